use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{debug, instrument};

use super::{ObjectMeta, ObjectStore};

/// Landing zone on the local filesystem: object key `a/b/c.jsonl` maps to
/// `{root}/a/b/c.jsonl`.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        if key.is_empty() || key.starts_with('/') || key.split('/').any(|s| s == ".." || s == ".") {
            bail!("Invalid object key: {:?}", key);
        }
        Ok(self.root.join(key))
    }

    async fn ensure_parent(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context(format!("Failed to create directory {}", parent.display()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for LocalStorage {
    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }

    #[instrument(skip(self))]
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        // Walk only the directory the prefix points into, then filter by full key.
        let start_dir = match prefix.rfind('/') {
            Some(idx) => self.path_for(&prefix[..idx])?,
            None => self.root.clone(),
        };

        let mut objects = Vec::new();
        let mut pending = vec![start_dir];

        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e).context(format!("Failed to list {}", dir.display())),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let metadata = entry.metadata().await?;
                if metadata.is_dir() {
                    pending.push(path);
                    continue;
                }

                let Ok(relative) = path.strip_prefix(&self.root) else { continue };
                let key = relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if !key.starts_with(prefix) {
                    continue;
                }

                objects.push(ObjectMeta {
                    key,
                    size: metadata.len(),
                    last_modified: metadata.modified().ok().map(DateTime::<Utc>::from),
                });
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        debug!("Listed {} objects under {}", objects.len(), prefix);
        Ok(objects)
    }

    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path)
            .await
            .context(format!("Failed to read {}", path.display()))
    }

    #[instrument(skip(self, data), fields(size = data.len()))]
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let path = self.path_for(key)?;
        Self::ensure_parent(&path).await?;

        // Write to a temp sibling then rename, so readers never see a partial file.
        let tmp = path.with_extension("tmp-write");
        tokio::fs::write(&tmp, &data)
            .await
            .context(format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .context(format!("Failed to move {} into place", tmp.display()))
    }

    #[instrument(skip(self))]
    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        let source = self.path_for(from)?;
        let dest = self.path_for(to)?;
        Self::ensure_parent(&dest).await?;
        tokio::fs::copy(&source, &dest)
            .await
            .context(format!("Failed to copy {} to {}", source.display(), dest.display()))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).context(format!("Failed to delete {}", path.display())),
        }
    }

    /// Same-filesystem rename is atomic, so no copy is needed
    #[instrument(skip(self))]
    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let source = self.path_for(from)?;
        let dest = self.path_for(to)?;
        Self::ensure_parent(&dest).await?;
        tokio::fs::rename(&source, &dest)
            .await
            .context(format!("Failed to move {} to {}", source.display(), dest.display()))
    }
}
