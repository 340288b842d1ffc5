use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;

use super::{ObjectMeta, ObjectStore};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    last_modified: DateTime<Utc>,
}

/// In-process object store, used by tests and local dry runs.
///
/// Writes (`put`, `copy`) to keys under a prefix registered with
/// [`MemoryStorage::fail_writes_under`] fail, which lets tests exercise
/// routing failures.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    failing_prefixes: Mutex<Vec<String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an object with an explicit modification time
    pub fn insert_at(&self, key: impl Into<String>, data: impl Into<Vec<u8>>, last_modified: DateTime<Utc>) {
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects.insert(
            key.into(),
            StoredObject {
                data: data.into(),
                last_modified,
            },
        );
    }

    pub fn insert(&self, key: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.insert_at(key, data, Utc::now());
    }

    /// Every key currently stored, sorted
    pub fn keys(&self) -> Vec<String> {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects.keys().cloned().collect()
    }

    pub fn read(&self, key: &str) -> Option<Vec<u8>> {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects.get(key).map(|o| o.data.clone())
    }

    pub fn fail_writes_under(&self, prefix: impl Into<String>) {
        let mut failing = self.failing_prefixes.lock().unwrap_or_else(|e| e.into_inner());
        failing.push(prefix.into());
    }

    pub fn clear_failures(&self) {
        let mut failing = self.failing_prefixes.lock().unwrap_or_else(|e| e.into_inner());
        failing.clear();
    }

    fn check_writable(&self, key: &str) -> Result<()> {
        let failing = self.failing_prefixes.lock().unwrap_or_else(|e| e.into_inner());
        if failing.iter().any(|p| key.starts_with(p.as_str())) {
            bail!("Injected write failure for {}", key);
        }
        Ok(())
    }
}

#[async_trait]
impl ObjectStore for MemoryStorage {
    fn describe(&self) -> String {
        "memory://".to_string()
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectMeta>> {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectMeta {
                key: key.clone(),
                size: object.data.len() as u64,
                last_modified: Some(object.last_modified),
            })
            .collect())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.read(key).ok_or_else(|| anyhow!("No such object: {}", key))
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.check_writable(key)?;
        self.insert(key, data);
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<()> {
        self.check_writable(to)?;
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        let object = objects
            .get(from)
            .cloned()
            .ok_or_else(|| anyhow!("No such object: {}", from))?;
        objects.insert(to.to_string(), object);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects.remove(key);
        Ok(())
    }
}
