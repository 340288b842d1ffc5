//! Duplicate resolution
//!
//! Runs once per pipeline over the valid records of every file in the batch.
//! All grouping happens before anything is loaded.
//!
//! Recency order within a natural key, most recent first:
//!
//! 1. `inserted_at` (capture time carried by the record)
//! 2. the source file's `discovered_at`
//! 3. the source file's path
//! 4. line number within the file
//!
//! Steps 3 and 4 only exist to make the winner independent of listing order.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::types::{NaturalKey, ValidRecord};

/// Committed state of the target table, read once per pipeline
#[derive(Debug, Clone, Default)]
pub struct CommittedState {
    /// Stored `inserted_at` for each incoming key that already has a row
    pub versions: HashMap<NaturalKey, DateTime<Utc>>,
    /// Maximum committed `inserted_at` in the table
    pub watermark: Option<DateTime<Utc>>,
}

impl CommittedState {
    /// True when the table already holds this key at the same or a newer capture time
    pub fn is_applied(&self, record: &ValidRecord) -> bool {
        self.versions
            .get(record.key())
            .is_some_and(|stored| record.inserted_at() <= *stored)
    }
}

/// Output of deduplication
#[derive(Debug, Clone, Default)]
pub struct DedupOutcome {
    /// One record per key, sorted by key; what the loader should commit
    pub to_load: Vec<ValidRecord>,
    /// Records that lost to a more recent record with the same key
    pub duplicates: Vec<ValidRecord>,
    /// Winners dropped because the table already has them
    pub already_applied: Vec<ValidRecord>,
}

/// Most recent first
fn recency_cmp(a: &ValidRecord, b: &ValidRecord) -> Ordering {
    b.inserted_at()
        .cmp(&a.inserted_at())
        .then_with(|| b.source_file().discovery_cmp(a.source_file()))
        .then_with(|| b.line_number().cmp(&a.line_number()))
}

/// Keep the most recent record per natural key.
///
/// Returns `(winners, losers)`; winners are sorted by key.
pub fn resolve_duplicates(records: Vec<ValidRecord>) -> (Vec<ValidRecord>, Vec<ValidRecord>) {
    let mut groups: BTreeMap<NaturalKey, Vec<ValidRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(record.key().clone()).or_default().push(record);
    }

    let mut winners = Vec::with_capacity(groups.len());
    let mut losers = Vec::new();
    for (_, mut group) in groups {
        group.sort_by(recency_cmp);
        let mut group = group.into_iter();
        if let Some(winner) = group.next() {
            winners.push(winner);
        }
        losers.extend(group);
    }

    (winners, losers)
}

/// Drop winners the table already holds at the same or a newer capture time.
///
/// Returns `(to_load, already_applied)`.
pub fn filter_applied(
    winners: Vec<ValidRecord>,
    committed: &CommittedState,
) -> (Vec<ValidRecord>, Vec<ValidRecord>) {
    winners.into_iter().partition(|record| !committed.is_applied(record))
}

/// Full deduplication: resolve within the batch, then against the table
pub fn deduplicate(records: Vec<ValidRecord>, committed: &CommittedState) -> DedupOutcome {
    let total = records.len();
    let (winners, duplicates) = resolve_duplicates(records);
    let (to_load, already_applied) = filter_applied(winners, committed);

    debug!(
        total,
        to_load = to_load.len(),
        duplicates = duplicates.len(),
        already_applied = already_applied.len(),
        "Deduplicated batch"
    );

    DedupOutcome {
        to_load,
        duplicates,
        already_applied,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::adapters::DataTypeSpec;
    use crate::pipeline::parser::RecordParser;
    use crate::types::LandingFile;
    use std::sync::Arc;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn parse(path: &str, discovered: &str, body: &str) -> Vec<ValidRecord> {
        let spec = DataTypeSpec::new(&["id"], &["id"], "things");
        let file = Arc::new(LandingFile {
            path: path.to_string(),
            source_id: "test".to_string(),
            data_type: "things".to_string(),
            discovered_at: utc(discovered),
            size: body.len() as u64,
        });
        RecordParser::new(&spec).parse_file(file, body.as_bytes()).valid
    }

    fn winner_summary(records: &[ValidRecord]) -> Vec<(String, String, usize)> {
        records
            .iter()
            .map(|r| (r.key().encoded().to_string(), r.source_file().path.clone(), r.line_number()))
            .collect()
    }

    #[test]
    fn test_latest_inserted_at_wins() {
        let records = parse(
            "a.jsonl",
            "2024-01-03T00:00:00Z",
            "{\"id\":\"t1\",\"inserted_at\":\"2024-01-01T00:00:00Z\"}\n\
             {\"id\":\"t1\",\"inserted_at\":\"2024-01-02T00:00:00Z\"}\n",
        );
        let outcome = deduplicate(records, &CommittedState::default());
        assert_eq!(outcome.to_load.len(), 1);
        assert_eq!(outcome.to_load[0].inserted_at(), utc("2024-01-02T00:00:00Z"));
        assert_eq!(outcome.duplicates.len(), 1);
    }

    #[test]
    fn test_tie_breaks_on_file_discovery() {
        let older = parse("b.jsonl", "2024-01-01T00:00:00Z", r#"{"id":"t1","inserted_at":"2024-01-01T00:00:00Z"}"#);
        let newer = parse("a.jsonl", "2024-01-02T00:00:00Z", r#"{"id":"t1","inserted_at":"2024-01-01T00:00:00Z"}"#);

        let (winners, _) = resolve_duplicates(older.into_iter().chain(newer).collect());
        assert_eq!(winners[0].source_file().path, "a.jsonl");
    }

    #[test]
    fn test_winner_independent_of_input_order() {
        let a = parse(
            "a.jsonl",
            "2024-01-01T00:00:00Z",
            "{\"id\":\"t1\",\"inserted_at\":\"2024-01-01T00:00:00Z\",\"v\":1}\n\
             {\"id\":\"t2\",\"inserted_at\":\"2024-01-03T00:00:00Z\",\"v\":1}\n",
        );
        let b = parse(
            "b.jsonl",
            "2024-01-01T00:00:00Z",
            "{\"id\":\"t1\",\"inserted_at\":\"2024-01-01T00:00:00Z\",\"v\":2}\n\
             {\"id\":\"t2\",\"inserted_at\":\"2024-01-02T00:00:00Z\",\"v\":2}\n",
        );

        let (ab, _) = resolve_duplicates(a.iter().chain(b.iter()).cloned().collect());
        let (ba, _) = resolve_duplicates(b.iter().chain(a.iter()).cloned().collect());
        assert_eq!(winner_summary(&ab), winner_summary(&ba));
        // Same capture and discovery time: path breaks the tie
        assert_eq!(ab[0].source_file().path, "b.jsonl");
        assert_eq!(ab[1].source_file().path, "a.jsonl");
    }

    #[test]
    fn test_already_applied_filtered() {
        let records = parse(
            "a.jsonl",
            "2024-01-03T00:00:00Z",
            "{\"id\":\"old\",\"inserted_at\":\"2024-01-01T00:00:00Z\"}\n\
             {\"id\":\"same\",\"inserted_at\":\"2024-01-02T00:00:00Z\"}\n\
             {\"id\":\"newer\",\"inserted_at\":\"2024-01-05T00:00:00Z\"}\n\
             {\"id\":\"fresh\",\"inserted_at\":\"2024-01-01T00:00:00Z\"}\n",
        );
        let key = |id: &str| records.iter().find(|r| r.payload()["id"] == id).unwrap().key().clone();

        let committed = CommittedState {
            versions: HashMap::from([
                (key("old"), utc("2024-01-02T00:00:00Z")),
                (key("same"), utc("2024-01-02T00:00:00Z")),
                (key("newer"), utc("2024-01-02T00:00:00Z")),
            ]),
            watermark: Some(utc("2024-01-02T00:00:00Z")),
        };

        let outcome = deduplicate(records.clone(), &committed);
        let loaded: Vec<_> = outcome.to_load.iter().map(|r| r.payload()["id"].clone()).collect();
        let applied: Vec<_> = outcome.already_applied.iter().map(|r| r.payload()["id"].clone()).collect();
        assert_eq!(loaded, vec!["fresh", "newer"]);
        assert_eq!(applied, vec!["old", "same"]);
    }
}
