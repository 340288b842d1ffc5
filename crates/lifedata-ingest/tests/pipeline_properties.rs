//! End-to-end pipeline behaviour against the in-memory backends

mod common;

use common::Harness;
use lifedata_ingest::report::Totals;
use lifedata_ingest::{Adapter, AdapterRegistry, DataTypeSpec, FileStatus, PipelineStatus, RunStatus};
use serde_json::json;

const PLAYS: &str = "tracks/landing/plays_20240103T000000Z.jsonl";

fn registry() -> AdapterRegistry {
    AdapterRegistry::new([Adapter::new("tracks")
        .with_data_type("plays", DataTypeSpec::new(&["id"], &["id"], "tracks_plays"))
        .with_data_type(
            "listens",
            DataTypeSpec::new(&["id"], &["id", "played_at"], "tracks_listens"),
        )])
    .unwrap()
}

fn harness() -> Harness {
    Harness::new().with_registry(registry())
}

#[tokio::test]
async fn test_latest_version_wins_within_a_file() {
    let h = harness();
    h.land(
        PLAYS,
        &[
            r#"{"id":"t1","inserted_at":"2024-01-01T00:00:00Z","plays":1}"#,
            r#"{"id":"t1","inserted_at":"2024-01-02T00:00:00Z","plays":2}"#,
        ],
    );

    let report = h.run(&["tracks"], Some(&["plays"]), false).await;
    assert_eq!(report.status, RunStatus::Success);

    let rows = h.warehouse.rows("tracks_plays");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].inserted_at.to_rfc3339(), "2024-01-02T00:00:00+00:00");
    assert_eq!(rows[0].payload["plays"], 2);

    let file = &report.pipeline("tracks", "plays").unwrap().files[0];
    assert_eq!(file.valid_count, 2);
    assert_eq!(file.duplicate_count, 1);
    assert_eq!(file.loaded_count, 1);
    assert_eq!(file.status, FileStatus::Success);
}

#[tokio::test]
async fn test_missing_required_field_rejects_whole_file() {
    let h = harness();
    let path = "tracks/landing/listens_20240103T000000Z.jsonl";
    h.land(path, &[r#"{"id":"t1"}"#]);

    let report = h.run(&["tracks"], Some(&["listens"]), false).await;
    let pipeline = report.pipeline("tracks", "listens").unwrap();
    let file = &pipeline.files[0];

    assert_eq!(file.status, FileStatus::TotalFailure);
    assert_eq!(file.loaded_count, 0);
    assert_eq!(file.rejected_count, 1);
    assert_eq!(file.rejections[0].reason, "missing_field:played_at");
    assert_eq!(
        file.routed_to.as_deref(),
        Some("tracks/rejected/listens_20240103T000000Z.jsonl")
    );

    assert!(h.warehouse.rows("tracks_listens").is_empty());
    assert_eq!(h.warehouse.load_calls(), 0);
    assert_eq!(h.store.keys(), vec!["tracks/rejected/listens_20240103T000000Z.jsonl"]);
    assert_eq!(report.status, RunStatus::TotalFailure);
    assert_eq!(report.exit_code(), 1);
}

#[tokio::test]
async fn test_reingesting_archived_file_loads_nothing() {
    let h = harness();
    let lines = [
        r#"{"id":"t1","inserted_at":"2024-01-01T00:00:00Z"}"#,
        r#"{"id":"t2","inserted_at":"2024-01-02T00:00:00Z"}"#,
    ];
    h.land(PLAYS, &lines);

    let first = h.run(&["tracks"], Some(&["plays"]), false).await;
    assert_eq!(first.totals.loaded, 2);
    let before = h.warehouse.rows("tracks_plays");

    // Router crashed after loading: the same file shows up in landing again
    h.land(PLAYS, &lines);
    let second = h.run(&["tracks"], Some(&["plays"]), false).await;

    let pipeline = second.pipeline("tracks", "plays").unwrap();
    assert_eq!(pipeline.totals.loaded, 0);
    assert_eq!(pipeline.totals.already_applied, 2);
    assert_eq!(pipeline.files[0].status, FileStatus::Success);
    assert_eq!(pipeline.watermark_before, pipeline.watermark_after);
    assert_eq!(h.warehouse.rows("tracks_plays"), before);
    assert_eq!(second.exit_code(), 0);
}

#[tokio::test]
async fn test_rerun_after_success_is_noop() {
    let h = harness();
    h.land(PLAYS, &[r#"{"id":"t1","inserted_at":"2024-01-01T00:00:00Z"}"#]);

    h.run(&["tracks"], None, false).await;
    let rows = h.warehouse.rows("tracks_plays");
    let keys = h.store.keys();

    let again = h.run(&["tracks"], None, false).await;
    assert_eq!(again.totals.files, 0);
    assert_eq!(again.totals.loaded, 0);
    assert_eq!(h.warehouse.rows("tracks_plays"), rows);
    assert_eq!(h.store.keys(), keys);
}

#[tokio::test]
async fn test_bad_lines_do_not_block_good_ones() {
    let h = harness();
    h.land(
        PLAYS,
        &[
            r#"{"id":"a","inserted_at":"2024-01-01T00:00:00Z"}"#,
            "not json",
            r#"{"id":"b","inserted_at":"2024-01-01T00:00:00Z"}"#,
            r#"{"other":"no key"}"#,
            r#"{"id":"c","inserted_at":"2024-01-01T00:00:00Z"}"#,
            r#"{"id":{"nested":true}}"#,
        ],
    );

    let report = h.run(&["tracks"], Some(&["plays"]), false).await;
    let file = &report.pipeline("tracks", "plays").unwrap().files[0];

    assert_eq!(file.valid_count, 3);
    assert_eq!(file.rejected_count, 3);
    assert_eq!(file.loaded_count, 3);
    assert_eq!(file.status, FileStatus::PartialFailure);
    assert_eq!(
        file.routed_to.as_deref(),
        Some("tracks/archive/plays_20240103T000000Z.jsonl")
    );

    let reasons: Vec<_> = file.rejections.iter().map(|r| (r.line_number, r.reason.as_str())).collect();
    assert_eq!(
        reasons,
        vec![
            (2, "malformed_json"),
            (4, "missing_field:id"),
            (6, "type_mismatch:id")
        ]
    );

    let rejected_report = h
        .store
        .read("tracks/rejected/plays_20240103T000000Z.rejected.jsonl")
        .unwrap();
    let lines: Vec<serde_json::Value> = String::from_utf8(rejected_report)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0]["raw_line"], "not json");
    assert_eq!(lines[0]["source_file"], PLAYS);

    // Rejected lines alone do not fail the run
    assert_eq!(report.status, RunStatus::Success);
    assert_eq!(h.warehouse.rows("tracks_plays").len(), 3);
}

#[tokio::test]
async fn test_duplicates_across_files_resolve_to_latest() {
    let h = harness();
    h.land(
        "tracks/landing/plays_20240101T000000Z.jsonl",
        &[
            r#"{"id":"a","inserted_at":"2024-01-05T00:00:00Z","v":"newest"}"#,
            r#"{"id":"b","inserted_at":"2024-01-01T00:00:00Z","v":"old"}"#,
        ],
    );
    h.land(
        "tracks/landing/plays_20240102T000000Z.jsonl",
        &[
            r#"{"id":"a","inserted_at":"2024-01-02T00:00:00Z","v":"stale"}"#,
            r#"{"id":"b","inserted_at":"2024-01-03T00:00:00Z","v":"new"}"#,
        ],
    );

    let report = h.run(&["tracks"], None, false).await;
    let pipeline = report.pipeline("tracks", "plays").unwrap();
    assert_eq!(pipeline.totals.valid, 4);
    assert_eq!(pipeline.totals.duplicates, 2);
    assert_eq!(pipeline.totals.loaded, 2);

    let payloads = h.payloads("tracks_plays");
    let values: Vec<_> = payloads.iter().map(|p| p["v"].as_str().unwrap()).collect();
    assert_eq!(values, vec!["newest", "new"]);
}

#[tokio::test]
async fn test_same_capture_time_prefers_later_file() {
    let h = harness();
    h.land(
        "tracks/landing/plays_20240101T000000Z.jsonl",
        &[r#"{"id":"a","inserted_at":"2024-01-01T00:00:00Z","v":"first"}"#],
    );
    h.land(
        "tracks/landing/plays_20240102T000000Z.jsonl",
        &[r#"{"id":"a","inserted_at":"2024-01-01T00:00:00Z","v":"second"}"#],
    );

    h.run(&["tracks"], None, false).await;
    assert_eq!(h.payloads("tracks_plays"), vec![json!({
        "id": "a",
        "inserted_at": "2024-01-01T00:00:00Z",
        "v": "second"
    })]);
}

#[tokio::test]
async fn test_result_does_not_depend_on_line_order() {
    let lines = [
        r#"{"id":"a","inserted_at":"2024-01-01T00:00:00Z","v":1}"#,
        r#"{"id":"b","inserted_at":"2024-01-04T00:00:00Z","v":2}"#,
        r#"{"id":"a","inserted_at":"2024-01-03T00:00:00Z","v":3}"#,
        r#"{"id":"c","inserted_at":"2024-01-02T00:00:00Z","v":4}"#,
        r#"{"id":"b","inserted_at":"2024-01-02T00:00:00Z","v":5}"#,
    ];

    let forward = harness();
    forward.land(PLAYS, &lines);
    forward.run(&["tracks"], None, false).await;

    let mut reversed_lines = lines;
    reversed_lines.reverse();
    let reversed = harness();
    reversed.land(PLAYS, &reversed_lines);
    reversed.run(&["tracks"], None, false).await;

    let expected = forward.payloads("tracks_plays");
    assert_eq!(expected.len(), 3);
    assert_eq!(reversed.payloads("tracks_plays"), expected);
}

#[tokio::test]
async fn test_dry_run_changes_nothing() {
    let h = harness();
    // Key `a` is already committed at this capture time
    h.land(
        "tracks/landing/plays_20240102T000000Z.jsonl",
        &[r#"{"id":"a","inserted_at":"2024-01-01T00:00:00Z"}"#],
    );
    h.run(&["tracks"], None, false).await;

    h.land(
        PLAYS,
        &[
            r#"{"id":"a","inserted_at":"2024-01-01T00:00:00Z"}"#,
            r#"{"id":"b","inserted_at":"2024-01-01T00:00:00Z"}"#,
            r#"{"id":"b","inserted_at":"2024-01-02T00:00:00Z"}"#,
            r#"{"id":"c","inserted_at":"2024-01-01T00:00:00Z"}"#,
            "{broken",
        ],
    );
    let keys = h.store.keys();
    let rows = h.warehouse.rows("tracks_plays");
    let load_calls = h.warehouse.load_calls();

    let dry = h.run(&["tracks"], None, true).await;
    assert!(dry.dry_run);
    assert_eq!(dry.status, RunStatus::Success);

    let pipeline = dry.pipeline("tracks", "plays").unwrap();
    assert_eq!(pipeline.status, PipelineStatus::DryRun);
    let file = &pipeline.files[0];
    assert_eq!(file.status, FileStatus::DryRun);
    assert!(file.routed_to.is_none());

    assert_eq!(h.warehouse.load_calls(), load_calls);
    assert_eq!(h.warehouse.rows("tracks_plays"), rows);
    assert_eq!(h.store.keys(), keys);

    // The dry run predicts exactly what the real run then does
    let real = h.run(&["tracks"], None, false).await;
    let committed = real.pipeline("tracks", "plays").unwrap();
    assert_eq!(committed.status, PipelineStatus::Succeeded);
    assert_eq!(
        pipeline.totals,
        Totals {
            files: 1,
            valid: 4,
            rejected: 1,
            duplicates: 1,
            already_applied: 1,
            loaded: 2,
        }
    );
    assert_eq!(committed.totals, pipeline.totals);
    assert_eq!(real.totals, dry.totals);
    assert_eq!(committed.files[0].loaded_count, file.loaded_count);
    assert_eq!(committed.files[0].rejected_count, file.rejected_count);
    assert_eq!(h.warehouse.rows("tracks_plays").len(), 3);
}

#[tokio::test]
async fn test_files_for_other_data_types_are_left_alone() {
    let h = harness();
    h.land(PLAYS, &[r#"{"id":"a"}"#]);
    h.land("tracks/landing/listens_20240103T000000Z.jsonl", &[r#"{"id":"a","played_at":"x"}"#]);
    h.land("tracks/landing/notes.txt", &["hello"]);

    let report = h.run(&["tracks"], Some(&["plays"]), false).await;
    assert_eq!(report.pipelines.len(), 1);
    assert_eq!(
        h.store.keys(),
        vec![
            "tracks/archive/plays_20240103T000000Z.jsonl",
            "tracks/landing/listens_20240103T000000Z.jsonl",
            "tracks/landing/notes.txt",
        ]
    );

    // Without inserted_at in the payload the file timestamp is used
    let rows = h.warehouse.rows("tracks_plays");
    assert_eq!(rows[0].inserted_at.to_rfc3339(), "2024-01-03T00:00:00+00:00");
    assert_eq!(rows[0].source_file, PLAYS);
}

#[tokio::test]
async fn test_builtin_spotify_recently_played() {
    let h = Harness::new();
    h.land(
        "spotify/landing/recently_played_20240601T120000Z.jsonl",
        &[
            r#"{"played_at":"2024-06-01T11:00:00Z","track":{"id":"4uLU6hMCjMI75M1A2tKUQC","name":"Never Gonna Give You Up"}}"#,
            r#"{"played_at":"2024-06-01T11:04:00Z","track":{"id":"7GhIk7Il098yCjg4BQjzvb","name":"Bohemian Rhapsody"}}"#,
            r#"{"played_at":"2024-06-01T11:00:00Z","track":{"name":"no id"}}"#,
        ],
    );

    let report = h.run(&["spotify"], Some(&["recently_played"]), false).await;
    let pipeline = report.pipeline("spotify", "recently_played").unwrap();
    assert_eq!(pipeline.target_table.as_deref(), Some("spotify_recently_played"));
    assert_eq!(pipeline.totals.loaded, 2);
    assert_eq!(pipeline.files[0].rejections[0].reason, "missing_field:track.id");

    let rows = h.warehouse.rows("spotify_recently_played");
    assert_eq!(rows.len(), 2);
    assert_eq!(
        rows[0].key_fields,
        json!({"played_at": "2024-06-01T11:00:00Z", "track.id": "4uLU6hMCjMI75M1A2tKUQC"})
    );
}
