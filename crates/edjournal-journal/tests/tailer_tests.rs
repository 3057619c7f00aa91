use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use edjournal_journal::{JournalEvent, JournalTailer, TailError, TailerOptions};
use tempfile::TempDir;

const OLDER: &str = "Journal.2024-05-01T120000.01.log";
const NEWER: &str = "Journal.2024-05-02T090000.01.log";

fn append(path: &Path, text: &str) {
    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    f.write_all(text.as_bytes()).unwrap();
}

fn tailer(dir: &Path) -> JournalTailer {
    JournalTailer::new(dir.to_path_buf(), Vec::new(), TailerOptions::default())
}

/// Read and commit every available batch.
async fn drain(tailer: &mut JournalTailer) -> Vec<JournalEvent> {
    tailer.refresh().await.unwrap();
    let mut events = Vec::new();
    while let Some(batch) = tailer.next_batch().await.unwrap() {
        tailer.commit(&batch);
        events.extend(batch.events);
    }
    events
}

fn types(events: &[JournalEvent]) -> Vec<&str> {
    events.iter().map(|e| e.event_type.as_str()).collect()
}

// ============================================================
// Discovery and ordering
// ============================================================

#[tokio::test]
async fn test_missing_directory_is_no_source() {
    let dir = TempDir::new().unwrap();
    let mut tailer = tailer(&dir.path().join("absent"));

    match tailer.refresh().await {
        Err(TailError::NoSource(path)) => assert!(path.ends_with("absent")),
        other => panic!("expected NoSource, got {:?}", other),
    }
    assert_eq!(tailer.files_known(), 0);
}

#[tokio::test]
async fn test_files_replay_in_name_stamp_order() {
    let dir = TempDir::new().unwrap();
    // Written newest first so modification times disagree with name order.
    append(&dir.path().join(NEWER), "{\"event\":\"Second\"}\n");
    append(&dir.path().join(OLDER), "{\"event\":\"First\"}\n");
    append(&dir.path().join("Status.json"), "{\"event\":\"Status\"}\n");

    let mut tailer = tailer(dir.path());
    let events = drain(&mut tailer).await;

    assert_eq!(types(&events), vec!["First", "Second"]);
    assert_eq!(events[0].sequence, 0);
    assert_eq!(events[1].sequence, 1);
    assert_eq!(tailer.files_known(), 2);
}

#[tokio::test]
async fn test_superseded_files_are_closed() {
    let dir = TempDir::new().unwrap();
    append(&dir.path().join(OLDER), "{\"event\":\"A\"}\n");

    let mut tailer = tailer(dir.path());
    let discovery = tailer.refresh().await.unwrap();
    assert_eq!(discovery.changed.len(), 1);
    assert!(!discovery.changed[0].fully_closed);

    append(&dir.path().join(NEWER), "{\"event\":\"B\"}\n");
    let discovery = tailer.refresh().await.unwrap();

    let older = discovery
        .changed
        .iter()
        .find(|e| e.path.ends_with(OLDER))
        .unwrap();
    assert!(older.fully_closed);
    assert_eq!(discovery.newest, Some(dir.path().join(NEWER)));
}

// ============================================================
// Offsets and partial lines
// ============================================================

#[tokio::test]
async fn test_offsets_point_past_each_line() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(OLDER);
    append(&path, "{\"event\":\"A\"}\r\n{\"event\":\"B\"}\r\n");

    let mut tailer = tailer(dir.path());
    let events = drain(&mut tailer).await;

    assert_eq!(events[0].byte_offset_end, 15);
    assert_eq!(events[1].byte_offset_end, 30);
    let entry = tailer.ledger_entry(&path).unwrap();
    assert_eq!(entry.bytes_consumed, 30);
    assert_eq!(entry.size_at_last_read, 30);
}

#[tokio::test]
async fn test_unterminated_line_waits_for_newline() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(OLDER);
    append(&path, "{\"event\":\"A\"}\n{\"event\":\"B\"");

    let mut tailer = tailer(dir.path());
    let events = drain(&mut tailer).await;
    assert_eq!(types(&events), vec!["A"]);
    let entry = tailer.ledger_entry(&path).unwrap().clone();
    assert_eq!(entry.bytes_consumed, 14);
    assert!(entry.bytes_consumed <= entry.size_at_last_read);

    append(&path, "}\n");
    let events = drain(&mut tailer).await;
    assert_eq!(types(&events), vec!["B"]);
    assert_eq!(events[0].sequence, 1);
    assert_eq!(events[0].byte_offset_end, 28);
}

#[tokio::test]
async fn test_superseded_file_flushes_unterminated_tail() {
    let dir = TempDir::new().unwrap();
    append(&dir.path().join(OLDER), "{\"event\":\"A\"}\n{\"event\":\"B\"}");
    append(&dir.path().join(NEWER), "{\"event\":\"C\"}\n");

    let mut tailer = tailer(dir.path());
    let events = drain(&mut tailer).await;

    assert_eq!(types(&events), vec!["A", "B", "C"]);
}

#[tokio::test]
async fn test_invalid_line_is_counted_and_skipped() {
    let dir = TempDir::new().unwrap();
    append(
        &dir.path().join(OLDER),
        "{\"event\":\"A\"}\nnot valid json\n{\"event\":\"B\"}\n",
    );

    let mut tailer = tailer(dir.path());
    let events = drain(&mut tailer).await;

    assert_eq!(types(&events), vec!["A", "B"]);
    assert_eq!(events[0].sequence, 0);
    assert_eq!(events[1].sequence, 1);
    assert_eq!(tailer.parse_failures(), 1);
}

#[tokio::test]
async fn test_blank_lines_are_not_failures() {
    let dir = TempDir::new().unwrap();
    append(&dir.path().join(OLDER), "\n  \n{\"event\":\"A\"}\n");

    let mut tailer = tailer(dir.path());
    let events = drain(&mut tailer).await;

    assert_eq!(types(&events), vec!["A"]);
    assert_eq!(tailer.parse_failures(), 0);
}

// ============================================================
// Restart and failure handling
// ============================================================

#[tokio::test]
async fn test_resumes_from_committed_ledger() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(OLDER);
    append(&path, "{\"event\":\"A\"}\n{\"event\":\"B\"}\n");

    let mut first = tailer(dir.path());
    drain(&mut first).await;
    let ledger = first.ledger_entries();

    append(&path, "{\"event\":\"C\"}\n");
    let mut second = JournalTailer::new(dir.path().to_path_buf(), ledger, TailerOptions::default());
    let events = drain(&mut second).await;

    assert_eq!(types(&events), vec!["C"]);
}

#[tokio::test]
async fn test_rollback_rereads_the_same_lines() {
    let dir = TempDir::new().unwrap();
    append(&dir.path().join(OLDER), "{\"event\":\"A\"}\n{\"event\":\"B\"}\n");

    let mut tailer = tailer(dir.path());
    tailer.refresh().await.unwrap();
    let batch = tailer.next_batch().await.unwrap().unwrap();
    assert_eq!(batch.events.len(), 2);
    tailer.rollback(&batch);

    let again = tailer.next_batch().await.unwrap().unwrap();
    assert_eq!(again.events, batch.events);
    assert_eq!(again.first_sequence, 0);
}

#[tokio::test]
async fn test_shrunk_file_is_reread_from_start() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(OLDER);
    append(&path, "{\"event\":\"Old1\"}\n{\"event\":\"Old2\"}\n");

    let mut tailer = tailer(dir.path());
    drain(&mut tailer).await;

    fs::write(&path, "{\"event\":\"New\"}\n").unwrap();
    tailer.refresh().await.unwrap();
    let batch = tailer.next_batch().await.unwrap().unwrap();

    assert!(batch.truncated);
    assert_eq!(types(&batch.events), vec!["New"]);
    assert_eq!(batch.entry.bytes_consumed, 16);
}

#[tokio::test]
async fn test_replaced_file_with_pending_fragment_is_reread() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(OLDER);
    append(&path, "{\"event\":\"A\"}\n{\"event\":\"Partial-with-a-long-tail\"");

    let mut tailer = tailer(dir.path());
    assert_eq!(types(&drain(&mut tailer).await), vec!["A"]);
    let entry = tailer.ledger_entry(&path).unwrap().clone();
    assert_eq!(entry.bytes_consumed, 14);
    assert_eq!(entry.size_at_last_read, 49);

    // Longer than the consumed offset, shorter than the last known size.
    fs::write(&path, "{\"event\":\"Zed\"}\n").unwrap();
    tailer.refresh().await.unwrap();
    let batch = tailer.next_batch().await.unwrap().unwrap();

    assert!(batch.truncated);
    assert_eq!(types(&batch.events), vec!["Zed"]);
    assert!(batch.failures.is_empty());
    assert_eq!(batch.entry.bytes_consumed, 16);
    assert_eq!(batch.entry.size_at_last_read, 16);
}

#[tokio::test]
async fn test_small_chunks_cover_every_line() {
    let dir = TempDir::new().unwrap();
    let mut text = String::new();
    for i in 0..20 {
        text.push_str(&format!("{{\"event\":\"E{}\"}}\n", i));
    }
    append(&dir.path().join(OLDER), &text);

    let options = TailerOptions {
        max_chunk_bytes: 40,
        ..TailerOptions::default()
    };
    let mut tailer = JournalTailer::new(dir.path().to_path_buf(), Vec::new(), options);
    let events = drain(&mut tailer).await;

    assert_eq!(events.len(), 20);
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.event_type, format!("E{}", i));
        assert_eq!(event.sequence, i as u64);
    }
}

#[tokio::test]
async fn test_vanished_directory_reports_no_source() {
    let dir = TempDir::new().unwrap();
    let journals: PathBuf = dir.path().join("journals");
    fs::create_dir(&journals).unwrap();
    append(&journals.join(OLDER), "{\"event\":\"A\"}\n");

    let mut tailer = tailer(&journals);
    drain(&mut tailer).await;

    fs::remove_dir_all(&journals).unwrap();
    assert!(matches!(tailer.refresh().await, Err(TailError::NoSource(_))));
}
