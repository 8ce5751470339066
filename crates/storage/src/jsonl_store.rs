//! JSON Lines file store.
//!
//! One history record per line, UTF-8, newline-terminated. Appends rewrite
//! the log into a temporary file next to it and rename it into place, so a
//! crash never leaves a truncated record behind.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use flowtrack_core::HistoryRecord;
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use super::{CorruptLine, HistoryStore, LoadedHistory, Result};

/// File-backed history store.
#[derive(Debug, Clone)]
pub struct JsonlHistoryStore {
    path: PathBuf,
}

impl JsonlHistoryStore {
    /// Use `path` as the log. The file is created on first append.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Location of the log file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        }
    }

    /// Write `contents` to a sibling temp file, then rename it over the log.
    fn replace_with(&self, contents: &[&[u8]]) -> Result<()> {
        let dir = self.dir();
        fs::create_dir_all(dir)?;

        let mut tmp = NamedTempFile::new_in(dir)?;
        for chunk in contents {
            tmp.write_all(chunk)?;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

impl HistoryStore for JsonlHistoryStore {
    fn load(&self) -> Result<LoadedHistory> {
        let bytes = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LoadedHistory::default()),
            Err(e) => return Err(e.into()),
        };

        let loaded = parse_lines(&bytes);
        debug!(
            "Loaded {} history records from {} ({} skipped)",
            loaded.records.len(),
            self.path.display(),
            loaded.corrupt.len()
        );
        Ok(loaded)
    }

    fn append(&mut self, record: &HistoryRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let existing = match fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        // A torn final line stays on its own line so only it gets skipped.
        let separator: &[u8] = if existing.is_empty() || existing.ends_with(b"\n") {
            b""
        } else {
            b"\n"
        };
        self.replace_with(&[existing.as_slice(), separator, line.as_slice()])
    }

    fn clear(&mut self) -> Result<()> {
        self.replace_with(&[])
    }
}

/// Parse a JSON Lines buffer, skipping blank lines and reporting bad ones.
///
/// A line that parses but breaks a record invariant counts as bad too.
pub(crate) fn parse_lines(bytes: &[u8]) -> LoadedHistory {
    let mut loaded = LoadedHistory::default();

    for (idx, raw) in bytes.split(|b| *b == b'\n').enumerate() {
        let line_no = idx + 1;
        let parsed = std::str::from_utf8(raw)
            .map_err(|e| e.to_string())
            .and_then(|text| {
                let text = text.trim();
                if text.is_empty() {
                    return Ok(None);
                }
                let record =
                    serde_json::from_str::<HistoryRecord>(text).map_err(|e| e.to_string())?;
                record.validate().map_err(|e| e.to_string())?;
                Ok(Some(record))
            });

        match parsed {
            Ok(Some(record)) => loaded.records.push(record),
            Ok(None) => {}
            Err(reason) => {
                warn!("Skipping corrupt history line {}: {}", line_no, reason);
                loaded.corrupt.push(CorruptLine { line: line_no, reason });
            }
        }
    }

    loaded
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use flowtrack_core::{Timestamp, WorkflowId, WorkflowState};

    fn record(id: &str, duration: f64) -> HistoryRecord {
        HistoryRecord {
            workflow_type: "deploy".to_string(),
            workflow_id: WorkflowId::new(id),
            final_state: WorkflowState::Completed,
            started_at: Timestamp::from_secs(1_700_000_000.0),
            ended_at: Timestamp::from_secs(1_700_000_000.0 + duration),
            duration_seconds: duration,
            step_durations: BTreeMap::from([("build".to_string(), duration / 2.0)]),
            step_count: 1,
            completed_steps: 1,
            failed_steps: 0,
            metadata: serde_json::Map::new(),
        }
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonlHistoryStore::new(dir.path().join("history.jsonl"));
        let loaded = store.load().unwrap();
        assert!(loaded.records.is_empty());
        assert!(loaded.corrupt.is_empty());
    }

    #[test]
    fn test_append_writes_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("history.jsonl");
        let mut store = JsonlHistoryStore::new(&path);

        store.append(&record("run-1", 10.0)).unwrap();
        store.append(&record("run-2", 20.0)).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 2);
        assert!(text.ends_with('\n'));
        assert!(text.lines().next().unwrap().starts_with("{\"workflow_type\":\"deploy\""));

        let loaded = store.load().unwrap();
        assert_eq!(loaded.records.len(), 2);
        assert_eq!(loaded.records[1].workflow_id.as_str(), "run-2");
    }

    #[test]
    fn test_corrupt_line_mid_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        let good1 = serde_json::to_string(&record("run-1", 10.0)).unwrap();
        let good2 = serde_json::to_string(&record("run-2", 20.0)).unwrap();
        fs::write(&path, format!("{good1}\n{{\"workflow_type\": \"dep\n\n{good2}\n")).unwrap();

        let loaded = JsonlHistoryStore::new(&path).load().unwrap();
        assert_eq!(loaded.records.len(), 2);
        assert_eq!(loaded.corrupt.len(), 1);
        assert_eq!(loaded.corrupt[0].line, 2);
    }

    #[test]
    fn test_inconsistent_record_lines_are_skipped() {
        let good = serde_json::to_string(&record("run-1", 10.0)).unwrap();
        let running = r#"{"workflow_type":"deploy","workflow_id":"run-2","final_state":"IN_PROGRESS","started_at":1700000000.0,"ended_at":1700000100.0,"duration_seconds":-5000.0,"step_durations":{"build":-900.0}}"#;
        let mismatched = r#"{"workflow_type":"deploy","workflow_id":"run-3","final_state":"COMPLETED","started_at":1700000000.0,"ended_at":1700000100.0,"duration_seconds":42.0,"step_durations":{}}"#;
        let negative_step = r#"{"workflow_type":"deploy","workflow_id":"run-4","final_state":"FAILED","started_at":1700000000.0,"ended_at":1700000100.0,"duration_seconds":100.0,"step_durations":{"build":-1.0}}"#;
        let text = format!("{good}\n{running}\n{mismatched}\n{negative_step}\n");

        let loaded = parse_lines(text.as_bytes());
        assert_eq!(loaded.records.len(), 1);
        assert_eq!(loaded.records[0].workflow_id.as_str(), "run-1");
        let lines: Vec<_> = loaded.corrupt.iter().map(|c| c.line).collect();
        assert_eq!(lines, vec![2, 3, 4]);
        assert!(loaded.corrupt[0].reason.contains("not terminal"));
    }

    #[test]
    fn test_invalid_utf8_line_is_skipped() {
        let mut bytes = serde_json::to_vec(&record("run-1", 10.0)).unwrap();
        bytes.extend_from_slice(b"\n\xff\xfe\n");
        let loaded = parse_lines(&bytes);
        assert_eq!(loaded.records.len(), 1);
        assert_eq!(loaded.corrupt[0].line, 2);
    }

    #[test]
    fn test_append_after_torn_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        let good = serde_json::to_string(&record("run-1", 10.0)).unwrap();
        fs::write(&path, format!("{good}\n{{\"workflow_ty")).unwrap();

        let mut store = JsonlHistoryStore::new(&path);
        store.append(&record("run-2", 20.0)).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.records.len(), 2);
        assert_eq!(loaded.corrupt.len(), 1);
    }

    #[test]
    fn test_clear_empties_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonlHistoryStore::new(dir.path().join("history.jsonl"));
        store.append(&record("run-1", 10.0)).unwrap();
        store.clear().unwrap();
        assert!(store.load().unwrap().records.is_empty());
    }
}
