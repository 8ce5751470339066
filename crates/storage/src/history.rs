//! Workflow history - queries and aggregates over finished runs.

use std::path::{Path, PathBuf};
use flowtrack_core::{HistoryRecord, Workflow, WorkflowState};
use serde::{Deserialize, Serialize};
use tracing::info;
use crate::{CorruptLine, HistoryError, HistoryStore, JsonlHistoryStore, MemoryHistoryStore, Result};

/// File name used when no history path is configured.
pub const DEFAULT_HISTORY_FILE: &str = ".workflow-history.jsonl";

/// Configuration for the history log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Location of the JSON Lines log
    pub path: PathBuf,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        Self {
            path: home.join(DEFAULT_HISTORY_FILE),
        }
    }
}

/// Aggregate statistics for one workflow type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryStats {
    /// Runs recorded
    pub total_workflows: usize,
    /// Runs that completed
    pub completed: usize,
    /// Runs that failed
    pub failed: usize,
    /// Runs that were cancelled
    pub cancelled: usize,
    /// Mean duration of completed runs
    pub average_duration: Option<f64>,
    /// `completed / total_workflows`, 0.0 when there is no data
    pub success_rate: f64,
    /// Number of runs the figures are based on; 0 means "no data"
    pub sample_size: usize,
}

/// Append-only record of finished workflow runs, queryable by type.
///
/// Records are read from the store when the history is opened and again on
/// [`WorkflowHistory::refresh`]; there is no implicit invalidation.
pub struct WorkflowHistory {
    store: Box<dyn HistoryStore>,
    records: Vec<HistoryRecord>,
    corrupt: Vec<CorruptLine>,
}

impl WorkflowHistory {
    /// Open the JSON Lines log at `path`, loading what is there.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_store(Box::new(JsonlHistoryStore::new(path)))
    }

    /// Open the log configured in `config`.
    pub fn from_config(config: &HistoryConfig) -> Result<Self> {
        Self::open(&config.path)
    }

    /// A history that lives only in memory.
    pub fn in_memory() -> Self {
        Self {
            store: Box::new(MemoryHistoryStore::new()),
            records: Vec::new(),
            corrupt: Vec::new(),
        }
    }

    /// Use a custom store, loading its contents.
    pub fn with_store(store: Box<dyn HistoryStore>) -> Result<Self> {
        let mut history = Self {
            store,
            records: Vec::new(),
            corrupt: Vec::new(),
        };
        history.refresh()?;
        Ok(history)
    }

    /// Re-read every record from the store.
    pub fn refresh(&mut self) -> Result<()> {
        let loaded = self.store.load()?;
        self.records = loaded.records;
        self.corrupt = loaded.corrupt;
        Ok(())
    }

    /// Lines skipped by the last load.
    pub fn corrupt_lines(&self) -> &[CorruptLine] {
        &self.corrupt
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if there are no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record a finished run under `workflow_type`.
    ///
    /// Accepts a tracker or a bare workflow. Fails with `NotTerminal` if the
    /// run has not reached a terminal state.
    pub fn log_workflow(
        &mut self,
        workflow: &impl AsRef<Workflow>,
        workflow_type: &str,
    ) -> Result<HistoryRecord> {
        let workflow = workflow.as_ref();
        let record = HistoryRecord::from_workflow(workflow, workflow_type).ok_or_else(|| {
            HistoryError::NotTerminal {
                workflow_id: workflow.workflow_id.to_string(),
                state: workflow.state,
            }
        })?;

        self.store.append(&record)?;
        info!(
            "Logged workflow {} ({}) as {} after {:.2}s",
            record.workflow_id, record.workflow_type, record.final_state, record.duration_seconds
        );
        self.records.push(record.clone());
        Ok(record)
    }

    /// Records of one type, or all of them, in insertion order.
    pub fn get_workflow_history(&self, workflow_type: Option<&str>) -> Vec<&HistoryRecord> {
        self.records
            .iter()
            .filter(|r| workflow_type.map_or(true, |t| r.workflow_type == t))
            .collect()
    }

    /// The `limit` most recent records, newest first.
    pub fn recent(&self, workflow_type: Option<&str>, limit: usize) -> Vec<&HistoryRecord> {
        let mut records = self.get_workflow_history(workflow_type);
        records.reverse();
        records.truncate(limit);
        records
    }

    /// Mean duration of completed runs of `workflow_type`.
    ///
    /// `None` when no completed run exists, which is distinct from a zero
    /// average.
    pub fn get_average_duration(&self, workflow_type: &str) -> Option<f64> {
        mean(
            self.records
                .iter()
                .filter(|r| r.workflow_type == workflow_type && r.is_completed())
                .map(|r| r.duration_seconds),
        )
    }

    /// Totals, average duration and success rate for `workflow_type`.
    pub fn get_stats(&self, workflow_type: &str) -> HistoryStats {
        let runs = self.get_workflow_history(Some(workflow_type));
        let count = |state: WorkflowState| runs.iter().filter(|r| r.final_state == state).count();

        let total = runs.len();
        let completed = count(WorkflowState::Completed);
        let success_rate = if total == 0 {
            0.0
        } else {
            completed as f64 / total as f64
        };

        HistoryStats {
            total_workflows: total,
            completed,
            failed: count(WorkflowState::Failed),
            cancelled: count(WorkflowState::Cancelled),
            average_duration: self.get_average_duration(workflow_type),
            success_rate,
            sample_size: total,
        }
    }

    /// Observed durations of `step_id` across runs of `workflow_type`.
    pub fn step_samples(&self, workflow_type: &str, step_id: &str) -> Vec<f64> {
        self.records
            .iter()
            .filter(|r| r.workflow_type == workflow_type)
            .filter_map(|r| r.step_durations.get(step_id).copied())
            .collect()
    }

    /// Mean observed duration of `step_id` across runs of `workflow_type`.
    pub fn get_average_step_duration(&self, workflow_type: &str, step_id: &str) -> Option<f64> {
        mean(self.step_samples(workflow_type, step_id).into_iter())
    }

    /// Drop every record, in the store and in memory.
    pub fn clear(&mut self) -> Result<()> {
        self.store.clear()?;
        self.records.clear();
        self.corrupt.clear();
        info!("Cleared workflow history");
        Ok(())
    }
}

impl std::fmt::Debug for WorkflowHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowHistory")
            .field("records", &self.records.len())
            .field("corrupt", &self.corrupt.len())
            .finish()
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use flowtrack_core::{Step, Timestamp, WorkflowId};

    fn init_tracing() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    }

    fn record(workflow_type: &str, id: &str, state: WorkflowState, duration: f64) -> HistoryRecord {
        HistoryRecord {
            workflow_type: workflow_type.to_string(),
            workflow_id: WorkflowId::new(id),
            final_state: state,
            started_at: Timestamp::from_secs(1_000.0),
            ended_at: Timestamp::from_secs(1_000.0 + duration),
            duration_seconds: duration,
            step_durations: BTreeMap::from([("build".to_string(), duration * 0.8)]),
            step_count: 1,
            completed_steps: 1,
            failed_steps: 0,
            metadata: serde_json::Map::new(),
        }
    }

    fn seeded(records: Vec<HistoryRecord>) -> WorkflowHistory {
        WorkflowHistory::with_store(Box::new(MemoryHistoryStore::with_records(records))).unwrap()
    }

    fn finished_workflow(id: &str, state: WorkflowState) -> Workflow {
        let mut wf = Workflow::new(id);
        let mut step = Step::new("build", "Build");
        step.state = WorkflowState::Completed;
        step.started_at = Some(Timestamp::from_secs(100.0));
        step.ended_at = Some(Timestamp::from_secs(130.0));
        wf.step_order.push("build".into());
        wf.steps.insert("build".into(), step);
        wf.state = state;
        wf.started_at = Some(Timestamp::from_secs(100.0));
        wf.ended_at = Some(Timestamp::from_secs(140.0));
        wf
    }

    #[test]
    fn test_average_duration_none_without_completed_runs() {
        let history = seeded(vec![record("deploy", "r1", WorkflowState::Failed, 50.0)]);
        assert_eq!(history.get_average_duration("deploy"), None);
        assert_eq!(history.get_average_duration("other"), None);
    }

    #[test]
    fn test_average_duration_is_mean_of_completed() {
        let durations = [12.0, 30.5, 7.25, 100.0, 0.0];
        let mut records: Vec<HistoryRecord> = durations
            .iter()
            .enumerate()
            .map(|(i, d)| record("deploy", &format!("r{i}"), WorkflowState::Completed, *d))
            .collect();
        records.push(record("deploy", "failed", WorkflowState::Failed, 999.0));
        records.push(record("build", "other", WorkflowState::Completed, 999.0));

        let history = seeded(records);
        let expected = durations.iter().sum::<f64>() / durations.len() as f64;
        let avg = history.get_average_duration("deploy").unwrap();
        assert!((avg - expected).abs() < 1e-9);
    }

    #[test]
    fn test_stats_without_data() {
        let history = WorkflowHistory::in_memory();
        let stats = history.get_stats("deploy");
        assert_eq!(stats.total_workflows, 0);
        assert_eq!(stats.success_rate, 0.0);
        assert_eq!(stats.sample_size, 0);
        assert!(stats.average_duration.is_none());
    }

    #[test]
    fn test_stats_counts_outcomes() {
        let history = seeded(vec![
            record("deploy", "r1", WorkflowState::Completed, 10.0),
            record("deploy", "r2", WorkflowState::Completed, 20.0),
            record("deploy", "r3", WorkflowState::Failed, 5.0),
            record("deploy", "r4", WorkflowState::Cancelled, 1.0),
        ]);
        let stats = history.get_stats("deploy");
        assert_eq!(stats.total_workflows, 4);
        assert_eq!(stats.completed, 2);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.sample_size, 4);
        assert_eq!(stats.average_duration, Some(15.0));
        assert!((stats.success_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_history_filter_and_recent_order() {
        let history = seeded(vec![
            record("deploy", "r1", WorkflowState::Completed, 10.0),
            record("build", "b1", WorkflowState::Completed, 10.0),
            record("deploy", "r2", WorkflowState::Completed, 10.0),
            record("deploy", "r3", WorkflowState::Completed, 10.0),
        ]);
        let ids = |rs: Vec<&HistoryRecord>| -> Vec<String> {
            rs.iter().map(|r| r.workflow_id.to_string()).collect()
        };
        assert_eq!(ids(history.get_workflow_history(Some("deploy"))), ["r1", "r2", "r3"]);
        assert_eq!(history.get_workflow_history(None).len(), 4);
        assert_eq!(ids(history.recent(Some("deploy"), 2)), ["r3", "r2"]);
    }

    #[test]
    fn test_log_workflow_rejects_running_workflow() {
        let mut history = WorkflowHistory::in_memory();
        let mut wf = finished_workflow("run-1", WorkflowState::InProgress);
        wf.ended_at = None;

        let err = history.log_workflow(&wf, "deploy").unwrap_err();
        assert!(matches!(
            err,
            HistoryError::NotTerminal { state: WorkflowState::InProgress, .. }
        ));
        assert!(history.is_empty());
    }

    #[test]
    fn test_log_workflow_persists_and_reloads() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");

        let mut history = WorkflowHistory::open(&path).unwrap();
        let record = history
            .log_workflow(&finished_workflow("run-1", WorkflowState::Completed), "deploy")
            .unwrap();
        assert_eq!(record.duration_seconds, 40.0);
        assert_eq!(record.step_durations["build"], 30.0);

        let reopened = WorkflowHistory::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(reopened.get_workflow_history(None)[0], &record);
    }

    #[test]
    fn test_corrupt_line_does_not_block_loading() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        let lines: Vec<String> = (0..4)
            .map(|i| {
                serde_json::to_string(&record("deploy", &format!("r{i}"), WorkflowState::Completed, 10.0))
                    .unwrap()
            })
            .collect();
        let contents = format!(
            "{}\n{}\nnot json at all\n{}\n{}\n",
            lines[0], lines[1], lines[2], lines[3]
        );
        std::fs::write(&path, contents).unwrap();

        let history = WorkflowHistory::open(&path).unwrap();
        assert_eq!(history.len(), 4);
        assert_eq!(history.corrupt_lines().len(), 1);
        assert_eq!(history.corrupt_lines()[0].line, 3);
    }

    #[test]
    fn test_refresh_picks_up_external_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        let mut reader = WorkflowHistory::open(&path).unwrap();
        let mut writer = WorkflowHistory::open(&path).unwrap();

        writer
            .log_workflow(&finished_workflow("run-1", WorkflowState::Failed), "deploy")
            .unwrap();
        assert!(reader.is_empty());
        reader.refresh().unwrap();
        assert_eq!(reader.len(), 1);
    }

    #[test]
    fn test_step_samples_and_average() {
        let history = seeded(vec![
            record("deploy", "r1", WorkflowState::Completed, 10.0),
            record("deploy", "r2", WorkflowState::Failed, 20.0),
        ]);
        assert_eq!(history.step_samples("deploy", "build"), vec![8.0, 16.0]);
        assert_eq!(history.get_average_step_duration("deploy", "build"), Some(12.0));
        assert!(history.step_samples("deploy", "missing").is_empty());
        assert_eq!(history.get_average_step_duration("deploy", "missing"), None);
    }

    #[test]
    fn test_clear() {
        let mut history = seeded(vec![record("deploy", "r1", WorkflowState::Completed, 10.0)]);
        history.clear().unwrap();
        assert!(history.is_empty());
        history.refresh().unwrap();
        assert!(history.is_empty());
    }

    #[test]
    fn test_default_config_points_at_home() {
        let config = HistoryConfig::default();
        assert!(config.path.ends_with(DEFAULT_HISTORY_FILE));
    }
}
