//! Workflow history storage for flowtrack.
//!
//! This crate provides a trait-based store for finished workflow runs with a
//! JSON Lines reference implementation, plus the query layer estimators use.

#![warn(missing_docs)]

pub mod trait_;
pub mod jsonl_store;
pub mod memory_store;
pub mod history;

pub use trait_::{CorruptLine, HistoryError, HistoryStore, LoadedHistory, Result};
pub use jsonl_store::JsonlHistoryStore;
pub use memory_store::MemoryHistoryStore;
pub use history::{HistoryConfig, HistoryStats, WorkflowHistory, DEFAULT_HISTORY_FILE};
