//! Progress tracking for multi-step workflows.
//!
//! Live state tracking with milestones, completion estimates from history,
//! and bottleneck detection.

#![warn(missing_docs)]

pub mod tracker;
pub mod estimator;
pub mod session;
pub mod error;

pub use tracker::{Callback, TrackerConfig, WorkflowTracker};
pub use estimator::{
    Bottleneck, Estimate, EstimateSource, EstimatorConfig, StepEstimate, TimeEstimator,
    CONFIDENCE_CEILING,
};
pub use session::WorkflowSession;
pub use error::{Result, SessionError};
