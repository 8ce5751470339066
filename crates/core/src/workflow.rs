//! Workflow model - a run made of (possibly nested) steps.

use std::collections::{BTreeMap, HashMap, HashSet};
use serde::{Deserialize, Serialize};
use crate::error::{Result, TrackerError};
use crate::id::WorkflowId;
use crate::milestone::{Milestone, MilestoneKind};
use crate::state::WorkflowState;
use crate::step::Step;
use crate::time::Timestamp;

/// How sibling steps are weighted when averaging progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressWeighting {
    /// Every sibling counts the same, whatever its estimate
    #[default]
    Equal,
    /// Siblings are weighted by `estimated_duration`; siblings without one
    /// take the mean of the known estimates
    EstimatedDuration,
}

/// State of one workflow run.
///
/// Steps live in a flat map keyed by id; `step_order` records insertion
/// order over all of them and drives every enumeration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique run id
    pub workflow_id: WorkflowId,

    /// Current state
    pub state: WorkflowState,

    /// Step ids in insertion order
    pub step_order: Vec<String>,

    /// Steps keyed by id
    pub steps: BTreeMap<String, Step>,

    /// When the workflow started
    pub started_at: Option<Timestamp>,

    /// When the workflow reached a terminal state
    pub ended_at: Option<Timestamp>,

    /// Failure message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Milestones reached so far
    #[serde(default)]
    pub milestones: Vec<Milestone>,

    /// Free-form caller metadata
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Workflow {
    /// Create an empty, pending workflow.
    pub fn new(workflow_id: impl Into<WorkflowId>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            state: WorkflowState::Pending,
            step_order: Vec::new(),
            steps: BTreeMap::new(),
            started_at: None,
            ended_at: None,
            error: None,
            milestones: Vec::new(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Look up a step.
    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.get(id)
    }

    /// All steps in insertion order.
    pub fn ordered_steps(&self) -> impl Iterator<Item = &Step> {
        self.step_order.iter().filter_map(|id| self.steps.get(id))
    }

    /// Steps without a parent, in insertion order.
    pub fn top_level_steps(&self) -> impl Iterator<Item = &Step> {
        self.ordered_steps().filter(|s| s.parent_id.is_none())
    }

    /// Direct children of `parent_id`, in insertion order.
    pub fn substeps<'a, 'b>(&'a self, parent_id: &'b str) -> impl Iterator<Item = &'a Step> + 'b
    where
        'a: 'b,
    {
        self.ordered_steps()
            .filter(move |s| s.parent_id.as_deref() == Some(parent_id))
    }

    /// Check if any step names `id` as its parent.
    pub fn has_substeps(&self, id: &str) -> bool {
        self.steps.values().any(|s| s.parent_id.as_deref() == Some(id))
    }

    /// Steps without substeps, in insertion order.
    pub fn leaf_steps(&self) -> impl Iterator<Item = &Step> {
        let parents: HashSet<&str> = self
            .steps
            .values()
            .filter_map(|s| s.parent_id.as_deref())
            .collect();
        self.ordered_steps()
            .filter(move |s| !parents.contains(s.id.as_str()))
    }

    /// Wall-clock duration once ended.
    pub fn duration(&self) -> Option<f64> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) => Some(end.seconds_since(start)),
            _ => None,
        }
    }

    /// Check if a milestone of this kind was already reached.
    pub fn has_milestone(&self, kind: MilestoneKind) -> bool {
        self.milestones.iter().any(|m| m.kind == kind)
    }

    /// Overall progress in `[0, 1]`.
    ///
    /// Top-level steps are averaged; a step with substeps contributes the
    /// (recursive) average of its substeps unless it is itself completed.
    pub fn overall_progress(&self, weighting: ProgressWeighting) -> f64 {
        let mut children: HashMap<&str, Vec<&Step>> = HashMap::new();
        let mut roots = Vec::new();
        for step in self.ordered_steps() {
            match step.parent_id.as_deref() {
                Some(parent) => children.entry(parent).or_default().push(step),
                None => roots.push(step),
            }
        }
        average(&roots, &children, weighting).clamp(0.0, 1.0)
    }

    /// Check every structural invariant. Used when restoring snapshots.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(TrackerError::InvalidSnapshot(msg));

        if self.step_order.len() != self.steps.len() {
            return invalid(format!(
                "step_order lists {} ids but {} steps are present",
                self.step_order.len(),
                self.steps.len()
            ));
        }
        let mut seen = HashSet::new();
        for id in &self.step_order {
            if !seen.insert(id.as_str()) {
                return invalid(format!("step '{id}' appears twice in step_order"));
            }
            if !self.steps.contains_key(id) {
                return invalid(format!("step_order references missing step '{id}'"));
            }
        }

        for (key, step) in &self.steps {
            if &step.id != key {
                return invalid(format!("step keyed '{key}' carries id '{}'", step.id));
            }
            if let Some(parent) = &step.parent_id {
                if !self.steps.contains_key(parent) {
                    return invalid(format!("step '{key}' has unknown parent '{parent}'"));
                }
            }
            if !(0.0..=1.0).contains(&step.progress_fraction) {
                return invalid(format!(
                    "step '{key}' progress {} outside [0, 1]",
                    step.progress_fraction
                ));
            }
            check_times(key, step.started_at, step.ended_at)?;
        }

        // Walking up from any step must terminate within steps.len() hops.
        for step in self.steps.values() {
            let mut current = step.parent_id.as_deref();
            let mut hops = 0;
            while let Some(parent) = current {
                hops += 1;
                if hops > self.steps.len() {
                    return invalid(format!("parent cycle through step '{}'", step.id));
                }
                current = self.steps.get(parent).and_then(|p| p.parent_id.as_deref());
            }
        }

        check_times(self.workflow_id.as_str(), self.started_at, self.ended_at)
    }
}

impl AsRef<Workflow> for Workflow {
    fn as_ref(&self) -> &Workflow {
        self
    }
}

fn check_times(id: &str, started: Option<Timestamp>, ended: Option<Timestamp>) -> Result<()> {
    for ts in [started, ended].into_iter().flatten() {
        if !ts.is_finite() {
            return Err(TrackerError::InvalidSnapshot(format!(
                "'{id}' has a non-finite timestamp"
            )));
        }
    }
    if let (Some(start), Some(end)) = (started, ended) {
        if end < start {
            return Err(TrackerError::InvalidSnapshot(format!(
                "'{id}' ends ({end}) before it starts ({start})"
            )));
        }
    }
    Ok(())
}

fn step_progress(
    step: &Step,
    children: &HashMap<&str, Vec<&Step>>,
    weighting: ProgressWeighting,
) -> f64 {
    match children.get(step.id.as_str()) {
        Some(kids) if !step.is_complete() => average(kids, children, weighting),
        _ => step.effective_progress(),
    }
}

fn step_weight(step: &Step, children: &HashMap<&str, Vec<&Step>>) -> Option<f64> {
    match step.estimated_duration {
        Some(d) if d > 0.0 => Some(d),
        _ => {
            let total: f64 = children
                .get(step.id.as_str())?
                .iter()
                .filter_map(|c| step_weight(c, children))
                .sum();
            (total > 0.0).then_some(total)
        }
    }
}

fn average(
    steps: &[&Step],
    children: &HashMap<&str, Vec<&Step>>,
    weighting: ProgressWeighting,
) -> f64 {
    if steps.is_empty() {
        return 0.0;
    }
    let progress: Vec<f64> = steps
        .iter()
        .map(|s| step_progress(s, children, weighting))
        .collect();

    let weights: Vec<f64> = match weighting {
        ProgressWeighting::Equal => vec![1.0; steps.len()],
        ProgressWeighting::EstimatedDuration => {
            let known: Vec<Option<f64>> = steps.iter().map(|s| step_weight(s, children)).collect();
            let (sum, count) = known
                .iter()
                .flatten()
                .fold((0.0, 0usize), |(sum, n), w| (sum + w, n + 1));
            if count == 0 {
                vec![1.0; steps.len()]
            } else {
                let fill = sum / count as f64;
                known.into_iter().map(|w| w.unwrap_or(fill)).collect()
            }
        }
    };

    let total: f64 = weights.iter().sum();
    let weighted: f64 = progress.iter().zip(&weights).map(|(p, w)| p * w).sum();
    weighted / total
}
