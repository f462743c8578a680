//! Current Step Information: the progress record threaded through a run.

use serde::{Deserialize, Serialize};

pub const PENDING_STEP: &str = "pending";

/// Progress snapshot for one coordinated run.
///
/// Every update returns a new value; a snapshot handed to an observer never
/// changes underneath it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Csi {
    /// Append-only, in completion order
    pub completed_steps: Vec<String>,
    /// 0..=100, never decreases within a run
    pub current_progress: u8,
    /// Fixed at run start
    pub total_steps: u32,
    /// Step name or "pending"
    pub current_step: String,
}

impl Csi {
    pub fn new(total_steps: u32) -> Self {
        Self {
            completed_steps: Vec::new(),
            current_progress: 0,
            total_steps: total_steps.max(1),
            current_step: PENDING_STEP.to_string(),
        }
    }

    /// Mark `step` as the one in flight
    pub fn begin(&self, step: &str) -> Self {
        Self {
            current_step: step.to_string(),
            ..self.clone()
        }
    }

    /// Record `step` as completed and merge its declared progress.
    pub fn advance(&self, step: &str, progress: u8) -> Self {
        let mut completed_steps = self.completed_steps.clone();
        completed_steps.push(step.to_string());
        Self {
            completed_steps,
            current_progress: self.current_progress.max(progress.min(100)),
            total_steps: self.total_steps,
            current_step: step.to_string(),
        }
    }

    /// Percentage for `completed` out of `total` steps
    pub fn progress_for(completed: usize, total: u32) -> u8 {
        if total == 0 {
            return 100;
        }
        let pct = (completed as u64 * 100) / total as u64;
        pct.min(100) as u8
    }

    pub fn is_complete(&self) -> bool {
        self.completed_steps.len() as u32 >= self.total_steps
    }
}

impl Default for Csi {
    fn default() -> Self {
        Self::new(1)
    }
}
