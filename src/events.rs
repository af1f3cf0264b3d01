use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Fetching,
    Indexing,
    Clustering,
    Resolving,
    Deleting,
    Reported,
    Aborted,
}

impl RunPhase {
    pub fn can_advance_to(self, next: RunPhase) -> bool {
        use RunPhase::*;
        matches!(
            (self, next),
            (Idle, Fetching)
                | (Fetching, Indexing)
                | (Indexing, Clustering)
                | (Clustering, Resolving)
                | (Resolving, Deleting)
                | (Deleting, Reported)
                | (Idle | Fetching | Indexing | Clustering | Resolving | Deleting, Aborted)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunPhase::Reported | RunPhase::Aborted)
    }
}

/// Linear phase tracker for one run; logs every transition.
#[derive(Debug)]
pub struct RunState {
    run_id: String,
    phase: RunPhase,
    history: Vec<RunPhase>,
}

impl RunState {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self { run_id: run_id.into(), phase: RunPhase::Idle, history: vec![RunPhase::Idle] }
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn history(&self) -> &[RunPhase] {
        &self.history
    }

    pub fn advance(&mut self, next: RunPhase) {
        debug_assert!(self.phase.can_advance_to(next), "illegal transition {:?} -> {next:?}", self.phase);
        tracing::info!(run_id = %self.run_id, from = ?self.phase, to = ?next, "phase");
        self.phase = next;
        self.history.push(next);
    }
}
