//! Execution state machine

use crate::error::{execution_error, PipelineResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    /// Dry run finished: actions were planned, nothing was applied
    Planned,
    Running,
    Succeeded,
    Failed,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

impl ExecutionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionState::Pending => "pending",
            ExecutionState::Planned => "planned",
            ExecutionState::Running => "running",
            ExecutionState::Succeeded => "succeeded",
            ExecutionState::Failed => "failed",
            ExecutionState::RollingBack => "rolling_back",
            ExecutionState::RolledBack => "rolled_back",
            ExecutionState::RollbackFailed => "rollback_failed",
        }
    }

    pub fn can_transition_to(&self, next: ExecutionState) -> bool {
        use ExecutionState::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Planned)
                | (Pending, Failed)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Failed, RollingBack)
                | (RollingBack, RolledBack)
                | (RollingBack, RollbackFailed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Planned
                | ExecutionState::Succeeded
                | ExecutionState::Failed
                | ExecutionState::RolledBack
                | ExecutionState::RollbackFailed
        )
    }

    /// Whether the target ended in its intended state
    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionState::Planned | ExecutionState::Succeeded)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transition {
    pub from: ExecutionState,
    pub to: ExecutionState,
    pub at: DateTime<Utc>,
}

/// Tracks one execution's state and its transition history
#[derive(Debug, Clone)]
pub struct StateMachine {
    state: ExecutionState,
    transitions: Vec<Transition>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: ExecutionState::Pending,
            transitions: Vec::new(),
        }
    }

    pub fn state(&self) -> ExecutionState {
        self.state
    }

    pub fn transitions(&self) -> &[Transition] {
        &self.transitions
    }

    pub fn transition(&mut self, next: ExecutionState) -> PipelineResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(execution_error(format!(
                "illegal state transition {} -> {}",
                self.state, next
            )));
        }
        self.transitions.push(Transition {
            from: self.state,
            to: next,
            at: Utc::now(),
        });
        self.state = next;
        Ok(())
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
