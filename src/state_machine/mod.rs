mod job;
mod state;

use std::fmt::Display;

use thiserror::Error;

pub use job::{Job, JobReport, JobStatus, TerminalStatus};
pub use state::{PortalMachine, PortalState};

/// A state change that the lifecycle rules do not allow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub from: String,
    pub to: String,
}

impl TransitionError {
    pub fn new(from: impl Display, to: impl Display) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}
