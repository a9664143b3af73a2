use std::fmt;

use serde::{Deserialize, Serialize};

use super::TransitionError;

/// The phases of one portal automation session.
///
/// A session flows through:
/// INIT → NAVIGATE_LOGIN → SUBMIT_CREDENTIALS → AUTHENTICATED →
/// LOCATE_TARGET_SECTION → SELECT_ITEMS → TRIGGER_DOWNLOAD → DONE,
/// and may drop to FAILED from any non-terminal phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortalState {
    Init,
    NavigateLogin,
    SubmitCredentials,
    Authenticated,
    LocateTargetSection,
    SelectItems,
    TriggerDownload,
    Done,
    Failed,
}

impl fmt::Display for PortalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PortalState::Init => "INIT",
            PortalState::NavigateLogin => "NAVIGATE_LOGIN",
            PortalState::SubmitCredentials => "SUBMIT_CREDENTIALS",
            PortalState::Authenticated => "AUTHENTICATED",
            PortalState::LocateTargetSection => "LOCATE_TARGET_SECTION",
            PortalState::SelectItems => "SELECT_ITEMS",
            PortalState::TriggerDownload => "TRIGGER_DOWNLOAD",
            PortalState::Done => "DONE",
            PortalState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

impl PortalState {
    /// The successor on the happy path, `None` for terminal phases.
    pub fn successor(self) -> Option<PortalState> {
        match self {
            PortalState::Init => Some(PortalState::NavigateLogin),
            PortalState::NavigateLogin => Some(PortalState::SubmitCredentials),
            PortalState::SubmitCredentials => Some(PortalState::Authenticated),
            PortalState::Authenticated => Some(PortalState::LocateTargetSection),
            PortalState::LocateTargetSection => Some(PortalState::SelectItems),
            PortalState::SelectItems => Some(PortalState::TriggerDownload),
            PortalState::TriggerDownload => Some(PortalState::Done),
            PortalState::Done | PortalState::Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PortalState::Done | PortalState::Failed)
    }
}

/// Tracks the current phase of a session and every phase it has left.
#[derive(Debug, Clone)]
pub struct PortalMachine {
    state: PortalState,
    history: Vec<PortalState>,
}

impl Default for PortalMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl PortalMachine {
    pub fn new() -> Self {
        Self {
            state: PortalState::Init,
            history: Vec::new(),
        }
    }

    pub fn state(&self) -> PortalState {
        self.state
    }

    /// Every phase visited so far, including the current one.
    pub fn trail(&self) -> Vec<PortalState> {
        let mut trail = self.history.clone();
        trail.push(self.state);
        trail
    }

    /// Step to the next happy-path phase.
    pub fn advance(&mut self, next: PortalState) -> Result<(), TransitionError> {
        if self.state.successor() != Some(next) {
            return Err(TransitionError::new(self.state, next));
        }
        self.history.push(self.state);
        self.state = next;
        Ok(())
    }

    /// Drop to FAILED. Returns the phase that failed.
    pub fn fail(&mut self) -> PortalState {
        let failed_in = self.state;
        if !failed_in.is_terminal() {
            self.history.push(failed_in);
            self.state = PortalState::Failed;
        }
        failed_in
    }
}
