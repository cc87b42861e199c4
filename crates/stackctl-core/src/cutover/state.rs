use crate::error::StateMachineError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Cutover state; each one names the proxy mode that is live while in it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CutoverState {
    /// Proxy serves only the challenge path
    ChallengeMode,
    /// Certificate client running (proxy still in challenge mode)
    Issuing,
    /// Issued certificate being checked (proxy still in challenge mode)
    Verifying,
    /// Proxy serves production with the new certificate
    ProductionMode,
    /// Previous configuration restored
    RolledBack,
}

impl CutoverState {
    /// All states
    pub const ALL: [Self; 5] = [
        Self::ChallengeMode,
        Self::Issuing,
        Self::Verifying,
        Self::ProductionMode,
        Self::RolledBack,
    ];

    /// True if no transition leaves this state
    #[must_use]
    pub fn is_terminal(self) -> bool {
        allowed_transitions(Some(self)).is_empty()
    }
}

impl fmt::Display for CutoverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ChallengeMode => "challenge mode",
            Self::Issuing => "issuing",
            Self::Verifying => "verifying",
            Self::ProductionMode => "production mode",
            Self::RolledBack => "rolled back",
        })
    }
}

/// Validates a state transition; `from = None` is the initial entry.
///
/// # Errors
///
/// `StateMachineError::IllegalTransition` for anything outside the table.
pub fn validate_transition(from: Option<CutoverState>, to: CutoverState) -> Result<(), StateMachineError> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(StateMachineError::IllegalTransition { from, to })
    }
}

/// States reachable from `from` in one step
#[must_use]
pub fn allowed_transitions(from: Option<CutoverState>) -> Vec<CutoverState> {
    use CutoverState::{ChallengeMode, Issuing, ProductionMode, RolledBack, Verifying};
    match from {
        // a run either enters challenge mode or finds production already live
        None => vec![ChallengeMode, ProductionMode],
        Some(ChallengeMode) => vec![Issuing, RolledBack],
        Some(Issuing) => vec![Verifying, RolledBack],
        Some(Verifying) => vec![ProductionMode, RolledBack],
        Some(ProductionMode | RolledBack) => vec![],
    }
}

/// One recorded transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transition {
    /// State left (`None` for the initial entry)
    pub from: Option<CutoverState>,
    /// State entered
    pub to: CutoverState,
    /// When it happened
    pub at: DateTime<Utc>,
}

/// Single-writer cutover state with its transition history
#[derive(Debug, Clone, Default)]
pub struct CutoverMachine {
    state: Option<CutoverState>,
    history: Vec<Transition>,
}

impl CutoverMachine {
    /// Machine that has not entered any state yet
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> Option<CutoverState> {
        self.state
    }

    /// Move to `to` if the table allows it
    ///
    /// # Errors
    ///
    /// `StateMachineError::IllegalTransition`; the state is left unchanged.
    pub fn advance(&mut self, to: CutoverState) -> Result<(), StateMachineError> {
        validate_transition(self.state, to)?;
        tracing::debug!(from = ?self.state, to = %to, "cutover transition");
        self.history.push(Transition {
            from: self.state,
            to,
            at: Utc::now(),
        });
        self.state = Some(to);
        Ok(())
    }

    /// Transitions so far, oldest first
    #[must_use]
    pub fn history(&self) -> &[Transition] {
        &self.history
    }

    /// Consume the machine, keeping its history
    #[must_use]
    pub fn into_history(self) -> Vec<Transition> {
        self.history
    }
}
