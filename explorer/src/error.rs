//! Error taxonomy for exploration sessions.
//!
//! Only [`ExploreError::ScopeLoss`] ends a running session. Device and oracle
//! failures degrade to best-effort continuation and are reported through the
//! observer. Budget exhaustion is not an error at all; see
//! [`crate::session::EventKind::BudgetReached`].

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExploreError {
    /// A start request arrived while another session was active.
    #[error("an exploration session is already running")]
    SessionActive,

    #[error("invalid exploration settings: {0}")]
    InvalidSettings(String),

    /// A single device action failed. The engine skips the affected candidate.
    #[error("device action `{action}` failed: {message}")]
    DeviceAction {
        action: &'static str,
        message: String,
    },

    /// The current screen stayed outside the target app after every recovery attempt.
    #[error(
        "left target app `{app_id}` (current activity `{activity}`) and {attempts} relaunch attempts did not recover"
    )]
    ScopeLoss {
        app_id: String,
        activity: String,
        attempts: u32,
    },

    /// The decision oracle was unreachable or answered with something unusable.
    #[error("decision oracle failed: {0}")]
    Oracle(String),
}

impl ExploreError {
    pub fn device(action: &'static str, err: &anyhow::Error) -> Self {
        Self::DeviceAction {
            action,
            message: format!("{err:#}"),
        }
    }

    /// Whether this error terminates the session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ScopeLoss { .. })
    }
}
