//! Error types for VSite update cycles.

use thiserror::Error;

use super::UpdatePhase;

/// Backend-specific failures of a VSite update cycle.
///
/// These are scoped to one VSite: they schedule that VSite's own retry
/// deadline and never touch the database session.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UpdateError {
    /// A backend step failed for a backend-specific reason.
    #[error("VSite '{vsite}' failed while {phase}: {reason}")]
    Backend {
        vsite: String,
        phase: UpdatePhase,
        reason: String,
    },

    /// The backend failed on local I/O.
    #[error("VSite '{vsite}' I/O failure while {phase}")]
    Io {
        vsite: String,
        phase: UpdatePhase,
        #[source]
        source: std::io::Error,
    },

    /// An update was requested for a VSite this agent does not serve.
    #[error("Unknown VSite '{vsite}'")]
    UnknownVSite { vsite: String },
}

impl UpdateError {
    /// Get the VSite name this error is about.
    pub fn vsite(&self) -> &str {
        match self {
            UpdateError::Backend { vsite, .. }
            | UpdateError::Io { vsite, .. }
            | UpdateError::UnknownVSite { vsite } => vsite,
        }
    }

    /// Get the phase the cycle was in, if any.
    pub fn phase(&self) -> Option<UpdatePhase> {
        match self {
            UpdateError::Backend { phase, .. } | UpdateError::Io { phase, .. } => Some(*phase),
            UpdateError::UnknownVSite { .. } => None,
        }
    }
}

impl From<UpdateError> for crate::Error {
    fn from(err: UpdateError) -> Self {
        crate::Error::Update(err)
    }
}
