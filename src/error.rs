//! Typed engine failures
//!
//! Most of the crate returns `anyhow::Result`. The variants here are the ones
//! callers need to tell apart, so they are raised as `EngineError` and can be
//! recovered with `err.downcast_ref::<EngineError>()`.

use std::path::PathBuf;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The rule catalog cannot be executed as declared (cycles, unknown
    /// dependencies, malformed or duplicate ids). Fatal: raised before any
    /// rule runs.
    #[error("configuration error in rule '{rule}': {message}")]
    Configuration { rule: String, message: String },

    /// A persisted document could not be written.
    #[error("failed to persist {}: {message}", path.display())]
    Persistence { path: PathBuf, message: String },
}

impl EngineError {
    pub fn configuration(rule: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            rule: rule.into(),
            message: message.into(),
        }
    }

    /// Rule id named by a configuration error
    pub fn rule(&self) -> Option<&str> {
        match self {
            Self::Configuration { rule, .. } => Some(rule),
            Self::Persistence { .. } => None,
        }
    }
}
