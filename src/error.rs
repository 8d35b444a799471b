//! Errors surfaced to orchestration code and recorded in history.

use serde::{Deserialize, Serialize};

/// Failure recorded in history and returned to orchestration code.
///
/// Values of this type are persisted inside `ActivityFailed`,
/// `SubOrchestrationFailed` and `OrchestrationFailed` events, so the variants
/// must stay serializable and stable across versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum OrchestrationError {
    /// The activity handler returned an error.
    #[error("activity '{name}' failed: {cause}")]
    ActivityExecution { name: String, cause: String },

    /// No handler is registered under the activity name.
    #[error("unknown activity '{0}'")]
    UnknownActivity(String),

    /// A child orchestration finished with an error.
    #[error("sub-orchestration '{name}' failed: {cause}")]
    SubOrchestrationFailed { name: String, cause: String },

    /// No handler is registered under the orchestration name (or pinned version).
    #[error("unknown orchestration '{0}'")]
    UnknownOrchestration(String),

    /// Replay issued a call sequence that does not match stored history.
    #[error("nondeterministic orchestration: {0}")]
    DeterminismViolation(String),

    /// Orchestration code panicked.
    #[error("orchestration panicked: {0}")]
    Panicked(String),

    /// Failure raised by orchestration code itself.
    #[error("{0}")]
    Application(String),
}

impl OrchestrationError {
    /// Convenience constructor for application-level failures.
    pub fn application(message: impl Into<String>) -> Self {
        Self::Application(message.into())
    }

    /// Fatal errors fail the instance without giving orchestration code a
    /// chance to handle them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::UnknownActivity(_)
                | Self::UnknownOrchestration(_)
                | Self::DeterminismViolation(_)
                | Self::Panicked(_)
        )
    }
}

impl From<String> for OrchestrationError {
    fn from(message: String) -> Self {
        Self::Application(message)
    }
}

impl From<&str> for OrchestrationError {
    fn from(message: &str) -> Self {
        Self::Application(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_classification() {
        assert!(OrchestrationError::UnknownActivity("A".into()).is_fatal());
        assert!(OrchestrationError::DeterminismViolation("x".into()).is_fatal());
        assert!(
            !OrchestrationError::ActivityExecution {
                name: "A".into(),
                cause: "boom".into()
            }
            .is_fatal()
        );
        assert!(!OrchestrationError::application("nope").is_fatal());
    }

    #[test]
    fn display_includes_name_and_cause() {
        let err = OrchestrationError::ActivityExecution {
            name: "ProcessPayment".into(),
            cause: "card declined".into(),
        };
        assert_eq!(err.to_string(), "activity 'ProcessPayment' failed: card declined");
    }

    #[test]
    fn survives_json_round_trip_inside_events() {
        let err = OrchestrationError::SubOrchestrationFailed {
            name: "Notify".into(),
            cause: "x".into(),
        };
        let s = serde_json::to_string(&err).unwrap();
        let back: OrchestrationError = serde_json::from_str(&s).unwrap();
        assert_eq!(back, err);
    }
}
