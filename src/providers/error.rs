/// Failure reported by a [`HistoryStore`](super::HistoryStore).
///
/// `is_retryable()` tells the runtime whether to put the work item back and
/// replay again (`ConcurrencyConflict`, transient storage failures) or to give
/// up on the operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// The appended event id was not `last_event_id + 1`. Another writer won.
    #[error("concurrency conflict on '{instance}': expected event_id {expected}, got {actual}")]
    ConcurrencyConflict { instance: String, expected: u64, actual: u64 },

    #[error("instance '{0}' already exists")]
    InstanceExists(String),

    #[error("instance '{0}' not found")]
    InstanceNotFound(String),

    /// I/O or backend failure.
    #[error("{operation}: {message}")]
    Storage { operation: String, message: String },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ProviderError {
    pub fn storage(operation: impl Into<String>, message: impl ToString) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConcurrencyConflict { .. } | Self::Storage { .. })
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        let conflict = ProviderError::ConcurrencyConflict {
            instance: "i".into(),
            expected: 3,
            actual: 2,
        };
        assert!(conflict.is_retryable());
        assert!(ProviderError::storage("append", "disk full").is_retryable());
        assert!(!ProviderError::InstanceNotFound("i".into()).is_retryable());
        assert!(!ProviderError::InstanceExists("i".into()).is_retryable());
    }

    #[test]
    fn display_names_operation() {
        let err = ProviderError::storage("read", "permission denied");
        assert_eq!(err.to_string(), "read: permission denied");
        let conflict = ProviderError::ConcurrencyConflict {
            instance: "order-42".into(),
            expected: 5,
            actual: 4,
        };
        assert!(conflict.to_string().contains("expected event_id 5"));
    }
}
