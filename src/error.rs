//! Error taxonomy (§7). Every public operation that can fail in a way a
//! caller needs to branch on returns `SibylError`; internal plumbing uses
//! `anyhow::Result` and is narrowed to this taxonomy at the boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SibylError {
    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("capacity exceeded: {0}")]
    Capacity(String),

    #[error("runner fault: {0}")]
    RunnerFault(String),

    /// Not a failure — a quality gate reporting `passed=false` is a protocol
    /// signal, carried as a value (`GateResult`) everywhere except where an
    /// orchestrator needs to short-circuit on it via `?`.
    #[error("gate failed: {0}")]
    GateFailure(String),

    #[error("internal error (correlation {correlation_id}): {message}")]
    Internal {
        correlation_id: String,
        message: String,
    },
}

impl SibylError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            correlation_id: crate::domain::new_id("err"),
            message: message.into(),
        }
    }

    /// Narrow an `anyhow::Error` to the taxonomy by downcasting first,
    /// falling back to `Internal` with a fresh correlation id. Mirrors the
    /// structured-marker-then-heuristic-fallback strategy used to classify
    /// RPC errors at the gateway boundary.
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        match err.downcast::<SibylError>() {
            Ok(known) => known,
            Err(err) => {
                let msg = err.to_string();
                if msg.starts_with("REPO_NOT_FOUND") || msg.contains("not found") {
                    Self::NotFound(msg)
                } else {
                    Self::internal(msg)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_anyhow_preserves_a_downcastable_sibyl_error() {
        let original = anyhow::Error::new(SibylError::Conflict("task already claimed".to_string()));
        match SibylError::from_anyhow(original) {
            SibylError::Conflict(msg) => assert_eq!(msg, "task already claimed"),
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[test]
    fn from_anyhow_classifies_not_found_by_message() {
        let err = anyhow::anyhow!("runner not found: r-123");
        match SibylError::from_anyhow(err) {
            SibylError::NotFound(msg) => assert!(msg.contains("r-123")),
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn from_anyhow_classifies_repo_not_found_marker() {
        let err = anyhow::anyhow!("REPO_NOT_FOUND: org/proj");
        match SibylError::from_anyhow(err) {
            SibylError::NotFound(_) => {}
            other => panic!("expected NotFound, got {other:?}"),
        }
    }

    #[test]
    fn from_anyhow_falls_back_to_internal_with_a_correlation_id() {
        let err = anyhow::anyhow!("disk full");
        match SibylError::from_anyhow(err) {
            SibylError::Internal { correlation_id, message } => {
                assert!(correlation_id.starts_with("err"));
                assert_eq!(message, "disk full");
            }
            other => panic!("expected Internal, got {other:?}"),
        }
    }
}
