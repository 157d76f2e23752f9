use labelsquor_core::WorkState;
use labelsquor_store::StoreError;

/// Errors surfaced by the orchestrator's ingress and observability API.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The referenced work item does not exist.
    #[error("work item not found: {0}")]
    NotFound(String),

    /// The requested operation is not legal from the item's current state.
    #[error("illegal transition: {from} -> {to}")]
    IllegalTransition { from: WorkState, to: WorkState },

    /// A concurrent writer changed the item first; re-read and retry.
    #[error("conflict on work item {0}: concurrently modified")]
    Conflict(String),

    /// Invalid engine configuration or wiring.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The durable store failed.
    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for OrchestratorError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::NotFound(id),
            StoreError::IllegalTransition { from, to } => Self::IllegalTransition { from, to },
            other => Self::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_to_api_variants() {
        let err: OrchestratorError = StoreError::NotFound("wi-1".into()).into();
        assert!(matches!(err, OrchestratorError::NotFound(_)));

        let err: OrchestratorError = StoreError::IllegalTransition {
            from: WorkState::Completed,
            to: WorkState::Ready,
        }
        .into();
        assert!(matches!(err, OrchestratorError::IllegalTransition { .. }));

        let err: OrchestratorError = StoreError::Backend("boom".into()).into();
        assert!(matches!(err, OrchestratorError::Store(_)));
    }
}
