use labelsquor_core::WorkState;

/// Errors surfaced by durable-store backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The referenced work item does not exist.
    #[error("work item not found: {0}")]
    NotFound(String),

    /// The requested edge is not in the legal-transition table. Nothing was
    /// written.
    #[error("illegal transition: {from} -> {to}")]
    IllegalTransition { from: WorkState, to: WorkState },

    /// Failed to reach the backend.
    #[error("store connection error: {0}")]
    Connection(String),

    /// The backend rejected an operation.
    #[error("store backend error: {0}")]
    Backend(String),

    /// A value could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The store is temporarily unreachable; callers back off and retry
    /// without changing item state.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether a caller should retry the same operation after a pause.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Unavailable(_))
    }
}
