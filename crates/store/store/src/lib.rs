//! Durable-store abstraction for the LabelSquor orchestrator.
//!
//! The [`WorkItemStore`] trait defines the two atomic primitives the rest of
//! the system is built on (compare-and-transition and acquire-lock-if-free)
//! together with the scheduling queries, the event outbox, quota counters,
//! metrics, and the dead-letter log. Backends live
//! in sibling crates (`labelsquor-store-memory`, `labelsquor-store-postgres`)
//! and are validated by the shared [`testing`] conformance suite.

pub mod error;
pub mod request;
pub mod store;
pub mod testing;

pub use error::StoreError;
pub use request::{FieldUpdate, TransitionChanges, TransitionOutcome, TransitionRequest};
pub use store::{ClaimCandidate, ItemFilter, WorkItemStore};
