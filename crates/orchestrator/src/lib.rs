//! Durable, concurrent workflow engine for the LabelSquor enrichment
//! pipeline.
//!
//! Work items move through a strict state machine persisted by a
//! [`WorkItemStore`](labelsquor_store::WorkItemStore) backend. Cooperating
//! workers claim ready items under lease-based locks, run one pipeline
//! stage at a time through registered [`StageHandler`]s, and map each
//! outcome to an audited transition. External-API quota exhaustion parks
//! items with their partial progress intact; the resume sweeper wakes them
//! when the window resets. Every state change co-commits an outbox event
//! that the [`EventBus`] delivers to in-process subscribers in write order.

pub mod builder;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod executor;
pub mod handler;
pub mod lock;
pub mod metrics;
pub mod orchestrator;
pub mod pool;
pub mod quota;
pub mod sweeper;
pub mod views;
pub mod worker;

pub use builder::OrchestratorBuilder;
pub use dispatcher::Dispatcher;
pub use error::OrchestratorError;
pub use events::{EventBus, EventSubscriber, SubscriberError};
pub use executor::StageExecutor;
pub use handler::{HandlerRegistry, StageContext, StageHandler};
pub use lock::{LockLease, LockManager};
pub use metrics::{MetricsSnapshot, OrchestratorMetrics};
pub use orchestrator::Orchestrator;
pub use pool::WorkerPool;
pub use quota::QuotaManager;
pub use sweeper::ResumeSweeper;
pub use views::{DurationStats, EngineStats, QuotaUtilization, collect_stats, percentile};
pub use worker::Worker;
