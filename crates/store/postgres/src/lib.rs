//! `PostgreSQL` backend for the LabelSquor durable work-item store.
//!
//! State changes are single conditional `UPDATE` statements guarded by
//! `state` and `version`, committed in one transaction with the transition
//! audit row and the outbox event. Migrations are idempotent and run at
//! startup under a configurable table prefix.

mod config;
mod migrations;
mod store;

pub use config::PostgresConfig;
pub use migrations::run_migrations;
pub use store::PostgresWorkItemStore;
