//! Task store: durable persistence for the dispatcher.
//!
//! Two backends implement the same [`store::TaskStore`] contract: the
//! Postgres store ([`pg::PgTaskStore`]) for production and an in-memory
//! store ([`mem::MemTaskStore`]) for development and tests. Conditional
//! state transitions are compare-and-swap operations in both.

pub mod config;
pub mod mem;
pub mod models;
pub mod notify;
pub mod pg;
pub mod pool;
pub mod queries;
pub mod store;
