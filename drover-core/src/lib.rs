//! # Drover Core
//!
//! Work-queue and lease coordination for fleets of polling agents that share
//! one persistent store and never talk to each other directly.
//!
//! ## Overview
//!
//! - **Score-ordered queues**: [`fifo::Fifo`] pops by score, supports
//!   protective (crash-safe) dequeue into a holding area, restore, and
//!   conditional score updates that refuse to overwrite fresher values.
//! - **Leases**: [`lease::LeaseStore`] implements keyed, time-bounded
//!   ownership with read-time expiry; [`lease::LeaseGuard`] wraps the
//!   re-check-before-every-side-effect pattern.
//! - **Monitor scheduling**: [`monitor::MonitorQueue`] chunks stale entities
//!   into due-time ordered queue items and decides when the head is due,
//!   including preemption.
//! - **Agent loops**: [`agent::AgentLoop`] and [`agent::MonitorAgent`] run the
//!   claim, act, re-claim, commit cycle against collaborator plugins.
//!
//! ## Feature Flags
//!
//! - `database` (default): Postgres queue, lease and worker stores (SQLx) and
//!   the Redis lease store. In-memory implementations are always available.
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use drover_core::fifo::{Fifo, InMemoryBackend};
//!
//! async fn enqueue() -> drover_core::Result<()> {
//!     let queue: Fifo<String> = Fifo::new(Arc::new(InMemoryBackend::new("jobs")));
//!     queue.put(&"job-1".to_string(), Some(10.0)).await?;
//!     let next = queue.get(None, true).await?;
//!     if let Some(item) = next {
//!         queue.delete(&[item.id]).await?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod codec;
pub mod config;
pub mod entity;
pub mod error;
pub mod fifo;
pub mod lease;
pub mod monitor;

pub use config::DroverConfig;
pub use error::{DroverError, Result};

/// Embedded schema migrations for the Postgres backends.
#[cfg(feature = "database")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
