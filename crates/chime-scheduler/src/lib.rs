//! Durable timer dispatch core for Chime.
//!
//! This crate provides a persistent timer system that:
//! - Stores pending jobs in a relational store (SQLite via sqlx)
//! - Runs a single dispatch loop sleeping on the nearest expiry
//! - Lets mutation calls (schedule/cancel/update) safely interrupt that wait
//! - Fires sub-minute timers from memory without touching the store

mod coordinator;
mod error;
mod scheduler;
mod store;
mod types;

pub use coordinator::WaitCoordinator;
pub use error::{SchedulerError, StoreError};
pub use scheduler::{Scheduler, TimerRef};
pub use store::{SqliteStore, TimerStore};
pub use types::{Payload, Timer};
