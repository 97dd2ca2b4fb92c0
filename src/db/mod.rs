//! Database module: raw row models and SQL repositories for the local queue.
//!
//! This module is split into two submodules:
//! - `model`: raw rows as stored, plus their conversion into `QueueEntry`.
//! - `repo`: SQL-only functions over the SQLite pool.
//!
//! Callers normally go through `crate::queue::SqliteQueue`, which layers the
//! queue's degradation rules on top of these functions.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::QueueRow;
