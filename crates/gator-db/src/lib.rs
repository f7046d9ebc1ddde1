//! Durable storage for the mission orchestrator: projects, missions,
//! tasks, processes, and the append-only audit log.
//!
//! Backed by an embedded sqlite file (§4.1 of the design doc); every
//! mutation that must be atomic across rows runs inside one transaction.

pub mod config;
pub mod error;
pub mod ids;
pub mod models;
pub mod pool;
pub mod queries;

pub use error::{StoreError, StoreResult};
