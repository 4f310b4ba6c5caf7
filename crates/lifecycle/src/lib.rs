//! Platform lifecycle engine.
//!
//! Three orchestrators share one set of client abstractions:
//!
//! - [`validation`]: ordered health checks across cluster, services, data
//!   stores, network, security and resources.
//! - [`backup`]: database backups with compression, encryption, checksums,
//!   verification and point-in-time restore.
//! - [`teardown`]: a confirmation-gated state machine that drains and deletes
//!   an environment.
//!
//! Remote systems are reached only through the traits in [`clients`], so
//! every orchestrator runs against in-memory fakes in tests.

pub mod backup;
pub mod clients;
pub mod config;
pub mod error;
pub mod exit;
pub mod retry;
pub mod teardown;
pub mod validation;

#[cfg(test)]
mod testing;

pub use config::LifecycleConfig;
pub use error::{LifecycleError, Result};
pub use exit::ExitSignal;
