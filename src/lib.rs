//! devsup - supervise a fixed set of local development services.
//!
//! Services are launched in `start_order` tiers, given a resolved port,
//! health-checked over HTTP, restarted under a bounded policy, and stopped
//! in reverse order on shutdown.

pub mod arbiter;
pub mod child;
pub mod config;
pub mod control;
pub mod error;
pub mod health;
pub mod log_ring;
pub mod policy;
pub mod report;
pub mod supervisor;

pub use config::{ServiceSpec, SupervisorConfig, SupervisorSettings};
pub use error::{ConfigError, SupervisorError};
pub use supervisor::{ChildStatus, RunOutcome, ShutdownHandle, StatusBoard, Supervisor};
