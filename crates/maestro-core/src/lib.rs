//! Maestro Core Domain Types
//!
//! This crate contains the domain model of the maestro with no dependencies on:
//! - Sockets or the wire protocol
//! - The async runtime
//! - Persistence
//!
//! Daemons, jobs, tasks and client sessions live here together with the
//! status machines that govern them. The coordinator in the `maestro` crate
//! owns instances of these types and drives them from protocol events.

pub mod client;
pub mod daemon;
pub mod error;
pub mod ids;
pub mod job;
pub mod status;
pub mod task;

// Re-export commonly used types
pub use client::Client;
pub use daemon::{split_tags, Daemon, DaemonError, DaemonInfo};
pub use error::CoreError;
pub use ids::{ClientId, DaemonAddress, JobId, TaskKey};
pub use job::{GroupType, Job, JobEvent, JobInfo, RunType};
pub use status::{DaemonErrorKind, DaemonState, JobStatus};
pub use task::Task;
