//! Newtype wrappers for identifiers to ensure type safety.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            /// Create a new identifier from a string.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the inner string reference.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner string.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

string_id!(
    /// Server-assigned job identifier. Issued from a monotonically
    /// increasing counter, so ids are never reused within a process.
    JobId
);

string_id!(
    /// Network address of a daemon (`host:port`); the daemon's identity.
    DaemonAddress
);

string_id!(
    /// Identifier of one client protocol connection.
    ClientId
);

impl JobId {
    /// Build the id for the `n`-th submitted job.
    pub fn from_counter(n: u64) -> Self {
        Self(n.to_string())
    }
}

impl ClientId {
    /// Generate a new random ClientId.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl DaemonAddress {
    /// Host part of the address, without the port.
    pub fn host(&self) -> &str {
        match self.0.rsplit_once(':') {
            Some((host, port)) if port.parse::<u16>().is_ok() => host,
            _ => &self.0,
        }
    }

    /// Returns the address with `default_port` appended when it carries none.
    pub fn with_default_port(address: &str, default_port: u16) -> Self {
        let address = address.trim();
        match address.rsplit_once(':') {
            Some((_, port)) if port.parse::<u16>().is_ok() => Self::new(address),
            _ => Self(format!("{address}:{default_port}")),
        }
    }
}

/// Key of a task in the global task registry: `job-id:fraction`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub job: JobId,
    pub fraction: u32,
}

impl TaskKey {
    pub fn new(job: JobId, fraction: u32) -> Self {
        Self { job, fraction }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.job, self.fraction)
    }
}
