//! Domain model for ebtrace
//!
//! This module contains core domain types and errors that provide:
//! - Compile-time safety via newtype pattern
//! - Self-documenting function signatures
//! - Structured error handling

pub mod errors;
pub mod types;

pub use types::{CpuId, Pid, StartTime, Timestamp};

pub use errors::{AttachError, ConsumerError, RegistryError, ResolveError, StartupError};
