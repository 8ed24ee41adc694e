//! # Nebula Core
//!
//! Identifiers shared by the Nebula script step crates.
//!
//! ```rust
//! use nebula_core::{ExecutionId, NodeId};
//!
//! let execution = ExecutionId::v4();
//! let step = NodeId::v4();
//! assert_ne!(execution.to_string(), step.to_string());
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod id;

pub use id::{ExecutionId, NodeId, UuidParseError};
