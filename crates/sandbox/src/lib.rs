#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! # Nebula Sandbox
//!
//! Sandboxed execution of user-supplied script steps.
//!
//! This crate provides:
//! - [`ScriptEngine`] -- runs a script step over its input records
//! - [`backend`] -- the in-process interpreter and the dispatcher that
//!   picks between it and an external worker
//! - [`worker`] -- the external worker client, wire protocol and server
//! - [`validate`] -- normalization of guest return values into records
//! - [`ContinuationPolicy`] -- continue-on-fail handling
//!
//! A step runs either once over all input records or once per record.
//! Guests only reach the host through their [`CapabilityContext`]:
//! parameters, per-execution static data, a log sink and a few helpers.

pub mod backend;
pub mod capability;
pub mod config;
pub mod engine;
pub mod error;
pub mod mode;
pub mod modules;
pub mod policy;
pub mod record;
pub mod script;
pub mod static_data;
pub mod validate;
pub mod worker;

pub use backend::{BackendKind, ExecutionRequest, InProcessSandbox, SandboxBackend, ScriptBackend};
pub use capability::{CapabilityBuilder, CapabilityContext, LogEntry, LogLevel, RunMode};
pub use config::SandboxConfig;
pub use engine::{ExecutionScope, ScriptEngine, ScriptStep};
pub use error::{ErrorKind, SandboxError, StepError, ValidationError};
pub use modules::ModuleRegistry;
pub use policy::{ContinuationPolicy, StepIdentity};
pub use record::{BinaryAttachment, ErrorRecord, InputRecord, OutputRecord, ResultRecord};
pub use script::{ExecutionMode, GuestLanguage, ScriptUnit};
pub use static_data::{StaticDataArena, StaticDataHandle};
pub use worker::WorkerClient;
