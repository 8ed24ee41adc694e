//! External worker backend.
//!
//! The host talks to a separately supervised worker process over TCP
//! using newline-delimited JSON frames (see [`protocol`]). The
//! [`WorkerClient`] is the host's [`ScriptBackend`](crate::backend::ScriptBackend)
//! for that connection; [`server::serve`] is the worker's accept loop.

mod client;
pub mod protocol;
pub mod server;

pub use client::WorkerClient;
pub use protocol::{ClientFrame, ErrorDetail, WorkerOutcome, WorkerRequest, WorkerResponse};
pub use server::{WorkerServer, serve};
