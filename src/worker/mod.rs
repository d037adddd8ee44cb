//! Job side of the worker.
//!
//! - [`TelemetryLoop`]: advertises spare GPU capacity on a fixed interval
//! - [`CommandLoop`]: receives `run-file` commands and returns their results
//! - [`SandboxRunner`]: executes a staged file in a container or directly
//!
//! # Execution Flow
//!
//! 1. [`CommandLoop`] decodes a `run-file` frame and validates its fields
//! 2. The base64 body is written to the staging path
//! 3. [`SandboxRunner::run`] executes it and deletes the staged file
//! 4. The [`JobResult`](crate::protocol::JobResult) is sent back with the
//!    request's token as `forwarding_token`

pub mod command;
pub mod sandbox;
pub mod telemetry;

pub use command::CommandLoop;
pub use sandbox::{SandboxMode, SandboxRunner};
pub use telemetry::TelemetryLoop;
