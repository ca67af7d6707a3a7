//! wuBase test-data acquisition.
//!
//! Configures a wuBase over its serial link, runs an ordered setup batch,
//! then supervises a timed pulse-acquisition run while a background thread
//! streams received bytes into an optional output file.
//!
//! # Run lifecycle
//!
//! 1. Open a [`DeviceSession`] (normally a [`SerialSession`]).
//! 2. Execute a [`SetupPlan`] strictly in order, each command followed by its
//!    settle delay.
//! 3. [`Supervisor::run`] launches the receive thread and polls its
//!    [`ReceiveMonitor`] until the source is exhausted, the [`RunLimit`]
//!    elapses or the operator interrupts.
//! 4. Shutdown joins the receive thread with a grace period, queries the final
//!    status and closes the output. The outcome is a [`RunResult`] whose
//!    [`RunResult::exit_code`] becomes the process exit status.

pub mod config;
mod errors;
pub mod logging;
pub mod output;
pub mod plan;
pub mod serial;
pub mod session;
pub mod signal;
pub mod supervisor;

pub use config::{Args, Config};
pub use errors::*;
pub use output::OutputSink;
pub use plan::{CommandOutcome, SetupCommand, SetupFailurePolicy, SetupPlan};
pub use serial::SerialSession;
pub use session::{DeviceSession, ReceiveMonitor, StreamRequest};
pub use signal::CancelToken;
pub use supervisor::{EndReason, RunLimit, RunResult, StopTrigger, Supervisor, SupervisorConfig};
