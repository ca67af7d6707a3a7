//! Supervised acquisition run.
//!
//! A run moves through `Idle → Running → {Completed, TimedOut, Interrupted} →
//! ShuttingDown → Done`. The receive itself happens on a background thread
//! that owns the device link for the whole receive window; the foreground
//! only polls the shared [`ReceiveMonitor`] and the wall clock.
//!
//! Whatever ends the polling loop, shutdown is the same: request a stop, join
//! the receive thread for at most the grace period, query the final device
//! status, close the output. Every step is attempted even when an earlier one
//! failed.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::{Serialize, Serializer};

use crate::errors::Result;
use crate::output::OutputSink;
use crate::plan::{CommandOutcome, SetupFailurePolicy, SetupPlan};
use crate::session::{DeviceSession, ReceiveMonitor, StreamRequest};
use crate::signal::CancelToken;

// ============================================================================
// Constants
// ============================================================================

/// How often the running flag is checked and progress is logged.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Sleep between loop iterations.
pub const DEFAULT_TICK: Duration = Duration::from_millis(100);

/// How long the receive thread gets to stop before it is declared stuck.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Default wall-clock budget of a run.
pub const DEFAULT_RUN_LIMIT: Duration = Duration::from_secs(60);

// ============================================================================
// Configuration
// ============================================================================

/// Wall-clock budget of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunLimit {
    /// Run until the source is exhausted or the operator interrupts.
    Unbounded,
    /// Stop once this much time has passed since acquisition started.
    After(Duration),
}

impl RunLimit {
    /// Seconds as given on the command line; any negative value disables the limit.
    pub fn from_secs(secs: i64) -> Self {
        u64::try_from(secs)
            .map(|s| RunLimit::After(Duration::from_secs(s)))
            .unwrap_or(RunLimit::Unbounded)
    }

    pub fn is_exceeded(&self, elapsed: Duration) -> bool {
        match self {
            RunLimit::Unbounded => false,
            RunLimit::After(limit) => elapsed >= *limit,
        }
    }
}

impl Default for RunLimit {
    fn default() -> Self {
        RunLimit::After(DEFAULT_RUN_LIMIT)
    }
}

impl fmt::Display for RunLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunLimit::Unbounded => write!(f, "no time limit"),
            RunLimit::After(d) => write!(f, "{} seconds", d.as_secs_f64()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub run_limit: RunLimit,
    pub poll_interval: Duration,
    pub tick: Duration,
    pub grace_period: Duration,
    pub request: StreamRequest,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            run_limit: RunLimit::default(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            tick: DEFAULT_TICK,
            grace_period: DEFAULT_GRACE_PERIOD,
            request: StreamRequest::default(),
        }
    }
}

// ============================================================================
// Run Result
// ============================================================================

/// What ended the polling loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopTrigger {
    /// The receive thread finished on its own: the source is exhausted.
    Completed,
    TimedOut,
    Interrupted,
}

/// How the run ended, after shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Completed,
    TimedOut,
    Interrupted,
    /// The receive thread was still alive after the grace period.
    ThreadStuck,
}

impl From<StopTrigger> for EndReason {
    fn from(t: StopTrigger) -> Self {
        match t {
            StopTrigger::Completed => EndReason::Completed,
            StopTrigger::TimedOut => EndReason::TimedOut,
            StopTrigger::Interrupted => EndReason::Interrupted,
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndReason::Completed => "completed",
            EndReason::TimedOut => "timed out",
            EndReason::Interrupted => "interrupted",
            EndReason::ThreadStuck => "receive thread stuck",
        };
        f.write_str(s)
    }
}

/// Process exit status for a failed device/setup/receive step.
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_TIMED_OUT: i32 = 3;
pub const EXIT_THREAD_STUCK: i32 = 4;
pub const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub end_reason: EndReason,
    pub trigger: StopTrigger,
    /// Device status queried after shutdown, if the query succeeded.
    pub final_status: Option<String>,
    pub bytes_received: u64,
    /// Time from launching the receive thread to the stop trigger.
    #[serde(serialize_with = "as_secs")]
    pub elapsed: Duration,
    /// Whether the receive thread was joined within the grace period.
    pub joined: bool,
    /// Error returned (or panic raised) by the receive thread.
    pub receive_error: Option<String>,
    pub output_closed: bool,
    pub setup: Vec<CommandOutcome>,
}

impl RunResult {
    /// Exit status for the process: 0 only for a clean, complete run.
    pub fn exit_code(&self) -> i32 {
        match self.end_reason {
            EndReason::Completed if self.receive_error.is_none() => 0,
            EndReason::Completed => EXIT_FAILURE,
            EndReason::TimedOut => EXIT_TIMED_OUT,
            EndReason::ThreadStuck => EXIT_THREAD_STUCK,
            EndReason::Interrupted => EXIT_INTERRUPTED,
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code() == 0
    }
}

fn as_secs<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64())
}

// ============================================================================
// Supervisor
// ============================================================================

/// Clears the running flag when the receive thread exits, panics included.
struct RunningGuard(Arc<ReceiveMonitor>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.set_running(false);
    }
}

enum JoinOutcome {
    Finished(u64),
    Failed(String),
    Stuck,
}

pub struct Supervisor<S> {
    session: Arc<S>,
    config: SupervisorConfig,
    cancel: CancelToken,
}

impl<S> Supervisor<S>
where
    S: DeviceSession + 'static,
{
    pub fn new(session: Arc<S>, config: SupervisorConfig, cancel: CancelToken) -> Self {
        Self {
            session,
            config,
            cancel,
        }
    }

    /// Execute the setup plan, then run a supervised acquisition.
    ///
    /// A setup failure under [`SetupFailurePolicy::Abort`] is returned as an
    /// error; the output is closed and acquisition never starts.
    pub fn run(
        &self,
        plan: &SetupPlan,
        policy: SetupFailurePolicy,
        output: Option<OutputSink>,
    ) -> Result<RunResult> {
        info!("sending {} setup commands", plan.len());
        let setup = match plan.execute(self.session.as_ref(), policy) {
            Ok(outcomes) => outcomes,
            Err(e) => {
                if let Some(sink) = &output {
                    if let Err(close_err) = sink.close() {
                        error!("failed to close output {}: {}", sink.label(), close_err);
                    }
                }
                return Err(e);
            }
        };

        let mut result = self.acquire(output)?;
        result.setup = setup;
        Ok(result)
    }

    /// Run the receive in the background until it completes, times out or is
    /// interrupted, then shut down.
    ///
    /// Only fails if the receive thread cannot be spawned.
    pub fn acquire(&self, output: Option<OutputSink>) -> Result<RunResult> {
        let monitor = Arc::new(ReceiveMonitor::new());
        let output = output.map(Arc::new);

        // Interrupted during setup: the device is never told to stream.
        if self.cancel.is_cancelled() {
            warn!("run interrupted before acquisition started");
            let final_status = self.final_status();
            let output_closed = close_output(output.as_deref());
            return Ok(RunResult {
                end_reason: EndReason::Interrupted,
                trigger: StopTrigger::Interrupted,
                final_status,
                bytes_received: 0,
                elapsed: Duration::ZERO,
                joined: true,
                receive_error: None,
                output_closed,
                setup: Vec::new(),
            });
        }

        // Idle -> Running
        info!("start run, {}", self.config.run_limit);
        monitor.set_running(true);
        let handle = match self.spawn_receiver(&monitor, output.clone()) {
            Ok(h) => h,
            Err(e) => {
                monitor.set_running(false);
                close_output(output.as_deref());
                return Err(e.into());
            }
        };
        let started = Instant::now();

        // Running -> {Completed, TimedOut, Interrupted}
        let trigger = self.poll(&monitor, started);
        let elapsed = started.elapsed();
        match trigger {
            StopTrigger::Completed => info!("end of batch data readout after {:.1?}", elapsed),
            StopTrigger::TimedOut => error!(
                "run exceeded {} ({:.1?} elapsed), stopping",
                self.config.run_limit, elapsed
            ),
            StopTrigger::Interrupted => warn!("run interrupted after {:.1?}, stopping", elapsed),
        }

        // ShuttingDown
        monitor.request_stop();
        let (joined, receive_error) = match self.join_with_grace(handle) {
            JoinOutcome::Finished(n) => {
                debug!("receive thread finished, {} bytes", n);
                (true, None)
            }
            JoinOutcome::Failed(msg) => {
                error!("receive failed: {}", msg);
                (true, Some(msg))
            }
            JoinOutcome::Stuck => {
                error!(
                    "receive thread failed to stop within {:?}",
                    self.config.grace_period
                );
                (false, None)
            }
        };
        let end_reason = if joined {
            EndReason::from(trigger)
        } else {
            EndReason::ThreadStuck
        };

        // Done
        let final_status = self.final_status();
        let output_closed = close_output(output.as_deref());
        let bytes_received = monitor.bytes_received();
        info!("run {}: {} bytes received", end_reason, bytes_received);

        Ok(RunResult {
            end_reason,
            trigger,
            final_status,
            bytes_received,
            elapsed,
            joined,
            receive_error,
            output_closed,
            setup: Vec::new(),
        })
    }

    // ------------------------------------------------------------------------
    // Internal Methods
    // ------------------------------------------------------------------------

    fn final_status(&self) -> Option<String> {
        match self.session.query_status() {
            Ok(status) => {
                info!("final status: {}", status);
                Some(status)
            }
            Err(e) => {
                error!("final status query failed: {}", e);
                None
            }
        }
    }

    fn spawn_receiver(
        &self,
        monitor: &Arc<ReceiveMonitor>,
        output: Option<Arc<OutputSink>>,
    ) -> std::io::Result<JoinHandle<Result<u64>>> {
        let session = Arc::clone(&self.session);
        let monitor = Arc::clone(monitor);
        let request = self.config.request;

        thread::Builder::new()
            .name("wubase-rx".into())
            .spawn(move || {
                let _running = RunningGuard(Arc::clone(&monitor));
                session.stream_receive(&request, output.as_deref(), &monitor)
            })
    }

    fn poll(&self, monitor: &ReceiveMonitor, started: Instant) -> StopTrigger {
        let mut last_poll = started;
        loop {
            thread::sleep(self.config.tick);
            let now = Instant::now();

            if self.cancel.is_cancelled() {
                return StopTrigger::Interrupted;
            }

            if now.duration_since(last_poll) >= self.config.poll_interval {
                last_poll = now;
                if !monitor.is_running() {
                    return StopTrigger::Completed;
                }
                let bytes = monitor.bytes_received();
                let secs = now.duration_since(started).as_secs_f64();
                info!(
                    "progress: {:.2e} bytes ({:.1} kB/s)",
                    bytes as f64,
                    bytes as f64 / secs.max(f64::EPSILON) / 1e3
                );
            }

            if self.config.run_limit.is_exceeded(now.duration_since(started)) {
                // a receive that finished right at the limit still counts as complete
                if !monitor.is_running() {
                    return StopTrigger::Completed;
                }
                return StopTrigger::TimedOut;
            }
        }
    }

    fn join_with_grace(&self, handle: JoinHandle<Result<u64>>) -> JoinOutcome {
        // a grace period past the end of the clock means no deadline
        let deadline = Instant::now().checked_add(self.config.grace_period);
        while !handle.is_finished() {
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        // dropping the handle detaches the thread
                        return JoinOutcome::Stuck;
                    }
                    self.config.tick.min(deadline - now)
                }
                None => self.config.tick,
            };
            thread::sleep(wait);
        }

        match handle.join() {
            Ok(Ok(n)) => JoinOutcome::Finished(n),
            Ok(Err(e)) => JoinOutcome::Failed(e.to_string()),
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                JoinOutcome::Failed(format!("receive thread panicked: {msg}"))
            }
        }
    }
}

/// Close the output if there is one. Returns true when nothing is left open.
fn close_output(output: Option<&OutputSink>) -> bool {
    match output {
        Some(sink) => match sink.close() {
            Ok(()) => true,
            Err(e) => {
                error!("failed to close output {}: {}", sink.label(), e);
                sink.is_closed()
            }
        },
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_timeout_disables_limit() {
        assert_eq!(RunLimit::from_secs(-1), RunLimit::Unbounded);
        assert_eq!(RunLimit::from_secs(i64::MIN), RunLimit::Unbounded);
        assert_eq!(
            RunLimit::from_secs(0),
            RunLimit::After(Duration::from_secs(0))
        );
        assert_eq!(
            RunLimit::from_secs(60),
            RunLimit::After(Duration::from_secs(60))
        );
    }

    #[test]
    fn limit_is_inclusive() {
        let limit = RunLimit::After(Duration::from_secs(2));
        assert!(!limit.is_exceeded(Duration::from_millis(1999)));
        assert!(limit.is_exceeded(Duration::from_secs(2)));
        assert!(!RunLimit::Unbounded.is_exceeded(Duration::from_secs(u64::MAX / 2)));
    }

    fn result(end_reason: EndReason, receive_error: Option<&str>) -> RunResult {
        RunResult {
            end_reason,
            trigger: StopTrigger::Completed,
            final_status: None,
            bytes_received: 0,
            elapsed: Duration::ZERO,
            joined: end_reason != EndReason::ThreadStuck,
            receive_error: receive_error.map(str::to_string),
            output_closed: true,
            setup: Vec::new(),
        }
    }

    #[test]
    fn exit_code_reflects_outcome() {
        assert_eq!(result(EndReason::Completed, None).exit_code(), 0);
        assert!(result(EndReason::Completed, None).is_success());
        assert_eq!(
            result(EndReason::Completed, Some("io error")).exit_code(),
            EXIT_FAILURE
        );
        assert_eq!(result(EndReason::TimedOut, None).exit_code(), EXIT_TIMED_OUT);
        assert_eq!(
            result(EndReason::ThreadStuck, None).exit_code(),
            EXIT_THREAD_STUCK
        );
        assert_eq!(
            result(EndReason::Interrupted, None).exit_code(),
            EXIT_INTERRUPTED
        );
    }

    #[test]
    fn result_serializes_for_reports() {
        let mut r = result(EndReason::TimedOut, None);
        r.elapsed = Duration::from_millis(1500);
        r.final_status = Some("IDLE".into());
        let value = serde_json::to_value(&r).unwrap();
        assert_eq!(value["end_reason"], "timed_out");
        assert_eq!(value["trigger"], "completed");
        assert_eq!(value["elapsed"], 1.5);
        assert_eq!(value["final_status"], "IDLE");
    }
}
