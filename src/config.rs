//! Command line configuration.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::LevelFilter;

use crate::errors::Result;
use crate::logging;
use crate::plan::{self, SetupFailurePolicy, SetupPlan};
use crate::serial::DEFAULT_BAUD;
use crate::session::StreamRequest;
use crate::supervisor::{RunLimit, SupervisorConfig, DEFAULT_POLL_INTERVAL, DEFAULT_TICK};

#[derive(Parser, Debug, Clone)]
#[command(name = "wubase-take-data", about = "Take wuBase test data")]
pub struct Args {
    /// UART port of the wuBase (e.g. /dev/ttyUSB0)
    #[arg(long)]
    pub port: String,

    /// Baud rate to use during acquisition
    #[arg(long, default_value_t = DEFAULT_BAUD)]
    pub baud: u32,

    /// Output file for test data (received bytes are discarded when omitted)
    #[arg(long)]
    pub ofile: Option<PathBuf>,

    /// Number of test pulses to send
    #[arg(long, default_value_t = 1000)]
    pub npulses: u32,

    /// Log level (off, error, warn, info, debug, trace) [default: WUBASE_LOG, RUST_LOG, then info]
    #[arg(long, value_parser = parse_log_level)]
    pub loglevel: Option<LevelFilter>,

    /// Run timeout in seconds; the run is stopped if the DAQ runs longer. Negative means no timeout
    #[arg(long, default_value_t = 60, allow_negative_numbers = true)]
    pub timeout: i64,

    /// Settle delay in seconds after each setup command
    #[arg(long, default_value = "0", value_parser = parse_seconds)]
    pub settle_delay: Duration,

    /// What to do when a setup command fails: continue or abort
    #[arg(long, default_value = "continue", value_parser = parse_policy)]
    pub on_setup_error: SetupFailurePolicy,

    /// Read the setup commands from this file instead of the built-in pulser sequence
    #[arg(long)]
    pub setup_file: Option<PathBuf>,

    /// Seconds the receive thread gets to stop before it is reported stuck
    #[arg(long, default_value = "5", value_parser = parse_seconds)]
    pub grace: Duration,

    /// Write a JSON summary of the run to this file
    #[arg(long)]
    pub report: Option<PathBuf>,
}

fn parse_log_level(s: &str) -> std::result::Result<LevelFilter, String> {
    logging::parse_level(s).map_err(|e| e.to_string())
}

fn parse_seconds(s: &str) -> std::result::Result<Duration, String> {
    plan::parse_delay(s)
}

fn parse_policy(s: &str) -> std::result::Result<SetupFailurePolicy, String> {
    s.parse().map_err(|e: crate::DriverError| e.to_string())
}

/// Validated run configuration. Read-only once built.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: String,
    pub baud: u32,
    pub npulses: u32,
    pub output: Option<PathBuf>,
    pub run_limit: RunLimit,
    pub log_level: Option<LevelFilter>,
    pub settle_delay: Duration,
    pub setup_policy: SetupFailurePolicy,
    pub setup_file: Option<PathBuf>,
    pub grace_period: Duration,
    pub report: Option<PathBuf>,
}

impl From<Args> for Config {
    fn from(args: Args) -> Self {
        Self {
            port: args.port,
            baud: args.baud,
            npulses: args.npulses,
            output: args.ofile,
            run_limit: RunLimit::from_secs(args.timeout),
            log_level: args.loglevel,
            settle_delay: args.settle_delay,
            setup_policy: args.on_setup_error,
            setup_file: args.setup_file,
            grace_period: args.grace,
            report: args.report,
        }
    }
}

impl Config {
    /// The setup plan to run: the file given with `--setup-file`, or the
    /// built-in pulser sequence.
    pub fn setup_plan(&self) -> Result<SetupPlan> {
        match &self.setup_file {
            Some(path) => SetupPlan::from_file(path, self.settle_delay),
            None => Ok(SetupPlan::pulser_run(self.npulses, self.settle_delay)),
        }
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            run_limit: self.run_limit,
            poll_interval: DEFAULT_POLL_INTERVAL,
            tick: DEFAULT_TICK,
            grace_period: self.grace_period,
            request: StreamRequest::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> std::result::Result<Config, clap::Error> {
        let mut argv = vec!["wubase-take-data"];
        argv.extend_from_slice(args);
        Args::try_parse_from(argv).map(Config::from)
    }

    #[test]
    fn defaults_match_bench_script() {
        let cfg = parse(&["--port", "COM_TEST"]).unwrap();
        assert_eq!(cfg.port, "COM_TEST");
        assert_eq!(cfg.baud, 115_200);
        assert_eq!(cfg.npulses, 1000);
        assert_eq!(cfg.output, None);
        assert_eq!(cfg.log_level, None);
        assert_eq!(cfg.run_limit, RunLimit::After(Duration::from_secs(60)));
        assert_eq!(cfg.settle_delay, Duration::ZERO);
        assert_eq!(cfg.setup_policy, SetupFailurePolicy::Continue);
        assert_eq!(cfg.grace_period, Duration::from_secs(5));

        let sup = cfg.supervisor();
        assert_eq!(sup.poll_interval, Duration::from_secs(1));
        assert_eq!(sup.request, StreamRequest::default());
    }

    #[test]
    fn port_is_required() {
        assert!(parse(&[]).is_err());
    }

    #[test]
    fn negative_timeout_means_unbounded() {
        let cfg = parse(&["--port", "p", "--timeout", "-1"]).unwrap();
        assert_eq!(cfg.run_limit, RunLimit::Unbounded);

        let cfg = parse(&["--port", "p", "--timeout=-30"]).unwrap();
        assert_eq!(cfg.run_limit, RunLimit::Unbounded);

        let cfg = parse(&["--port", "p", "--timeout", "2"]).unwrap();
        assert_eq!(cfg.run_limit, RunLimit::After(Duration::from_secs(2)));
    }

    #[test]
    fn invalid_log_level_is_rejected_before_any_io() {
        let err = parse(&["--port", "p", "--loglevel", "chatty"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);

        let cfg = parse(&["--port", "p", "--loglevel", "debug"]).unwrap();
        assert_eq!(cfg.log_level, Some(LevelFilter::Debug));

        let cfg = parse(&["--port", "p", "--loglevel", "INFO"]).unwrap();
        assert_eq!(cfg.log_level, Some(LevelFilter::Info));
    }

    #[test]
    fn optional_settings() {
        let cfg = parse(&[
            "--port",
            "/dev/ttyUSB0",
            "--baud",
            "1000000",
            "--ofile",
            "run.bin",
            "--npulses",
            "42",
            "--settle-delay",
            "0.25",
            "--on-setup-error",
            "abort",
            "--grace",
            "1.5",
            "--report",
            "run.json",
        ])
        .unwrap();
        assert_eq!(cfg.baud, 1_000_000);
        assert_eq!(cfg.output, Some(PathBuf::from("run.bin")));
        assert_eq!(cfg.npulses, 42);
        assert_eq!(cfg.settle_delay, Duration::from_millis(250));
        assert_eq!(cfg.setup_policy, SetupFailurePolicy::Abort);
        assert_eq!(cfg.grace_period, Duration::from_millis(1500));
        assert_eq!(cfg.report, Some(PathBuf::from("run.json")));

        let plan = cfg.setup_plan().unwrap();
        assert_eq!(plan.commands().last().unwrap().command, "pulser_start 42");
        assert!(plan
            .commands()
            .iter()
            .all(|c| c.post_delay == Duration::from_millis(250)));
    }

    #[test]
    fn bad_durations_and_policies_are_rejected() {
        assert!(parse(&["--port", "p", "--settle-delay", "-1"]).is_err());
        assert!(parse(&["--port", "p", "--grace", "soon"]).is_err());
        assert!(parse(&["--port", "p", "--on-setup-error", "retry"]).is_err());
    }

    #[test]
    fn grace_beyond_the_clock_is_accepted() {
        let cfg = parse(&["--port", "p", "--grace", "1.8e19"]).unwrap();
        assert!(cfg.supervisor().grace_period > Duration::from_secs(u64::MAX / 2));
    }

    #[test]
    fn setup_file_overrides_builtin_plan() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.txt");
        std::fs::write(&path, "status\nfpgaload @0.1\n").unwrap();

        let cfg = parse(&["--port", "p", "--setup-file", path.to_str().unwrap()]).unwrap();
        let plan = cfg.setup_plan().unwrap();
        assert_eq!(plan.len(), 2);
        assert_eq!(plan.commands()[1].post_delay, Duration::from_millis(100));

        let missing = parse(&["--port", "p", "--setup-file", "/nonexistent/plan.txt"]).unwrap();
        assert!(missing.setup_plan().is_err());
    }
}
