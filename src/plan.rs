//! Ordered setup batch executed before acquisition starts.
//!
//! Later commands depend on device state established by earlier ones
//! (`fpgaload` must precede `adcconfig`), so a plan is always executed
//! strictly in order, one command at a time.

use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::Serialize;

use crate::errors::{DriverError, Result};
use crate::session::DeviceSession;

// ============================================================================
// Data Types
// ============================================================================

/// One setup command and the settle time that follows it.
#[derive(Debug, Clone, PartialEq)]
pub struct SetupCommand {
    pub command: String,
    pub post_delay: Duration,
}

impl SetupCommand {
    pub fn new(command: impl Into<String>, post_delay: Duration) -> Self {
        Self {
            command: command.into(),
            post_delay,
        }
    }
}

/// What to do when a setup command fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SetupFailurePolicy {
    /// Record the failure, log it, and carry on with the next command.
    #[default]
    Continue,
    /// Stop at the first failure; acquisition is not started.
    Abort,
}

impl FromStr for SetupFailurePolicy {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "continue" => Ok(SetupFailurePolicy::Continue),
            "abort" => Ok(SetupFailurePolicy::Abort),
            other => Err(DriverError::Config(format!(
                "invalid setup failure policy `{other}` (expected continue or abort)"
            ))),
        }
    }
}

/// Result of one executed setup command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutcome {
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandOutcome {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Ordered list of setup commands.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetupPlan {
    commands: Vec<SetupCommand>,
}

// ============================================================================
// Construction
// ============================================================================

impl SetupPlan {
    pub fn new(commands: Vec<SetupCommand>) -> Self {
        Self { commands }
    }

    /// Standard pulser test-data setup: load the FPGA, configure the ADC,
    /// arm the triggers and start `npulses` calibration pulses.
    pub fn pulser_run(npulses: u32, settle: Duration) -> Self {
        let texts = [
            "status".to_string(),
            "pulser_setup 20000 0.3".to_string(),
            "dac 1 2000".to_string(),
            "fpgaload".to_string(),
            "adcconfig".to_string(),
            "fpgaload".to_string(),
            "flush_events".to_string(),
            "fpgatrig 0".to_string(),
            "fpgatrig 1".to_string(),
            format!("pulser_start {npulses}"),
        ];
        Self::new(
            texts
                .into_iter()
                .map(|t| SetupCommand::new(t, settle))
                .collect(),
        )
    }

    /// Parse a plan file: one command per line, a `#` at the start of a word
    /// starts a comment, and an optional trailing ` @<seconds>` overrides
    /// `default_delay` for that line. `#` and `@` inside a word belong to the
    /// command.
    ///
    /// ```text
    /// status
    /// fpgaload @0.5   # give the FPGA time to configure
    /// adcconfig
    /// ```
    pub fn parse(text: &str, default_delay: Duration) -> Result<Self> {
        let mut commands = Vec::new();
        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = strip_comment(raw).trim();
            if line.is_empty() {
                continue;
            }

            let (command, delay) = match split_delay(line) {
                Some((cmd, secs)) => {
                    let delay = parse_delay(secs).map_err(|reason| {
                        DriverError::Config(format!("setup plan line {line_no}: {reason}"))
                    })?;
                    (cmd.trim(), delay)
                }
                None => (line, default_delay),
            };

            if command.is_empty() {
                return Err(DriverError::Config(format!(
                    "setup plan line {line_no}: missing command before delay"
                )));
            }
            commands.push(SetupCommand::new(command, delay));
        }

        if commands.is_empty() {
            return Err(DriverError::Config("setup plan is empty".into()));
        }
        Ok(Self::new(commands))
    }

    pub fn from_file(path: &Path, default_delay: Duration) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            DriverError::Config(format!("cannot read setup plan {}: {e}", path.display()))
        })?;
        Self::parse(&text, default_delay)
    }

    pub fn commands(&self) -> &[SetupCommand] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Cut a line at the first `#` that starts a word.
fn strip_comment(line: &str) -> &str {
    let mut word_start = true;
    for (i, c) in line.char_indices() {
        if c == '#' && word_start {
            return &line[..i];
        }
        word_start = c.is_whitespace();
    }
    line
}

/// Split off a trailing `@<seconds>` that starts a word and holds a number.
fn split_delay(line: &str) -> Option<(&str, &str)> {
    let (command, secs) = line.rsplit_once('@')?;
    let word_start = command.is_empty() || command.ends_with(char::is_whitespace);
    let secs = secs.trim();
    (word_start && secs.parse::<f64>().is_ok()).then_some((command, secs))
}

/// Parse a non-negative, finite number of seconds.
pub fn parse_delay(secs: &str) -> std::result::Result<Duration, String> {
    let value: f64 = secs
        .parse()
        .map_err(|_| format!("invalid delay `{secs}`"))?;
    Duration::try_from_secs_f64(value).map_err(|_| format!("delay must be >= 0 seconds, got {secs}"))
}

// ============================================================================
// Execution
// ============================================================================

impl SetupPlan {
    /// Send every command in order, sleeping its settle delay after each.
    ///
    /// With [`SetupFailurePolicy::Continue`] all commands are sent and failures
    /// are only recorded. With [`SetupFailurePolicy::Abort`] the first failure is
    /// returned as [`DriverError::Setup`].
    pub fn execute<S>(&self, session: &S, policy: SetupFailurePolicy) -> Result<Vec<CommandOutcome>>
    where
        S: DeviceSession + ?Sized,
    {
        let started = Instant::now();
        let mut outcomes = Vec::with_capacity(self.commands.len());

        for (idx, step) in self.commands.iter().enumerate() {
            debug!(
                "setup [{}/{}] > {}",
                idx + 1,
                self.commands.len(),
                step.command
            );
            let result = session.execute(&step.command);
            if !step.post_delay.is_zero() {
                std::thread::sleep(step.post_delay);
            }

            match result {
                Ok(reply) => {
                    debug!("setup [{}] < {}", step.command, reply);
                    outcomes.push(CommandOutcome {
                        command: step.command.clone(),
                        reply: Some(reply),
                        error: None,
                    });
                }
                Err(e) => {
                    warn!("setup command `{}` failed: {}", step.command, e);
                    if policy == SetupFailurePolicy::Abort {
                        return Err(DriverError::Setup {
                            command: step.command.clone(),
                            reason: e.to_string(),
                        });
                    }
                    outcomes.push(CommandOutcome {
                        command: step.command.clone(),
                        reply: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        let failed = outcomes.iter().filter(|o| !o.is_ok()).count();
        if failed > 0 {
            warn!(
                "setup finished with {} of {} commands failed ({:.2?})",
                failed,
                outcomes.len(),
                started.elapsed()
            );
        } else {
            info!(
                "setup finished: {} commands ({:.2?})",
                outcomes.len(),
                started.elapsed()
            );
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::OutputSink;
    use crate::session::{ReceiveMonitor, StreamRequest};
    use std::sync::Mutex;

    /// Records every command with the instant it arrived.
    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, Instant)>>,
        fail_on: Option<&'static str>,
    }

    impl DeviceSession for Recorder {
        fn identifier(&self) -> Result<String> {
            Ok("REC".into())
        }

        fn query_status(&self) -> Result<String> {
            Ok("idle".into())
        }

        fn execute(&self, command: &str) -> Result<String> {
            self.calls
                .lock()
                .unwrap()
                .push((command.to_string(), Instant::now()));
            if self.fail_on == Some(command) {
                return Err(DriverError::Command(format!("{command}: ?")));
            }
            Ok("OK".into())
        }

        fn stream_receive(
            &self,
            _request: &StreamRequest,
            _sink: Option<&OutputSink>,
            _monitor: &ReceiveMonitor,
        ) -> Result<u64> {
            Ok(0)
        }
    }

    #[test]
    fn pulser_run_matches_bench_sequence() {
        let plan = SetupPlan::pulser_run(250, Duration::ZERO);
        let texts: Vec<&str> = plan.commands().iter().map(|c| c.command.as_str()).collect();
        assert_eq!(
            texts,
            [
                "status",
                "pulser_setup 20000 0.3",
                "dac 1 2000",
                "fpgaload",
                "adcconfig",
                "fpgaload",
                "flush_events",
                "fpgatrig 0",
                "fpgatrig 1",
                "pulser_start 250",
            ]
        );
    }

    #[test]
    fn executes_in_order_with_delays() {
        let plan = SetupPlan::new(vec![
            SetupCommand::new("fpgaload", Duration::from_millis(40)),
            SetupCommand::new("adcconfig", Duration::from_millis(20)),
            SetupCommand::new("fpgatrig 1", Duration::ZERO),
        ]);
        let dev = Recorder::default();
        let outcomes = plan.execute(&dev, SetupFailurePolicy::Continue).unwrap();

        assert!(outcomes.iter().all(CommandOutcome::is_ok));
        let calls = dev.calls.lock().unwrap();
        let order: Vec<&str> = calls.iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(order, ["fpgaload", "adcconfig", "fpgatrig 1"]);

        assert!(calls[1].1 - calls[0].1 >= Duration::from_millis(40));
        assert!(calls[2].1 - calls[1].1 >= Duration::from_millis(20));
    }

    #[test]
    fn continue_policy_records_failures_and_keeps_going() {
        let plan = SetupPlan::pulser_run(10, Duration::ZERO);
        let dev = Recorder {
            fail_on: Some("adcconfig"),
            ..Default::default()
        };
        let outcomes = plan.execute(&dev, SetupFailurePolicy::Continue).unwrap();

        assert_eq!(outcomes.len(), plan.len());
        let failed: Vec<&str> = outcomes
            .iter()
            .filter(|o| !o.is_ok())
            .map(|o| o.command.as_str())
            .collect();
        assert_eq!(failed, ["adcconfig"]);
        assert_eq!(dev.calls.lock().unwrap().len(), plan.len());
    }

    #[test]
    fn abort_policy_stops_at_first_failure() {
        let plan = SetupPlan::pulser_run(10, Duration::ZERO);
        let dev = Recorder {
            fail_on: Some("adcconfig"),
            ..Default::default()
        };
        let err = plan.execute(&dev, SetupFailurePolicy::Abort).unwrap_err();
        match err {
            DriverError::Setup { command, .. } => assert_eq!(command, "adcconfig"),
            other => panic!("unexpected error: {other}"),
        }
        // status, pulser_setup, dac, fpgaload, adcconfig
        assert_eq!(dev.calls.lock().unwrap().len(), 5);
    }

    #[test]
    fn parses_plan_text() {
        let text = "\
# bring-up
status
fpgaload @0.5   # FPGA needs time
adcconfig

pulser_start 100 @ 0
";
        let plan = SetupPlan::parse(text, Duration::from_millis(10)).unwrap();
        assert_eq!(
            plan.commands(),
            &[
                SetupCommand::new("status", Duration::from_millis(10)),
                SetupCommand::new("fpgaload", Duration::from_millis(500)),
                SetupCommand::new("adcconfig", Duration::from_millis(10)),
                SetupCommand::new("pulser_start 100", Duration::ZERO),
            ]
        );
    }

    #[test]
    fn hash_and_at_inside_words_belong_to_the_command() {
        let text = "\
set_tag run#4 @0.1 # tagged
notify ops@lab
label @soon
";
        let plan = SetupPlan::parse(text, Duration::from_millis(10)).unwrap();
        assert_eq!(
            plan.commands(),
            &[
                SetupCommand::new("set_tag run#4", Duration::from_millis(100)),
                SetupCommand::new("notify ops@lab", Duration::from_millis(10)),
                SetupCommand::new("label @soon", Duration::from_millis(10)),
            ]
        );
    }

    #[test]
    fn rejects_bad_plan_lines() {
        let err = SetupPlan::parse("status\nfpgaload @-1\n", Duration::ZERO).unwrap_err();
        assert!(err.to_string().contains("line 2"), "{err}");

        let err = SetupPlan::parse("@0.2\n", Duration::ZERO).unwrap_err();
        assert!(err.to_string().contains("line 1"), "{err}");

        assert!(SetupPlan::parse("# nothing here\n\n", Duration::ZERO).is_err());
    }

    #[test]
    fn policy_from_str() {
        assert_eq!(
            "Continue".parse::<SetupFailurePolicy>().unwrap(),
            SetupFailurePolicy::Continue
        );
        assert_eq!(
            "abort".parse::<SetupFailurePolicy>().unwrap(),
            SetupFailurePolicy::Abort
        );
        assert!("skip".parse::<SetupFailurePolicy>().is_err());
    }
}
