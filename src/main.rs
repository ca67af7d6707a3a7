use std::process::exit;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};

use wubase_daq::output::write_report;
use wubase_daq::serial::DEFAULT_TIMEOUT;
use wubase_daq::{
    logging, signal, Args, CancelToken, Config, DeviceSession, OutputSink, SerialSession,
    Supervisor,
};

fn main() {
    let config = Config::from(Args::parse());
    logging::init_logging(config.log_level);

    match run(&config) {
        Ok(code) => exit(code),
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error: {e:#}");
            exit(1);
        }
    }
}

fn run(config: &Config) -> Result<i32> {
    // Everything that can be rejected without touching the device goes first.
    let plan = config.setup_plan()?;
    let output = config
        .output
        .as_deref()
        .map(OutputSink::create)
        .transpose()
        .context("failed to create output file")?;

    let cancel = CancelToken::new();
    if let Err(e) = signal::cancel_on_ctrl_c(cancel.clone()) {
        warn!("Ctrl-C handling unavailable: {e}");
    }

    let session = SerialSession::open(&config.port, config.baud, DEFAULT_TIMEOUT)
        .with_context(|| format!("failed to open wuBase on {}", config.port))?;
    let uid = session.identifier().context("failed to read wuBase UID")?;
    info!("wuBase UID: {}", uid);
    match session.query_status() {
        Ok(status) => info!("wuBase status: {}", status),
        Err(e) => warn!("wuBase status unavailable: {e}"),
    }

    let supervisor = Supervisor::new(Arc::new(session), config.supervisor(), cancel);
    let result = supervisor.run(&plan, config.setup_policy, output)?;

    println!(
        "{}",
        result
            .final_status
            .as_deref()
            .unwrap_or("<final status unavailable>")
    );

    if let Some(path) = &config.report {
        match write_report(path, &result) {
            Ok(()) => info!("run report written to {}", path.display()),
            Err(e) => error!("failed to write run report {}: {}", path.display(), e),
        }
    }

    info!("exiting ({}, code {})", result.end_reason, result.exit_code());
    Ok(result.exit_code())
}
