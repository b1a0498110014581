//! ECN triangle monitor entry point.
//!
//! Brings up the configured switches, installs their rules and prints one
//! line per congestion signal until interrupted.

use anyhow::Context;
use clap::{CommandFactory, Parser};
use p4rt_controller::audit::init_logging;
use p4rt_controller::monitor::EcnCode;
use p4rt_controller::{
    error_log, info_log, warn_log, CongestionSignal, ControllerConfig, CounterEntry, EcnThreshold,
    MonitorExit, Orchestrator, PipelineConfig, SimulatedFabric, TickReporter,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

const SOURCE: &str = "ecn-monitor";

/// P4Runtime controller for the ECN triangle (switches are simulated in-process until a real SwitchConnector is linked)
#[derive(Parser, Debug)]
#[command(name = "ecn-monitor")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// p4info file produced by the P4 compiler
    #[arg(long, default_value = "./build/ecn.p4.p4info.txt")]
    p4info: PathBuf,

    /// BMv2 JSON file produced by the P4 compiler
    #[arg(long = "bmv2-json", default_value = "./build/ecn.json")]
    bmv2_json: PathBuf,

    /// YAML topology; the built-in triangle is used when absent or missing
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// ECN queue threshold; prompted for when absent
    #[arg(short = 't', long)]
    threshold: Option<String>,

    /// Polling interval in milliseconds (overrides the config file)
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Read back and print every table after bring-up
    #[arg(long)]
    dump_tables: bool,

    /// Counter to read on every switch each tick
    #[arg(long)]
    counter: Option<String>,

    /// Counter cell index
    #[arg(long, default_value = "0")]
    counter_index: u64,

    /// Push one CE-marked packet-in from this switch after bring-up
    #[arg(long)]
    inject_congestion: Option<String>,
}

/// Prints what each polling tick observes.
struct ConsoleReporter;

impl TickReporter for ConsoleReporter {
    fn congestion(&mut self, signal: &CongestionSignal) {
        println!("{}", signal);
    }

    fn counter(&mut self, switch: &str, entry: &p4rt_controller::Result<CounterEntry>) {
        match entry {
            Ok(entry) => println!("{}: {}", switch, entry),
            Err(e) => warn_log!(SOURCE, switch = %switch, error = %e, "Counter read failed"),
        }
    }

    fn monitor_stopped(&mut self, switch: &str, exit: &MonitorExit) {
        warn_log!(SOURCE, switch = %switch, exit = %exit, "Stopped monitoring switch");
    }
}

/// Prints help and the missing-artifact message when `path` does not exist.
fn check_artifact(kind: &str, path: &Path) -> bool {
    if path.exists() {
        return true;
    }
    if let Err(e) = Args::command().print_help() {
        warn_log!(SOURCE, error = %e, "Cannot print help");
    }
    println!("\n{} file not found: {}\nHave you run 'make'?", kind, path.display());
    false
}

fn load_config(args: &Args) -> anyhow::Result<ControllerConfig> {
    let mut config = match &args.config {
        Some(path) => ControllerConfig::load_or_default(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => ControllerConfig::default(),
    };
    if let Some(ms) = args.poll_interval_ms {
        config.poll_interval_ms = ms;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

async fn read_threshold(arg: Option<&str>, bitwidth: u32) -> anyhow::Result<EcnThreshold> {
    let input = match arg {
        Some(value) => value.to_string(),
        None => {
            let mut stdout = tokio::io::stdout();
            stdout
                .write_all(b"Please input the threshold of the queue: ")
                .await?;
            stdout.flush().await?;
            let mut line = String::new();
            BufReader::new(tokio::io::stdin())
                .read_line(&mut line)
                .await
                .context("failed to read threshold")?;
            line
        }
    };
    Ok(EcnThreshold::parse(&input, bitwidth)?)
}

/// Waits for SIGINT or SIGTERM and cancels `cancel`.
fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info_log!(SOURCE, "Received shutdown signal");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            warn_log!(SOURCE, error = %e, "SIGTERM handler unavailable, waiting for SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level, args.log_json);

    if !check_artifact("p4info", &args.p4info) || !check_artifact("BMv2 JSON", &args.bmv2_json) {
        return ExitCode::from(1);
    }

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(1);
        }
    };

    let threshold = match read_threshold(args.threshold.as_deref(), config.names.ecn_bitwidth).await {
        Ok(threshold) => threshold,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(1);
        }
    };

    let pipeline = match PipelineConfig::load(&args.p4info, &args.bmv2_json) {
        Ok(pipeline) => pipeline,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::from(1);
        }
    };

    info_log!(
        SOURCE,
        switches = config.switches.len(),
        threshold = %threshold,
        poll_interval_ms = config.poll_interval_ms,
        "Starting ECN monitor"
    );

    let fabric = SimulatedFabric::for_targets(config.switches.iter().map(|plan| &plan.target)).await;
    let mut orchestrator = Orchestrator::new(
        Arc::new(fabric.clone()),
        pipeline,
        config.orchestrator_settings(),
    );
    if let Some(counter) = &args.counter {
        orchestrator.watch_counter(counter.clone(), args.counter_index);
    }
    spawn_signal_handler(orchestrator.cancel_token());

    let report = orchestrator
        .bring_up(config.switches.clone(), Some(threshold))
        .await;
    for (switch, update) in report.installed() {
        println!("{}: {}", switch, update);
    }
    for (switch, e) in report.failures() {
        eprintln!("{}: bring-up failed: {}", switch, e);
    }

    if report.first_switch_unreachable() {
        error_log!(SOURCE, "First switch unreachable, giving up");
        orchestrator.shutdown().await;
        return ExitCode::from(1);
    }

    if args.dump_tables {
        for (switch, entries) in orchestrator.dump_tables(None).await {
            match entries {
                Ok(entries) => {
                    println!("----- Reading tables rules for {} -----", switch);
                    for entry in entries {
                        println!("{}", entry);
                    }
                }
                Err(e) => eprintln!("{}", e),
            }
        }
    }

    if let Some(name) = &args.inject_congestion {
        let injected = match fabric.switch(name).await {
            Some(switch) => switch.inject_ecn(EcnCode::CongestionExperienced).await,
            None => false,
        };
        if !injected {
            warn_log!(SOURCE, switch = %name, "Could not inject congestion");
        }
    }

    let mut reporter = ConsoleReporter;
    orchestrator.run(&mut reporter).await;

    println!("Shutting down.");
    let shutdown = orchestrator.shutdown().await;
    for e in &shutdown.errors {
        eprintln!("{}", e);
    }
    info_log!(
        SOURCE,
        closed = shutdown.closed.len(),
        errors = shutdown.errors.len(),
        "Shutdown complete"
    );
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_artifact_paths() {
        let args = Args::parse_from(["ecn-monitor"]);
        assert_eq!(args.p4info, PathBuf::from("./build/ecn.p4.p4info.txt"));
        assert_eq!(args.bmv2_json, PathBuf::from("./build/ecn.json"));
        assert!(args.threshold.is_none());
        assert_eq!(args.counter_index, 0);
    }

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from([
            "ecn-monitor",
            "--bmv2-json",
            "out/ecn.json",
            "--threshold",
            "10",
            "--counter",
            "MyIngress.ingressTunnelCounter",
            "--counter-index",
            "100",
            "--inject-congestion",
            "s2",
        ]);
        assert_eq!(args.bmv2_json, PathBuf::from("out/ecn.json"));
        assert_eq!(args.threshold.as_deref(), Some("10"));
        assert_eq!(args.counter_index, 100);
        assert_eq!(args.inject_congestion.as_deref(), Some("s2"));
    }

    #[tokio::test]
    async fn test_threshold_argument_is_strict() {
        assert_eq!(read_threshold(Some("10"), 19).await.unwrap().value(), 10);
        assert!(read_threshold(Some("5*2"), 19).await.is_err());
        assert!(read_threshold(Some("1000000"), 19).await.is_err());
    }

    #[test]
    fn test_missing_config_falls_back_to_triangle() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("controller.yaml");
        let args = Args::parse_from([
            "ecn-monitor",
            "-c",
            missing.to_str().unwrap(),
            "--poll-interval-ms",
            "250",
        ]);
        let config = load_config(&args).unwrap();
        assert_eq!(config.switches.len(), 3);
        assert_eq!(config.poll_interval_ms, 250);

        let broken = dir.path().join("broken.yaml");
        std::fs::write(&broken, "switches: [").unwrap();
        let args = Args::parse_from(["ecn-monitor", "-c", broken.to_str().unwrap()]);
        assert!(load_config(&args).is_err());
    }

    #[test]
    fn test_missing_artifact() {
        let dir = tempfile::tempdir().unwrap();
        assert!(check_artifact("p4info", dir.path()));
        assert!(!check_artifact("p4info", &dir.path().join("ecn.p4.p4info.txt")));
    }
}
