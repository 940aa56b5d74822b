//! ---
//! gl_section: "07-entrypoints"
//! gl_subsection: "binary"
//! gl_type: "source"
//! gl_scope: "code"
//! gl_description: "Binary entrypoint for the gearlink controller, worker and operator tools."
//! gl_version: "v0.0.0-prealpha"
//! gl_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gearlink_common::{init_tracing, AppConfig, PeerRole};
use gearlink_executor::{SimulatedFeatureHandler, WorkerOptions, WorkerPeer};
use gearlink_msg::{BusMetricsExporter, InMemoryBroker, QoS, TopicSet, Transport};
use gearlink_orchestrator::{
    generate_sample, read_points_file, ControllerHandle, ControllerOptions, ControllerPeer, Point,
    SessionReport, StepOutcome, StepRecord,
};
use gearlink_presence::PresenceChannel;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

mod bus;

const CONFIG_CANDIDATES: &[&str] = &["gearlink.toml", "configs/gearlink.toml"];

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Correlated point workflows between a controller and a worker over MQTT",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", global = true, help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the controller and wait for start signals")]
    Controller,
    #[command(about = "Run the worker answering point commands")]
    Worker,
    #[command(about = "Read `x,y` lines from stdin and issue one request per line")]
    Interactive,
    #[command(about = "Run one session over a points file and save the results")]
    Batch {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    #[command(about = "Write a sample points file")]
    Generate {
        #[arg(value_name = "FILE", default_value = "sample_points.txt")]
        file: PathBuf,
    },
    #[command(about = "Print every message of the deployment")]
    Monitor,
    #[command(about = "Run controller and worker against an in-process broker")]
    Demo,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Generate { file } = &cli.command {
        let written = generate_sample(file)?;
        println!("wrote {written} points to {}", file.display());
        return Ok(());
    }

    let loaded = AppConfig::load_with_source(cli.config.as_deref(), CONFIG_CANDIDATES)?;
    let config = loaded.config;
    let service = match &cli.command {
        Commands::Worker => "worker",
        Commands::Monitor => "monitor",
        Commands::Demo => "demo",
        _ => "controller",
    };
    init_tracing(service, &config.logging)?;
    match &loaded.source {
        Some(path) => info!(config_path = %path.display(), "configuration loaded"),
        None => info!("no configuration file found; using defaults"),
    }
    info!(deployment = %config.bus.deployment_id, host = %config.bus.host, port = config.bus.port, "gearlinkd starting");

    match cli.command {
        Commands::Controller => run_controller(&config).await,
        Commands::Worker => run_worker(&config).await,
        Commands::Interactive => run_interactive(&config).await,
        Commands::Batch { file } => run_batch(&config, &file).await,
        Commands::Monitor => run_monitor(&config).await,
        Commands::Demo => run_demo(&config).await,
        Commands::Generate { .. } => Ok(()),
    }
}

async fn start_controller(
    config: &AppConfig,
    metrics: Arc<BusMetricsExporter>,
) -> Result<ControllerHandle> {
    let options = ControllerOptions::from_config(config);
    let will = PresenceChannel::last_will(&options.topics, &options.sender)?;
    let session = bus::connect(config, config.bus.client_id(PeerRole::Controller), Some(will)).await;
    let handle = ControllerPeer::start(session.transport, session.inbound, options, Some(metrics)).await?;
    Ok(handle)
}

async fn run_controller(config: &AppConfig) -> Result<()> {
    let (registry, metrics) = bus::metrics()?;
    let mut handle = start_controller(config, metrics).await?;
    info!(points = config.workflow.points.len(), "controller waiting for start signals");

    let shutdown = bus::shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            report = handle.next_report() => match report {
                Some(report) => print_report(&report),
                None => break,
            },
        }
    }
    bus::log_metrics(&registry);
    handle.shutdown().await?;
    Ok(())
}

async fn run_worker(config: &AppConfig) -> Result<()> {
    let (registry, metrics) = bus::metrics()?;
    let options = WorkerOptions::from_config(config);
    let will = PresenceChannel::last_will(&options.topics, &options.sender)?;
    let session = bus::connect(config, config.bus.client_id(PeerRole::Worker), Some(will)).await;
    let handler = Arc::new(SimulatedFeatureHandler::new(config.executor.simulate_delay));
    let handle = WorkerPeer::start(session.transport, session.inbound, options, handler, Some(metrics)).await?;
    info!("worker ready for commands");

    bus::shutdown_signal().await;
    let stats = handle.executor().stats();
    info!(
        executed = stats.executed,
        replayed = stats.replayed,
        dropped_in_flight = stats.dropped_in_flight,
        failed = stats.failed,
        "worker statistics"
    );
    bus::log_metrics(&registry);
    handle.shutdown().await?;
    Ok(())
}

async fn run_interactive(config: &AppConfig) -> Result<()> {
    let (_registry, metrics) = bus::metrics()?;
    let handle = start_controller(config, metrics).await?;
    println!("enter points as `x,y`; `quit` to exit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = bus::shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        let line = tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next_line() => line.context("failed to read stdin")?,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        match line {
            "" => continue,
            "quit" | "exit" => break,
            _ => {}
        }
        match line.parse::<Point>() {
            Ok(point) => {
                let record = handle.execute(&point.to_work_item()).await;
                print_step(&record);
            }
            Err(reason) => println!("invalid point {line:?}: {reason}"),
        }
    }
    handle.shutdown().await?;
    Ok(())
}

async fn run_batch(config: &AppConfig, file: &Path) -> Result<()> {
    let parsed = read_points_file(file)?;
    if !parsed.rejected.is_empty() {
        warn!(skipped = parsed.rejected.len(), "some lines of the points file were skipped");
    }
    if parsed.points.is_empty() {
        bail!("no valid points in {}", file.display());
    }
    info!(points = parsed.points.len(), file = %file.display(), "running batch session");

    let (registry, metrics) = bus::metrics()?;
    let mut handle = start_controller(config, metrics).await?;
    handle.trigger(parsed.work_items()).await?;
    let report = handle
        .next_report()
        .await
        .context("controller stopped before the batch finished")?;
    print_report(&report);

    let output = PathBuf::from(format!(
        "batch_results_{}.json",
        chrono::Local::now().format("%Y%m%d_%H%M%S")
    ));
    let contents = serde_json::to_vec_pretty(&report)?;
    std::fs::write(&output, contents)
        .with_context(|| format!("unable to write {}", output.display()))?;
    println!("results saved to {}", output.display());

    bus::log_metrics(&registry);
    handle.shutdown().await?;
    Ok(())
}

async fn run_monitor(config: &AppConfig) -> Result<()> {
    let topics = TopicSet::new(&config.bus.deployment_id);
    let client_id = format!("M-{}", config.bus.deployment_id);
    let mut session = bus::connect(config, client_id, None).await;
    session
        .transport
        .subscribe(&topics.wildcard(), QoS::AtLeastOnce)
        .await?;
    println!("monitoring {}", topics.wildcard());

    let shutdown = bus::shutdown_signal();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            message = session.inbound.recv() => match message {
                Some(message) => println!(
                    "{} {}{} {}",
                    chrono::Local::now().format("%H:%M:%S%.3f"),
                    message.topic,
                    if message.retain { " (retained)" } else { "" },
                    String::from_utf8_lossy(&message.payload)
                ),
                None => break,
            },
        }
    }
    session.transport.disconnect().await?;
    Ok(())
}

/// Both peers on an in-process broker that delivers every command twice.
async fn run_demo(config: &AppConfig) -> Result<()> {
    let (registry, metrics) = bus::metrics()?;
    let broker = InMemoryBroker::new();
    let topics = TopicSet::new(&config.bus.deployment_id);
    broker.duplicate_deliveries(topics.cmd_point.clone());

    let worker_options = WorkerOptions {
        auto_start: None,
        ..WorkerOptions::from_config(config)
    };
    let will = PresenceChannel::last_will(&topics, &worker_options.sender)?;
    let (transport, inbound) = broker.connect(config.bus.client_id(PeerRole::Worker), Some(will));
    let handler = Arc::new(SimulatedFeatureHandler::new(config.executor.simulate_delay));
    let worker = WorkerPeer::start(transport, inbound, worker_options, handler, Some(metrics.clone())).await?;

    let controller_options = ControllerOptions::from_config(config);
    let will = PresenceChannel::last_will(&topics, &controller_options.sender)?;
    let (transport, inbound) = broker.connect(config.bus.client_id(PeerRole::Controller), Some(will));
    let mut controller = ControllerPeer::start(transport, inbound, controller_options, Some(metrics)).await?;

    worker.send_start_signal().await?;
    let report = controller
        .next_report()
        .await
        .context("controller stopped before the demo session finished")?;
    print_report(&report);

    let stats = worker.executor().stats();
    println!(
        "worker executed {} commands, replayed {}, dropped {} in-flight duplicates",
        stats.executed, stats.replayed, stats.dropped_in_flight
    );
    bus::log_metrics(&registry);
    controller.shutdown().await?;
    worker.shutdown().await?;
    Ok(())
}

fn print_step(record: &StepRecord) {
    let status = match &record.outcome {
        StepOutcome::Success => "ok".to_owned(),
        StepOutcome::Timeout => "timeout".to_owned(),
        StepOutcome::Error { message } => format!("error: {message}"),
    };
    let values = record
        .reply
        .as_ref()
        .and_then(|reply| reply.payload.get("values"))
        .map(|values| format!(" values={values}"))
        .unwrap_or_default();
    println!("{} -> {status} (attempts {}){values}", record.label, record.attempts);
}

fn print_report(report: &SessionReport) {
    for step in &report.steps {
        print_step(step);
    }
    println!(
        "session {}: {} points, {} successful, {} failed",
        report.session_id.as_deref().unwrap_or("local"),
        report.summary.total_items,
        report.summary.success_count,
        report.summary.failure_count
    );
}
