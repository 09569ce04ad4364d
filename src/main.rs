use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::{fmt, EnvFilter};

use metricoor::clock::{BootClock, ElapsedClock};
use metricoor::config::Config;
use metricoor::engine::TelemetryEngine;
use metricoor::event::AtomEvent;
use metricoor::export::health::HealthMetrics;
use metricoor::guardrail::EngineStats;
use metricoor::pull::PullScheduler;
use metricoor::report::DumpReason;

/// On-device telemetry aggregation engine.
#[derive(Parser)]
#[command(name = "metricoor", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Write the final report here on shutdown.
    #[arg(long)]
    report: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Version) = &cli.command {
        println!("metricoor {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;
    fmt().with_env_filter(filter).with_target(true).init();

    let config_path = cli
        .config
        .clone()
        .context("--config is required (use --help for usage)")?;
    let cfg = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting metricoor");

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg, cli).await })
}

async fn run(cfg: Config, cli: Cli) -> Result<()> {
    let clock = BootClock;
    let now_ns = clock.now_ns().context("reading the boot clock")?;

    let stats = Arc::new(EngineStats::new());
    let pull_scheduler = Arc::new(PullScheduler::new(Arc::clone(&stats)));
    let engine = Arc::new(TelemetryEngine::new(
        Arc::clone(&stats),
        Arc::clone(&pull_scheduler),
    ));

    for config in &cfg.configs {
        engine.add_config(config, now_ns);
    }

    // Restore activation state from the previous run, if any.
    if let Some(path) = &cfg.snapshot_path {
        match std::fs::read_to_string(path) {
            Ok(data) => match serde_json::from_str(&data) {
                Ok(snapshot) => {
                    engine.load_active_snapshot(&snapshot, now_ns);
                    tracing::info!(path = %path.display(), "active-metric snapshot loaded");
                }
                Err(e) => tracing::warn!(error = %e, "unreadable snapshot, starting fresh"),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(error = %e, "snapshot read failed, starting fresh"),
        }
    }

    let health = if cfg.health.enabled {
        let health = Arc::new(
            HealthMetrics::new(&cfg.health.addr, Arc::clone(&stats))
                .context("building health metrics")?,
        );
        Arc::clone(&health).start().await?;
        Some(health)
    } else {
        None
    };

    let shutdown = tokio_util::sync::CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let ctrl_c = tokio::signal::ctrl_c();
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => tracing::info!("received SIGINT, shutting down"),
                _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            }
            shutdown.cancel();
        });
    }

    // Periodic kick: bucket expiry, activation TTLs, and the pull alarm.
    {
        let engine = Arc::clone(&engine);
        let pull_scheduler = Arc::clone(&pull_scheduler);
        let shutdown = shutdown.clone();
        let interval = cfg.flush_check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Ok(now) = BootClock.now_ns() {
                            engine.flush_if_expired(now);
                            if pull_scheduler.next_pull_time_ns() <= now {
                                pull_scheduler.on_alarm(now);
                            }
                        }
                    }
                }
            }
        });
    }

    // Ingest: newline-delimited JSON events on stdin, through a bounded
    // queue whose overflow increments the per-atom dropped counter.
    let (event_tx, mut event_rx) =
        tokio::sync::mpsc::channel::<AtomEvent>(cfg.event_queue_size);
    {
        let stats = Arc::clone(&stats);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            let mut lines = stdin.lines();
            loop {
                let line = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<AtomEvent>(line) {
                            Ok(event) => {
                                let atom_id = event.atom_id;
                                if event_tx.try_send(event).is_err() {
                                    stats.note_event_dropped(atom_id);
                                }
                            }
                            Err(e) => tracing::warn!(error = %e, "unparseable event line"),
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "stdin read failed");
                        break;
                    }
                }
            }
        });
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = event_rx.recv() => match event {
                Some(event) => {
                    engine.process_event(&event);
                }
                None => break,
            },
        }
    }

    let now_ns = clock.now_ns().unwrap_or(now_ns);

    if let Some(path) = &cfg.snapshot_path {
        let snapshot = engine.save_active_snapshot(now_ns, DumpReason::TerminationSignal);
        match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    tracing::error!(error = %e, "writing snapshot failed");
                } else {
                    tracing::info!(path = %path.display(), "active-metric snapshot saved");
                }
            }
            Err(e) => tracing::error!(error = %e, "serializing snapshot failed"),
        }
    }

    if let Some(path) = &cli.report {
        let report = engine.dump_report(now_ns, true, false, DumpReason::TerminationSignal);
        let json = serde_json::to_string_pretty(&report).context("serializing report")?;
        std::fs::write(path, json)
            .with_context(|| format!("writing report to {}", path.display()))?;
        tracing::info!(path = %path.display(), "final report written");
    }

    if let Some(health) = health {
        health.stop();
    }

    tracing::info!("metricoor stopped");
    Ok(())
}
