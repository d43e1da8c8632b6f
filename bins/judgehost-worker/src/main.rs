mod config;
mod daemon;
mod docker;
mod downloader;
mod endpoint;
mod guard;
mod pipeline;
mod slots;
mod verdict;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use clap::Parser;
use config::SystemConfig;
use daemon::Daemon;
use docker::{ContainerRuntime, DockerRuntime};
use downloader::Downloader;
use endpoint::HttpEndpoint;
use pipeline::{Pipeline, Settings};
use slots::CpuSlots;
use std::fs::{DirBuilder, OpenOptions};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "judgehost", version, about = "Judgehost daemon for programming contests")]
struct Cli {
    /// Path to the TOML system config
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Log level: unset for info, -d for warn, -dd for debug
    #[arg(short, long, action = clap::ArgAction::Count)]
    debug: u8,

    /// Append logs to this file instead of stdout
    #[arg(long)]
    log: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json: bool,

    /// Empty the download cache before starting
    #[arg(long)]
    clean_cache: bool,
}

fn init_tracing(cli: &Cli) -> Result<()> {
    let level = match cli.debug {
        0 => "info",
        1 => "warn",
        _ => "debug",
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    match &cli.log {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            let writer = Mutex::new(file);
            if cli.json {
                builder.json().with_writer(writer).init();
            } else {
                builder.with_ansi(false).with_writer(writer).init();
            }
        }
        None if cli.json => builder.json().init(),
        None => builder.init(),
    }
    Ok(())
}

fn ensure_dir(path: &Path) -> Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    warn!(path = %path.display(), "Directory missing, creating it");
    DirBuilder::new()
        .recursive(true)
        .mode(0o744)
        .create(path)
        .with_context(|| format!("cannot create {}", path.display()))
}

async fn sanity_check(config: &SystemConfig, endpoint: &HttpEndpoint, runtime: &DockerRuntime) -> Result<()> {
    ensure_dir(&config.judge_root).context("judge_root check failed")?;
    ensure_dir(&config.cache_root).context("cache_root check failed")?;
    endpoint.ping().await.context("endpoint check failed")?;
    runtime.ping().await.context("docker check failed")?;
    info!("Sanity check passed");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install CTRL+C signal handler");
    };
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM signal handler")
            .recv()
            .await;
    };
    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    info!("Judgehost booting...");

    let config = SystemConfig::load(&cli.config).map_err(|e| {
        error!("Failed to load config: {}", e);
        e
    })?;
    info!(
        host = %config.host_name,
        endpoint_name = %config.endpoint_name,
        endpoint = %config.endpoint_url,
        image = %config.docker_image,
        max_worker = config.max_worker,
        "Config loaded"
    );

    let runtime = Arc::new(DockerRuntime::connect(&config.docker_server)?);
    let endpoint = HttpEndpoint::new(&config)?;
    let downloader = Downloader::new(endpoint.clone(), config.cache_root.clone());

    if let Err(e) = sanity_check(&config, &endpoint, &runtime).await {
        error!(error = %format!("{:#}", e), "Sanity check failed");
        return Err(e);
    }
    if cli.clean_cache {
        downloader.clean_cache()?;
    }
    runtime.ensure_image(&config.docker_image).await?;
    endpoint.register().await?;
    info!(host = %config.host_name, "Judgehost registered");

    let cpus = config::host_cpu_count();
    if config.max_worker > cpus {
        warn!(max_worker = config.max_worker, cpus, "More workers than CPUs, extra workers will wait for slots");
    }
    let pipeline = Arc::new(Pipeline::new(
        runtime,
        Arc::new(endpoint.clone()),
        Arc::new(downloader),
        Settings::from(&config),
    ));
    let (daemon, queue) = Daemon::new(pipeline, CpuSlots::new(cpus), config.max_worker, config.max_retry);
    let pool = daemon.run();

    let (stop, stopped) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        warn!("Received shutdown signal, draining queue...");
        let _ = stop.send(true);
    });

    daemon::feed(
        &endpoint,
        &queue,
        &config.judge_root,
        Duration::from_millis(config.poll_interval_ms),
        stopped,
    )
    .await?;

    drop(queue);
    pool.join().await;
    info!("Judgehost shutdown complete");
    Ok(())
}
