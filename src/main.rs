//! pingload: a ping/pong server and a concurrent load-testing client
//!
//! The server answers on one of two wire protocols:
//! - Framed: 8-digit length prefix followed by a JSON message
//! - Line: `ping\n` answered by `pong\n`
//!
//! Features:
//! - Client harness running many simulated clients per process
//! - One CSV result row per client, appended under an advisory file lock
//! - Offline merge and header check for per-process result files
//! - Configuration via CLI arguments, environment or TOML file

mod client;
mod config;
mod merge;
mod protocols;
mod server;
mod sink;

use client::Harness;
use config::{ClientConfig, Config, Mode, ServerConfig};
use server::Server;
use sink::ResultSink;
use std::path::Path;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match config.mode {
        Mode::Server(server) => run_server(server),
        Mode::Client(client) => run_client(client),
        Mode::Merge { input_dir, output } => run_merge(&input_dir, &output),
        Mode::CheckHeaders { dir } => run_check_headers(&dir),
    }
}

fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
}

/// Serve until the process is killed. A bind failure exits non-zero.
fn run_server(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        listen = %config.listen,
        protocol = %config.protocol,
        max_connections = ?config.max_connections,
        "Starting pingload server"
    );

    runtime()?.block_on(async {
        let server = Server::bind(&config).map_err(|e| {
            error!(listen = %config.listen, error = %e, "Failed to bind");
            e
        })?;
        server.run().await;
        Ok::<(), Box<dyn std::error::Error>>(())
    })
}

/// Run one batch. Worker failures are recorded, never reported via exit code.
fn run_client(config: ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(parent) = config.sink.path.parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(dir = %parent.display(), error = %e, "Could not create results directory");
            }
        }
    }

    let sink = ResultSink::new(config.sink);
    let harness = Harness::new(config.batch);

    let batch = harness.config();
    info!(
        target_addr = %batch.target,
        client_index = batch.start_index,
        results = %sink.path().display(),
        header = ?sink.header(),
        "Starting pingload client"
    );

    runtime()?.block_on(async move {
        harness.execute(sink).await;
    });
    Ok(())
}

fn run_merge(input_dir: &Path, output: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let summary = merge::merge_dir(input_dir, output)?;
    info!(
        files = summary.files,
        rows = summary.rows,
        output = %output.display(),
        "Merged result files"
    );
    Ok(())
}

fn run_check_headers(dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let reports = merge::check_headers(dir)?;
    let mut dirty = 0;
    for report in reports.iter().filter(|r| !r.is_clean()) {
        dirty += 1;
        if report.empty {
            println!("{}: empty", report.path.display());
        } else {
            println!(
                "{}: repeated header at lines {:?}",
                report.path.display(),
                report.duplicate_lines
            );
        }
    }
    info!(files = reports.len(), dirty, "Header check complete");
    Ok(())
}
