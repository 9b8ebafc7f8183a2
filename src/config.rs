//! Configuration module for pingload.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments (and their environment variables) take precedence over
//! config file values, which take precedence over built-in defaults.

use crate::client::{BatchConfig, Pacing, WorkerOptions};
use crate::protocols::Protocol;
use crate::sink::{HeaderVariant, LockPolicy, SinkConfig, SinkMode};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "pingload")]
#[command(author = "pingload authors")]
#[command(version = "0.1.0")]
#[command(about = "Ping/pong server and concurrent load-testing client", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Accept connections and answer pings
    Server(ServerArgs),
    /// Run a batch of simulated clients and record the results
    Client(ClientArgs),
    /// Merge a directory of per-process result files into one
    Merge(MergeArgs),
    /// Report result files with repeated header rows
    CheckHeaders(CheckHeadersArgs),
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Address to bind to (e.g., 0.0.0.0:9000)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Wire protocol spoken on the port
    #[arg(short, long, value_enum)]
    pub protocol: Option<Protocol>,

    /// Maximum concurrent sessions (unbounded when unset)
    #[arg(long)]
    pub max_connections: Option<usize>,
}

#[derive(Args, Debug)]
pub struct ClientArgs {
    /// Server host
    #[arg(long)]
    pub host: Option<String>,

    /// Server port
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Messages sent by each worker
    #[arg(short, long, allow_negative_numbers = true)]
    pub messages: Option<i64>,

    /// Workers launched by this process
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Client id of the first worker
    #[arg(long)]
    pub client_index: Option<u64>,

    /// Total clients in the scenario, recorded with every result
    #[arg(long)]
    pub clients_total: Option<usize>,

    /// Number of servers behind the target, recorded with every result
    #[arg(long)]
    pub servers: Option<usize>,

    /// Round number; the scenario id becomes `R<round>`
    #[arg(long)]
    pub round: Option<u32>,

    /// Explicit scenario id (overrides --round)
    #[arg(long)]
    pub scenario: Option<String>,

    /// Repetition index
    #[arg(long)]
    pub repetition: Option<u32>,

    /// Wire protocol spoken by the server
    #[arg(long, value_enum)]
    pub protocol: Option<Protocol>,

    /// Request pacing on each connection
    #[arg(long, value_enum)]
    pub pacing: Option<Pacing>,

    /// Connection attempt timeout in milliseconds
    #[arg(long)]
    pub connect_timeout_ms: Option<u64>,

    /// Result store path
    #[arg(long, env = "PINGLOAD_RESULTS_PATH")]
    pub results_path: Option<PathBuf>,

    /// Directory for the result store when no path is given
    #[arg(long, env = "PINGLOAD_RESULTS_DIR")]
    pub results_dir: Option<PathBuf>,

    /// This process is the only writer of its result store
    #[arg(long)]
    pub private: bool,

    /// Result header layout
    #[arg(long, value_enum)]
    pub header: Option<HeaderVariant>,
}

#[derive(Args, Debug)]
pub struct MergeArgs {
    /// Directory holding per-process result files
    pub input_dir: PathBuf,
    /// Merged output file
    pub output: PathBuf,
}

#[derive(Args, Debug)]
pub struct CheckHeadersArgs {
    /// Directory holding result files
    pub dir: PathBuf,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub results: ResultsSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub protocol: Protocol,
    pub max_connections: Option<usize>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            protocol: Protocol::default(),
            max_connections: None,
        }
    }
}

/// Client-related configuration
#[derive(Debug, Deserialize)]
pub struct ClientSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_messages")]
    pub messages: i64,
    #[serde(default = "default_one")]
    pub workers: usize,
    #[serde(default = "default_one_u64")]
    pub client_index: u64,
    pub clients_total: Option<usize>,
    #[serde(default = "default_one")]
    pub servers: usize,
    #[serde(default = "default_one_u32")]
    pub repetition: u32,
    #[serde(default)]
    pub protocol: Protocol,
    #[serde(default)]
    pub pacing: Pacing,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            messages: default_messages(),
            workers: 1,
            client_index: 1,
            clients_total: None,
            servers: 1,
            repetition: 1,
            protocol: Protocol::default(),
            pacing: Pacing::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

/// Result store configuration
#[derive(Debug, Deserialize)]
pub struct ResultsSection {
    pub path: Option<PathBuf>,
    #[serde(default = "default_results_dir")]
    pub dir: PathBuf,
    #[serde(default)]
    pub header: HeaderVariant,
    #[serde(default)]
    pub private: bool,
    #[serde(default = "default_lock_attempts")]
    pub lock_attempts: u32,
    #[serde(default = "default_lock_retry_ms")]
    pub lock_retry_ms: u64,
}

impl Default for ResultsSection {
    fn default() -> Self {
        Self {
            path: None,
            dir: default_results_dir(),
            header: HeaderVariant::default(),
            private: false,
            lock_attempts: default_lock_attempts(),
            lock_retry_ms: default_lock_retry_ms(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:9000".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9000
}

fn default_messages() -> i64 {
    10
}

fn default_one() -> usize {
    1
}

fn default_one_u64() -> u64 {
    1
}

fn default_one_u32() -> u32 {
    1
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_lock_attempts() -> u32 {
    LockPolicy::default().attempts
}

fn default_lock_retry_ms() -> u64 {
    LockPolicy::default().retry_delay.as_millis() as u64
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Resolved server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: String,
    pub protocol: Protocol,
    pub max_connections: Option<usize>,
}

/// Resolved client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub batch: BatchConfig,
    pub sink: SinkConfig,
}

/// What the process was asked to do.
#[derive(Debug, Clone)]
pub enum Mode {
    Server(ServerConfig),
    Client(ClientConfig),
    Merge { input_dir: PathBuf, output: PathBuf },
    CheckHeaders { dir: PathBuf },
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub mode: Mode,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Resolve parsed CLI args against the optional TOML file.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let log_level = if cli.log_level != "info" {
            cli.log_level
        } else {
            toml_config.logging.level.clone()
        };

        let mode = match cli.command {
            Command::Server(args) => Mode::Server(resolve_server(args, toml_config.server)),
            Command::Client(args) => {
                Mode::Client(resolve_client(args, toml_config.client, toml_config.results))
            }
            Command::Merge(args) => Mode::Merge {
                input_dir: args.input_dir,
                output: args.output,
            },
            Command::CheckHeaders(args) => Mode::CheckHeaders { dir: args.dir },
        };

        Ok(Config { log_level, mode })
    }
}

fn resolve_server(args: ServerArgs, file: ServerSection) -> ServerConfig {
    ServerConfig {
        listen: args.listen.unwrap_or(file.listen),
        protocol: args.protocol.unwrap_or(file.protocol),
        max_connections: args.max_connections.or(file.max_connections),
    }
}

fn resolve_client(args: ClientArgs, file: ClientSection, results: ResultsSection) -> ClientConfig {
    let host = args.host.unwrap_or(file.host);
    let port = args.port.unwrap_or(file.port);
    let workers = args.workers.unwrap_or(file.workers);
    let client_index = args.client_index.unwrap_or(file.client_index);
    let repetition = args.repetition.unwrap_or(file.repetition);
    let protocol = args.protocol.unwrap_or(file.protocol);

    let scenario_id = match (args.scenario, args.round) {
        (Some(scenario), _) => scenario,
        (None, Some(round)) => format!("R{round}"),
        (None, None) => Utc::now().format("%Y%m%dT%H%M%SZ").to_string(),
    };

    let private = args.private || results.private;
    let path = args.results_path.or(results.path).unwrap_or_else(|| {
        let dir = args.results_dir.unwrap_or(results.dir);
        let name = if private {
            format!(
                "{scenario_id}_rep{repetition}_c{client_index}_{}.csv",
                std::process::id()
            )
        } else {
            format!("results-{protocol}.csv")
        };
        dir.join(name)
    });

    ClientConfig {
        batch: BatchConfig {
            target: format!("{host}:{port}"),
            messages: args.messages.unwrap_or(file.messages),
            workers,
            start_index: client_index,
            scenario_id,
            repetition,
            declared_clients: args
                .clients_total
                .or(file.clients_total)
                .unwrap_or(workers),
            declared_servers: args.servers.unwrap_or(file.servers),
            worker: WorkerOptions {
                protocol,
                pacing: args.pacing.unwrap_or(file.pacing),
                connect_timeout: Duration::from_millis(
                    args.connect_timeout_ms.unwrap_or(file.connect_timeout_ms),
                ),
            },
        },
        sink: SinkConfig {
            path,
            mode: if private {
                SinkMode::Private
            } else {
                SinkMode::Shared
            },
            header: args.header.unwrap_or(results.header),
            lock_policy: LockPolicy {
                attempts: results.lock_attempts,
                retry_delay: Duration::from_millis(results.lock_retry_ms),
            },
        },
    }
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {1}", .0.display())]
    FileRead(PathBuf, std::io::Error),

    #[error("Failed to parse config file '{}': {1}", .0.display())]
    TomlParse(PathBuf, toml::de::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(args: &[&str]) -> ClientConfig {
        let cli = CliArgs::try_parse_from(args).unwrap();
        match Config::from_cli(cli).unwrap().mode {
            Mode::Client(config) => config,
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.server.protocol, Protocol::Framed);
        assert_eq!(config.client.port, 9000);
        assert_eq!(config.client.messages, 10);
        assert_eq!(config.results.header, HeaderVariant::Extended);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "127.0.0.1:7000"
            protocol = "line"
            max_connections = 512

            [client]
            host = "10.0.0.2"
            messages = 100
            workers = 8
            pacing = "bulk"

            [results]
            dir = "/tmp/out"
            header = "basic"
            private = true

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:7000");
        assert_eq!(config.server.protocol, Protocol::Line);
        assert_eq!(config.server.max_connections, Some(512));
        assert_eq!(config.client.host, "10.0.0.2");
        assert_eq!(config.client.port, 9000);
        assert_eq!(config.client.workers, 8);
        assert_eq!(config.client.pacing, Pacing::Bulk);
        assert_eq!(config.results.dir, PathBuf::from("/tmp/out"));
        assert_eq!(config.results.header, HeaderVariant::Basic);
        assert!(config.results.private);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_client_args() {
        let config = client(&[
            "pingload",
            "client",
            "--host",
            "10.1.1.1",
            "--port",
            "9100",
            "--messages",
            "50",
            "--workers",
            "4",
            "--client-index",
            "11",
            "--servers",
            "2",
            "--round",
            "7",
            "--repetition",
            "3",
            "--results-path",
            "/tmp/r.csv",
        ]);

        assert_eq!(config.batch.target, "10.1.1.1:9100");
        assert_eq!(config.batch.messages, 50);
        assert_eq!(config.batch.workers, 4);
        assert_eq!(config.batch.start_index, 11);
        assert_eq!(config.batch.declared_clients, 4);
        assert_eq!(config.batch.declared_servers, 2);
        assert_eq!(config.batch.scenario_id, "R7");
        assert_eq!(config.batch.repetition, 3);
        assert_eq!(config.sink.path, PathBuf::from("/tmp/r.csv"));
        assert_eq!(config.sink.mode, SinkMode::Shared);
    }

    #[test]
    fn test_negative_messages_accepted_for_validation() {
        let config = client(&["pingload", "client", "--messages", "-1", "--results-path", "x"]);
        assert_eq!(config.batch.messages, -1);
    }

    #[test]
    fn test_private_results_name() {
        let config = client(&[
            "pingload",
            "client",
            "--private",
            "--scenario",
            "S1",
            "--client-index",
            "4",
            "--results-dir",
            "/tmp/parts",
        ]);

        assert_eq!(config.sink.mode, SinkMode::Private);
        let expected = format!("S1_rep1_c4_{}.csv", std::process::id());
        assert_eq!(config.sink.path, PathBuf::from("/tmp/parts").join(expected));
    }

    #[test]
    fn test_server_args() {
        let cli = CliArgs::try_parse_from([
            "pingload",
            "server",
            "--listen",
            "127.0.0.1:9001",
            "--protocol",
            "line",
        ])
        .unwrap();

        match Config::from_cli(cli).unwrap().mode {
            Mode::Server(server) => {
                assert_eq!(server.listen, "127.0.0.1:9001");
                assert_eq!(server.protocol, Protocol::Line);
                assert_eq!(server.max_connections, None);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
