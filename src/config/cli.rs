use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

use super::StoreBackend;

/// Command-line arguments for the regcache binary.
#[derive(Debug, Parser)]
#[command(name = "regcache", version, about = "Caching package registry proxy")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "REGCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Prime the search index if needed, then serve registry traffic.
    Serve(Box<ServeArgs>),
    /// Prime the search index and exit.
    Prime(PrimeArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct PrimeArgs {
    #[command(flatten)]
    pub backends: BackendOverrides,
}

/// Overrides shared by every command that touches the store or upstream.
#[derive(Debug, Args, Default, Clone)]
pub struct BackendOverrides {
    /// Override the public registry host.
    #[arg(long = "public-registry", value_name = "HOST")]
    pub public_registry: Option<String>,

    /// Override the host this proxy is reachable at.
    #[arg(long = "private-registry", value_name = "HOST")]
    pub private_registry: Option<String>,

    /// Serve private tarball URLs over https.
    #[arg(
        long = "private-tls",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub private_tls: Option<bool>,

    /// Override the key-value store backend.
    #[arg(long = "store-backend", value_name = "BACKEND", value_enum)]
    pub store_backend: Option<StoreBackend>,

    /// Override the Redis connection URL.
    #[arg(long = "redis-url", value_name = "URL")]
    pub redis_url: Option<String>,

    /// Override the tarball directory.
    #[arg(long = "storage-directory", value_name = "PATH")]
    pub storage_directory: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub backends: BackendOverrides,

    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub server_graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,
}
