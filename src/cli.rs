//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// OAuth2 gateway - token validation, capture and proxying for protected APIs
#[derive(Parser, Debug)]
#[command(name = "oauth-gateway")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "OAUTH_GATEWAY_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "OAUTH_GATEWAY_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "OAUTH_GATEWAY_HOST")]
    pub host: Option<String>,

    /// Directory of OAuth server definitions
    #[arg(long, env = "OAUTH_GATEWAY_DEFINITIONS")]
    pub definitions: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "OAUTH_GATEWAY_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "OAUTH_GATEWAY_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Load configuration and definitions, print the routes, and exit
    Check {
        /// Output format (table, json)
        #[arg(short, long, default_value = "table")]
        format: String,
    },
}
