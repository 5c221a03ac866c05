//! OAuth Gateway - OAuth2 token validation and capture for protected APIs

use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use oauth_gateway::{
    cli::{Cli, Command},
    config::Config,
    gateway::Gateway,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::Check { ref format }) => run_check(config, format).await,
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Load configuration and apply CLI overrides
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host.clone_from(host);
    }
    if let Some(ref directory) = cli.definitions {
        config.repository.directory = Some(directory.clone());
    }
    config.validate()?;
    Ok(config)
}

/// Validate definitions offline and print the resulting route table
async fn run_check(config: Config, format: &str) -> ExitCode {
    let gateway = match Gateway::offline(config).await {
        Ok(g) => g,
        Err(e) => {
            eprintln!("❌ Failed to open definitions: {e}");
            return ExitCode::FAILURE;
        }
    };

    let report = match gateway.reload().await {
        Ok(report) => report,
        Err(e) => {
            eprintln!("❌ Failed to load definitions: {e}");
            return ExitCode::FAILURE;
        }
    };

    let routes = gateway.routes().routes();
    if format == "json" {
        match serde_json::to_string_pretty(&routes) {
            Ok(json) => println!("{json}"),
            Err(e) => {
                eprintln!("❌ Failed to serialize to JSON: {e}");
                return ExitCode::FAILURE;
            }
        }
    } else {
        println!(
            "{} server(s) loaded, {} route(s) registered\n",
            report.servers, report.routes
        );
        for route in &routes {
            println!("  {route}");
        }
    }

    if report.skipped_servers > 0 || report.skipped_routes > 0 {
        eprintln!(
            "\n❌ {} server(s) and {} route(s) skipped, see log for details",
            report.skipped_servers, report.skipped_routes
        );
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

/// Run the gateway server
async fn run_server(config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        servers = config.servers.len(),
        apis = config.apis.len(),
        "Starting OAuth Gateway"
    );

    // Create and run gateway
    let gateway = match Gateway::new(config).await {
        Ok(g) => g,
        Err(e) => {
            error!("Failed to create gateway: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Run with graceful shutdown
    if let Err(e) = gateway.run().await {
        error!("Gateway error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Gateway shutdown complete");
    ExitCode::SUCCESS
}
