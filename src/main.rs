use clap::Parser;
use std::process;
use topowatch::cli::{commands, Cli, Commands};
use topowatch::config::Config;
use topowatch::logging;
use topowatch::supervisor;
use tracing::info;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Reject unprivileged all-in-one runs before touching config or log files
    if matches!(cli.command, Some(Commands::Allinone { .. })) {
        if let Err(e) = supervisor::require_root(supervisor::current_euid()) {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }

    let config = match Config::load(cli.config.backend.as_deref(), &cli.config.files) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to initialize config: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = logging::init(&config.logging, cli.verbose) {
        eprintln!("Failed to initialize logging: {}", e);
        process::exit(1);
    }

    info!("Starting topowatch v{}", env!("CARGO_PKG_VERSION"));

    let result = match cli.command {
        Some(command) => commands::handle_command(command, &cli.config, &config).await,
        None => {
            eprintln!("No command specified. Use --help for usage information.");
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}
