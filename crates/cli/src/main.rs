//! taskforge CLI, the main entry point.
//!
//! Commands:
//! - `onboard` writes the default config with a fresh secrets passphrase
//! - `serve` runs the reconciler and the HTTP gateway until Ctrl-C
//! - `doctor` checks config and database connectivity

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "taskforge",
    about = "taskforge: reconcile agent tasks against models and sandboxed tools",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write the default configuration
    Onboard {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },

    /// Start the reconciler and the HTTP gateway
    Serve {
        /// Override the gateway port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Diagnose configuration and storage
    Doctor,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Onboard { force } => commands::onboard::run(force).await?,
        Commands::Serve { port } => commands::serve::run(port).await?,
        Commands::Doctor => commands::doctor::run().await?,
    }

    Ok(())
}
