//! Ledgerlink - OAuth connection manager for accounting APIs
//!
//! Main entry point for the ledgerlink CLI.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod commands;

use commands::{auth, connections, query, serve};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Ledgerlink - OAuth connection manager for accounting APIs
#[derive(Parser)]
#[command(name = "ledgerlink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output as JSON (for scripting)
    #[arg(long, global = true)]
    pub json: bool,

    /// Config file layered on top of the discovered configuration
    #[arg(short, long, global = true, env = "LEDGERLINK_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the OAuth callback server
    Serve(serve::ServeArgs),

    /// Authorization and token management
    Auth(auth::AuthArgs),

    /// Run a query against a connected company
    Query(query::QueryArgs),

    /// List configured connections
    Connections(connections::ConnectionsArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Console (human-readable, stderr) + rotating JSON file
    let filter = if cli.verbose {
        "ledgerlink=debug,ledgerlink_oauth=debug,ledgerlink_store=debug,ledgerlink_config=debug,info"
    } else {
        "ledgerlink=info,ledgerlink_oauth=info,ledgerlink_store=warn,ledgerlink_config=warn,warn"
    };

    let log_dir = ledgerlink_config::config_dir()
        .map(|d| d.join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"));
    let file_appender = tracing_appender::rolling::daily(&log_dir, "ledgerlink.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::prelude::*;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(tracing_subscriber::EnvFilter::new(
                    "ledgerlink=trace,ledgerlink_oauth=trace,ledgerlink_store=debug,ledgerlink_config=debug,info",
                )),
        )
        .init();

    let ctx = commands::Context {
        config_path: cli.config,
        json_output: cli.json,
        verbose: cli.verbose,
    };

    match cli.command {
        Commands::Serve(args) => serve::run(args, &ctx).await,
        Commands::Auth(args) => auth::run(args, &ctx).await,
        Commands::Query(args) => query::run(args, &ctx).await,
        Commands::Connections(args) => connections::run(args, &ctx).await,
    }
}
