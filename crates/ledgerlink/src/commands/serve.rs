//! Serve command - runs the OAuth callback server.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Args;
use ledgerlink_oauth::{CallbackServer, CallbackServerConfig, ConnectionManager};

use super::Context;

/// Arguments for the serve command.
///
/// CLI arguments override config file values.
#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to bind to (overrides config)
    #[arg(short, long)]
    pub bind: Option<String>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Allow cross-origin requests
    #[arg(long)]
    pub cors: bool,

    /// Reject callbacks without a state parameter
    #[arg(long)]
    pub require_state: bool,
}

/// Run the serve command.
pub async fn run(args: ServeArgs, ctx: &Context) -> Result<()> {
    let config = ctx.load_config()?;
    let server_config = config.server();

    let bind = args.bind.unwrap_or(server_config.bind);
    let port = args.port.unwrap_or(server_config.port);
    let require_state = args.require_state || server_config.require_state;
    let bind_addr: SocketAddr = format!("{}:{}", bind, port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", bind, port))?;

    let store = ctx.open_store(&config)?;
    let names: Vec<String> = config.connection_names().iter().map(|s| s.to_string()).collect();
    let manager = Arc::new(ConnectionManager::new(Arc::new(config), store));

    if names.is_empty() {
        tracing::warn!("No connections configured; every callback will be rejected");
    }
    for name in &names {
        println!("  http://{}/oauth/{}/connect", bind_addr, name);
    }

    let server_config = CallbackServerConfig {
        bind_addr,
        enable_cors: args.cors,
        require_state,
    };
    CallbackServer::new(server_config, manager).run().await?;
    Ok(())
}
