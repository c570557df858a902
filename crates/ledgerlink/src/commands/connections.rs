//! Connections command - lists configured connections.

use anyhow::Result;
use clap::Args;
use ledgerlink_oauth::Clock;
use ledgerlink_store::TokenStore;

use super::Context;

/// Arguments for the connections command.
#[derive(Args, Debug)]
pub struct ConnectionsArgs {
    /// Also show whether each connection has a usable token
    #[arg(long)]
    pub status: bool,
}

/// Run the connections command.
pub async fn run(args: ConnectionsArgs, ctx: &Context) -> Result<()> {
    let manager = ctx.manager()?;
    let config = manager.config();
    let now = manager.clock().now();

    let mut rows = Vec::new();
    for name in config.connection_names() {
        let connection = config.connection(name)?;
        let state = if args.status {
            Some(match manager.store().load_latest(name).await? {
                None => "not authorized",
                Some(token) if !token.is_refreshable(now) => "re-authorization required",
                Some(token) if token.is_expired(now, manager.settings().expiry_leeway()) => {
                    "expired (refreshable)"
                }
                Some(_) => "connected",
            })
        } else {
            None
        };
        rows.push((name, connection.api_base_url()?, state));
    }

    if ctx.json_output {
        let items: Vec<_> = rows
            .iter()
            .map(|(name, base_url, state)| {
                serde_json::json!({
                    "name": name,
                    "base_url": base_url,
                    "status": state,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    if rows.is_empty() {
        println!("No connections configured.");
        println!("  Add a [connections.<name>] table to ledgerlink.toml");
        return Ok(());
    }

    for (name, base_url, state) in rows {
        match state {
            Some(state) => println!("{:<20} {:<45} {}", name, base_url, state),
            None => println!("{:<20} {}", name, base_url),
        }
    }
    Ok(())
}
