//! Auth command - authorization and token management.

use anyhow::Result;
use clap::{Args, Subcommand};
use ledgerlink_oauth::Clock;
use ledgerlink_store::{Token, TokenStore, mask_secret};

use super::{Context, explain};

/// Arguments for the auth command.
#[derive(Args, Debug)]
pub struct AuthArgs {
    #[command(subcommand)]
    pub command: AuthCommand,
}

#[derive(Subcommand, Debug)]
pub enum AuthCommand {
    /// Print the consent URL for a connection
    Url {
        /// Connection name
        name: String,
    },

    /// Show the stored token for a connection
    Status {
        /// Connection name
        name: String,
    },

    /// Refresh the access token now
    Refresh {
        /// Connection name
        name: String,
    },

    /// Complete authorization with a code copied from the callback URL
    Exchange {
        /// Connection name
        name: String,
        /// Authorization code (`code` query parameter)
        code: String,
        /// Realm id (`realmId` query parameter)
        realm_id: String,
    },

    /// Store a connection's client secret in the system keyring
    SetSecret {
        /// Connection name
        name: String,
    },
}

/// Run the auth command.
pub async fn run(args: AuthArgs, ctx: &Context) -> Result<()> {
    match args.command {
        AuthCommand::Url { name } => cmd_url(&name, ctx).await,
        AuthCommand::Status { name } => cmd_status(&name, ctx).await,
        AuthCommand::Refresh { name } => cmd_refresh(&name, ctx).await,
        AuthCommand::Exchange {
            name,
            code,
            realm_id,
        } => cmd_exchange(&name, &code, &realm_id, ctx).await,
        AuthCommand::SetSecret { name } => cmd_set_secret(&name, ctx).await,
    }
}

async fn cmd_url(name: &str, ctx: &Context) -> Result<()> {
    let manager = ctx.manager()?;
    let url = manager.authorization_url(name)?;

    if ctx.json_output {
        println!("{}", serde_json::json!({ "connection": name, "url": url }));
    } else {
        println!("Open this URL in your browser to connect '{}':", name);
        println!();
        println!("  {}", url);
    }
    Ok(())
}

async fn cmd_status(name: &str, ctx: &Context) -> Result<()> {
    let manager = ctx.manager()?;
    manager.connection_config(name)?;

    let now = manager.clock().now();
    let leeway = manager.settings().expiry_leeway();
    let latest = manager.store().load_latest(name).await?;

    if ctx.json_output {
        let body = match &latest {
            Some(token) => serde_json::json!({
                "connection": name,
                "has_token": true,
                "realm_id": token.realm_id,
                "issued_at": token.issued_at.to_rfc3339(),
                "expires_at": token.expires_at.to_rfc3339(),
                "expired": token.is_expired(now, leeway),
                "refreshable": token.is_refreshable(now),
                "refresh_expires_at": token.refresh_expires_at.map(|t| t.to_rfc3339()),
            }),
            None => serde_json::json!({ "connection": name, "has_token": false }),
        };
        println!("{}", serde_json::to_string_pretty(&body)?);
        return Ok(());
    }

    println!("Connection: {}", name);
    println!("-----------{}", "-".repeat(name.len()));

    let Some(token) = latest else {
        println!("Token: none stored");
        println!("  Run 'ledgerlink auth url {}' to authorize", name);
        return Ok(());
    };

    print_token(&token, now, leeway);

    if ctx.verbose {
        let history = manager.store().history(name, 5).await?;
        println!();
        println!("Recent tokens:");
        for token in history {
            println!(
                "  {}  access {}  expires {}",
                token.issued_at.format("%Y-%m-%d %H:%M:%S"),
                mask_secret(&token.access_token),
                token.expires_at.format("%Y-%m-%d %H:%M:%S"),
            );
        }
    }

    Ok(())
}

fn print_token(token: &Token, now: chrono::DateTime<chrono::Utc>, leeway: std::time::Duration) {
    println!("Realm: {}", token.realm_id.as_deref().unwrap_or("(none)"));
    println!("Issued: {}", token.issued_at.to_rfc3339());
    if token.is_expired(now, leeway) {
        println!("Access token: expired at {}", token.expires_at.to_rfc3339());
    } else {
        println!(
            "Access token: valid for {}m (until {})",
            token.expires_in(now).num_minutes(),
            token.expires_at.to_rfc3339()
        );
    }

    match (token.is_refreshable(now), token.refresh_expires_at) {
        (true, Some(at)) => println!("Refresh token: valid until {}", at.to_rfc3339()),
        (true, None) => println!("Refresh token: present"),
        (false, _) => println!("Refresh token: unusable, re-authorization required"),
    }
}

async fn cmd_refresh(name: &str, ctx: &Context) -> Result<()> {
    let manager = ctx.manager()?;
    let before = manager.store().load_latest(name).await?;

    let mut connection = manager.initialize(name).await.map_err(explain)?;
    if before.is_some_and(|t| t.access_token == connection.token().access_token) {
        connection.refresh().await.map_err(explain)?;
    }

    let token = connection.token();
    if ctx.json_output {
        println!(
            "{}",
            serde_json::json!({
                "connection": name,
                "issued_at": token.issued_at.to_rfc3339(),
                "expires_at": token.expires_at.to_rfc3339(),
            })
        );
    } else {
        println!(
            "Refreshed '{}'; access token valid until {}",
            name,
            token.expires_at.to_rfc3339()
        );
    }
    Ok(())
}

async fn cmd_exchange(name: &str, code: &str, realm_id: &str, ctx: &Context) -> Result<()> {
    let manager = ctx.manager()?;
    let connection = manager
        .handle_callback(name, code, realm_id)
        .await
        .map_err(explain)?;

    let token = connection.token();
    if ctx.json_output {
        println!(
            "{}",
            serde_json::json!({
                "connection": name,
                "realm_id": token.realm_id,
                "expires_at": token.expires_at.to_rfc3339(),
            })
        );
    } else {
        println!("Connected '{}' to realm {}", name, realm_id);
        println!("Access token valid until {}", token.expires_at.to_rfc3339());
    }
    Ok(())
}

async fn cmd_set_secret(name: &str, ctx: &Context) -> Result<()> {
    let config = ctx.load_config()?;
    config.connection(name)?;

    let secret = rpassword::prompt_password(format!("Client secret for '{}': ", name))?;
    let secret = secret.trim();
    if secret.is_empty() {
        println!("No secret entered, aborting.");
        return Ok(());
    }

    ledgerlink_config::store_in_keyring(name, secret).map_err(|e| {
        anyhow::anyhow!(
            "{}\nSet {} instead.",
            e,
            ledgerlink_config::client_secret_env_var(name)
        )
    })?;
    println!("Client secret for '{}' stored in the system keyring.", name);
    Ok(())
}
