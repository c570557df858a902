//! Query command - runs a query statement against a connected company.

use anyhow::Result;
use clap::Args;
use ledgerlink_oauth::AccountingApi;

use super::{Context, explain};

/// Arguments for the query command.
#[derive(Args, Debug)]
pub struct QueryArgs {
    /// Connection name
    pub name: String,

    /// Query statement, e.g. "select * from Customer where Active = true"
    pub statement: String,
}

/// Run the query command.
pub async fn run(args: QueryArgs, ctx: &Context) -> Result<()> {
    let manager = ctx.manager()?;
    let connection = manager.initialize(&args.name).await.map_err(explain)?;

    tracing::debug!(connection = %args.name, statement = %args.statement, "Running query");
    let response = connection.api().query(&args.statement).await?;

    if ctx.json_output {
        println!("{}", serde_json::to_string(&response)?);
    } else {
        println!("{}", serde_json::to_string_pretty(&response)?);
    }
    Ok(())
}
