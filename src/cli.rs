use std::net::IpAddr;
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::info;

use crate::catalog::SchemaService;
use crate::config::Settings;
use crate::server;

#[derive(Debug, Parser)]
#[command(
    name = "portico",
    version,
    about = "MCP tool server fronting the Heroku Platform API"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the MCP stdio server plus the OAuth/health HTTP endpoints.
    Serve(ServeArgs),
    /// Fetch the upstream schema once and persist the catalog cache.
    Seed,
}

#[derive(Debug, Clone, Args)]
pub struct ServeArgs {
    /// Bind address for the OAuth/health HTTP endpoints.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: IpAddr,
    /// Port for the OAuth/health HTTP endpoints.
    #[arg(long, default_value_t = 8787)]
    pub port: u16,
}

pub async fn run(cli: Cli, settings: Settings) -> Result<()> {
    match cli.command {
        Commands::Serve(args) => server::serve(args, settings).await,
        Commands::Seed => seed(settings).await,
    }
}

async fn seed(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    let http = server::build_http_client(&settings);
    let catalog = SchemaService::new(Arc::clone(&settings), http);

    catalog.cold_boot().await;
    catalog.refresh(true).await?;
    info!(
        operations = catalog.operations().await.len(),
        cache_path = %settings.catalog_cache_path.display(),
        "catalog cache seeded"
    );
    Ok(())
}
