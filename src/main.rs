mod api;
mod auth;
mod cli;
mod config;
mod engine;
mod error;
mod events;
mod output;
mod session;
mod transport;
mod waterfall;

use anyhow::Result;
use clap::Parser;
use cli::Cli;
use log::info;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    output::print_banner();

    let cli = Cli::parse();
    info!("Starting buildwatch");
    cli.execute().await?;

    Ok(())
}
