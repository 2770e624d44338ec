//! shelfctl - operator tool for shelf document and blob stores
//!
//! Results go to stdout as JSON lines; logs go to stderr.

mod cli;
mod commands;
mod config;
mod error;

use crate::cli::Cli;
use crate::config::Config;
use crate::error::Result;
use clap::Parser;
use tracing::debug;
use tracing_subscriber::{prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let env_filter = EnvFilter::from_default_env()
        .add_directive("shelfctl=info".parse()?)
        .add_directive("shelf_db=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    };

    let config = Config::from_env()?.with_overrides(cli.doc_db, cli.blob_db, cli.busy_timeout_secs);
    debug!("Document store: {:?}", config.doc_db);
    debug!("Blob store: {:?}", config.blob_db);

    let mut stdout = std::io::stdout();
    commands::run(cli.command, &config, &mut stdout).await
}
