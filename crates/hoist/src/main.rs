//! # hoist
//!
//! Packages a project directory, streams it to a remote build service and renders
//! the service's progress. Environments that enable watch mode are uploaded again
//! whenever project files change.

#![deny(missing_docs)]
#![deny(clippy::missing_docs_in_private_items)]

use clap::Parser;
use commands::{Cli, Commands};
use common::{config::Config, logging};
use tracing::level_filters::LevelFilter;

/// Project directory archiving utilities.
mod archiver;

/// CLI subcommands.
mod commands;

/// Project configuration (`hoist.toml`).
mod config;

/// Environment-aware build context resolution.
mod context;

/// Upload result rendering.
mod display;

/// Ignore file parsing and matching.
mod ignore_file;

/// Remote build service interface.
mod remote;

/// Single cancellable upload.
mod session;

/// Debounced uploads on filesystem changes.
mod watcher;

/// Test doubles shared between modules.
#[cfg(test)]
mod testing;

/// CLI entrypoint.
#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    let mut config = Config::new(cli.config_file)?;

    if cli.verbose {
        config.logging.level = LevelFilter::DEBUG;
    }

    logging::init(&config);

    match cli.command {
        Commands::Up(args) => commands::up(args, config).await?,
    }

    Ok(())
}
