/// `up` subcommand.
mod up;

pub(crate) use up::up;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// CLI configuration.
#[derive(Parser)]
#[command(about, version)]
pub(crate) struct Cli {
    /// Client configuration file path.
    ///
    /// Defaults to `~/.hoist/config.toml`.
    #[arg(short, long, global = true)]
    pub config_file: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Selected subcommand.
    #[command(subcommand)]
    pub command: Commands,
}

/// Supported subcommands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Upload the project to the remote build service.
    ///
    /// If the selected environment enables watch mode, the project is uploaded
    /// again whenever its files change.
    Up(Up),
}

/// `up` subcommand configuration.
#[derive(Args)]
pub struct Up {
    /// Project directory, defaults to the current one.
    path: Option<PathBuf>,

    /// Environment name.
    ///
    /// Takes precedence over the `HOIST_ENV` environment variable.
    #[arg(short, long)]
    environment: Option<String>,

    /// Custom remote build service URL.
    #[arg(long)]
    remote: Option<String>,
}
