mod client;
mod config;
mod output;
mod runner;
mod storage;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;

use corral_core::Job;

use crate::config::Config;

/// corral test runner
#[derive(Parser, Debug)]
#[command(name = "corral-worker")]
#[command(about = "Runs corral test jobs on this machine", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register with the coordinator and run jobs as they are assigned
    Worker,
    /// Run a single job with output to stdout, without registering
    ///
    /// `sha` is a commit hash, `dir` the Testfile's directory relative to
    /// the repository root (`/` for the root), and `name` the entry to run.
    Onejob {
        sha: String,
        dir: String,
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Commands::Worker => runner::run(config).await,
        Commands::Onejob { sha, dir, name } => {
            let dir = if dir.starts_with('/') {
                dir
            } else {
                format!("/{dir}")
            };
            runner::one_job(config, Job { sha, dir, name }).await
        }
    }
}
