use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{error, warn};

use triad::backlog::BacklogStore;
use triad::config::{Config, StatusMode};
use triad::engine::{Collaborators, Engine};
use triad::status;
use triad::vcs::Vcs;

#[derive(Debug, Parser)]
#[command(name = "triad", about = "Resumable three-agent delivery orchestrator")]
struct Args {
    /// Resolve configuration and select work without calling remote services.
    #[arg(long)]
    dry_run: bool,
    /// Repository root holding backlog/ and status/ (defaults to the working
    /// directory).
    #[arg(long)]
    root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let cfg = Config::from_env(args.dry_run)?;
    let root = match args.root {
        Some(root) => root,
        None => std::env::current_dir()?,
    };

    let store = BacklogStore::open(&root)?;
    let collab = Collaborators::from_config(&cfg, &root);
    let mut engine = Engine::new(&cfg, store, &collab);

    if let Err(err) = engine.run().await {
        error!(error = %format!("{err:#}"), "run failed");
        if let Err(write_err) = status::write_error(&root, &err) {
            warn!(error = %write_err, "could not write error snapshot");
        } else if cfg.status_mode == StatusMode::Commit {
            let _ = collab
                .vcs
                .commit_and_push(&[status::error_path()], "status: record error");
        }
        return Err(err);
    }
    Ok(())
}
