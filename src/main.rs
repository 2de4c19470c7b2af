//! Termlab - run interactive CLI coding-agent exercises from the browser.
//!
//! Usage:
//!   termlab serve [--port 3100] [--workspace-dir PATH]

mod error;
mod http_server;
mod origin;
mod registry;
mod session;
mod state;
mod workspace;
mod ws;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "termlab")]
#[command(about = "Interactive coding-agent exercise server")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "3100")]
        port: u16,

        /// Directory exercise workspaces unpack into
        #[arg(long, env = "TERMLAB_WORKSPACE_DIR")]
        workspace_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("termlab=info,tower_http=info")),
        )
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Serve {
            port,
            workspace_dir,
        } => {
            let claude_bin = session::find_claude();
            match &claude_bin {
                Some(path) => info!("using claude at {}", path.display()),
                None => warn!("claude not found on PATH; sessions will fail until it is installed"),
            }
            let workspace_root = workspace_dir.unwrap_or_else(default_workspace_root);
            info!("workspaces under {}", workspace_root.display());

            let state = state::AppState::new(claude_bin, workspace_root);
            http_server::run_server(port, state).await;
        }
    }
}

fn default_workspace_root() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".termlab").join("workspaces"))
        .unwrap_or_else(|| std::env::temp_dir().join("termlab-workspaces"))
}
