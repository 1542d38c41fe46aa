//! Chime: persistent timer dispatch daemon.
//!
//! Hosts the dispatch core over a SQLite timer store and logs every
//! fired timer. Feature code (reminder rendering, moderation actions)
//! lives elsewhere and consumes completions through the scheduler's
//! subscription interface.

use clap::{Parser, Subcommand};
use miette::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod daemon;

#[derive(Parser)]
#[command(name = "chime")]
#[command(about = "Persistent timer dispatch daemon", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the dispatch daemon
    Run {
        /// SQLite database URL
        #[arg(long, env = "CHIME_DB", default_value = "sqlite:chime.db")]
        db: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "chime=info,chime_scheduler=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { db } => daemon::run(&db).await,
    }
}
