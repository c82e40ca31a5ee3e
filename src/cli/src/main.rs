//! box CLI entry point.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use box_cli::commands::{dispatch, exit_code, is_cancelled, Cli};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let code = match dispatch(cli).await {
        Ok(()) => 0,
        Err(e) => {
            if !is_cancelled(e.as_ref()) {
                eprintln!("Error: {e}");
            }
            exit_code(e.as_ref())
        }
    };

    // Exit explicitly: the interactive stdin reader may still be parked on a read.
    std::process::exit(code);
}
