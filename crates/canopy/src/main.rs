//! Canopy CLI - multi-repository git worktree workspaces
//!
//! Binary name: `canopy`

use std::process;

use canopy_core::CancellationToken;
use clap::Parser;

mod cli;
mod handlers;

use cli::Cli;
use handlers::{format_error, run_cli};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    // Ctrl-C cancels in-flight work; mutations roll back before returning
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received SIGINT, cancelling...");
            on_signal.cancel();
        }
    });

    if let Err(err) = run_cli(cli, cancel).await {
        #[allow(clippy::print_stderr)]
        {
            eprintln!("Error: {}", format_error(&err));
        }

        let code = err
            .downcast_ref::<canopy_core::Error>()
            .map(canopy_core::Error::exit_code)
            .unwrap_or_else(|| 1);

        #[allow(clippy::exit)]
        process::exit(code);
    }
}
