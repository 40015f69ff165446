//! pipeforge CLI entry point.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Installs the global tracing subscriber. `RUST_LOG` wins over the
/// `--log-level` flag.
fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = pipeforge::cli::parse_cli();
    init_tracing(&cli.log_level);
    pipeforge::cli::run_with_cli(cli).await
}
