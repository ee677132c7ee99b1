use std::process::ExitCode;

use album_harvest::app::{self, Cli};
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "album_harvest=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match app::run(cli).await {
        Ok(summary) => {
            if let Some(stop) = summary.stop {
                tracing::info!("done: {}", stop.label());
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            tracing::error!("crawl aborted: {err}");
            ExitCode::FAILURE
        }
    }
}
