//! Racing-rank operator CLI.

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use racing_rank::cli::{self, Cli, Commands};
use racing_rank::config::AppConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "racing_rank=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Load configuration
    let mut config = AppConfig::load()?;

    // Override with CLI args
    if let Some(path) = cli.database {
        config.database.path = path.to_string_lossy().to_string();
    }

    match cli.command {
        Commands::Status => cli::run_status(&config).await,
        Commands::Stats { as_of } => cli::run_stats(&config, &as_of).await,
        Commands::Features {
            limit,
            workers,
            only_missing,
        } => cli::run_features(&config, limit, workers, only_missing).await,
        Commands::Train {
            race_type,
            test_size,
            output_dir,
        } => cli::run_train(&config, race_type, test_size, output_dir).await,
        Commands::Predict { race_id, db, format } => {
            cli::run_predict(&config, &race_id, db, &format).await
        }
    }
}
