use anyhow::Result;
use clap::Parser;
use whatsgate::{cli, logging};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file before anything else (silently ignore if missing)
    dotenvy::dotenv().ok();

    let cli_args = cli::Cli::parse();
    let config = cli::load_config(cli_args.config.as_deref())?;

    let mut log_config = logging::LogConfig::new()
        .with_debug_mode(cli_args.debug)
        .with_level(config.logging.level.clone())
        .with_json(config.logging.json);
    if let Some(ref dir) = config.logging.file {
        log_config = log_config.with_log_dir(dir.clone());
    }

    let _guard = logging::init_logging(log_config)
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    // Clean up old log files (keep last 7 days)
    if cli_args.debug {
        let removed = match config.logging.file {
            Some(ref dir) => logging::cleanup_logs_in(dir, 7),
            None => logging::cleanup_old_logs(7),
        };
        if let Ok(removed) = removed
            && removed > 0
        {
            tracing::info!("Cleaned up {} old log file(s)", removed);
        }
    }

    cli::run(cli_args, config).await
}
