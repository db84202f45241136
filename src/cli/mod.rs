//! CLI Module
//!
//! Command-line interface for whatsgate using Clap v4.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;

use crate::channels::whatsapp::{ConnectionController, ConnectionStateStore, ProtocolClient};
use crate::config::Config;
use crate::gateway::{self, AppState};

/// whatsgate - HTTP gateway for a WhatsApp Web session
#[derive(Parser, Debug)]
#[command(name = "whatsgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Enable debug mode (debug log level plus log files)
    #[arg(short, long, global = true)]
    pub debug: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the HTTP gateway (default)
    Serve {
        /// Address to bind, overrides the configuration
        #[arg(long)]
        bind: Option<String>,

        /// Port to listen on, overrides the configuration
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Initialize configuration
    Init {
        /// Force overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Show the effective configuration
    Config,

    /// Log management operations
    Logs {
        #[command(subcommand)]
        operation: LogCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum LogCommands {
    /// Show log file location and status
    Status,
    /// Clean up old log files
    Clean {
        /// Maximum age in days (default: 7)
        #[arg(short = 'a', long, default_value = "7")]
        days: u64,
    },
}

/// Main CLI entry point
pub async fn run(cli: Cli, config: Config) -> Result<()> {
    if cli.debug {
        tracing::info!("Debug mode enabled");
    }

    match cli.command {
        None => cmd_serve(config, None, None).await,
        Some(Commands::Serve { bind, port }) => cmd_serve(config, bind, port).await,
        Some(Commands::Init { force }) => cmd_init(force),
        Some(Commands::Config) => cmd_config(&config),
        Some(Commands::Logs { operation }) => cmd_logs(&config, operation),
    }
}

/// Load configuration from file or defaults
pub fn load_config(config_path: Option<&str>) -> Result<Config> {
    let config = if let Some(path) = config_path {
        Config::load_from_path(path)?
    } else {
        Config::load()?
    };

    config.validate()?;
    Ok(config)
}

#[cfg(feature = "whatsapp")]
fn protocol_client() -> Result<Arc<dyn ProtocolClient>> {
    Ok(Arc::new(crate::channels::whatsapp::WhatsAppClient::new()))
}

#[cfg(not(feature = "whatsapp"))]
fn protocol_client() -> Result<Arc<dyn ProtocolClient>> {
    anyhow::bail!(
        "whatsgate was built without WhatsApp support; rebuild with `--features whatsapp`"
    )
}

/// Run the gateway until Ctrl+C
async fn cmd_serve(mut config: Config, bind: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    if let Some(port) = port {
        config.server.port = port;
    }

    let client = protocol_client()?;
    let store = Arc::new(ConnectionStateStore::new());
    let controller = ConnectionController::new(
        store,
        client,
        config.whatsapp.controller_settings(),
    );

    let address = config.server.address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind {}", address))?;
    tracing::info!(
        "Session directory: {}",
        config.whatsapp.session_dir.display()
    );

    let result = gateway::serve(listener, AppState::new(controller.clone()), shutdown_signal()).await;
    controller.shutdown().await;
    result
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown requested");
}

/// Initialize configuration file
fn cmd_init(force: bool) -> Result<()> {
    println!("whatsgate configuration\n");

    let config_path =
        Config::system_config_path().context("Could not determine config directory")?;

    if config_path.exists() && !force {
        anyhow::bail!(
            "Configuration file already exists at: {}\nUse --force to overwrite",
            config_path.display()
        );
    }

    Config::default().save(&config_path)?;

    println!("Configuration initialized at: {}", config_path.display());
    println!("\nNext steps:");
    println!("   1. Adjust the port and session directory if needed");
    println!("   2. Run 'whatsgate serve' and open /test in a browser");

    Ok(())
}

/// Show configuration
fn cmd_config(config: &Config) -> Result<()> {
    println!("whatsgate configuration\n");
    println!("Listen address: {}", config.server.address());
    println!("Log level: {}", config.logging.level);
    if let Some(ref dir) = config.logging.file {
        println!("Log directory: {}", dir.display());
    }
    println!("\nWhatsApp:");
    println!("  Session directory: {}", config.whatsapp.session_dir.display());
    println!("  Browser: {}", config.whatsapp.browser.join(" / "));
    println!("  Connect timeout: {}s", config.whatsapp.connect_timeout_secs);
    println!("  Keep-alive: {}s", config.whatsapp.keep_alive_secs);
    println!(
        "  Auto-reconnect: {}",
        if config.whatsapp.auto_reconnect {
            format!("after {}s", config.whatsapp.reconnect_delay_secs)
        } else {
            "off".to_string()
        }
    );
    Ok(())
}

/// Log management
fn cmd_logs(config: &Config, operation: LogCommands) -> Result<()> {
    use crate::logging;

    let log_dir = config
        .logging
        .file
        .clone()
        .unwrap_or_else(logging::default_log_dir);

    match operation {
        LogCommands::Status => {
            println!("Log directory: {}", log_dir.display());

            if !log_dir.exists() {
                println!("Status: no logs found");
                println!("\nRun with -d to write log files:");
                println!("   whatsgate -d serve");
                return Ok(());
            }

            let mut file_count = 0;
            let mut total_size = 0u64;
            for entry in std::fs::read_dir(&log_dir)? {
                let entry = entry?;
                if let Ok(metadata) = entry.metadata()
                    && metadata.is_file()
                {
                    file_count += 1;
                    total_size += metadata.len();
                }
            }
            println!("Log files: {}", file_count);
            println!(
                "Total size: {:.2} MB",
                total_size as f64 / (1024.0 * 1024.0)
            );
            if let Some(newest) = logging::newest_log_in(&log_dir) {
                println!("Latest log: {}", newest.display());
            }
            Ok(())
        }

        LogCommands::Clean { days } => {
            println!("Cleaning up log files older than {} days...\n", days);
            let removed = logging::cleanup_logs_in(&log_dir, days)?;
            if removed > 0 {
                println!("Removed {} old log file(s)", removed);
            } else {
                println!("No old log files to remove");
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_default_command_is_none() {
        let cli = Cli::try_parse_from(["whatsgate"]).unwrap();
        assert!(cli.command.is_none());
        assert!(!cli.debug);
    }

    #[test]
    fn test_serve_overrides() {
        let cli = Cli::try_parse_from(["whatsgate", "-d", "serve", "--port", "8080"]).unwrap();
        assert!(cli.debug);
        match cli.command {
            Some(Commands::Serve { bind, port }) => {
                assert!(bind.is_none());
                assert_eq!(port, Some(8080));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_logs_clean_days() {
        let cli = Cli::try_parse_from(["whatsgate", "logs", "clean", "--days", "3"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Logs {
                operation: LogCommands::Clean { days: 3 }
            })
        ));
    }

    #[cfg(feature = "whatsapp")]
    #[test]
    fn test_protocol_client_available() {
        assert!(protocol_client().is_ok());
    }

    #[cfg(not(feature = "whatsapp"))]
    #[test]
    fn test_protocol_client_requires_feature() {
        let err = protocol_client().err().unwrap();
        assert!(err.to_string().contains("--features whatsapp"));
    }

    #[test]
    fn test_load_config_from_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "[whatsapp]\nkeep_alive_secs = 45\n").unwrap();
        let config = load_config(file.path().to_str()).unwrap();
        assert_eq!(config.whatsapp.keep_alive_secs, 45);
    }

    #[test]
    fn test_load_config_rejects_invalid() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "[whatsapp]\nevent_queue_capacity = 0\n").unwrap();
        assert!(load_config(file.path().to_str()).is_err());
    }
}
