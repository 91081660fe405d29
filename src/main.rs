//! chatrelay - provider routing and streaming chat gateway
//!
//! Fronts a pool of hosted and local LLM providers, fails over between them
//! and streams each reply to any number of subscribers.

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chatrelay::config::{Config, KeySource};

#[derive(Parser)]
#[command(name = "chatrelay")]
#[command(about = "Provider routing and streaming chat gateway")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,

        /// Override listen address
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Validate configuration file
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },

    /// Show configured providers and their routing metadata
    Providers {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("chatrelay={},tower_http=info", level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load(path: &str) -> anyhow::Result<(Config, Vec<(String, KeySource)>)> {
    Config::from_file_with_env(path).with_context(|| format!("loading {}", path))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, listen } => {
            let (mut loaded, key_sources) = load(&config)?;
            init_tracing(&loaded.logging.level);
            tracing::info!(config = %config, "Configuration loaded");

            if let Some(addr) = listen {
                tracing::info!(listen = %addr, "Override listen address");
                loaded.server.listen = addr;
            }
            for (provider, source) in &key_sources {
                if *source == KeySource::None {
                    tracing::debug!(provider = %provider, "No API key configured");
                } else {
                    tracing::debug!(provider = %provider, key_source = %source, "API key resolved");
                }
            }

            chatrelay::api::run_server(loaded).await
        }

        Commands::Check { config } => {
            init_tracing("warn");
            let (loaded, key_sources) = load(&config)?;

            println!("Configuration OK: {}", config);
            println!("  listen:    {}", loaded.server.listen);
            println!(
                "  database:  {}",
                loaded
                    .database
                    .as_ref()
                    .map(|d| d.path.as_str())
                    .unwrap_or("(in-memory)")
            );
            println!("  providers: {}", loaded.providers.len());
            for (provider, source) in key_sources {
                println!("    {:<20} key: {}", provider, source);
            }
            Ok(())
        }

        Commands::Providers { config } => {
            init_tracing("warn");
            let (loaded, _) = load(&config)?;

            if loaded.providers.is_empty() {
                println!("No providers configured");
                return Ok(());
            }

            println!(
                "{:<20} {:>8} {:>10}  {:<30} {}",
                "NAME", "PRIORITY", "CONTEXT", "MODELS", "TAGS"
            );
            for p in &loaded.providers {
                let models = if p.models.is_empty() {
                    "*".to_string()
                } else {
                    p.models.join(",")
                };
                println!(
                    "{:<20} {:>8} {:>10}  {:<30} {}",
                    p.name,
                    p.priority,
                    p.context_length
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    models,
                    p.tags.join(",")
                );
            }
            Ok(())
        }
    }
}
