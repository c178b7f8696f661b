//! tiergate - provider routing gateway with circuit breaking and
//! streaming translation
//!
//! A local gateway that accepts messages-format requests and routes them
//! across configured upstream providers with automatic fallback.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tiergate::config::Config;

#[derive(Parser)]
#[command(name = "tiergate")]
#[command(about = "Provider routing gateway with circuit breaking and streaming translation")]
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

    /// Show configured providers and their model catalogs
    Providers {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
}

fn init_tracing(default_filter: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, listen } => {
            let (mut loaded, key_sources) = Config::from_file_with_env(&config)?;

            init_tracing(&loaded.logging.level);
            tracing::info!(config = %config, "Loaded configuration");

            for (name, source) in &key_sources {
                tracing::info!(provider = %name, key_source = %source, "API key resolution");
            }

            if let Some(addr) = listen {
                tracing::info!(listen = %addr, "Override listen address");
                loaded.server.listen = addr;
            }

            tiergate::proxy::run_server(loaded).await
        }

        Commands::Check { config } => {
            init_tracing("tiergate=info");
            match Config::from_file_with_env(&config) {
                Ok((loaded, key_sources)) => {
                    println!("Configuration OK: {}", config);
                    println!("  listen: {}", loaded.server.listen);
                    println!("  fallback strategy: {}", loaded.routing.fallback_strategy);
                    println!(
                        "  circuit breaker: threshold {}, recovery {}s",
                        loaded.circuit_breaker.failure_threshold,
                        loaded.circuit_breaker.recovery_timeout_secs
                    );
                    println!("  providers: {}", loaded.providers.len());
                    for (name, source) in &key_sources {
                        println!("    {}: api key {}", name, source);
                    }
                    Ok(())
                }
                Err(e) => {
                    eprintln!("Configuration invalid: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Providers { config } => {
            init_tracing("tiergate=info");
            let (loaded, key_sources) = Config::from_file_with_env(&config)?;

            for provider in &loaded.providers {
                let source = key_sources
                    .iter()
                    .find(|(name, _)| name == &provider.name)
                    .map(|(_, s)| s.to_string())
                    .unwrap_or_else(|| "none".to_string());

                println!(
                    "{} [{}] {} (priority {}, {})",
                    provider.name,
                    provider.api_format,
                    provider.url,
                    provider.priority,
                    if provider.enabled { "enabled" } else { "disabled" },
                );
                println!("  api key: {}", source);
                if !provider.models.big.is_empty() {
                    println!("  big:    {}", provider.models.big.join(", "));
                }
                if !provider.models.middle.is_empty() {
                    println!("  middle: {}", provider.models.middle.join(", "));
                }
                if !provider.models.small.is_empty() {
                    println!("  small:  {}", provider.models.small.join(", "));
                }
            }
            Ok(())
        }
    }
}
