//! CRUD PubSub - Main Server
//!
//! Republishes REST mutations to WebSocket subscribers.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crud_pubsub::events::{ChangeEvent, EventForwarder, HttpMethod};
use crud_pubsub::Config;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "crud-pubsub")]
#[command(about = "Real-time CRUD change notifications over WebSockets")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the notifier server
    Serve {
        /// Port to listen on (overrides config.yaml / SERVER_PORT)
        #[arg(short, long)]
        port: Option<u16>,

        /// Path to the YAML config file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Admit every connection without the auth handshake
        #[arg(long)]
        no_auth: bool,
    },

    /// Send a single change event to a running notifier
    Publish {
        /// Notifier base URL
        #[arg(long, env = "PUBSUB_URL", default_value = "http://localhost:3000")]
        url: String,

        /// HTTP method of the mutation (POST, PUT, PATCH, DELETE)
        #[arg(short, long)]
        method: HttpMethod,

        /// Absolute endpoint path, e.g. /rooms/5
        #[arg(short, long)]
        endpoint: String,

        /// JSON payload
        #[arg(short, long, default_value = "null")]
        data: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,crud_pubsub=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            port,
            config,
            no_auth,
        } => {
            let mut config = Config::from_yaml_and_env(config.as_deref())?;
            if let Some(port) = port {
                config.server_port = port;
            }
            if no_auth {
                config.auth_enabled = false;
            }
            crud_pubsub::start_server(config).await
        }
        Commands::Publish {
            url,
            method,
            endpoint,
            data,
        } => run_publish(&url, method, &endpoint, &data).await,
    }
}

async fn run_publish(url: &str, method: HttpMethod, endpoint: &str, data: &str) -> Result<()> {
    let data: serde_json::Value = serde_json::from_str(data).context("--data is not valid JSON")?;
    let event = ChangeEvent::new(method, endpoint, data)?;

    let forwarder = EventForwarder::new(url)?;
    let outcome = forwarder.forward(&event).await?;

    if outcome.published {
        println!(
            "Published {} {}: delivered={} skipped={} failed={}",
            event.method(),
            event.endpoint(),
            outcome.delivered,
            outcome.skipped,
            outcome.failed
        );
    } else {
        println!(
            "Ignored {} {} (not a published mutation)",
            event.method(),
            event.endpoint()
        );
    }
    Ok(())
}
