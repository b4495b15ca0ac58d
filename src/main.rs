//! snspub binary entry point

use clap::{Parser, Subcommand};
use snspub::federation::Audience;
use snspub::{AppState, config};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Single-actor ActivityPub notification service
#[derive(Parser, Debug)]
#[command(name = "snspub", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server (default)
    Serve,
    /// Send a note to every follower and exit
    Notify {
        /// Mention each follower instead of addressing the followers collection
        #[arg(long)]
        alert: bool,
        /// Plain-text message
        message: String,
    },
}

fn init_tracing(logging: &config::LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("snspub={},tower_http=debug", logging.level).into()
    });

    if logging.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().pretty())
            .init();
    }
}

/// Application entry point
///
/// # Setup
/// 1. Load configuration from file and environment
/// 2. Initialize tracing/logging
/// 3. Initialize AppState
/// 4. Serve, or broadcast one note
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 1. Load configuration
    let config = config::AppConfig::load()?;

    // 2. Initialize tracing/logging and metrics
    init_tracing(&config.logging);
    snspub::metrics::init_metrics();
    tracing::info!(
        domain = %config.server.domain,
        protocol = %config.server.protocol,
        "Configuration loaded"
    );

    // 3. Initialize application state
    let state = AppState::new(config.clone()).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(state, &config).await,
        Command::Notify { alert, message } => notify(state, alert, &message).await,
    }
}

async fn serve(state: AppState, config: &config::AppConfig) -> anyhow::Result<()> {
    let app = snspub::build_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);
    tracing::info!("Public URL: {}", config.server.base_url());

    axum::serve(listener, app).await?;
    Ok(())
}

async fn notify(state: AppState, alert: bool, message: &str) -> anyhow::Result<()> {
    let audience = if alert {
        Audience::Mention
    } else {
        Audience::Followers
    };

    let results = state.notify(message, audience).await?;
    let failed: Vec<_> = results.iter().filter(|r| !r.success).collect();
    for result in &failed {
        tracing::error!(
            inbox = %result.inbox_uri,
            status = ?result.status_code,
            error = ?result.error,
            "Delivery failed"
        );
    }

    if !failed.is_empty() {
        anyhow::bail!("{} of {} deliveries failed", failed.len(), results.len());
    }
    Ok(())
}
