mod auth;
mod bus;
mod config;
mod coordinator;
mod directory;
mod events;
mod node;
mod ring;

use anyhow::Result;
use clap::Parser;
use dotenvy::dotenv;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "beacon", about = "Distributed presence plane")]
enum Cli {
    /// Start the coordinator: admits presence nodes into the hash fabric
    /// and answers client routing queries
    Coordinator,
    /// Start a presence node: serves WebSocket sessions for its assigned
    /// vnodes and fans presence events out over the bus
    Node,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("beacon=info,tower_http=warn"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_tree::HierarchicalLayer::new(2).with_targets(true).with_bracketed_fields(false))
        .with(sentry::integrations::tracing::layer().event_filter(
            |metadata| match *metadata.level() {
                tracing::Level::ERROR => sentry::integrations::tracing::EventFilter::Event,
                tracing::Level::WARN | tracing::Level::INFO => {
                    sentry::integrations::tracing::EventFilter::Breadcrumb
                }
                _ => sentry::integrations::tracing::EventFilter::Ignore,
            },
        ))
        .init();

    let telemetry = config::TelemetryConfig::from_env();
    let _guard = sentry::init((
        telemetry.sentry_dsn.unwrap_or_default(),
        sentry::ClientOptions {
            release: sentry::release_name!(),
            environment: Some(telemetry.environment.into()),
            traces_sample_rate: 0.2,
            enable_logs: true,
            ..Default::default()
        },
    ));

    match cli {
        Cli::Coordinator => coordinator::run(config::CoordinatorConfig::from_env()?).await,
        Cli::Node => node::run(config::NodeConfig::from_env()?).await,
    }
}
