//! Digit Bot - entry point
//!
//! 1. Loads and validates configuration (file + DIGIT_BOT__* env)
//! 2. Connects and authorizes the session
//! 3. Bootstraps instrument histories and tick streams
//! 4. Runs the orchestrator until ctrl-c or a fatal error

use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use digit_bot::runner::SessionExit;
use digit_bot::state::StateManager;
use digit_bot::{
    AppConfig, LogNotifier, Notifier, Orchestrator, SessionTransport, WebhookNotifier, WsGateway,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting Digit Bot...");

    let config = AppConfig::load().context("configuration rejected")?;
    info!(
        "Endpoint {}, instruments [{}], scoring {}, staking {:?}",
        config.session.endpoint,
        config
            .instruments
            .iter()
            .map(|i| i.symbol.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        config.strategy.scoring,
        config.staking.mode
    );

    let notifier: Arc<dyn Notifier> = match &config.notify.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url, config.notify.timeout_secs)?),
        None => Arc::new(LogNotifier),
    };

    let (transport, transport_events) = SessionTransport::new(config.session.clone());
    transport.connect().await.context("initial connect failed")?;
    transport.authorize().await.context("authorization failed")?;

    let gateway = Arc::new(WsGateway::new(transport.clone()));
    let mut orchestrator = Orchestrator::new(config.clone(), gateway, notifier)
        .with_transport_events(transport_events);
    if let Some(dir) = &config.state_dir {
        orchestrator = orchestrator.with_state_manager(StateManager::new(dir));
    }

    orchestrator.bootstrap().await.context("bootstrap failed")?;

    let control = orchestrator.control_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received");
            control.shutdown();
        }
    });

    let report = orchestrator.run().await?;
    transport.close().await;

    match report.exit {
        SessionExit::Shutdown => info!("Digit Bot stopped"),
        SessionExit::Fatal(reason) => error!("Digit Bot stopped on fatal error: {}", reason),
    }
    Ok(())
}
