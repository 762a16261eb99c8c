pub mod config;
pub mod error;
pub mod events;
pub mod http;
pub mod pipeline;
pub mod registry;
pub mod service;
pub mod session;
pub mod store;
pub mod transport;
pub mod webhook;

use std::sync::Arc;

use config::Config;
use pipeline::Reconciler;
use service::Gateway;
use session::SessionTunables;
use store::PgStore;
use transport::{NoopConnector, TransportConnector};
use webhook::{ReqwestPoster, WebhookDispatcher};

/// Starts the gateway runtime with the default postgres store and the
/// placeholder transport connector.
pub async fn run() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let config = Config::from_env()?;
    run_with(config, Arc::new(NoopConnector)).await
}

/// Starts the gateway runtime against a caller-supplied transport
/// connector. This is the seam a real wire backend plugs into.
pub async fn run_with(
    config: Config,
    connector: Arc<dyn TransportConnector>,
) -> anyhow::Result<()> {
    let bind_addr = config.bind_addr;
    tracing::info!(%bind_addr, "starting gateway");

    let store = PgStore::connect(&config.database_url).await?;
    store.migrate().await?;
    let store: Arc<dyn store::Store> = Arc::new(store);

    let webhooks = WebhookDispatcher::new(
        store.clone(),
        Arc::new(ReqwestPoster::new(config.webhook_timeout)),
    );
    let reconciler = Reconciler::new(store.clone(), webhooks.clone());
    let gateway = Gateway::new(
        store,
        connector,
        webhooks,
        reconciler,
        SessionTunables::from(&config),
        config.qr_wait,
    );

    if let Err(error) = gateway.restore_all_sessions().await {
        tracing::warn!(error = %error, "session restore failed, continuing without it");
    }

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, http::router(gateway)).await?;

    Ok(())
}
