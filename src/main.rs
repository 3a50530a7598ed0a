mod api;
mod app_state;
mod config;
mod dedup;
mod dispatcher;
mod error;
mod exchange;
mod ledger;
mod middleware;
mod notifications;
mod orchestrator;
mod reconciler;
mod risk;
mod scheduler;
mod symbol_lock;
mod types;
mod user_store;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use app_state::AppState;
use config::GlobalConfig;
use dedup::DedupRegistry;
use dispatcher::BroadcastDispatcher;
use exchange::client::{ExchangeApi, ExchangeGateway};
use exchange::user_stream::{UserDataEvent, UserDataStream};
use ledger::SqliteLedgerStore;
use notifications::NotificationBus;
use orchestrator::OrderOrchestrator;
use reconciler::UserDataReconciler;
use risk::RiskEvaluator;
use scheduler::Scheduler;
use symbol_lock::SymbolLockRegistry;
use user_store::{InMemoryUserStore, UserStore};

const CONFIG_PATH: &str = "config.json";
const USER_DATA_CHANNEL_CAPACITY: usize = 256;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let mut global_config = match GlobalConfig::load(CONFIG_PATH) {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!(error = %e, path = CONFIG_PATH, "falling back to default global config");
            GlobalConfig::default()
        }
    };
    // Safety-first startup: never come up Live regardless of what was saved.
    global_config.trading_mode = types::TradingMode::Paused;
    let config = Arc::new(RwLock::new(global_config));

    let database_url = std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://relay.db".to_string());
    let ledger: Arc<dyn ledger::LedgerStore> = Arc::new(SqliteLedgerStore::connect(&database_url).await?);

    let (base_url, ws_base_url, connect_timeout, read_timeout) = {
        let c = config.read();
        (
            c.exchange_base_url.clone(),
            c.exchange_ws_url.clone(),
            Duration::from_secs(c.connect_timeout_secs),
            Duration::from_secs(c.read_timeout_secs),
        )
    };
    let gateway = Arc::new(ExchangeGateway::new(base_url, connect_timeout, read_timeout));
    // RiskEvaluator/OrderOrchestrator depend only on the `ExchangeApi`
    // surface, so they can be driven against a fake in tests; every other
    // consumer here needs the gateway's inherent-only methods and keeps the
    // concrete type.
    let gateway_api: Arc<dyn ExchangeApi> = gateway.clone();

    let dedup = Arc::new(DedupRegistry::new(config.read().dedup_enabled));
    let symbol_locks = Arc::new(SymbolLockRegistry::new());
    let (notifications, notification_handle) = NotificationBus::spawn();
    let notifications = Arc::new(notifications);

    // External user/credential/subscription tables are out of this repo's
    // scope (§1); a real deployment swaps this for a store reading the
    // dashboard's own schema.
    let user_store: Arc<dyn UserStore> = Arc::new(InMemoryUserStore::new());

    let risk = Arc::new(RiskEvaluator::new(ledger.clone(), gateway_api.clone(), dedup.clone()));
    let orchestrator = Arc::new(OrderOrchestrator::new(
        risk.clone(),
        ledger.clone(),
        gateway_api.clone(),
        symbol_locks.clone(),
        notifications.clone(),
        dedup.clone(),
        config.read().default_symbol.clone(),
    ));
    let dispatcher = Arc::new(BroadcastDispatcher::new(
        orchestrator.clone(),
        ledger.clone(),
        user_store.clone(),
        dedup.clone(),
        config.clone(),
    ));

    let state = Arc::new(AppState::new(
        config.clone(),
        gateway.clone(),
        ledger.clone(),
        dedup.clone(),
        symbol_locks.clone(),
        notifications.clone(),
        user_store.clone(),
        risk.clone(),
        orchestrator.clone(),
        dispatcher.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler = Arc::new(UserDataReconciler::new(ledger.clone(), symbol_locks.clone(), notifications.clone()));
    let user_stream_handles = spawn_user_data_streams(&ws_base_url, user_store.clone(), gateway.clone(), reconciler, shutdown_rx.clone()).await;

    let scheduler = Arc::new(Scheduler::new(ledger.clone(), gateway.clone(), user_store.clone(), notifications.clone(), config.clone()));
    let scheduler_handle = tokio::spawn({
        let scheduler = scheduler.clone();
        async move { scheduler.run().await }
    });

    let app = api::ingestion::router(state.clone());
    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
    info!(addr = %listener.local_addr()?, "ingestion HTTP server listening");

    let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>());

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server exited with error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    scheduler_handle.abort();
    for handle in user_stream_handles {
        handle.abort();
    }
    drop(notifications);
    let _ = notification_handle.await;

    Ok(())
}

/// One `UserDataStream::run` task per credentialed, subscribed user, each
/// feeding its own `UserDataReconciler::run` consumer (§5: "its own
/// dedicated reader ... hands events off to a small pool").
async fn spawn_user_data_streams(
    ws_base_url: &str,
    user_store: Arc<dyn UserStore>,
    gateway: Arc<ExchangeGateway>,
    reconciler: Arc<UserDataReconciler>,
    shutdown_rx: watch::Receiver<bool>,
) -> Vec<tokio::task::JoinHandle<()>> {
    let users = match user_store.eligible_for_broadcast().await {
        Ok(users) => users,
        Err(e) => {
            warn!(error = %e, "failed to enumerate users for user-data stream startup");
            return Vec::new();
        }
    };

    let mut handles = Vec::with_capacity(users.len() * 2);
    for user in users {
        let Some(creds) = user.credentials else { continue };
        let (tx, rx) = mpsc::channel::<UserDataEvent>(USER_DATA_CHANNEL_CAPACITY);
        let stream = UserDataStream::new(ws_base_url.to_string());
        let gateway = gateway.clone();
        let shutdown_rx = shutdown_rx.clone();
        let user_id = user.user_id;

        handles.push(tokio::spawn(async move {
            stream.run(user_id, gateway, creds, tx, shutdown_rx).await;
        }));

        let reconciler = reconciler.clone();
        handles.push(tokio::spawn(async move {
            reconciler.run(user_id, rx).await;
        }));
    }
    handles
}
