// =============================================================================
// Central Application State
// =============================================================================
//
// The single source of truth the HTTP surface and the background loops
// share. Every subsystem here is Arc-wrapped and owns its own interior
// mutability (`RiskEvaluator`, `OrderOrchestrator`, `DedupRegistry`, ...);
// `AppState` itself only adds the handful of fields the ingestion handlers
// touch directly (config, the last-seen heartbeat) so axum's
// `State<Arc<AppState>>` extractor stays a single clone.
// =============================================================================

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::GlobalConfig;
use crate::dedup::DedupRegistry;
use crate::dispatcher::BroadcastDispatcher;
use crate::exchange::client::ExchangeGateway;
use crate::ledger::LedgerStore;
use crate::notifications::NotificationBus;
use crate::orchestrator::OrderOrchestrator;
use crate::risk::RiskEvaluator;
use crate::symbol_lock::SymbolLockRegistry;
use crate::user_store::UserStore;

/// Central application state shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    pub config: Arc<RwLock<GlobalConfig>>,

    pub gateway: Arc<ExchangeGateway>,
    pub ledger: Arc<dyn LedgerStore>,
    pub dedup: Arc<DedupRegistry>,
    pub symbol_locks: Arc<SymbolLockRegistry>,
    pub notifications: Arc<NotificationBus>,
    pub user_store: Arc<dyn UserStore>,

    pub risk: Arc<RiskEvaluator>,
    pub orchestrator: Arc<OrderOrchestrator>,
    pub dispatcher: Arc<BroadcastDispatcher>,

    /// Unix millis of the most recent `/heartbeat` call, for `/health`'s
    /// liveness readout. §6.1: heartbeat "carries no trading effect" —
    /// this is the only trace it leaves.
    last_heartbeat_ms: AtomicI64,

    pub start_time: std::time::Instant,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<RwLock<GlobalConfig>>,
        gateway: Arc<ExchangeGateway>,
        ledger: Arc<dyn LedgerStore>,
        dedup: Arc<DedupRegistry>,
        symbol_locks: Arc<SymbolLockRegistry>,
        notifications: Arc<NotificationBus>,
        user_store: Arc<dyn UserStore>,
        risk: Arc<RiskEvaluator>,
        orchestrator: Arc<OrderOrchestrator>,
        dispatcher: Arc<BroadcastDispatcher>,
    ) -> Self {
        Self {
            config,
            gateway,
            ledger,
            dedup,
            symbol_locks,
            notifications,
            user_store,
            risk,
            orchestrator,
            dispatcher,
            last_heartbeat_ms: AtomicI64::new(0),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn record_heartbeat(&self, at_ms: i64) {
        self.last_heartbeat_ms.store(at_ms, Ordering::Relaxed);
    }

    pub fn last_heartbeat_ms(&self) -> i64 {
        self.last_heartbeat_ms.load(Ordering::Relaxed)
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
