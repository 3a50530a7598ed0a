// =============================================================================
// BroadcastDispatcher (C7) — §4.7
// =============================================================================
//
// Fan-out entry point for a signal arriving once and needing to be executed
// for every eligible subscriber. Two dedup layers guard a single incoming
// intent from being applied twice: the signal-layer check here (shared
// across all users) and the per-user check inside `RiskEvaluator` (§4.5 step
// 6). A bounded `tokio::sync::Semaphore` caps how many per-user orchestrator
// runs execute concurrently, the same worker-pool idiom this codebase's
// market-data fan-out already uses, sized from `GlobalConfig::worker_pool_size`
// rather than hardcoded.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::{resolve_effective_config, GlobalConfig};
use crate::dedup::{signal_fingerprint, DedupOutcome, DedupRegistry, SIGNAL_LAYER_TTL};
use crate::ledger::LedgerStore;
use crate::orchestrator::OrderOrchestrator;
use crate::types::TradeIntent;
use crate::user_store::UserStore;

#[derive(Debug, Clone, Serialize)]
pub struct PerUserOutcome {
    pub user_id: Uuid,
    pub status: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BroadcastResponse {
    pub accepted: bool,
    pub skipped: Option<String>,
    pub per_user: Vec<PerUserOutcome>,
}

pub struct BroadcastDispatcher {
    orchestrator: Arc<OrderOrchestrator>,
    ledger: Arc<dyn LedgerStore>,
    user_store: Arc<dyn UserStore>,
    dedup: Arc<DedupRegistry>,
    config: Arc<parking_lot::RwLock<GlobalConfig>>,
    worker_permits: Arc<Semaphore>,
}

impl BroadcastDispatcher {
    pub fn new(
        orchestrator: Arc<OrderOrchestrator>,
        ledger: Arc<dyn LedgerStore>,
        user_store: Arc<dyn UserStore>,
        dedup: Arc<DedupRegistry>,
        config: Arc<parking_lot::RwLock<GlobalConfig>>,
    ) -> Self {
        let worker_pool_size = config.read().worker_pool_size.max(1);
        Self {
            orchestrator,
            ledger,
            user_store,
            dedup,
            config,
            worker_permits: Arc::new(Semaphore::new(worker_pool_size)),
        }
    }

    /// §4.7: dedup at the signal layer, enumerate eligible subscribers,
    /// execute each one's run under the bounded worker pool, and isolate
    /// per-user failures so one user's rejection never affects another's.
    #[instrument(skip(self, intent), fields(symbol = %intent.symbol, action = ?intent.action))]
    pub async fn broadcast(&self, intent: TradeIntent) -> BroadcastResponse {
        let side_or_dca = intent.side_or_dca_literal();
        let fingerprint = signal_fingerprint(&intent.symbol, &side_or_dca, intent.entry_price, intent.stop_loss);

        if self.dedup.check(&fingerprint, SIGNAL_LAYER_TTL, std::time::Instant::now()) == DedupOutcome::Duplicate {
            return BroadcastResponse {
                accepted: false,
                skipped: Some("duplicate signal within dedup window".to_string()),
                per_user: vec![],
            };
        }

        // §4.3 step 4: persistent guard against a process restart clearing
        // the in-memory dedup map while the window is still open.
        let since = Utc::now() - chrono::Duration::from_std(SIGNAL_LAYER_TTL).unwrap_or(chrono::Duration::minutes(5));
        match self.ledger.exists_by_fingerprint_since(&fingerprint, since).await {
            Ok(true) => {
                return BroadcastResponse {
                    accepted: false,
                    skipped: Some("duplicate signal already recorded in ledger".to_string()),
                    per_user: vec![],
                };
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "ledger dedup guard failed, proceeding on in-memory check alone");
            }
        }

        let eligible = match self.user_store.eligible_for_broadcast().await {
            Ok(users) => users,
            Err(e) => {
                warn!(error = %e, "failed to enumerate eligible users");
                return BroadcastResponse {
                    accepted: false,
                    skipped: Some(format!("user enumeration failed: {e}")),
                    per_user: vec![],
                };
            }
        };

        let global = self.config.read().clone();
        let session_timezone = global.session_timezone.clone();
        let default_symbol = global.default_symbol.clone();
        let mut intent = intent;
        if intent.symbol.is_empty() {
            intent.symbol = default_symbol;
        }

        let mut handles = Vec::with_capacity(eligible.len());
        for user in eligible {
            let effective = resolve_effective_config(&global, Some(&user.overrides));
            if !effective.auto_trade_enabled {
                continue;
            }
            let Some(creds) = user.credentials.clone() else { continue };

            let orchestrator = self.orchestrator.clone();
            let permits = self.worker_permits.clone();
            let intent = intent.clone();
            let session_timezone = session_timezone.clone();
            let user_id = user.user_id;

            handles.push(tokio::spawn(async move {
                let _permit = permits.acquire_owned().await.expect("semaphore never closed");
                let result = orchestrator
                    .execute_for_user(user_id, &creds, &effective, intent, &session_timezone)
                    .await;
                match result {
                    Ok(outcome) => PerUserOutcome { user_id, status: "ACCEPTED".to_string(), detail: outcome.summary },
                    Err(e) => PerUserOutcome { user_id, status: "REJECTED".to_string(), detail: e.to_string() },
                }
            }));
        }

        let mut per_user = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => per_user.push(outcome),
                Err(join_err) => {
                    warn!(error = %join_err, "per-user broadcast task panicked, isolated from siblings");
                }
            }
        }

        info!(accepted = per_user.len(), "broadcast fan-out complete");
        BroadcastResponse { accepted: true, skipped: None, per_user }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserConfigOverride;
    use crate::dedup::DedupRegistry;
    use crate::exchange::client::{ExchangeApi, ExchangeGateway};
    use crate::ledger::SqliteLedgerStore;
    use crate::notifications::NotificationBus;
    use crate::risk::RiskEvaluator;
    use crate::symbol_lock::SymbolLockRegistry;
    use crate::types::{IntentAction, IntentSource, Side};
    use crate::user_store::{ExchangeCredentials, InMemoryUserStore, UserRecord};

    async fn build_dispatcher() -> (BroadcastDispatcher, Arc<InMemoryUserStore>) {
        let ledger: Arc<dyn LedgerStore> = Arc::new(SqliteLedgerStore::in_memory().await.unwrap());
        let gateway: Arc<dyn ExchangeApi> = Arc::new(ExchangeGateway::new("http://127.0.0.1:1", std::time::Duration::from_secs(1), std::time::Duration::from_secs(1)));
        let dedup = Arc::new(DedupRegistry::new(true));
        let risk = Arc::new(RiskEvaluator::new(ledger.clone(), gateway.clone(), dedup.clone()));
        let (notifications, _handle) = NotificationBus::spawn();
        let notifications = Arc::new(notifications);
        let symbol_locks = Arc::new(SymbolLockRegistry::new());
        let orchestrator = Arc::new(OrderOrchestrator::new(risk, ledger.clone(), gateway, symbol_locks, notifications, dedup.clone(), "BTCUSDT".to_string()));
        let user_store = Arc::new(InMemoryUserStore::new());
        let config = Arc::new(parking_lot::RwLock::new(GlobalConfig::default()));
        (BroadcastDispatcher::new(orchestrator, ledger, user_store.clone(), dedup, config), user_store)
    }

    fn intent() -> TradeIntent {
        TradeIntent {
            action: IntentAction::Entry,
            symbol: "BTCUSDT".to_string(),
            side: Some(Side::Long),
            entry_price: Some(50_000.0),
            stop_loss: Some(49_000.0),
            take_profit: None,
            new_stop_loss: None,
            new_take_profit: None,
            close_ratio: None,
            source: IntentSource::default(),
        }
    }

    #[tokio::test]
    async fn broadcast_with_no_eligible_users_is_accepted_but_empty() {
        let (dispatcher, _users) = build_dispatcher().await;
        let resp = dispatcher.broadcast(intent()).await;
        assert!(resp.accepted);
        assert!(resp.per_user.is_empty());
    }

    #[tokio::test]
    async fn users_without_auto_trade_enabled_are_skipped() {
        let (dispatcher, users) = build_dispatcher().await;
        users.upsert(UserRecord {
            user_id: Uuid::new_v4(),
            has_exchange_credentials: true,
            subscription_active: true,
            credentials: Some(ExchangeCredentials { api_key: "k".into(), api_secret: "s".into() }),
            overrides: UserConfigOverride { auto_trade_enabled: Some(false), ..Default::default() },
        });
        let resp = dispatcher.broadcast(intent()).await;
        assert!(resp.per_user.is_empty());
    }

    #[tokio::test]
    async fn repeated_identical_signal_is_deduped_at_signal_layer() {
        let (dispatcher, _users) = build_dispatcher().await;
        let first = dispatcher.broadcast(intent()).await;
        assert!(first.accepted);
        let second = dispatcher.broadcast(intent()).await;
        assert!(!second.accepted);
        assert!(second.skipped.is_some());
    }
}
