// =============================================================================
// UserDataReconciler (C8) — §4.8
// =============================================================================
//
// Consumes the `OrderTradeUpdate` events `exchange::user_stream::UserDataStream`
// hands off per user and applies them to the ledger under the same
// per-(userId, symbol) `SymbolLockRegistry` the orchestrator uses, so a fill
// arriving mid-execution can never race a risk-gated order placement for the
// same symbol (§4.4). One reconciler instance is shared; `run()` is spawned
// once per user, each against that user's own event channel.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::exchange::user_stream::{OrderTradeUpdate, OrderTradeUpdateStatus, UserDataEvent};
use crate::ledger::LedgerStore;
use crate::notifications::NotificationBus;
use crate::symbol_lock::SymbolLockRegistry;
use crate::types::{ExitReason, Notification, NotificationScope, NotificationSeverity, Trade, TradeEvent, TradeEventType};

/// Which protective/entry order a `clientOrderId` refers to, recovered from
/// the suffix convention `derive_client_order_id` in `orchestrator.rs` uses
/// (`"entry-…"`, `"sl…-…"`, `"tp…-…"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OrderRole {
    Entry,
    StopLoss,
    TakeProfit,
    Unknown,
}

fn classify(client_order_id: &str) -> OrderRole {
    let prefix = client_order_id.split('-').next().unwrap_or("");
    if prefix == "entry" {
        OrderRole::Entry
    } else if prefix == "sl" {
        OrderRole::StopLoss
    } else if prefix == "tp" {
        OrderRole::TakeProfit
    } else {
        OrderRole::Unknown
    }
}

/// Bounds how many recently-seen idempotency keys are retained in memory.
/// The reconnect invariant (§4.8) means history is never replayed, so this
/// only needs to absorb duplicate deliveries within a live connection.
const SEEN_CAP: usize = 2048;

pub struct UserDataReconciler {
    ledger: Arc<dyn LedgerStore>,
    symbol_locks: Arc<SymbolLockRegistry>,
    notifications: Arc<NotificationBus>,
    seen: Mutex<HashSet<String>>,
}

impl UserDataReconciler {
    pub fn new(ledger: Arc<dyn LedgerStore>, symbol_locks: Arc<SymbolLockRegistry>, notifications: Arc<NotificationBus>) -> Self {
        Self { ledger, symbol_locks, notifications, seen: Mutex::new(HashSet::new()) }
    }

    /// Drains `rx` until the sender side (the stream reader) drops it, i.e.
    /// for the lifetime of one user's process-level subscription.
    pub async fn run(&self, user_id: Uuid, mut rx: mpsc::Receiver<UserDataEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                UserDataEvent::OrderTradeUpdate(update) => {
                    if let Err(e) = self.handle_update(user_id, update).await {
                        error!(error = %e, %user_id, "failed to reconcile order update");
                    }
                }
                UserDataEvent::Other(value) => {
                    info!(%user_id, event = %value, "non-order user-data event");
                }
            }
        }
        warn!(%user_id, "user-data reconciler channel closed");
    }

    fn idempotency_key(trade_id: Uuid, update: &OrderTradeUpdate) -> String {
        format!("{trade_id}|{:?}|{}|{}", update.status, update.exchange_order_id, update.fill_sequence)
    }

    /// Returns `true` the first time this key is seen. Capped with a crude
    /// clear-all sweep rather than LRU eviction — idempotency here only needs
    /// to survive a single connection's duplicate redeliveries, not a long
    /// retention window.
    fn mark_seen(&self, key: String) -> bool {
        let mut seen = self.seen.lock();
        if seen.len() >= SEEN_CAP {
            seen.clear();
        }
        seen.insert(key)
    }

    async fn handle_update(&self, user_id: Uuid, update: OrderTradeUpdate) -> anyhow::Result<()> {
        let role = classify(&update.client_order_id);
        if role == OrderRole::Unknown {
            return Ok(());
        }

        let _guard = self.symbol_locks.acquire(user_id, &update.symbol).await;

        let Some(mut trade) = self.ledger.find_open_by_symbol(user_id, &update.symbol).await? else {
            // No open trade for this symbol — either already closed by a
            // prior event or stale; the periodic scheduler heals the rest.
            return Ok(());
        };

        let key = Self::idempotency_key(trade.trade_id, &update);
        if !self.mark_seen(key) {
            return Ok(());
        }

        match (role, update.status) {
            (OrderRole::StopLoss, OrderTradeUpdateStatus::Filled) => {
                self.close_trade(&mut trade, &update, ExitReason::StopLoss).await?;
            }
            (OrderRole::TakeProfit, OrderTradeUpdateStatus::Filled) => {
                self.close_trade(&mut trade, &update, ExitReason::TakeProfit).await?;
            }
            (OrderRole::StopLoss, OrderTradeUpdateStatus::PartiallyFilled) => {
                self.partial_close(&mut trade, &update, TradeEventType::StreamPartialClose).await?;
            }
            (OrderRole::TakeProfit, OrderTradeUpdateStatus::PartiallyFilled) => {
                self.partial_close(&mut trade, &update, TradeEventType::StreamPartialClose).await?;
            }
            (OrderRole::StopLoss, OrderTradeUpdateStatus::Canceled | OrderTradeUpdateStatus::Expired) => {
                self.protection_lost(&trade, &update, TradeEventType::SlLost, NotificationSeverity::Critical, "stop-loss lost — position is naked").await?;
            }
            (OrderRole::TakeProfit, OrderTradeUpdateStatus::Canceled | OrderTradeUpdateStatus::Expired) => {
                self.protection_lost(&trade, &update, TradeEventType::TpLost, NotificationSeverity::Warn, "take-profit order lost").await?;
            }
            (OrderRole::Entry, OrderTradeUpdateStatus::Filled) => {
                self.confirm_entry(&mut trade, &update).await?;
            }
            _ => {}
        }

        Ok(())
    }

    async fn close_trade(&self, trade: &mut Trade, update: &OrderTradeUpdate, reason: ExitReason) -> anyhow::Result<()> {
        let close_qty = trade.remaining_quantity;
        trade.exit_price = Some(update.last_fill_price);
        trade.exit_quantity = Some(close_qty);
        trade.exit_time = Some(Utc::now());
        trade.exit_order_id = Some(update.exchange_order_id.to_string());
        trade.exit_reason = Some(reason.to_string());
        trade.total_closed_quantity += close_qty;
        trade.remaining_quantity = 0.0;
        trade.commission += update.commission;
        trade.gross_profit += update.realized_pnl;
        trade.recompute_net_profit();
        trade.status = "CLOSED".to_string();
        trade.updated_at = Utc::now();

        let event = trade_event(trade.trade_id, TradeEventType::StreamClose, update, Some(close_qty), true, None);
        self.ledger.update_trade(trade, &event).await?;

        let (severity, title) = match reason {
            ExitReason::StopLoss => (NotificationSeverity::Error, "Stop-loss hit"),
            ExitReason::TakeProfit => (NotificationSeverity::Success, "Take-profit hit"),
            _ => (NotificationSeverity::Info, "Trade closed"),
        };
        self.notify(trade.user_id, title, &format!("{} closed at {:.4}, netProfit {:.4}", trade.symbol, update.last_fill_price, trade.net_profit), severity).await;
        Ok(())
    }

    async fn partial_close(&self, trade: &mut Trade, update: &OrderTradeUpdate, event_type: TradeEventType) -> anyhow::Result<()> {
        trade.total_closed_quantity += update.last_fill_qty;
        trade.remaining_quantity = (trade.remaining_quantity - update.last_fill_qty).max(0.0);
        trade.commission += update.commission;
        trade.gross_profit += update.realized_pnl;
        trade.recompute_net_profit();
        trade.updated_at = Utc::now();

        let event = trade_event(trade.trade_id, event_type, update, Some(update.last_fill_qty), true, None);
        self.ledger.update_trade(trade, &event).await?;
        Ok(())
    }

    async fn protection_lost(
        &self,
        trade: &Trade,
        update: &OrderTradeUpdate,
        event_type: TradeEventType,
        severity: NotificationSeverity,
        message: &str,
    ) -> anyhow::Result<()> {
        let event = trade_event(trade.trade_id, event_type, update, None, true, Some(message.to_string()));
        self.ledger.append_event(&event).await?;
        self.notify(trade.user_id, message, &format!("{} (order {})", trade.symbol, update.exchange_order_id), severity).await;
        Ok(())
    }

    async fn confirm_entry(&self, trade: &mut Trade, update: &OrderTradeUpdate) -> anyhow::Result<()> {
        let price_changed = (trade.entry_price - update.last_fill_price).abs() > f64::EPSILON;
        trade.entry_price = update.last_fill_price;
        trade.entry_commission = update.commission;
        trade.updated_at = Utc::now();

        // No dedicated "entry confirmed" event type exists in the fixed
        // taxonomy; reusing ENTRY_PLACED here mirrors the orchestrator's
        // deliberate reuse of existing variants for a closely related case.
        let event = trade_event(trade.trade_id, TradeEventType::EntryPlaced, update, Some(update.last_fill_qty), true, Some("confirmed via user-data stream".to_string()));
        self.ledger.update_trade(trade, &event).await?;

        if price_changed {
            info!(trade_id = %trade.trade_id, real_entry_price = update.last_fill_price, "entry fill price differs from placed price");
        }
        Ok(())
    }

    async fn notify(&self, user_id: Uuid, title: &str, body: &str, severity: NotificationSeverity) {
        self.notifications
            .publish(Notification {
                scope: NotificationScope::User { user_id },
                title: title.to_string(),
                body: body.to_string(),
                severity,
                tags: vec!["reconciler".to_string()],
            })
            .await;
    }
}

fn trade_event(
    trade_id: Uuid,
    event_type: TradeEventType,
    update: &OrderTradeUpdate,
    quantity: Option<f64>,
    success: bool,
    detail: Option<String>,
) -> TradeEvent {
    TradeEvent {
        event_id: Uuid::new_v4(),
        trade_id,
        event_type: event_type.to_string(),
        timestamp: Utc::now(),
        exchange_order_id: Some(update.exchange_order_id.to_string()),
        side: None,
        order_type: None,
        price: Some(update.last_fill_price),
        quantity,
        success,
        error_message: None,
        detail,
        fill_sequence: Some(update.fill_sequence),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_entry_sl_tp_by_prefix() {
        assert_eq!(classify("entry-abc123"), OrderRole::Entry);
        assert_eq!(classify("sl-abc123"), OrderRole::StopLoss);
        assert_eq!(classify("sl-dca1-abc123"), OrderRole::StopLoss);
        assert_eq!(classify("tp-partial-abc123"), OrderRole::TakeProfit);
        assert_eq!(classify("garbage"), OrderRole::Unknown);
    }

    fn sample_update(status: OrderTradeUpdateStatus) -> OrderTradeUpdate {
        OrderTradeUpdate {
            client_order_id: "sl-abc123".to_string(),
            exchange_order_id: 1,
            symbol: "BTCUSDT".to_string(),
            status,
            last_fill_qty: 1.0,
            last_fill_price: 49_000.0,
            realized_pnl: -100.0,
            commission: 0.5,
            fill_sequence: 1,
            event_time_ms: 0,
        }
    }

    #[test]
    fn idempotency_key_differs_by_fill_sequence() {
        let trade_id = Uuid::new_v4();
        let a = UserDataReconciler::idempotency_key(trade_id, &sample_update(OrderTradeUpdateStatus::Filled));
        let mut second = sample_update(OrderTradeUpdateStatus::Filled);
        second.fill_sequence = 2;
        let b = UserDataReconciler::idempotency_key(trade_id, &second);
        assert_ne!(a, b);
    }
}
