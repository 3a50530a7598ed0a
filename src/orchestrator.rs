// =============================================================================
// OrderOrchestrator (C6) — §4.6
// =============================================================================
//
// Executes one intent for one user. Every branch runs inside the
// per-(userId, symbol) lock acquired in `execute_for_user`, so a
// concurrent reconciler event or a second broadcast for the same user
// never interleaves with an in-flight orchestrator run on that symbol.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use hex::encode as hex_encode;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::dedup::{cancel_fingerprint, per_user_fingerprint, signal_fingerprint, DedupOutcome, DedupRegistry, CANCEL_TTL};
use crate::error::{EngineError, RiskRejectReason};
use crate::exchange::client::{round_to_step, ExchangeApi, OrderSide};
use crate::ledger::LedgerStore;
use crate::notifications::NotificationBus;
use crate::risk::RiskEvaluator;
use crate::symbol_lock::SymbolLockRegistry;
use crate::types::{
    EffectiveUserConfig, ExitReason, IntentAction, Notification, NotificationScope,
    NotificationSeverity, Side, Trade, TradeEvent, TradeEventType, TradeIntent, TradeStatus,
};
use crate::user_store::ExchangeCredentials;

/// Maker-fee assumption used to estimate commission before the real value
/// arrives from the stream (§4.6.1 step 5, reconciled in `reconcile.rs`).
const MAKER_FEE_RATE: f64 = 0.0002;
/// Taker-fee assumption for market closes (§4.6.3 step 3).
const TAKER_FEE_RATE: f64 = 0.0004;

pub struct OrchestratorOutcome {
    pub trade_id: Option<Uuid>,
    pub summary: String,
}

/// Executes ENTRY, DCA_ENTRY, CLOSE, MOVE_SL, and CANCEL intents for one
/// user against one exchange account.
pub struct OrderOrchestrator {
    risk: Arc<RiskEvaluator>,
    ledger: Arc<dyn LedgerStore>,
    gateway: Arc<dyn ExchangeApi>,
    symbol_locks: Arc<SymbolLockRegistry>,
    notifications: Arc<NotificationBus>,
    dedup: Arc<DedupRegistry>,
    /// Per (user, symbol) idempotent leverage-set cache (§4.1.1 "ensure
    /// leverage is set... idempotent; cached").
    leverage_set: RwLock<HashSet<(Uuid, String)>>,
    default_symbol: String,
}

impl OrderOrchestrator {
    pub fn new(
        risk: Arc<RiskEvaluator>,
        ledger: Arc<dyn LedgerStore>,
        gateway: Arc<dyn ExchangeApi>,
        symbol_locks: Arc<SymbolLockRegistry>,
        notifications: Arc<NotificationBus>,
        dedup: Arc<DedupRegistry>,
        default_symbol: String,
    ) -> Self {
        Self {
            risk,
            ledger,
            gateway,
            symbol_locks,
            notifications,
            dedup,
            leverage_set: RwLock::new(HashSet::new()),
            default_symbol,
        }
    }

    #[instrument(skip(self, creds, config, intent), fields(user_id = %user_id))]
    pub async fn execute_for_user(
        &self,
        user_id: Uuid,
        creds: &ExchangeCredentials,
        config: &EffectiveUserConfig,
        intent: TradeIntent,
        session_timezone: &str,
    ) -> Result<OrchestratorOutcome, EngineError> {
        if intent.action == IntentAction::Info {
            return Ok(OrchestratorOutcome { trade_id: None, summary: "info intent, no action taken".into() });
        }

        let intent = self.resolve_symbol_fallback(user_id, intent).await?;
        let _guard = self.symbol_locks.acquire(user_id, &intent.symbol).await;

        let result = match intent.action {
            IntentAction::Entry => self.handle_entry(user_id, creds, config, &intent, session_timezone, false).await,
            IntentAction::DcaEntry => self.handle_entry(user_id, creds, config, &intent, session_timezone, true).await,
            IntentAction::Close => self.handle_close(user_id, creds, &intent).await,
            IntentAction::MoveSl => self.handle_move_sl(user_id, creds, &intent).await,
            IntentAction::Cancel => self.handle_cancel(user_id, creds, &intent).await,
            IntentAction::Info => unreachable!("handled above"),
        };

        match &result {
            Ok(outcome) => {
                self.notifications
                    .publish(Notification {
                        scope: NotificationScope::User { user_id },
                        title: "Trade executed".to_string(),
                        body: outcome.summary.clone(),
                        severity: NotificationSeverity::Success,
                        tags: vec![intent.symbol.clone()],
                    })
                    .await;
            }
            Err(e) => {
                self.notifications.publish(e.to_notification(user_id)).await;
            }
        }

        result
    }

    // -------------------------------------------------------------------------
    // §4.6.6 symbol fallback
    // -------------------------------------------------------------------------

    async fn resolve_symbol_fallback(&self, user_id: Uuid, mut intent: TradeIntent) -> Result<TradeIntent, EngineError> {
        let needs_fallback = matches!(intent.action, IntentAction::Close | IntentAction::MoveSl)
            && intent.symbol == self.default_symbol;
        if !needs_fallback {
            return Ok(intent);
        }

        let existing = self
            .ledger
            .find_open_by_symbol(user_id, &intent.symbol)
            .await
            .map_err(|e| EngineError::DataIntegrity(e.to_string()))?;
        if existing.is_some() {
            return Ok(intent);
        }

        let open_trades = self
            .ledger
            .find_by_status(user_id, TradeStatus::Open)
            .await
            .map_err(|e| EngineError::DataIntegrity(e.to_string()))?;

        match open_trades.as_slice() {
            [single] => {
                info!(from = %intent.symbol, to = %single.symbol, "symbol auto-corrected");
                self.notifications
                    .publish(Notification {
                        scope: NotificationScope::User { user_id },
                        title: "Symbol auto-corrected".to_string(),
                        body: format!("{} routed to {} (only open position)", intent.symbol, single.symbol),
                        severity: NotificationSeverity::Info,
                        tags: vec![single.symbol.clone()],
                    })
                    .await;
                intent.symbol = single.symbol.clone();
                Ok(intent)
            }
            _ => Err(EngineError::RiskRejected {
                reason: RiskRejectReason::AmbiguousSymbol,
                detail: format!("{} open trades found, cannot disambiguate default symbol", open_trades.len()),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // §4.6.1 ENTRY / §4.6.2 DCA_ENTRY
    // -------------------------------------------------------------------------

    async fn handle_entry(
        &self,
        user_id: Uuid,
        creds: &ExchangeCredentials,
        config: &EffectiveUserConfig,
        intent: &TradeIntent,
        session_timezone: &str,
        is_dca: bool,
    ) -> Result<OrchestratorOutcome, EngineError> {
        let decision = self
            .risk
            .evaluate(user_id, creds, config, intent, session_timezone, Utc::now())
            .await?;

        self.ensure_leverage(user_id, creds, &intent.symbol, config.leverage).await?;

        let side_or_dca = intent.side_or_dca_literal();
        let fingerprint = per_user_fingerprint(user_id, &intent.symbol, &side_or_dca, intent.entry_price, intent.stop_loss);
        let client_order_id = derive_client_order_id(&fingerprint, "entry");

        let entry_price = intent.entry_price.ok_or_else(|| EngineError::DataIntegrity("missing entry price".into()))?;

        if is_dca {
            self.place_dca_entry(user_id, creds, intent, &client_order_id, decision.quantity, entry_price).await
        } else {
            self.place_fresh_entry(user_id, creds, intent, &client_order_id, decision.quantity, entry_price).await
        }
    }

    async fn place_fresh_entry(
        &self,
        user_id: Uuid,
        creds: &ExchangeCredentials,
        intent: &TradeIntent,
        client_order_id: &str,
        quantity: f64,
        entry_price: f64,
    ) -> Result<OrchestratorOutcome, EngineError> {
        let side = intent.side.ok_or_else(|| EngineError::DataIntegrity("entry intent missing side".into()))?;
        let order_side = OrderSide::from_position_side(side);
        let stop_loss = intent.stop_loss.ok_or_else(|| EngineError::RiskRejected {
            reason: RiskRejectReason::NoSl,
            detail: "entry requires a stop-loss".into(),
        })?;

        let ack = self
            .gateway
            .place_limit(creds, &intent.symbol, order_side, entry_price, quantity, client_order_id)
            .await?;

        let trade_id = Uuid::new_v4();
        let now = Utc::now();
        let entry_commission = entry_price * quantity * MAKER_FEE_RATE;

        let mut trade = Trade {
            trade_id,
            user_id,
            symbol: intent.symbol.clone(),
            side: side.to_string(),
            entry_price,
            entry_quantity: quantity,
            entry_time: now,
            entry_order_id: ack.order_id.to_string(),
            entry_commission,
            exit_price: None,
            exit_quantity: None,
            exit_time: None,
            exit_order_id: None,
            exit_reason: None,
            total_closed_quantity: 0.0,
            remaining_quantity: quantity,
            gross_profit: 0.0,
            commission: entry_commission,
            net_profit: -entry_commission,
            stop_loss,
            take_profit: intent.take_profit,
            dca_count: 0,
            // Signal-layer fingerprint, not per-user: must match what
            // `BroadcastDispatcher` queries in `exists_by_fingerprint_since`
            // for the restart guard (§4.3 step 4) to ever find a hit.
            signal_hash: signal_fingerprint(&intent.symbol, &intent.side_or_dca_literal(), intent.entry_price, intent.stop_loss),
            source_platform: intent.source.platform.clone(),
            source_channel_id: intent.source.channel_id.clone(),
            source_author_name: intent.source.author_name.clone(),
            source_message_id: intent.source.message_id.clone(),
            created_at: now,
            updated_at: now,
            status: TradeStatus::Open.to_string(),
        };

        let entry_event = trade_event(trade_id, TradeEventType::EntryPlaced, Some(ack.order_id.to_string()), Some(side.to_string()), Some("LIMIT"), Some(entry_price), Some(quantity), true, None);
        self.ledger.insert_trade(&trade, &entry_event).await.map_err(|e| EngineError::DataIntegrity(e.to_string()))?;

        // Protective SL, with fail-safe rollback on exhaustion (§4.6.1 step 6).
        let sl_client_order_id = derive_client_order_id(&trade.trade_id.to_string(), "sl");
        match self.gateway.place_stop_market(creds, &intent.symbol, order_side.opposite_for_protection(), quantity, stop_loss, &sl_client_order_id).await {
            Ok(sl_ack) => {
                let sl_event = trade_event(trade_id, TradeEventType::SlPlaced, Some(sl_ack.order_id.to_string()), None, Some("STOP_MARKET"), Some(stop_loss), Some(quantity), true, None);
                self.ledger.append_event(&sl_event).await.map_err(|e| EngineError::DataIntegrity(e.to_string()))?;
            }
            Err(sl_err) => {
                return self.fail_safe_rollback(user_id, creds, &mut trade, &ack.order_id.to_string(), quantity, order_side, sl_err).await;
            }
        }

        if let Some(tp) = intent.take_profit {
            let tp_client_order_id = derive_client_order_id(&trade.trade_id.to_string(), "tp");
            match self.gateway.place_take_profit_market(creds, &intent.symbol, order_side.opposite_for_protection(), quantity, tp, &tp_client_order_id).await {
                Ok(tp_ack) => {
                    let tp_event = trade_event(trade_id, TradeEventType::TpPlaced, Some(tp_ack.order_id.to_string()), None, Some("TAKE_PROFIT_MARKET"), Some(tp), Some(quantity), true, None);
                    self.ledger.append_event(&tp_event).await.map_err(|e| EngineError::DataIntegrity(e.to_string()))?;
                }
                Err(tp_err) => {
                    warn!(error = %tp_err, "take-profit placement failed, leaving stop-loss in place");
                    let tp_lost = trade_event(trade_id, TradeEventType::TpLost, None, None, None, None, None, false, Some(tp_err.to_string()));
                    self.ledger.append_event(&tp_lost).await.map_err(|e| EngineError::DataIntegrity(e.to_string()))?;
                }
            }
        }

        Ok(OrchestratorOutcome {
            trade_id: Some(trade_id),
            summary: format!("entry placed for {} at {} qty {}", intent.symbol, entry_price, quantity),
        })
    }

    async fn place_dca_entry(
        &self,
        user_id: Uuid,
        creds: &ExchangeCredentials,
        intent: &TradeIntent,
        client_order_id: &str,
        quantity: f64,
        entry_price: f64,
    ) -> Result<OrchestratorOutcome, EngineError> {
        let mut trade = self
            .ledger
            .find_open_by_symbol(user_id, &intent.symbol)
            .await
            .map_err(|e| EngineError::DataIntegrity(e.to_string()))?
            .ok_or_else(|| EngineError::RiskRejected { reason: RiskRejectReason::NoPositionToDca, detail: "no open position for DCA".into() })?;

        let side = trade.side_enum();
        let order_side = OrderSide::from_position_side(side);

        let ack = self
            .gateway
            .place_limit(creds, &intent.symbol, order_side, entry_price, quantity, client_order_id)
            .await?;

        let old_notional = trade.entry_price * trade.entry_quantity;
        let new_notional = entry_price * quantity;
        let total_qty = trade.entry_quantity + quantity;
        trade.entry_price = (old_notional + new_notional) / total_qty;
        trade.entry_quantity = total_qty;
        trade.remaining_quantity += quantity;
        trade.dca_count += 1;
        trade.updated_at = Utc::now();

        let dca_event = trade_event(trade.trade_id, TradeEventType::DcaEntry, Some(ack.order_id.to_string()), Some(side.to_string()), Some("LIMIT"), Some(entry_price), Some(quantity), true, None);
        self.ledger.update_trade(&trade, &dca_event).await.map_err(|e| EngineError::DataIntegrity(e.to_string()))?;

        let new_stop_loss = intent.new_stop_loss.unwrap_or(trade.stop_loss);
        let new_take_profit = intent.new_take_profit.or(trade.take_profit);

        self.gateway.cancel_all_orders(creds, &intent.symbol).await.ok();

        let sl_client_order_id = derive_client_order_id(&trade.trade_id.to_string(), &format!("sl-dca{}", trade.dca_count));
        match self
            .gateway
            .place_stop_market(creds, &intent.symbol, order_side.opposite_for_protection(), trade.entry_quantity, new_stop_loss, &sl_client_order_id)
            .await
        {
            Ok(_) => {
                trade.stop_loss = new_stop_loss;
            }
            Err(sl_err) => {
                return self.fail_safe_rollback(user_id, creds, &mut trade, &ack.order_id.to_string(), trade.entry_quantity, order_side, sl_err).await;
            }
        }

        if let Some(tp) = new_take_profit {
            let tp_client_order_id = derive_client_order_id(&trade.trade_id.to_string(), &format!("tp-dca{}", trade.dca_count));
            if self
                .gateway
                .place_take_profit_market(creds, &intent.symbol, order_side.opposite_for_protection(), trade.entry_quantity, tp, &tp_client_order_id)
                .await
                .is_ok()
            {
                trade.take_profit = Some(tp);
            }
        }

        self.ledger
            .update_trade(&trade, &trade_event(trade.trade_id, TradeEventType::MoveSl, None, None, None, Some(new_stop_loss), None, true, None))
            .await
            .map_err(|e| EngineError::DataIntegrity(e.to_string()))?;

        Ok(OrchestratorOutcome {
            trade_id: Some(trade.trade_id),
            summary: format!("DCA layer {} added at {} qty {}", trade.dca_count, entry_price, quantity),
        })
    }

    /// §4.6.1 step 6 fail-safe rollback: cancel the entry; if that fails,
    /// MARKET close the filled amount; if both fail, log FAIL_SAFE and
    /// escalate (P7: the Trade is never left OPEN without protection).
    async fn fail_safe_rollback(
        &self,
        _user_id: Uuid,
        creds: &ExchangeCredentials,
        trade: &mut Trade,
        entry_order_id: &str,
        quantity: f64,
        entry_side: OrderSide,
        sl_error: EngineError,
    ) -> Result<OrchestratorOutcome, EngineError> {
        warn!(error = %sl_error, "stop-loss placement failed, invoking fail-safe rollback");

        let order_id: i64 = entry_order_id.parse().unwrap_or(0);

        if self.gateway.cancel_order(creds, &trade.symbol, order_id).await.is_ok() {
            trade.status = TradeStatus::Cancelled.to_string();
            trade.updated_at = Utc::now();
            let event = trade_event(trade.trade_id, TradeEventType::FailSafe, None, None, None, None, None, true, Some("entry cancelled before fill".into()));
            self.ledger.update_trade(trade, &event).await.map_err(|e| EngineError::DataIntegrity(e.to_string()))?;
            return Err(EngineError::FailSafeTriggered { detail: format!("stop-loss failed, entry cancelled: {sl_error}") });
        }

        let close_side = entry_side.opposite_for_protection();
        match self.gateway.place_market(creds, &trade.symbol, close_side, quantity, &format!("failsafe-{}", trade.trade_id)).await {
            Ok(close_ack) => {
                trade.status = TradeStatus::Closed.to_string();
                trade.exit_reason = Some(ExitReason::FailSafe.to_string());
                trade.exit_price = Some(close_ack.avg_price);
                trade.exit_quantity = Some(quantity);
                trade.exit_time = Some(Utc::now());
                trade.exit_order_id = Some(close_ack.order_id.to_string());
                trade.remaining_quantity = 0.0;
                trade.total_closed_quantity = trade.entry_quantity;
                trade.updated_at = Utc::now();
                let event = trade_event(trade.trade_id, TradeEventType::FailSafe, Some(close_ack.order_id.to_string()), None, Some("MARKET"), Some(close_ack.avg_price), Some(quantity), true, Some("rolled back via market close".into()));
                self.ledger.update_trade(trade, &event).await.map_err(|e| EngineError::DataIntegrity(e.to_string()))?;
                Err(EngineError::FailSafeTriggered { detail: format!("stop-loss failed, position closed via market order: {sl_error}") })
            }
            Err(close_err) => {
                let event = trade_event(trade.trade_id, TradeEventType::FailSafe, None, None, None, None, None, false, Some(format!("cancel and market close both failed: {close_err}")));
                self.ledger.append_event(&event).await.map_err(|e| EngineError::DataIntegrity(e.to_string()))?;
                Err(EngineError::FailSafeExhausted { detail: format!("sl={sl_error}, close={close_err}") })
            }
        }
    }

    // -------------------------------------------------------------------------
    // §4.6.3 CLOSE
    // -------------------------------------------------------------------------

    async fn handle_close(&self, user_id: Uuid, creds: &ExchangeCredentials, intent: &TradeIntent) -> Result<OrchestratorOutcome, EngineError> {
        let mut trade = self
            .ledger
            .find_open_by_symbol(user_id, &intent.symbol)
            .await
            .map_err(|e| EngineError::DataIntegrity(e.to_string()))?
            .ok_or_else(|| EngineError::RiskRejected { reason: RiskRejectReason::NoPositionToDca, detail: "no open position to close".into() })?;

        let close_qty = match intent.close_ratio {
            None => trade.remaining_quantity,
            Some(ratio) => {
                let symbol_info = self
                    .gateway
                    .get_symbol_info(&intent.symbol)
                    .await
                    .map_err(|e| EngineError::DataIntegrity(e.to_string()))?;
                let raw = (trade.remaining_quantity * ratio).max(0.0);
                let rounded = round_to_step(raw, symbol_info.step_size);
                // B1: a non-zero ratio always closes at least one step, never
                // rounds down to nothing.
                if rounded <= 0.0 && raw > 0.0 {
                    symbol_info.step_size.min(trade.remaining_quantity)
                } else {
                    rounded
                }
            }
        };
        if close_qty <= 0.0 {
            return Err(EngineError::DataIntegrity("computed close quantity is zero".into()));
        }

        self.gateway.cancel_all_orders(creds, &intent.symbol).await.ok();

        let side = trade.side_enum();
        let close_side = OrderSide::from_position_side(side).opposite_for_protection();
        let ack = self
            .gateway
            .place_market(creds, &intent.symbol, close_side, close_qty, &format!("close-{}", trade.trade_id))
            .await?;

        trade.total_closed_quantity += ack.filled_qty.max(close_qty);
        trade.remaining_quantity = (trade.remaining_quantity - ack.filled_qty.max(close_qty)).max(0.0);
        let taker_commission = ack.avg_price * close_qty * TAKER_FEE_RATE;
        trade.commission += taker_commission;

        let pnl_sign = if side == Side::Long { 1.0 } else { -1.0 };
        let gross_this_close = pnl_sign * (ack.avg_price - trade.entry_price) * close_qty;
        trade.gross_profit += gross_this_close;
        trade.exit_price = Some(ack.avg_price);
        trade.exit_order_id = Some(ack.order_id.to_string());

        if trade.remaining_quantity > 0.0 {
            trade.updated_at = Utc::now();
            let event = trade_event(trade.trade_id, TradeEventType::PartialClose, Some(ack.order_id.to_string()), None, Some("MARKET"), Some(ack.avg_price), Some(close_qty), true, None);
            self.ledger.update_trade(&trade, &event).await.map_err(|e| EngineError::DataIntegrity(e.to_string()))?;

            // Re-place SL: precedence intent.newStopLoss > cost-protection (entry price) > previous SL.
            let new_sl = intent.new_stop_loss.unwrap_or(trade.entry_price);
            let sl_client_order_id = derive_client_order_id(&trade.trade_id.to_string(), "sl-partial");
            if self
                .gateway
                .place_stop_market(creds, &intent.symbol, OrderSide::from_position_side(side).opposite_for_protection(), trade.remaining_quantity, new_sl, &sl_client_order_id)
                .await
                .is_ok()
            {
                trade.stop_loss = new_sl;
            }
            if let Some(tp) = intent.new_take_profit {
                let tp_client_order_id = derive_client_order_id(&trade.trade_id.to_string(), "tp-partial");
                if self
                    .gateway
                    .place_take_profit_market(creds, &intent.symbol, OrderSide::from_position_side(side).opposite_for_protection(), trade.remaining_quantity, tp, &tp_client_order_id)
                    .await
                    .is_ok()
                {
                    trade.take_profit = Some(tp);
                }
            }
            self.ledger.update_trade(&trade, &trade_event(trade.trade_id, TradeEventType::MoveSl, None, None, None, Some(new_sl), None, true, None)).await.map_err(|e| EngineError::DataIntegrity(e.to_string()))?;

            Ok(OrchestratorOutcome { trade_id: Some(trade.trade_id), summary: format!("partial close {close_qty} of {}", intent.symbol) })
        } else {
            trade.status = TradeStatus::Closed.to_string();
            // This engine has no upstream signal for "operator-initiated"
            // closes distinct from signal-driven ones; every CLOSE intent
            // reaching the orchestrator is recorded as SIGNAL_CLOSE.
            trade.exit_reason = Some(ExitReason::SignalClose.to_string());
            trade.exit_quantity = Some(close_qty);
            trade.exit_time = Some(Utc::now());
            trade.recompute_net_profit();
            trade.updated_at = Utc::now();

            let event = trade_event(trade.trade_id, TradeEventType::ClosePlaced, Some(ack.order_id.to_string()), None, Some("MARKET"), Some(ack.avg_price), Some(close_qty), true, None);
            self.ledger.update_trade(&trade, &event).await.map_err(|e| EngineError::DataIntegrity(e.to_string()))?;

            Ok(OrchestratorOutcome { trade_id: Some(trade.trade_id), summary: format!("closed {} net {:.4}", intent.symbol, trade.net_profit) })
        }
    }

    // -------------------------------------------------------------------------
    // §4.6.4 MOVE_SL
    // -------------------------------------------------------------------------

    async fn handle_move_sl(&self, user_id: Uuid, creds: &ExchangeCredentials, intent: &TradeIntent) -> Result<OrchestratorOutcome, EngineError> {
        let mut trade = self
            .ledger
            .find_open_by_symbol(user_id, &intent.symbol)
            .await
            .map_err(|e| EngineError::DataIntegrity(e.to_string()))?
            .ok_or_else(|| EngineError::RiskRejected { reason: RiskRejectReason::NoPositionToDca, detail: "no open position to move SL on".into() })?;

        let new_sl = intent.new_stop_loss.unwrap_or(trade.entry_price);
        let side = trade.side_enum();
        let protect_side = OrderSide::from_position_side(side).opposite_for_protection();

        self.gateway.cancel_all_orders(creds, &intent.symbol).await.ok();

        let sl_client_order_id = derive_client_order_id(&trade.trade_id.to_string(), &format!("sl-move-{}", Utc::now().timestamp_millis()));
        match self.gateway.place_stop_market(creds, &intent.symbol, protect_side, trade.remaining_quantity, new_sl, &sl_client_order_id).await {
            Ok(ack) => {
                trade.stop_loss = new_sl;
                trade.updated_at = Utc::now();
                let event = trade_event(trade.trade_id, TradeEventType::MoveSl, Some(ack.order_id.to_string()), None, Some("STOP_MARKET"), Some(new_sl), Some(trade.remaining_quantity), true, None);
                self.ledger.update_trade(&trade, &event).await.map_err(|e| EngineError::DataIntegrity(e.to_string()))?;
            }
            Err(sl_err) => {
                return self.fail_safe_rollback(user_id, creds, &mut trade, &trade.entry_order_id.clone(), trade.remaining_quantity, OrderSide::from_position_side(side), sl_err).await;
            }
        }

        if let Some(tp) = intent.new_take_profit {
            let tp_client_order_id = derive_client_order_id(&trade.trade_id.to_string(), &format!("tp-move-{}", Utc::now().timestamp_millis()));
            if self.gateway.place_take_profit_market(creds, &intent.symbol, protect_side, trade.remaining_quantity, tp, &tp_client_order_id).await.is_ok() {
                trade.take_profit = Some(tp);
                self.ledger.update_trade(&trade, &trade_event(trade.trade_id, TradeEventType::TpPlaced, None, None, None, Some(tp), None, true, None)).await.ok();
            }
        }

        Ok(OrchestratorOutcome { trade_id: Some(trade.trade_id), summary: format!("stop-loss moved to {new_sl} on {}", intent.symbol) })
    }

    // -------------------------------------------------------------------------
    // §4.6.5 CANCEL
    // -------------------------------------------------------------------------

    async fn handle_cancel(&self, user_id: Uuid, creds: &ExchangeCredentials, intent: &TradeIntent) -> Result<OrchestratorOutcome, EngineError> {
        let fingerprint = cancel_fingerprint(&intent.symbol);
        if let DedupOutcome::Duplicate = self.dedup.check(&fingerprint, CANCEL_TTL, std::time::Instant::now()) {
            return Ok(OrchestratorOutcome {
                trade_id: None,
                summary: format!("cancel on {} debounced, identical cancel seen within the window", intent.symbol),
            });
        }

        self.gateway.cancel_all_orders(creds, &intent.symbol).await?;

        let trade = self
            .ledger
            .find_open_by_symbol(user_id, &intent.symbol)
            .await
            .map_err(|e| EngineError::DataIntegrity(e.to_string()))?;

        match trade {
            None => Ok(OrchestratorOutcome { trade_id: None, summary: format!("no open trade on {}, cancel was a no-op", intent.symbol) }),
            Some(mut t) if t.entry_quantity == t.remaining_quantity && t.total_closed_quantity == 0.0 => {
                t.status = TradeStatus::Cancelled.to_string();
                t.updated_at = Utc::now();
                let event = trade_event(t.trade_id, TradeEventType::Cancel, None, None, None, None, None, true, None);
                self.ledger.update_trade(&t, &event).await.map_err(|e| EngineError::DataIntegrity(e.to_string()))?;
                Ok(OrchestratorOutcome { trade_id: Some(t.trade_id), summary: format!("unfilled entry on {} cancelled", intent.symbol) })
            }
            Some(t) => {
                let event = trade_event(t.trade_id, TradeEventType::Cancel, None, None, None, None, None, true, Some("orders cancelled, position remains open".into()));
                self.ledger.append_event(&event).await.map_err(|e| EngineError::DataIntegrity(e.to_string()))?;
                Ok(OrchestratorOutcome { trade_id: Some(t.trade_id), summary: format!("open orders on {} cancelled, position remains", intent.symbol) })
            }
        }
    }

    // -------------------------------------------------------------------------
    // Leverage idempotency cache (§4.1.1)
    // -------------------------------------------------------------------------

    async fn ensure_leverage(&self, user_id: Uuid, creds: &ExchangeCredentials, symbol: &str, leverage: u32) -> Result<(), EngineError> {
        let key = (user_id, symbol.to_string());
        if self.leverage_set.read().contains(&key) {
            return Ok(());
        }
        self.gateway.set_leverage(creds, symbol, leverage).await?;
        self.leverage_set.write().insert(key);
        debug!(symbol, leverage, "leverage set");
        Ok(())
    }
}

impl OrderSide {
    /// The side a protective (SL/TP) or closing order must take: opposite
    /// the position side it guards or closes.
    pub fn opposite_for_protection(self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

fn derive_client_order_id(fingerprint: &str, suffix: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(fingerprint.as_bytes());
    hasher.update(b"|");
    hasher.update(suffix.as_bytes());
    let digest = hex_encode(hasher.finalize());
    format!("{suffix}-{}", &digest[..24])
}

#[allow(clippy::too_many_arguments)]
fn trade_event(
    trade_id: Uuid,
    event_type: TradeEventType,
    exchange_order_id: Option<String>,
    side: Option<String>,
    order_type: Option<&str>,
    price: Option<f64>,
    quantity: Option<f64>,
    success: bool,
    error_message: Option<String>,
) -> TradeEvent {
    TradeEvent {
        event_id: Uuid::new_v4(),
        trade_id,
        event_type: event_type.to_string(),
        timestamp: Utc::now(),
        exchange_order_id,
        side,
        order_type: order_type.map(|s| s.to_string()),
        price,
        quantity,
        success,
        error_message,
        detail: None,
        fill_sequence: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_order_id_is_stable_for_same_fingerprint() {
        let a = derive_client_order_id("abc123", "entry");
        let b = derive_client_order_id("abc123", "entry");
        assert_eq!(a, b);
    }

    #[test]
    fn client_order_id_differs_by_suffix() {
        let entry = derive_client_order_id("abc123", "entry");
        let sl = derive_client_order_id("abc123", "sl");
        assert_ne!(entry, sl);
    }

    #[test]
    fn protection_side_is_opposite() {
        assert_eq!(OrderSide::Buy.opposite_for_protection(), OrderSide::Sell);
        assert_eq!(OrderSide::Sell.opposite_for_protection(), OrderSide::Buy);
    }

    // -------------------------------------------------------------------------
    // Fake ExchangeApi + end-to-end orchestrator scenarios (P7, B1, DCA).
    // -------------------------------------------------------------------------

    use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

    use crate::exchange::client::{OrderAck, OrderInfo, SymbolInfo};
    use crate::ledger::SqliteLedgerStore;

    /// In-memory stand-in for `ExchangeGateway`, driven entirely by the
    /// `fail_*` flags. Lets an orchestrator test force a stop-loss, cancel,
    /// or market-close failure without a live exchange.
    struct FakeExchange {
        balance: f64,
        mark_price: f64,
        symbol_info: SymbolInfo,
        next_order_id: AtomicI64,
        fail_sl: AtomicBool,
        fail_cancel: AtomicBool,
        fail_close: AtomicBool,
    }

    impl FakeExchange {
        fn new(mark_price: f64) -> Self {
            Self {
                balance: 10_000.0,
                mark_price,
                symbol_info: SymbolInfo { tick_size: 0.01, step_size: 0.001, min_notional: 5.0 },
                next_order_id: AtomicI64::new(1),
                fail_sl: AtomicBool::new(false),
                fail_cancel: AtomicBool::new(false),
                fail_close: AtomicBool::new(false),
            }
        }

        fn next_id(&self) -> i64 {
            self.next_order_id.fetch_add(1, Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl ExchangeApi for FakeExchange {
        async fn get_balance(&self, _creds: &ExchangeCredentials) -> Result<f64, EngineError> {
            Ok(self.balance)
        }

        async fn get_mark_price(&self, _symbol: &str) -> Result<f64, EngineError> {
            Ok(self.mark_price)
        }

        async fn get_open_orders(&self, _creds: &ExchangeCredentials, _symbol: &str) -> Result<Vec<OrderInfo>, EngineError> {
            Ok(vec![])
        }

        async fn get_symbol_info(&self, _symbol: &str) -> anyhow::Result<SymbolInfo> {
            Ok(self.symbol_info)
        }

        async fn set_leverage(&self, _creds: &ExchangeCredentials, _symbol: &str, _leverage: u32) -> Result<(), EngineError> {
            Ok(())
        }

        async fn place_limit(&self, _creds: &ExchangeCredentials, _symbol: &str, _side: OrderSide, price: f64, qty: f64, client_order_id: &str) -> Result<OrderAck, EngineError> {
            Ok(OrderAck { order_id: self.next_id(), client_order_id: client_order_id.to_string(), filled_qty: qty, avg_price: price, status: "FILLED".to_string() })
        }

        async fn place_market(&self, _creds: &ExchangeCredentials, _symbol: &str, _side: OrderSide, qty: f64, client_order_id: &str) -> Result<OrderAck, EngineError> {
            if self.fail_close.load(Ordering::SeqCst) {
                return Err(EngineError::ExchangeIoError("simulated market close failure".into()));
            }
            Ok(OrderAck { order_id: self.next_id(), client_order_id: client_order_id.to_string(), filled_qty: qty, avg_price: self.mark_price, status: "FILLED".to_string() })
        }

        async fn place_stop_market(&self, _creds: &ExchangeCredentials, _symbol: &str, _side: OrderSide, qty: f64, trigger_price: f64, client_order_id: &str) -> Result<OrderAck, EngineError> {
            if self.fail_sl.load(Ordering::SeqCst) {
                return Err(EngineError::ExchangeIoError("simulated stop-loss placement failure".into()));
            }
            Ok(OrderAck { order_id: self.next_id(), client_order_id: client_order_id.to_string(), filled_qty: qty, avg_price: trigger_price, status: "NEW".to_string() })
        }

        async fn place_take_profit_market(&self, _creds: &ExchangeCredentials, _symbol: &str, _side: OrderSide, qty: f64, trigger_price: f64, client_order_id: &str) -> Result<OrderAck, EngineError> {
            Ok(OrderAck { order_id: self.next_id(), client_order_id: client_order_id.to_string(), filled_qty: qty, avg_price: trigger_price, status: "NEW".to_string() })
        }

        async fn cancel_order(&self, _creds: &ExchangeCredentials, _symbol: &str, _order_id: i64) -> Result<(), EngineError> {
            if self.fail_cancel.load(Ordering::SeqCst) {
                return Err(EngineError::ExchangeIoError("simulated cancel failure".into()));
            }
            Ok(())
        }

        async fn cancel_all_orders(&self, _creds: &ExchangeCredentials, _symbol: &str) -> Result<(), EngineError> {
            Ok(())
        }
    }

    async fn build_orchestrator(gateway: Arc<dyn ExchangeApi>) -> (OrderOrchestrator, Arc<dyn LedgerStore>) {
        let ledger: Arc<dyn LedgerStore> = Arc::new(SqliteLedgerStore::in_memory().await.unwrap());
        let dedup = Arc::new(DedupRegistry::new(true));
        let risk = Arc::new(RiskEvaluator::new(ledger.clone(), gateway.clone(), dedup.clone()));
        let (notifications, _handle) = NotificationBus::spawn();
        let notifications = Arc::new(notifications);
        let symbol_locks = Arc::new(SymbolLockRegistry::new());
        let orchestrator = OrderOrchestrator::new(risk, ledger.clone(), gateway, symbol_locks, notifications, dedup, "BTCUSDT".to_string());
        (orchestrator, ledger)
    }

    fn test_config() -> EffectiveUserConfig {
        let mut allowed = HashSet::new();
        allowed.insert("BTCUSDT".to_string());
        EffectiveUserConfig {
            risk_percent: 0.01,
            max_position_notional: 1_000_000.0,
            max_daily_loss: 1_000_000.0,
            max_dca_per_symbol: 5,
            dca_risk_multiplier: 1.0,
            leverage: 20,
            allowed_symbols: allowed,
            auto_trade_enabled: true,
        }
    }

    fn entry_intent(entry_price: f64, stop_loss: f64) -> TradeIntent {
        TradeIntent {
            action: IntentAction::Entry,
            symbol: "BTCUSDT".to_string(),
            side: Some(Side::Long),
            entry_price: Some(entry_price),
            stop_loss: Some(stop_loss),
            take_profit: None,
            new_stop_loss: None,
            new_take_profit: None,
            close_ratio: None,
            source: Default::default(),
        }
    }

    fn close_intent(ratio: Option<f64>) -> TradeIntent {
        TradeIntent {
            action: IntentAction::Close,
            symbol: "BTCUSDT".to_string(),
            side: None,
            entry_price: None,
            stop_loss: None,
            take_profit: None,
            new_stop_loss: None,
            new_take_profit: None,
            close_ratio: ratio,
            source: Default::default(),
        }
    }

    fn test_creds() -> ExchangeCredentials {
        ExchangeCredentials { api_key: "k".into(), api_secret: "s".into() }
    }

    /// P7 / scenario 4: stop-loss placement fails, entry still cancellable
    /// (unfilled) -> rollback cancels it and the trade is never left naked.
    #[tokio::test]
    async fn fail_safe_rollback_cancels_entry_when_stop_loss_placement_fails() {
        let fake = Arc::new(FakeExchange::new(50_000.0));
        fake.fail_sl.store(true, Ordering::SeqCst);
        let (orchestrator, ledger) = build_orchestrator(fake).await;
        let user_id = Uuid::new_v4();
        let creds = test_creds();
        let config = test_config();

        let result = orchestrator.execute_for_user(user_id, &creds, &config, entry_intent(50_000.0, 49_000.0), "UTC").await;
        assert!(matches!(result, Err(EngineError::FailSafeTriggered { .. })));

        let cancelled = ledger.find_by_status(user_id, TradeStatus::Cancelled).await.unwrap();
        assert_eq!(cancelled.len(), 1);
    }

    /// Scenario 4 continued: cancel also fails, so rollback falls back to a
    /// MARKET close of the filled quantity instead of leaving it open.
    #[tokio::test]
    async fn fail_safe_rollback_market_closes_when_cancel_also_fails() {
        let fake = Arc::new(FakeExchange::new(50_000.0));
        fake.fail_sl.store(true, Ordering::SeqCst);
        fake.fail_cancel.store(true, Ordering::SeqCst);
        let (orchestrator, ledger) = build_orchestrator(fake).await;
        let user_id = Uuid::new_v4();
        let creds = test_creds();
        let config = test_config();

        let result = orchestrator.execute_for_user(user_id, &creds, &config, entry_intent(50_000.0, 49_000.0), "UTC").await;
        assert!(matches!(result, Err(EngineError::FailSafeTriggered { .. })));

        let closed = ledger.find_by_status(user_id, TradeStatus::Closed).await.unwrap();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].exit_reason.as_deref(), Some("FAIL_SAFE"));
    }

    /// P7: cancel and market-close both fail -> FAIL_SAFE_EXHAUSTED is
    /// escalated rather than swallowed.
    #[tokio::test]
    async fn fail_safe_exhausted_when_cancel_and_close_both_fail() {
        let fake = Arc::new(FakeExchange::new(50_000.0));
        fake.fail_sl.store(true, Ordering::SeqCst);
        fake.fail_cancel.store(true, Ordering::SeqCst);
        fake.fail_close.store(true, Ordering::SeqCst);
        let (orchestrator, _ledger) = build_orchestrator(fake).await;
        let user_id = Uuid::new_v4();
        let creds = test_creds();
        let config = test_config();

        let result = orchestrator.execute_for_user(user_id, &creds, &config, entry_intent(50_000.0, 49_000.0), "UTC").await;
        assert!(matches!(result, Err(EngineError::FailSafeExhausted { .. })));
    }

    /// Scenario 5: a partial close rounds to the symbol's step size and
    /// re-places the stop-loss at entry price (cost protection) when the
    /// intent carries no explicit new stop-loss.
    #[tokio::test]
    async fn partial_close_rounds_quantity_and_reapplies_cost_protection_stop() {
        let fake = Arc::new(FakeExchange::new(50_000.0));
        let (orchestrator, ledger) = build_orchestrator(fake).await;
        let user_id = Uuid::new_v4();
        let creds = test_creds();
        let config = test_config();

        let entry = orchestrator.execute_for_user(user_id, &creds, &config, entry_intent(50_000.0, 49_000.0), "UTC").await.unwrap();
        let trade_id = entry.trade_id.unwrap();
        let opened = ledger.find_by_id(trade_id).await.unwrap().unwrap();
        assert!(opened.entry_quantity > 0.0);

        orchestrator.execute_for_user(user_id, &creds, &config, close_intent(Some(0.5)), "UTC").await.unwrap();

        let trade = ledger.find_by_id(trade_id).await.unwrap().unwrap();
        assert_eq!(trade.status, "OPEN");
        assert!(trade.total_closed_quantity > 0.0);
        assert!((trade.total_closed_quantity - opened.entry_quantity * 0.5).abs() < 2e-3, "closed quantity rounded, not dropped");
        assert!((trade.remaining_quantity - (opened.entry_quantity - trade.total_closed_quantity)).abs() < 1e-9);
        assert_eq!(trade.stop_loss, trade.entry_price, "cost protection re-places SL at entry price");
    }

    /// B1: closeRatio=0.5 on a 0.003 qty must still close a valid,
    /// non-zero exchange quantity after rounding to step size.
    #[tokio::test]
    async fn partial_close_on_tiny_quantity_still_closes_a_valid_step() {
        let fake = Arc::new(FakeExchange::new(50_000.0));
        let (orchestrator, ledger) = build_orchestrator(fake).await;
        let user_id = Uuid::new_v4();
        let creds = test_creds();

        let trade_id = Uuid::new_v4();
        let now = Utc::now();
        let trade = Trade {
            trade_id,
            user_id,
            symbol: "BTCUSDT".to_string(),
            side: Side::Long.to_string(),
            entry_price: 50_000.0,
            entry_quantity: 0.003,
            entry_time: now,
            entry_order_id: "1".to_string(),
            entry_commission: 0.0,
            exit_price: None,
            exit_quantity: None,
            exit_time: None,
            exit_order_id: None,
            exit_reason: None,
            total_closed_quantity: 0.0,
            remaining_quantity: 0.003,
            gross_profit: 0.0,
            commission: 0.0,
            net_profit: 0.0,
            stop_loss: 49_000.0,
            take_profit: None,
            dca_count: 0,
            signal_hash: "test-fingerprint".to_string(),
            source_platform: None,
            source_channel_id: None,
            source_author_name: None,
            source_message_id: None,
            created_at: now,
            updated_at: now,
            status: TradeStatus::Open.to_string(),
        };
        let event = trade_event(trade_id, TradeEventType::EntryPlaced, None, None, None, None, None, true, None);
        ledger.insert_trade(&trade, &event).await.unwrap();

        orchestrator.handle_close(user_id, &creds, &close_intent(Some(0.5))).await.unwrap();

        let updated = ledger.find_by_id(trade_id).await.unwrap().unwrap();
        assert!(updated.total_closed_quantity > 0.0, "B1: must close a valid non-zero exchange quantity");
        assert!((updated.total_closed_quantity - 0.001).abs() < 1e-9);
    }

    /// DCA weighted-average recompute: entry_price becomes the
    /// notional-weighted average of the original fill and the DCA layer.
    #[tokio::test]
    async fn dca_entry_recomputes_weighted_average_entry_price() {
        let fake = Arc::new(FakeExchange::new(50_000.0));
        let (orchestrator, ledger) = build_orchestrator(fake).await;
        let user_id = Uuid::new_v4();
        let creds = test_creds();
        let config = test_config();

        let entry = orchestrator.execute_for_user(user_id, &creds, &config, entry_intent(50_000.0, 49_000.0), "UTC").await.unwrap();
        let trade_id = entry.trade_id.unwrap();
        let opened = ledger.find_by_id(trade_id).await.unwrap().unwrap();
        let (price1, qty1) = (opened.entry_price, opened.entry_quantity);

        // DCA risk sizing keys off `new_stop_loss` (the re-placed protective
        // level), not `stop_loss` — the original entry's stop stays the
        // reference for direction validity until a new one is supplied.
        let dca_intent = TradeIntent {
            action: IntentAction::DcaEntry,
            symbol: "BTCUSDT".to_string(),
            side: None,
            entry_price: Some(48_000.0),
            stop_loss: None,
            take_profit: None,
            new_stop_loss: Some(47_000.0),
            new_take_profit: None,
            close_ratio: None,
            source: Default::default(),
        };
        orchestrator.execute_for_user(user_id, &creds, &config, dca_intent, "UTC").await.unwrap();

        let after_dca = ledger.find_by_id(trade_id).await.unwrap().unwrap();
        assert_eq!(after_dca.dca_count, 1);
        let qty2 = after_dca.entry_quantity - qty1;
        assert!(qty2 > 0.0, "DCA layer must add quantity");

        let expected_price = (price1 * qty1 + 48_000.0 * qty2) / after_dca.entry_quantity;
        assert!((after_dca.entry_price - expected_price).abs() < 1e-6);
        // Risk-defined sizing at equal risk% and distance makes both layers
        // roughly equal-sized, so the blended price should sit near the
        // simple midpoint of the two fills, not collapse to either one.
        assert!(after_dca.entry_price > 48_000.0 && after_dca.entry_price < 50_000.0);
    }

    /// §4.3: the persisted `signal_hash` must match what the signal-layer
    /// restart guard queries against — `signal_fingerprint`, not
    /// `per_user_fingerprint` (which bakes in `user_id` and could never
    /// match across the two call sites).
    #[tokio::test]
    async fn signal_hash_uses_signal_layer_fingerprint_not_per_user_fingerprint() {
        let fake = Arc::new(FakeExchange::new(50_000.0));
        let (orchestrator, ledger) = build_orchestrator(fake).await;
        let user_id = Uuid::new_v4();
        let creds = test_creds();
        let config = test_config();
        let intent = entry_intent(50_000.0, 49_000.0);

        let entry = orchestrator.execute_for_user(user_id, &creds, &config, intent.clone(), "UTC").await.unwrap();
        let trade = ledger.find_by_id(entry.trade_id.unwrap()).await.unwrap().unwrap();

        let expected = signal_fingerprint(&intent.symbol, &intent.side_or_dca_literal(), intent.entry_price, intent.stop_loss);
        assert_eq!(trade.signal_hash, expected);
        assert_ne!(trade.signal_hash, per_user_fingerprint(user_id, &intent.symbol, &intent.side_or_dca_literal(), intent.entry_price, intent.stop_loss));
    }
}
