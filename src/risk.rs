// =============================================================================
// RiskEvaluator (C5) — §4.5
// =============================================================================
//
// The ordered 10-step gate. Every step either raises (an exchange-level
// failure, never swallowed — balance/mark-price probes must never be
// substituted with zero) or denies with a specific `RiskRejectReason`, in
// the exact order the spec lists them. Position sizing is split into a
// pure function (`size_position`) so the three-tier cap math is testable
// without a live exchange or ledger.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::dedup::{per_user_fingerprint, DedupOutcome, DedupRegistry, PER_USER_TTL};
use crate::error::{EngineError, RiskRejectReason};
use crate::exchange::client::{round_to_step, ExchangeApi};
use crate::ledger::LedgerStore;
use crate::types::{EffectiveUserConfig, IntentAction, Side, TradeIntent};
use crate::user_store::ExchangeCredentials;

/// Minimum notional the exchange will accept, USDT (§4.5 step 10).
const MIN_NOTIONAL_USDT: f64 = 5.0;
/// Price-deviation guard threshold (§4.5 step 9).
const PRICE_DEVIATION_THRESHOLD: f64 = 0.10;
/// Margin cap headroom — position margin must not exceed 90% of balance.
const MARGIN_CAP_FRACTION: f64 = 0.9;

#[derive(Debug, Clone, PartialEq)]
pub struct RiskDecision {
    pub quantity: f64,
    pub r_risk_amount: f64,
    pub rationale: String,
}

/// The `[day_start, day_end)` window for the exchange's session day in the
/// configured timezone, expressed in UTC for querying the ledger.
pub fn session_day_bounds(now: DateTime<Utc>, tz_name: &str) -> (DateTime<Utc>, DateTime<Utc>) {
    let tz: chrono_tz::Tz = tz_name.parse().unwrap_or(chrono_tz::UTC);
    let local_now = now.with_timezone(&tz);
    let local_midnight = tz
        .with_ymd_and_hms(local_now.year(), local_now.month(), local_now.day(), 0, 0, 0)
        .single()
        .expect("midnight is unambiguous");
    let start = local_midnight.with_timezone(&Utc);
    let end = start + chrono::Duration::days(1);
    (start, end)
}

/// Pure position-sizing math (§4.5 step 10). Returns the final quantity
/// rounded down to `step_size`, or a rejection reason if minimum notional
/// can't be met.
pub fn size_position(
    balance: f64,
    risk_percent: f64,
    dca_risk_multiplier: f64,
    is_dca: bool,
    entry_price: f64,
    stop_loss: f64,
    max_position_notional: f64,
    leverage: u32,
    step_size: f64,
) -> Result<RiskDecision, RiskRejectReason> {
    let risk_amount = if is_dca {
        balance * risk_percent * dca_risk_multiplier
    } else {
        balance * risk_percent
    };

    let sl_distance = (entry_price - stop_loss).abs();
    if sl_distance <= 0.0 {
        return Err(RiskRejectReason::WrongDirection);
    }

    let mut qty = risk_amount / sl_distance;
    let mut rationale = format!("risk-defined size: {risk_amount:.4} / {sl_distance:.4} = {qty:.8}");

    if entry_price * qty > max_position_notional {
        qty = max_position_notional / entry_price;
        rationale.push_str(&format!("; notional cap applied -> {qty:.8}"));
    }

    let margin_required = entry_price * qty / leverage.max(1) as f64;
    if margin_required > MARGIN_CAP_FRACTION * balance {
        qty = (MARGIN_CAP_FRACTION * balance * leverage.max(1) as f64) / entry_price;
        rationale.push_str(&format!("; margin cap applied -> {qty:.8}"));
    }

    qty = round_to_step(qty, step_size);

    if entry_price * qty < MIN_NOTIONAL_USDT {
        return Err(RiskRejectReason::MinNotional);
    }

    Ok(RiskDecision { quantity: qty, r_risk_amount: risk_amount, rationale })
}

/// Computes the allow/deny verdict and sizing for one (user, intent) pair.
/// Depends on `LedgerStore` (circuit breaker, DCA state) and
/// `ExchangeApi` (balance, mark price, open orders, symbol precision) —
/// both held behind `Arc` so the evaluator can be shared across every
/// user's concurrent calls.
pub struct RiskEvaluator {
    ledger: Arc<dyn LedgerStore>,
    gateway: Arc<dyn ExchangeApi>,
    dedup: Arc<DedupRegistry>,
}

impl RiskEvaluator {
    pub fn new(ledger: Arc<dyn LedgerStore>, gateway: Arc<dyn ExchangeApi>, dedup: Arc<DedupRegistry>) -> Self {
        Self { ledger, gateway, dedup }
    }

    #[instrument(skip(self, creds, config, intent), fields(user_id = %user_id, symbol = %intent.symbol))]
    pub async fn evaluate(
        &self,
        user_id: Uuid,
        creds: &ExchangeCredentials,
        config: &EffectiveUserConfig,
        intent: &TradeIntent,
        session_timezone: &str,
        now: DateTime<Utc>,
    ) -> Result<RiskDecision, EngineError> {
        let is_dca = intent.action == IntentAction::DcaEntry;

        // Step 1: whitelist.
        if !config.allowed_symbols.contains(&intent.symbol) {
            return Err(EngineError::RiskRejected {
                reason: RiskRejectReason::Whitelist,
                detail: format!("{} is not in the allowed symbol set", intent.symbol),
            });
        }

        // Step 2: balance probe. `get_balance` never substitutes zero on
        // failure — any exchange error propagates as-is.
        let balance = self.gateway.get_balance(creds).await?;

        // Step 3: daily loss circuit breaker.
        let (day_start, day_end) = session_day_bounds(now, session_timezone);
        let realized = self
            .ledger
            .realized_pnl_in_range(user_id, day_start, day_end)
            .await
            .map_err(|e| EngineError::DataIntegrity(e.to_string()))?;
        if realized < 0.0 && realized.abs() >= config.max_daily_loss {
            return Err(EngineError::RiskRejected {
                reason: RiskRejectReason::CircuitBreaker,
                detail: format!("realized loss {realized:.2} exceeds cap {:.2}", config.max_daily_loss),
            });
        }

        let open_trade = self
            .ledger
            .find_open_by_symbol(user_id, &intent.symbol)
            .await
            .map_err(|e| EngineError::DataIntegrity(e.to_string()))?;

        // Step 4: per-symbol DCA cap.
        if is_dca {
            let trade = open_trade.as_ref().ok_or_else(|| EngineError::RiskRejected {
                reason: RiskRejectReason::NoPositionToDca,
                detail: format!("no OPEN trade for {} to DCA into", intent.symbol),
            })?;
            if trade.dca_count as u32 + 1 > config.max_dca_per_symbol {
                return Err(EngineError::RiskRejected {
                    reason: RiskRejectReason::DcaLimit,
                    detail: format!("dca layer {} exceeds cap {}", trade.dca_count + 1, config.max_dca_per_symbol),
                });
            }
        } else {
            // Step 5: duplicate open order — a non-DCA entry must not land
            // while an unfilled LIMIT already rests on this symbol.
            let open_orders = self.gateway.get_open_orders(creds, &intent.symbol).await?;
            let has_unfilled_limit = open_orders
                .iter()
                .any(|o| o.order_type == "LIMIT" && o.executed_qty < o.orig_qty);
            if has_unfilled_limit {
                return Err(EngineError::RiskRejected {
                    reason: RiskRejectReason::DuplicateOpenOrder,
                    detail: format!("unfilled LIMIT already open on {}", intent.symbol),
                });
            }
        }

        // Step 6: per-user signal dedup (§4.3).
        let side_or_dca = intent.side_or_dca_literal();
        let fingerprint = per_user_fingerprint(user_id, &intent.symbol, &side_or_dca, intent.entry_price, intent.stop_loss);
        if self.dedup.check(&fingerprint, PER_USER_TTL, Instant::now()) == DedupOutcome::Duplicate {
            return Err(EngineError::RiskRejected {
                reason: RiskRejectReason::SignalDedup,
                detail: "duplicate signal within dedup window".to_string(),
            });
        }

        // Step 7: stop-loss presence. Required for every ENTRY/DCA_ENTRY —
        // a DCA layer with no protective price would leave the averaged
        // position naked, so this evaluator applies the same requirement
        // the spec states explicitly only for non-DCA ENTRY (documented in
        // the grounding ledger's Open Question Decisions).
        let effective_stop_loss = if is_dca {
            intent.new_stop_loss.or(open_trade.as_ref().map(|t| t.stop_loss))
        } else {
            intent.stop_loss
        };
        let stop_loss = effective_stop_loss.ok_or_else(|| EngineError::RiskRejected {
            reason: RiskRejectReason::NoSl,
            detail: "no stop-loss price available".to_string(),
        })?;

        // Step 8: direction validity.
        let side = intent
            .side
            .or_else(|| open_trade.as_ref().map(|t| t.side_enum()))
            .ok_or_else(|| EngineError::RiskRejected {
                reason: RiskRejectReason::WrongDirection,
                detail: "no side specified and no existing position to infer from".to_string(),
            })?;

        let mark_price = self.gateway.get_mark_price(&intent.symbol).await?;
        let entry_price = intent.entry_price.unwrap_or(mark_price);

        let direction_ok = match side {
            Side::Long => stop_loss < entry_price,
            Side::Short => stop_loss > entry_price,
        };
        if !direction_ok {
            return Err(EngineError::RiskRejected {
                reason: RiskRejectReason::WrongDirection,
                detail: format!("{side} stop {stop_loss} invalid against entry {entry_price}"),
            });
        }

        // Step 9: price-deviation guard.
        if mark_price > 0.0 && (entry_price - mark_price).abs() / mark_price > PRICE_DEVIATION_THRESHOLD {
            return Err(EngineError::RiskRejected {
                reason: RiskRejectReason::PriceDeviation,
                detail: format!("entry {entry_price} deviates >10% from mark {mark_price}"),
            });
        }

        // Step 10: three-tier position sizing.
        let symbol_info = self
            .gateway
            .get_symbol_info(&intent.symbol)
            .await
            .map_err(|e| EngineError::DataIntegrity(e.to_string()))?;

        let decision = size_position(
            balance,
            config.risk_percent,
            config.dca_risk_multiplier,
            is_dca,
            entry_price,
            stop_loss,
            config.max_position_notional,
            config.leverage,
            symbol_info.step_size,
        )
        .map_err(|reason| EngineError::RiskRejected {
            reason,
            detail: format!("sized quantity fails minimum notional at entry {entry_price}"),
        })?;

        debug!(quantity = decision.quantity, r_risk_amount = decision.r_risk_amount, "risk gate passed");
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_defined_size_is_used_when_below_caps() {
        let decision = size_position(10_000.0, 0.01, 2.0, false, 95_000.0, 93_000.0, 1_000_000.0, 20, 0.001).unwrap();
        // risk_amount = 100; distance = 2000; qty = 0.05
        assert!((decision.quantity - 0.05).abs() < 1e-6);
        assert!((decision.r_risk_amount - 100.0).abs() < 1e-6);
    }

    #[test]
    fn notional_cap_shrinks_oversized_position() {
        let decision = size_position(1_000_000.0, 0.5, 2.0, false, 100.0, 99.0, 5_000.0, 50, 0.001).unwrap();
        // risk_amount huge, distance tiny -> notional cap of 5000 / 100 = 50
        assert!((decision.quantity - 50.0).abs() < 1e-6);
    }

    #[test]
    fn margin_cap_shrinks_when_leverage_insufficient() {
        let decision = size_position(1_000.0, 0.5, 2.0, false, 1_000.0, 900.0, 10_000_000.0, 2, 0.001).unwrap();
        // margin_required = qty*1000/2 must be <= 900; qty capped at 1.8
        assert!(decision.quantity <= 1.8 + 1e-6);
    }

    #[test]
    fn below_minimum_notional_is_rejected() {
        let result = size_position(100.0, 0.0001, 2.0, false, 50_000.0, 49_900.0, 1_000_000.0, 20, 0.001);
        assert_eq!(result.unwrap_err(), RiskRejectReason::MinNotional);
    }

    #[test]
    fn dca_applies_risk_multiplier() {
        let entry = size_position(10_000.0, 0.01, 3.0, false, 95_000.0, 93_000.0, 1_000_000.0, 20, 0.001).unwrap();
        let dca = size_position(10_000.0, 0.01, 3.0, true, 95_000.0, 93_000.0, 1_000_000.0, 20, 0.001).unwrap();
        assert!((dca.r_risk_amount - entry.r_risk_amount * 3.0).abs() < 1e-6);
    }

    #[test]
    fn zero_distance_is_rejected_as_wrong_direction() {
        let result = size_position(10_000.0, 0.01, 2.0, false, 95_000.0, 95_000.0, 1_000_000.0, 20, 0.001);
        assert_eq!(result.unwrap_err(), RiskRejectReason::WrongDirection);
    }

    #[test]
    fn session_day_bounds_span_exactly_one_day() {
        let now = Utc.with_ymd_and_hms(2026, 7, 28, 15, 30, 0).unwrap();
        let (start, end) = session_day_bounds(now, "UTC");
        assert_eq!((end - start).num_hours(), 24);
        assert!(start <= now && now < end);
    }
}
