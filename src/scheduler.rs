// =============================================================================
// Scheduler & Circuit Breaker (C9) — §4.9
// =============================================================================
//
// Runs the clock: a daily stale-position cleanup, a daily per-user report,
// and (implicitly, by construction) the "circuit breaker" daily-loss reset —
// the realized-loss query in `RiskEvaluator` is already time-windowed
// (`session_day_bounds`), so no persisted reset is needed; this module only
// owns the two jobs that actually run on a clock. Ticks on a plain
// `tokio::time::interval`, the same polling-loop idiom this codebase's
// original reconciliation/regime loops used in `main.rs`, rather than
// pulling in a cron-expression crate for two fixed daily times.
// =============================================================================

use std::sync::Arc;

use chrono::{Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::GlobalConfig;
use crate::exchange::client::ExchangeGateway;
use crate::ledger::LedgerStore;
use crate::notifications::NotificationBus;
use crate::types::{ExitReason, Notification, NotificationScope, NotificationSeverity, Trade, TradeEvent, TradeEventType};
use crate::user_store::UserStore;

const TICK_INTERVAL: Duration = Duration::from_secs(60);
const CLEANUP_HOUR: u32 = 7;
const CLEANUP_MINUTE: u32 = 55;
const REPORT_HOUR: u32 = 8;
const REPORT_MINUTE: u32 = 0;

pub struct Scheduler {
    ledger: Arc<dyn LedgerStore>,
    gateway: Arc<ExchangeGateway>,
    user_store: Arc<dyn UserStore>,
    notifications: Arc<NotificationBus>,
    config: Arc<parking_lot::RwLock<GlobalConfig>>,
}

impl Scheduler {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        gateway: Arc<ExchangeGateway>,
        user_store: Arc<dyn UserStore>,
        notifications: Arc<NotificationBus>,
        config: Arc<parking_lot::RwLock<GlobalConfig>>,
    ) -> Self {
        Self { ledger, gateway, user_store, notifications, config }
    }

    /// Never returns; intended to be spawned once at startup.
    pub async fn run(&self) {
        let mut ticker = interval(TICK_INTERVAL);
        let mut last_cleanup_date = None;
        let mut last_report_date = None;

        loop {
            ticker.tick().await;

            let tz = self.timezone();
            let now_local = Utc::now().with_timezone(&tz);
            let today = now_local.date_naive();

            if now_local.hour() == CLEANUP_HOUR && now_local.minute() == CLEANUP_MINUTE && last_cleanup_date != Some(today) {
                last_cleanup_date = Some(today);
                if let Err(e) = self.run_stale_cleanup().await {
                    error!(error = %e, "stale-position cleanup failed");
                }
            }

            if now_local.hour() == REPORT_HOUR && now_local.minute() == REPORT_MINUTE && last_report_date != Some(today) {
                last_report_date = Some(today);
                if let Err(e) = self.run_daily_report(&tz).await {
                    error!(error = %e, "daily report failed");
                }
            }
        }
    }

    fn timezone(&self) -> Tz {
        let name = self.config.read().session_timezone.clone();
        name.parse().unwrap_or_else(|_| {
            warn!(timezone = %name, "invalid session timezone, falling back to UTC");
            chrono_tz::UTC
        })
    }

    /// §4.9: for each OPEN trade, ask the exchange whether a position still
    /// exists; close with STALE_CLEANUP when it reports zero. Per-user
    /// credentials are looked up fresh rather than cached, since this job
    /// runs once a day and correctness matters more than saving a lookup.
    async fn run_stale_cleanup(&self) -> anyhow::Result<()> {
        let open_trades = self.ledger.find_all_open().await?;
        info!(count = open_trades.len(), "running daily stale-position cleanup");

        for trade in open_trades {
            if let Err(e) = self.cleanup_one(trade).await {
                warn!(error = %e, "stale cleanup failed for one trade, continuing");
            }
        }
        Ok(())
    }

    async fn cleanup_one(&self, mut trade: Trade) -> anyhow::Result<()> {
        let Some(user) = self.user_store.get(trade.user_id).await? else {
            return Ok(());
        };
        let Some(creds) = user.credentials else {
            return Ok(());
        };

        let position_amount = match self.gateway.get_position_amount(&creds, &trade.symbol).await {
            Ok(amount) => amount,
            Err(e) => {
                warn!(trade_id = %trade.trade_id, error = %e, "could not verify exchange position during cleanup");
                return Ok(());
            }
        };

        if position_amount.abs() > f64::EPSILON {
            // Exchange still reports a position; magnitudes may disagree
            // with our remaining_quantity but we don't try to reconcile the
            // size here — only "exchange reports zero" triggers a close.
            if (position_amount.abs() - trade.remaining_quantity).abs() > trade.remaining_quantity * 0.01 {
                warn!(trade_id = %trade.trade_id, exchange_amount = position_amount, ledger_amount = trade.remaining_quantity, "position size mismatch during stale cleanup");
            }
            return Ok(());
        }

        let now = Utc::now();
        trade.exit_price = trade.exit_price.or(Some(trade.entry_price));
        trade.exit_quantity = Some(trade.remaining_quantity);
        trade.exit_time = Some(now);
        trade.exit_reason = Some(ExitReason::StaleCleanup.to_string());
        trade.total_closed_quantity = trade.entry_quantity;
        trade.remaining_quantity = 0.0;
        trade.status = "CLOSED".to_string();
        trade.updated_at = now;

        let event = TradeEvent {
            event_id: Uuid::new_v4(),
            trade_id: trade.trade_id,
            event_type: TradeEventType::StaleCleanup.to_string(),
            timestamp: now,
            exchange_order_id: None,
            side: None,
            order_type: None,
            price: None,
            quantity: Some(trade.remaining_quantity),
            success: true,
            error_message: None,
            detail: Some("exchange reported zero position".to_string()),
            fill_sequence: None,
        };
        self.ledger.update_trade(&trade, &event).await?;

        self.notifications
            .publish(Notification {
                scope: NotificationScope::User { user_id: trade.user_id },
                title: "Stale position cleaned up".to_string(),
                body: format!("{} closed — exchange reported no open position", trade.symbol),
                severity: NotificationSeverity::Warn,
                tags: vec!["scheduler".to_string(), "stale-cleanup".to_string()],
            })
            .await;
        Ok(())
    }

    /// §4.9: per user, summarize yesterday's closed trades, open positions,
    /// and risk-budget usage.
    async fn run_daily_report(&self, tz: &Tz) -> anyhow::Result<()> {
        let now_local = Utc::now().with_timezone(tz);
        let today_start = tz
            .with_ymd_and_hms(now_local.year(), now_local.month(), now_local.day(), 0, 0, 0)
            .single()
            .expect("midnight is unambiguous");
        let from = (today_start - chrono::Duration::days(1)).with_timezone(&Utc);
        let to = today_start.with_timezone(&Utc);

        let open_trades = self.ledger.find_all_open().await?;
        let mut by_user: std::collections::HashMap<Uuid, usize> = std::collections::HashMap::new();
        for trade in &open_trades {
            *by_user.entry(trade.user_id).or_insert(0) += 1;
        }

        let user_ids: std::collections::HashSet<Uuid> = by_user.keys().copied().collect();

        for user_id in user_ids {
            let closed = self.ledger.find_closed_in_range(user_id, from, to).await?;
            let realized_pnl: f64 = closed.iter().map(|t| t.net_profit).sum();
            let wins = closed.iter().filter(|t| t.net_profit > 0.0).count();
            let open_count = by_user.get(&user_id).copied().unwrap_or(0);

            self.notifications
                .publish(Notification {
                    scope: NotificationScope::User { user_id },
                    title: "Daily report".to_string(),
                    body: format!(
                        "Yesterday: {} trades closed ({} wins), realized P&L {:.4}. Currently {} open position(s).",
                        closed.len(),
                        wins,
                        realized_pnl,
                        open_count
                    ),
                    severity: NotificationSeverity::Info,
                    tags: vec!["scheduler".to_string(), "daily-report".to_string()],
                })
                .await;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_timezone_falls_back_to_utc_on_garbage_name() {
        let config = Arc::new(parking_lot::RwLock::new(GlobalConfig::default()));
        config.write().session_timezone = "not-a-real-zone".to_string();
        let scheduler_tz_name = config.read().session_timezone.clone();
        let parsed: Result<Tz, _> = scheduler_tz_name.parse();
        assert!(parsed.is_err());
    }
}
