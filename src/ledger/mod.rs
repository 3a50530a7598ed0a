// =============================================================================
// LedgerStore (C2) — §4.2
// =============================================================================
//
// Relational persistence for Trade/TradeEvent. Defined as a trait so the
// SQLite-backed implementation in `store.rs` can be swapped for an
// in-memory test double without touching any caller.
// =============================================================================

mod store;

pub use store::SqliteLedgerStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::types::{Trade, TradeEvent, TradeStatus};

#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// The single OPEN trade for (user, symbol), if any — I2.
    async fn find_open_by_symbol(&self, user_id: Uuid, symbol: &str) -> anyhow::Result<Option<Trade>>;

    /// Signal-layer dedup guard against process restart (§4.3 step 4).
    async fn exists_by_fingerprint_since(&self, hash: &str, since: DateTime<Utc>) -> anyhow::Result<bool>;

    async fn insert_trade(&self, trade: &Trade, event: &TradeEvent) -> anyhow::Result<()>;

    /// Updates `trade` and appends `event` in a single transaction (§4.2
    /// consistency rule).
    async fn update_trade(&self, trade: &Trade, event: &TradeEvent) -> anyhow::Result<()>;

    async fn append_event(&self, event: &TradeEvent) -> anyhow::Result<()>;

    async fn find_by_status(&self, user_id: Uuid, status: TradeStatus) -> anyhow::Result<Vec<Trade>>;

    /// Closed trades whose `exit_time` falls in `[from, to)` — backs the
    /// daily loss circuit breaker and the scheduler's daily report.
    async fn find_closed_in_range(
        &self,
        user_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Trade>>;

    /// Cross-user; used only by UserDataReconciler at startup/reconnect.
    async fn find_all_open(&self) -> anyhow::Result<Vec<Trade>>;

    async fn find_by_id(&self, trade_id: Uuid) -> anyhow::Result<Option<Trade>>;

    /// Sum of realized `net_profit` for closed trades in `[from, to)` — the
    /// circuit-breaker aggregate query (§4.5 step 3, §9 design note).
    async fn realized_pnl_in_range(
        &self,
        user_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<f64> {
        let closed = self.find_closed_in_range(user_id, from, to).await?;
        Ok(closed.iter().map(|t| t.net_profit).sum())
    }
}
