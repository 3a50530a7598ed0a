// =============================================================================
// SqliteLedgerStore — LedgerStore (C2) backed by SQLite via sqlx
// =============================================================================
//
// Each multi-write operation (insert_trade, update_trade) runs inside a
// single sqlx transaction so the Trade row and its TradeEvent land together
// or not at all (§4.2 consistency rule). Events are append-only; nothing
// here ever issues an UPDATE against trade_events.
// =============================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::ledger::LedgerStore;
use crate::types::{Trade, TradeEvent, TradeStatus};

pub struct SqliteLedgerStore {
    pool: SqlitePool,
}

impl SqliteLedgerStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = SqlitePool::connect(database_url).await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    #[cfg(test)]
    pub async fn in_memory() -> anyhow::Result<Self> {
        let pool = SqlitePool::connect(":memory:").await?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    fn row_to_trade(row: &sqlx::sqlite::SqliteRow) -> sqlx::Result<Trade> {
        Ok(Trade {
            trade_id: Uuid::parse_str(row.try_get::<String, _>("trade_id")?.as_str())
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            user_id: Uuid::parse_str(row.try_get::<String, _>("user_id")?.as_str())
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
            symbol: row.try_get("symbol")?,
            side: row.try_get("side")?,
            entry_price: row.try_get("entry_price")?,
            entry_quantity: row.try_get("entry_quantity")?,
            entry_time: row.try_get("entry_time")?,
            entry_order_id: row.try_get("entry_order_id")?,
            entry_commission: row.try_get("entry_commission")?,
            exit_price: row.try_get("exit_price")?,
            exit_quantity: row.try_get("exit_quantity")?,
            exit_time: row.try_get("exit_time")?,
            exit_order_id: row.try_get("exit_order_id")?,
            exit_reason: row.try_get("exit_reason")?,
            total_closed_quantity: row.try_get("total_closed_quantity")?,
            remaining_quantity: row.try_get("remaining_quantity")?,
            gross_profit: row.try_get("gross_profit")?,
            commission: row.try_get("commission")?,
            net_profit: row.try_get("net_profit")?,
            stop_loss: row.try_get("stop_loss")?,
            take_profit: row.try_get("take_profit")?,
            dca_count: row.try_get("dca_count")?,
            signal_hash: row.try_get("signal_hash")?,
            source_platform: row.try_get("source_platform")?,
            source_channel_id: row.try_get("source_channel_id")?,
            source_author_name: row.try_get("source_author_name")?,
            source_message_id: row.try_get("source_message_id")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            status: row.try_get("status")?,
        })
    }

    async fn insert_event_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        event: &TradeEvent,
    ) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trade_events
                (event_id, trade_id, event_type, timestamp, exchange_order_id,
                 side, order_type, price, quantity, success, error_message,
                 detail, fill_sequence)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(event.event_id.to_string())
        .bind(event.trade_id.to_string())
        .bind(&event.event_type)
        .bind(event.timestamp)
        .bind(&event.exchange_order_id)
        .bind(&event.side)
        .bind(&event.order_type)
        .bind(event.price)
        .bind(event.quantity)
        .bind(event.success)
        .bind(&event.error_message)
        .bind(&event.detail)
        .bind(event.fill_sequence)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn upsert_trade_tx(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        trade: &Trade,
    ) -> sqlx::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trades (
                trade_id, user_id, symbol, side,
                entry_price, entry_quantity, entry_time, entry_order_id, entry_commission,
                exit_price, exit_quantity, exit_time, exit_order_id, exit_reason,
                total_closed_quantity, remaining_quantity,
                gross_profit, commission, net_profit,
                stop_loss, take_profit,
                dca_count, signal_hash,
                source_platform, source_channel_id, source_author_name, source_message_id,
                created_at, updated_at, status
            ) VALUES (
                ?, ?, ?, ?,
                ?, ?, ?, ?, ?,
                ?, ?, ?, ?, ?,
                ?, ?,
                ?, ?, ?,
                ?, ?,
                ?, ?,
                ?, ?, ?, ?,
                ?, ?, ?
            )
            ON CONFLICT(trade_id) DO UPDATE SET
                symbol = excluded.symbol,
                side = excluded.side,
                entry_price = excluded.entry_price,
                entry_quantity = excluded.entry_quantity,
                entry_time = excluded.entry_time,
                entry_order_id = excluded.entry_order_id,
                entry_commission = excluded.entry_commission,
                exit_price = excluded.exit_price,
                exit_quantity = excluded.exit_quantity,
                exit_time = excluded.exit_time,
                exit_order_id = excluded.exit_order_id,
                exit_reason = excluded.exit_reason,
                total_closed_quantity = excluded.total_closed_quantity,
                remaining_quantity = excluded.remaining_quantity,
                gross_profit = excluded.gross_profit,
                commission = excluded.commission,
                net_profit = excluded.net_profit,
                stop_loss = excluded.stop_loss,
                take_profit = excluded.take_profit,
                dca_count = excluded.dca_count,
                signal_hash = excluded.signal_hash,
                updated_at = excluded.updated_at,
                status = excluded.status
            "#,
        )
        .bind(trade.trade_id.to_string())
        .bind(trade.user_id.to_string())
        .bind(&trade.symbol)
        .bind(&trade.side)
        .bind(trade.entry_price)
        .bind(trade.entry_quantity)
        .bind(trade.entry_time)
        .bind(&trade.entry_order_id)
        .bind(trade.entry_commission)
        .bind(trade.exit_price)
        .bind(trade.exit_quantity)
        .bind(trade.exit_time)
        .bind(&trade.exit_order_id)
        .bind(&trade.exit_reason)
        .bind(trade.total_closed_quantity)
        .bind(trade.remaining_quantity)
        .bind(trade.gross_profit)
        .bind(trade.commission)
        .bind(trade.net_profit)
        .bind(trade.stop_loss)
        .bind(trade.take_profit)
        .bind(trade.dca_count)
        .bind(&trade.signal_hash)
        .bind(&trade.source_platform)
        .bind(&trade.source_channel_id)
        .bind(&trade.source_author_name)
        .bind(&trade.source_message_id)
        .bind(trade.created_at)
        .bind(trade.updated_at)
        .bind(&trade.status)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for SqliteLedgerStore {
    async fn find_open_by_symbol(&self, user_id: Uuid, symbol: &str) -> anyhow::Result<Option<Trade>> {
        let row = sqlx::query(
            "SELECT * FROM trades WHERE user_id = ? AND symbol = ? AND status = 'OPEN' LIMIT 1",
        )
        .bind(user_id.to_string())
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            Some(r) => Some(Self::row_to_trade(&r)?),
            None => None,
        })
    }

    async fn exists_by_fingerprint_since(&self, hash: &str, since: DateTime<Utc>) -> anyhow::Result<bool> {
        let row = sqlx::query(
            "SELECT 1 FROM trades WHERE signal_hash = ? AND created_at >= ? LIMIT 1",
        )
        .bind(hash)
        .bind(since)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.is_some())
    }

    async fn insert_trade(&self, trade: &Trade, event: &TradeEvent) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::upsert_trade_tx(&mut tx, trade).await?;
        Self::insert_event_tx(&mut tx, event).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn update_trade(&self, trade: &Trade, event: &TradeEvent) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::upsert_trade_tx(&mut tx, trade).await?;
        Self::insert_event_tx(&mut tx, event).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn append_event(&self, event: &TradeEvent) -> anyhow::Result<()> {
        let mut tx = self.pool.begin().await?;
        Self::insert_event_tx(&mut tx, event).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn find_by_status(&self, user_id: Uuid, status: TradeStatus) -> anyhow::Result<Vec<Trade>> {
        let rows = sqlx::query("SELECT * FROM trades WHERE user_id = ? AND status = ?")
            .bind(user_id.to_string())
            .bind(status.to_string())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_trade).collect::<sqlx::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    async fn find_closed_in_range(
        &self,
        user_id: Uuid,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> anyhow::Result<Vec<Trade>> {
        let rows = sqlx::query(
            "SELECT * FROM trades WHERE user_id = ? AND status = 'CLOSED' AND exit_time >= ? AND exit_time < ?",
        )
        .bind(user_id.to_string())
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_trade).collect::<sqlx::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    async fn find_all_open(&self) -> anyhow::Result<Vec<Trade>> {
        let rows = sqlx::query("SELECT * FROM trades WHERE status = 'OPEN'")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_trade).collect::<sqlx::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    async fn find_by_id(&self, trade_id: Uuid) -> anyhow::Result<Option<Trade>> {
        let row = sqlx::query("SELECT * FROM trades WHERE trade_id = ?")
            .bind(trade_id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        Ok(match row {
            Some(r) => Some(Self::row_to_trade(&r)?),
            None => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExitReason, Side, TradeEventType};

    fn sample_trade(user_id: Uuid, symbol: &str, hash: &str) -> Trade {
        let now = Utc::now();
        Trade {
            trade_id: Uuid::new_v4(),
            user_id,
            symbol: symbol.to_string(),
            side: Side::Long.to_string(),
            entry_price: 95_000.0,
            entry_quantity: 0.1,
            entry_time: now,
            entry_order_id: "order-1".to_string(),
            entry_commission: 1.9,
            exit_price: None,
            exit_quantity: None,
            exit_time: None,
            exit_order_id: None,
            exit_reason: None,
            total_closed_quantity: 0.0,
            remaining_quantity: 0.1,
            gross_profit: 0.0,
            commission: 1.9,
            net_profit: -1.9,
            stop_loss: 93_000.0,
            take_profit: Some(98_000.0),
            dca_count: 0,
            signal_hash: hash.to_string(),
            source_platform: None,
            source_channel_id: None,
            source_author_name: None,
            source_message_id: None,
            created_at: now,
            updated_at: now,
            status: TradeStatus::Open.to_string(),
        }
    }

    fn sample_event(trade_id: Uuid) -> TradeEvent {
        TradeEvent {
            event_id: Uuid::new_v4(),
            trade_id,
            event_type: TradeEventType::EntryPlaced.to_string(),
            timestamp: Utc::now(),
            exchange_order_id: Some("order-1".to_string()),
            side: Some(Side::Long.to_string()),
            order_type: Some("LIMIT".to_string()),
            price: Some(95_000.0),
            quantity: Some(0.1),
            success: true,
            error_message: None,
            detail: None,
            fill_sequence: None,
        }
    }

    #[tokio::test]
    async fn insert_and_find_open_round_trips() {
        let store = SqliteLedgerStore::in_memory().await.unwrap();
        let user_id = Uuid::new_v4();
        let trade = sample_trade(user_id, "BTCUSDT", "hash-a");
        let event = sample_event(trade.trade_id);

        store.insert_trade(&trade, &event).await.unwrap();

        let found = store.find_open_by_symbol(user_id, "BTCUSDT").await.unwrap();
        assert!(found.is_some());
        assert_eq!(found.unwrap().trade_id, trade.trade_id);
    }

    #[tokio::test]
    async fn fingerprint_since_guards_restart_dedup() {
        let store = SqliteLedgerStore::in_memory().await.unwrap();
        let user_id = Uuid::new_v4();
        let trade = sample_trade(user_id, "BTCUSDT", "hash-dup");
        let event = sample_event(trade.trade_id);
        store.insert_trade(&trade, &event).await.unwrap();

        let since = Utc::now() - chrono::Duration::minutes(5);
        assert!(store.exists_by_fingerprint_since("hash-dup", since).await.unwrap());
        assert!(!store.exists_by_fingerprint_since("hash-other", since).await.unwrap());
    }

    #[tokio::test]
    async fn update_trade_transitions_to_closed() {
        let store = SqliteLedgerStore::in_memory().await.unwrap();
        let user_id = Uuid::new_v4();
        let mut trade = sample_trade(user_id, "ETHUSDT", "hash-b");
        let event = sample_event(trade.trade_id);
        store.insert_trade(&trade, &event).await.unwrap();

        trade.status = TradeStatus::Closed.to_string();
        trade.exit_price = Some(93_000.0);
        trade.exit_time = Some(Utc::now());
        trade.exit_reason = Some(ExitReason::StopLoss.to_string());
        trade.remaining_quantity = 0.0;
        trade.total_closed_quantity = 0.1;
        trade.gross_profit = -200.0;
        trade.recompute_net_profit();

        let close_event = TradeEvent {
            event_type: TradeEventType::StreamClose.to_string(),
            ..sample_event(trade.trade_id)
        };
        store.update_trade(&trade, &close_event).await.unwrap();

        let reopened = store.find_open_by_symbol(user_id, "ETHUSDT").await.unwrap();
        assert!(reopened.is_none());

        let fetched = store.find_by_id(trade.trade_id).await.unwrap().unwrap();
        assert_eq!(fetched.status_enum(), TradeStatus::Closed);
        assert!((fetched.net_profit - (-200.0 - 1.9)).abs() < 1e-9);
    }

    #[tokio::test]
    async fn find_all_open_is_cross_user() {
        let store = SqliteLedgerStore::in_memory().await.unwrap();
        let u1 = Uuid::new_v4();
        let u2 = Uuid::new_v4();
        let t1 = sample_trade(u1, "BTCUSDT", "h1");
        let t2 = sample_trade(u2, "ETHUSDT", "h2");
        store.insert_trade(&t1, &sample_event(t1.trade_id)).await.unwrap();
        store.insert_trade(&t2, &sample_event(t2.trade_id)).await.unwrap();

        let all_open = store.find_all_open().await.unwrap();
        assert_eq!(all_open.len(), 2);
    }

    #[tokio::test]
    async fn realized_pnl_in_range_sums_closed_trades() {
        let store = SqliteLedgerStore::in_memory().await.unwrap();
        let user_id = Uuid::new_v4();
        let mut trade = sample_trade(user_id, "BTCUSDT", "h3");
        trade.status = TradeStatus::Closed.to_string();
        trade.exit_time = Some(Utc::now());
        trade.gross_profit = 100.0;
        trade.recompute_net_profit();
        store.insert_trade(&trade, &sample_event(trade.trade_id)).await.unwrap();

        let from = Utc::now() - chrono::Duration::days(1);
        let to = Utc::now() + chrono::Duration::days(1);
        let pnl = store.realized_pnl_in_range(user_id, from, to).await.unwrap();
        assert!((pnl - (100.0 - 1.9)).abs() < 1e-9);
    }
}
