// =============================================================================
// UserDataStream — private listenKey-based WebSocket feed (§4.1, §6.2)
// =============================================================================
//
// Rebuilt from the original `market_data/trade_stream.rs` connect/reconnect
// idiom, retargeted from the public aggTrade stream to the private
// user-data stream. Delivery is best-effort, at-least-once after a
// reconnect; ordering across reconnects is not guaranteed (consumers must
// be idempotent — see `reconcile.rs`'s P6 handling).
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::exchange::client::ExchangeGateway;
use crate::user_store::ExchangeCredentials;

/// Backoff ladder: 1s, 2s, 4s, 8s, 16s, 32s, 60s (capped).
const BACKOFF_STEPS_SECS: [u64; 7] = [1, 2, 4, 8, 16, 32, 60];
const MAX_RECONNECT_ATTEMPTS: u32 = 20;
const PING_INTERVAL: Duration = Duration::from_secs(20);
const PONG_TIMEOUT: Duration = Duration::from_secs(60);
const LISTEN_KEY_KEEPALIVE: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderTradeUpdateStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct OrderTradeUpdate {
    pub client_order_id: String,
    pub exchange_order_id: i64,
    pub symbol: String,
    pub status: OrderTradeUpdateStatus,
    pub last_fill_qty: f64,
    pub last_fill_price: f64,
    pub realized_pnl: f64,
    pub commission: f64,
    pub fill_sequence: i64,
    pub event_time_ms: i64,
}

#[derive(Debug, Clone)]
pub enum UserDataEvent {
    OrderTradeUpdate(OrderTradeUpdate),
    /// Any other event type (ACCOUNT_UPDATE, MARGIN_CALL, listenKeyExpired)
    /// is passed through as raw JSON; the reconciler only acts on
    /// `OrderTradeUpdate` per §4.8, but the rest is kept for observability.
    Other(serde_json::Value),
}

/// A running user-data stream reader for one user's credentials. Held by
/// the caller (`main.rs`'s per-user spawn loop); dropping the handle's
/// sender side ends the task.
pub struct UserDataStream {
    ws_base_url: String,
}

impl UserDataStream {
    pub fn new(ws_base_url: impl Into<String>) -> Self {
        Self { ws_base_url: ws_base_url.into() }
    }

    /// Runs forever (until `shutdown` resolves), reconnecting on any error
    /// per the spec's backoff ladder. Parsed events are pushed onto `tx`;
    /// the receiver end drives `UserDataReconciler`.
    #[tracing::instrument(skip(self, gateway, creds, tx, shutdown), fields(user_id = %user_id))]
    pub async fn run(
        &self,
        user_id: uuid::Uuid,
        gateway: Arc<ExchangeGateway>,
        creds: ExchangeCredentials,
        tx: mpsc::Sender<UserDataEvent>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut attempt: u32 = 0;

        loop {
            if *shutdown.borrow() {
                return;
            }

            match self.connect_and_pump(&gateway, &creds, &tx, &mut shutdown).await {
                Ok(()) => {
                    // Graceful shutdown requested mid-stream.
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > MAX_RECONNECT_ATTEMPTS {
                        error!(attempts = attempt, error = %e, "user-data stream exhausted reconnect attempts");
                        let _ = tx
                            .send(UserDataEvent::Other(serde_json::json!({
                                "fatal": true,
                                "error": e.to_string(),
                            })))
                            .await;
                        return;
                    }

                    let idx = (attempt as usize - 1).min(BACKOFF_STEPS_SECS.len() - 1);
                    let delay = Duration::from_secs(BACKOFF_STEPS_SECS[idx]);
                    warn!(attempt, delay_secs = delay.as_secs(), error = %e, "user-data stream disconnected, reconnecting");

                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                    continue;
                }
            }

            // Successful reconnect after a prior failure resets the counter
            // and emits a recovered notification via the `Other` channel.
            if attempt > 0 {
                info!(attempt, "user-data stream recovered");
                let _ = tx
                    .send(UserDataEvent::Other(serde_json::json!({ "recovered": true })))
                    .await;
                attempt = 0;
            }
        }
    }

    async fn connect_and_pump(
        &self,
        gateway: &Arc<ExchangeGateway>,
        creds: &ExchangeCredentials,
        tx: &mpsc::Sender<UserDataEvent>,
        shutdown: &mut tokio::sync::watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let listen_key = gateway.start_listen_key(creds).await?;
        let url = format!("{}/ws/{}", self.ws_base_url, listen_key);

        let (ws_stream, _) = tokio_tungstenite::connect_async(&url).await?;
        let (mut write, mut read) = ws_stream.split();
        debug!(%url, "user-data stream connected");

        let mut ping_timer = tokio::time::interval(PING_INTERVAL);
        let mut keepalive_timer = tokio::time::interval(LISTEN_KEY_KEEPALIVE);
        let mut last_pong = tokio::time::Instant::now();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = gateway.close_listen_key(creds).await;
                        return Ok(());
                    }
                }
                _ = ping_timer.tick() => {
                    if last_pong.elapsed() > PONG_TIMEOUT {
                        anyhow::bail!("no pong received within timeout");
                    }
                    write.send(Message::Ping(vec![])).await?;
                }
                _ = keepalive_timer.tick() => {
                    if let Err(e) = gateway.keepalive_listen_key(creds).await {
                        warn!(error = %e, "listenKey keepalive failed");
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            if let Some(event) = parse_event(&text) {
                                if tx.send(event).await.is_err() {
                                    return Ok(());
                                }
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            last_pong = tokio::time::Instant::now();
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            write.send(Message::Pong(payload)).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            anyhow::bail!("server closed connection: {:?}", frame);
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => anyhow::bail!("websocket read error: {e}"),
                        None => anyhow::bail!("websocket stream ended"),
                    }
                }
            }
        }
    }
}

fn parse_event(raw: &str) -> Option<UserDataEvent> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    match value.get("e").and_then(|v| v.as_str()) {
        Some("ORDER_TRADE_UPDATE") => {
            let order = value.get("o")?;
            let status = match order.get("X")?.as_str()? {
                "NEW" => OrderTradeUpdateStatus::New,
                "PARTIALLY_FILLED" => OrderTradeUpdateStatus::PartiallyFilled,
                "FILLED" => OrderTradeUpdateStatus::Filled,
                "CANCELED" => OrderTradeUpdateStatus::Canceled,
                "EXPIRED" => OrderTradeUpdateStatus::Expired,
                "REJECTED" => OrderTradeUpdateStatus::Rejected,
                other => {
                    debug!(status = other, "unrecognized order status, dropping event");
                    return None;
                }
            };

            Some(UserDataEvent::OrderTradeUpdate(OrderTradeUpdate {
                client_order_id: order.get("c")?.as_str()?.to_string(),
                exchange_order_id: order.get("i")?.as_i64()?,
                symbol: order.get("s")?.as_str()?.to_string(),
                status,
                last_fill_qty: order.get("l").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0),
                last_fill_price: order.get("L").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0),
                realized_pnl: order.get("rp").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0),
                commission: order.get("n").and_then(|v| v.as_str()).and_then(|s| s.parse().ok()).unwrap_or(0.0),
                fill_sequence: order.get("t").and_then(|v| v.as_i64()).unwrap_or(0),
                event_time_ms: value.get("E").and_then(|v| v.as_i64()).unwrap_or(0),
            }))
        }
        _ => Some(UserDataEvent::Other(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_order_trade_update_filled() {
        let raw = r#"{
            "e": "ORDER_TRADE_UPDATE",
            "E": 123456789,
            "o": {
                "s": "BTCUSDT",
                "c": "abc-123",
                "i": 5001,
                "X": "FILLED",
                "l": "0.1",
                "L": "95000.0",
                "rp": "10.0",
                "n": "0.95",
                "t": 777
            }
        }"#;

        match parse_event(raw).unwrap() {
            UserDataEvent::OrderTradeUpdate(u) => {
                assert_eq!(u.client_order_id, "abc-123");
                assert_eq!(u.exchange_order_id, 5001);
                assert_eq!(u.status, OrderTradeUpdateStatus::Filled);
                assert!((u.last_fill_price - 95000.0).abs() < 1e-9);
                assert_eq!(u.fill_sequence, 777);
            }
            _ => panic!("expected OrderTradeUpdate"),
        }
    }

    #[test]
    fn unrecognized_event_type_passes_through_as_other() {
        let raw = r#"{"e": "ACCOUNT_UPDATE", "E": 1}"#;
        match parse_event(raw).unwrap() {
            UserDataEvent::Other(v) => assert_eq!(v["e"], "ACCOUNT_UPDATE"),
            _ => panic!("expected Other"),
        }
    }
}
