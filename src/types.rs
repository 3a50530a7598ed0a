// =============================================================================
// Shared types used across the relay engine
// =============================================================================

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Balance snapshot for a single asset from the exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceInfo {
    pub asset: String,
    #[serde(default)]
    pub free: f64,
    #[serde(default)]
    pub locked: f64,
}

/// Whether the engine is actively executing intents, paused, or killed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradingMode {
    Live,
    Paused,
    Killed,
}

impl Default for TradingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "Live"),
            Self::Paused => write!(f, "Paused"),
            Self::Killed => write!(f, "Killed"),
        }
    }
}

// ---------------------------------------------------------------------------
// TradeIntent
// ---------------------------------------------------------------------------

/// The action an upstream intent asks the engine to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentAction {
    Entry,
    DcaEntry,
    Close,
    MoveSl,
    Cancel,
    Info,
}

/// Position direction. `None` is only valid for a DCA intent against an
/// existing position, where the side is inferred from that position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// The opposite side — used when placing a protective order, which must
    /// sit on the opposite side of the position it protects.
    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// Audit-only provenance of an intent; never affects execution logic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntentSource {
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
}

/// A parsed, structured trade instruction delivered by the upstream
/// chat-signal parser. Immutable once dispatched; §4.6.6's symbol fallback
/// preprocessing produces a *new* intent value rather than mutating this one
/// in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeIntent {
    pub action: IntentAction,
    /// Required unless `action == Info`.
    #[serde(default)]
    pub symbol: String,
    /// `None` is only legal for `DcaEntry` against an existing position.
    #[serde(default)]
    pub side: Option<Side>,
    #[serde(default)]
    pub entry_price: Option<f64>,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default)]
    pub new_stop_loss: Option<f64>,
    #[serde(default)]
    pub new_take_profit: Option<f64>,
    /// `(0, 1]`; `None` means a full close.
    #[serde(default)]
    pub close_ratio: Option<f64>,
    #[serde(default)]
    pub source: IntentSource,
}

impl TradeIntent {
    /// The value DCA intents use in place of a literal side when computing
    /// a fingerprint (§4.3): `sideOrLiteral("DCA")`.
    pub fn side_or_dca_literal(&self) -> String {
        match self.side {
            Some(s) => s.to_string(),
            None => "DCA".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// EffectiveUserConfig
// ---------------------------------------------------------------------------

/// Per-user configuration resolved at evaluation time: "user override if
/// set, else global default" for every field here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EffectiveUserConfig {
    pub risk_percent: f64,
    pub max_position_notional: f64,
    pub max_daily_loss: f64,
    pub max_dca_per_symbol: u32,
    pub dca_risk_multiplier: f64,
    pub leverage: u32,
    pub allowed_symbols: std::collections::HashSet<String>,
    pub auto_trade_enabled: bool,
}

// ---------------------------------------------------------------------------
// Trade / TradeEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeStatus {
    Open,
    Closed,
    Cancelled,
}

impl std::fmt::Display for TradeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TradeStatus::Open => write!(f, "OPEN"),
            TradeStatus::Closed => write!(f, "CLOSED"),
            TradeStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    SignalClose,
    ManualClose,
    FailSafe,
    StaleCleanup,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self).unwrap_or_default();
        write!(f, "{}", s.as_str().unwrap_or("UNKNOWN"))
    }
}

/// The authoritative ledger row for one "open → (partial closes)* → close"
/// trade lifecycle. At most one row may be OPEN per (userId, symbol) — I2.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Trade {
    pub trade_id: Uuid,
    pub user_id: Uuid,
    pub symbol: String,
    pub side: String,

    pub entry_price: f64,
    pub entry_quantity: f64,
    pub entry_time: chrono::DateTime<chrono::Utc>,
    pub entry_order_id: String,
    pub entry_commission: f64,

    pub exit_price: Option<f64>,
    pub exit_quantity: Option<f64>,
    pub exit_time: Option<chrono::DateTime<chrono::Utc>>,
    pub exit_order_id: Option<String>,
    pub exit_reason: Option<String>,

    pub total_closed_quantity: f64,
    pub remaining_quantity: f64,

    pub gross_profit: f64,
    pub commission: f64,
    pub net_profit: f64,

    pub stop_loss: f64,
    pub take_profit: Option<f64>,

    pub dca_count: i64,
    pub signal_hash: String,

    pub source_platform: Option<String>,
    pub source_channel_id: Option<String>,
    pub source_author_name: Option<String>,
    pub source_message_id: Option<String>,

    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,

    pub status: String,
}

impl Trade {
    /// I3: `netProfit` is derived, never stored stale. Call after any change
    /// to `gross_profit` or `commission`.
    pub fn recompute_net_profit(&mut self) {
        self.net_profit = self.gross_profit - self.commission;
    }

    pub fn status_enum(&self) -> TradeStatus {
        match self.status.as_str() {
            "CLOSED" => TradeStatus::Closed,
            "CANCELLED" => TradeStatus::Cancelled,
            _ => TradeStatus::Open,
        }
    }

    pub fn side_enum(&self) -> Side {
        match self.side.as_str() {
            "SHORT" => Side::Short,
            _ => Side::Long,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeEventType {
    EntryPlaced,
    DcaEntry,
    SlPlaced,
    TpPlaced,
    MoveSl,
    Cancel,
    ClosePlaced,
    PartialClose,
    StreamClose,
    StreamPartialClose,
    SlLost,
    TpLost,
    FailSafe,
    StaleCleanup,
}

impl std::fmt::Display for TradeEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self).unwrap_or_default();
        write!(f, "{}", s.as_str().unwrap_or("UNKNOWN"))
    }
}

/// One append-only audit row per Trade mutation. Never mutated after insert.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TradeEvent {
    pub event_id: Uuid,
    pub trade_id: Uuid,
    pub event_type: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub exchange_order_id: Option<String>,
    pub side: Option<String>,
    pub order_type: Option<String>,
    pub price: Option<f64>,
    pub quantity: Option<f64>,
    pub success: bool,
    pub error_message: Option<String>,
    pub detail: Option<String>,
    /// Fill sequence number, when the exchange provides one — part of the
    /// idempotency key for stream-delivered events (P6).
    pub fill_sequence: Option<i64>,
}

// ---------------------------------------------------------------------------
// Notifications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum NotificationSeverity {
    Info,
    Success,
    Warn,
    Error,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "UPPERCASE")]
pub enum NotificationScope {
    Global,
    User { user_id: Uuid },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub scope: NotificationScope,
    pub title: String,
    pub body: String,
    pub severity: NotificationSeverity,
    #[serde(default)]
    pub tags: Vec<String>,
}
