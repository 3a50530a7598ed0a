// =============================================================================
// Error taxonomy — §7
// =============================================================================
//
// `EngineError` is the typed boundary error: every terminal outcome of an
// orchestrator run converts into exactly one of these variants, which in
// turn converts into exactly one notification (`From<&EngineError> for
// Notification`) and, on the HTTP ingestion path, exactly one status code.
//
// Internal plumbing (config load, DB connection, JSON parsing) still uses
// `anyhow::Result` with `.context(...)` the way the rest of this codebase
// always has; `EngineError` is reserved for the handful of outcomes the
// spec requires callers to be able to match on.
// =============================================================================

use crate::types::{Notification, NotificationScope, NotificationSeverity};

/// Sub-reasons for `RISK_REJECTED`, one per RiskEvaluator gate (§4.5) plus
/// the symbol-fallback ambiguity case (§4.6.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskRejectReason {
    Whitelist,
    NoSl,
    WrongDirection,
    PriceDeviation,
    CircuitBreaker,
    DcaLimit,
    DuplicateOpenOrder,
    SignalDedup,
    MinNotional,
    AmbiguousSymbol,
    NoPositionToDca,
}

impl std::fmt::Display for RiskRejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Whitelist => "WHITELIST",
            Self::NoSl => "NO_SL",
            Self::WrongDirection => "WRONG_DIRECTION",
            Self::PriceDeviation => "PRICE_DEVIATION",
            Self::CircuitBreaker => "CIRCUIT_BREAKER",
            Self::DcaLimit => "DCA_LIMIT",
            Self::DuplicateOpenOrder => "DUPLICATE_OPEN_ORDER",
            Self::SignalDedup => "SIGNAL_DEDUP",
            Self::MinNotional => "MIN_NOTIONAL",
            Self::AmbiguousSymbol => "AMBIGUOUS_SYMBOL",
            Self::NoPositionToDca => "NO_POSITION_TO_DCA",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("risk rejected: {reason} ({detail})")]
    RiskRejected {
        reason: RiskRejectReason,
        detail: String,
    },

    #[error("exchange returned {status}: {body}")]
    ExchangeHttpError { status: u16, body: String },

    #[error("exchange I/O error: {0}")]
    ExchangeIoError(String),

    #[error("data integrity violation: {0}")]
    DataIntegrity(String),

    #[error("fail-safe triggered: {detail}")]
    FailSafeTriggered { detail: String },

    #[error("fail-safe exhausted: {detail}")]
    FailSafeExhausted { detail: String },

    #[error("user-data stream disconnected: {0}")]
    StreamDisconnected(String),
}

impl EngineError {
    /// Every terminal outcome produces exactly one notification (§7).
    pub fn to_notification(&self, user_id: uuid::Uuid) -> Notification {
        let (severity, title) = match self {
            EngineError::RiskRejected { .. } => (NotificationSeverity::Warn, "Trade rejected"),
            EngineError::ExchangeHttpError { .. } => {
                (NotificationSeverity::Error, "Exchange rejected order")
            }
            EngineError::ExchangeIoError(_) => {
                (NotificationSeverity::Error, "Exchange unreachable")
            }
            EngineError::DataIntegrity(_) => {
                (NotificationSeverity::Critical, "Ledger integrity violation")
            }
            EngineError::FailSafeTriggered { .. } => {
                (NotificationSeverity::Warn, "Protective order failed, rolled back")
            }
            EngineError::FailSafeExhausted { .. } => {
                (NotificationSeverity::Critical, "Fail-safe exhausted — manual action required")
            }
            EngineError::StreamDisconnected(_) => {
                (NotificationSeverity::Critical, "User-data stream disconnected")
            }
        };

        Notification {
            scope: NotificationScope::User { user_id },
            title: title.to_string(),
            body: self.to_string(),
            severity,
            tags: vec![],
        }
    }
}

impl axum::response::IntoResponse for EngineError {
    fn into_response(self) -> axum::response::Response {
        use axum::http::StatusCode;

        let status = match &self {
            EngineError::RiskRejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::ExchangeHttpError { .. } | EngineError::ExchangeIoError(_) => {
                StatusCode::BAD_GATEWAY
            }
            EngineError::DataIntegrity(_) | EngineError::FailSafeExhausted { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            EngineError::FailSafeTriggered { .. } => StatusCode::OK,
            EngineError::StreamDisconnected(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}
