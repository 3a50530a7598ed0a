// =============================================================================
// ExchangeGateway — signed REST client against a Binance-style USD-M
// perpetual futures API (§4.1, §6.2)
// =============================================================================
//
// SECURITY: credentials are never logged or serialized; they are passed in
// by reference at each call site and live only for the duration of that
// call (§9 "thread-local credential carrying" re-architecture point).
//
// Numeric formatting: prices/quantities are rounded *toward zero* to the
// symbol's exchange-reported tick/step size at the request boundary (§4.1).
// A "precision" rejection is never retried without reformatting — callers
// that hit one should refresh the symbol info cache and rebuild the request.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::exchange::rate_limit::RateLimitTracker;
use crate::user_store::ExchangeCredentials;

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// SL/TP placement retry budget (§4.1, §5): at most two retries, 1 s then
/// 3 s delay, total ≤ 8 s including the initial attempt.
const IO_RETRY_DELAYS: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(3)];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }

    /// A long position's entry is a BUY; its protective/closing orders are
    /// SELL, and vice versa for short.
    pub fn from_position_side(side: crate::types::Side) -> Self {
        match side {
            crate::types::Side::Long => OrderSide::Buy,
            crate::types::Side::Short => OrderSide::Sell,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum OrderType {
    Limit,
    Market,
    StopMarket,
    TakeProfitMarket,
}

impl OrderType {
    fn as_str(self) -> &'static str {
        match self {
            OrderType::Limit => "LIMIT",
            OrderType::Market => "MARKET",
            OrderType::StopMarket => "STOP_MARKET",
            OrderType::TakeProfitMarket => "TAKE_PROFIT_MARKET",
        }
    }
}

/// Acknowledgement of a successfully placed order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderAck {
    pub order_id: i64,
    pub client_order_id: String,
    pub filled_qty: f64,
    pub avg_price: f64,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderInfo {
    pub order_id: i64,
    pub client_order_id: String,
    pub symbol: String,
    pub side: String,
    #[serde(rename = "type")]
    pub order_type: String,
    pub status: String,
    pub price: f64,
    pub orig_qty: f64,
    pub executed_qty: f64,
}

/// Exchange-reported precision for one symbol (§4.1.2).
#[derive(Debug, Clone, Copy)]
pub struct SymbolInfo {
    pub tick_size: f64,
    pub step_size: f64,
    pub min_notional: f64,
}

/// Round `value` *down* (toward zero, assuming positive input) to the
/// nearest multiple of `unit`.
pub fn round_to_step(value: f64, unit: f64) -> f64 {
    if unit <= 0.0 {
        return value;
    }
    (value / unit).floor() * unit
}

/// The subset of `ExchangeGateway` that `RiskEvaluator` and
/// `OrderOrchestrator` depend on: account queries, precision lookup, and
/// order placement/cancellation. Split out as a trait so those components
/// can be driven against an in-memory fake in tests instead of a live
/// exchange (§8 P7, scenarios 4/5).
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn get_balance(&self, creds: &ExchangeCredentials) -> Result<f64, crate::error::EngineError>;

    async fn get_mark_price(&self, symbol: &str) -> Result<f64, crate::error::EngineError>;

    async fn get_open_orders(
        &self,
        creds: &ExchangeCredentials,
        symbol: &str,
    ) -> Result<Vec<OrderInfo>, crate::error::EngineError>;

    async fn get_symbol_info(&self, symbol: &str) -> Result<SymbolInfo>;

    async fn set_leverage(
        &self,
        creds: &ExchangeCredentials,
        symbol: &str,
        leverage: u32,
    ) -> Result<(), crate::error::EngineError>;

    async fn place_limit(
        &self,
        creds: &ExchangeCredentials,
        symbol: &str,
        side: OrderSide,
        price: f64,
        qty: f64,
        client_order_id: &str,
    ) -> Result<OrderAck, crate::error::EngineError>;

    async fn place_market(
        &self,
        creds: &ExchangeCredentials,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        client_order_id: &str,
    ) -> Result<OrderAck, crate::error::EngineError>;

    async fn place_stop_market(
        &self,
        creds: &ExchangeCredentials,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        trigger_price: f64,
        client_order_id: &str,
    ) -> Result<OrderAck, crate::error::EngineError>;

    async fn place_take_profit_market(
        &self,
        creds: &ExchangeCredentials,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        trigger_price: f64,
        client_order_id: &str,
    ) -> Result<OrderAck, crate::error::EngineError>;

    async fn cancel_order(
        &self,
        creds: &ExchangeCredentials,
        symbol: &str,
        order_id: i64,
    ) -> Result<(), crate::error::EngineError>;

    async fn cancel_all_orders(&self, creds: &ExchangeCredentials, symbol: &str) -> Result<(), crate::error::EngineError>;
}

/// A thin signer over the exchange's USD-M perpetual futures REST API.
/// Holds no per-user state; safe to share as `Arc<ExchangeGateway>` across
/// every user's concurrent calls.
pub struct ExchangeGateway {
    base_url: String,
    client: reqwest::Client,
    rate_limiter: RateLimitTracker,
    symbol_info: RwLock<HashMap<String, SymbolInfo>>,
}

impl ExchangeGateway {
    pub fn new(base_url: impl Into<String>, connect_timeout: Duration, read_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .build()
            .expect("failed to build reqwest client");

        Self {
            base_url: base_url.into(),
            client,
            rate_limiter: RateLimitTracker::new(),
            symbol_info: RwLock::new(HashMap::new()),
        }
    }

    pub fn rate_limiter(&self) -> &RateLimitTracker {
        &self.rate_limiter
    }

    // -------------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------------

    fn sign(secret: &str, query: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    fn signed_query(creds: &ExchangeCredentials, params: &str) -> String {
        let ts = Self::timestamp_ms();
        let base = if params.is_empty() {
            format!("timestamp={ts}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={ts}&recvWindow={RECV_WINDOW}")
        };
        let sig = Self::sign(&creds.api_secret, &base);
        format!("{base}&signature={sig}")
    }

    fn auth_headers(creds: &ExchangeCredentials) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Ok(v) = HeaderValue::from_str(&creds.api_key) {
            headers.insert("X-MBX-APIKEY", v);
        }
        headers
    }

    /// Classify a transport-level failure (timeout, connection reset) vs an
    /// HTTP-level failure (non-2xx with a body). Only the former is retried
    /// (§4.1 failure semantics).
    async fn send_signed(
        &self,
        method: reqwest::Method,
        path: &str,
        creds: &ExchangeCredentials,
        query: String,
    ) -> Result<serde_json::Value, crate::error::EngineError> {
        let url = format!("{}{}?{}", self.base_url, path, query);

        let resp = self
            .client
            .request(method, &url)
            .headers(Self::auth_headers(creds))
            .send()
            .await
            .map_err(|e| crate::error::EngineError::ExchangeIoError(e.to_string()))?;

        self.rate_limiter.update_from_headers(resp.headers());

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .unwrap_or_else(|_| serde_json::json!({}));

        if !status.is_success() {
            return Err(crate::error::EngineError::ExchangeHttpError {
                status: status.as_u16(),
                body: body.to_string(),
            });
        }

        Ok(body)
    }

    /// Retry wrapper for SL/TP placement per §4.1: I/O faults retried at
    /// most twice with 1 s / 3 s delays; HTTP errors are never retried.
    async fn with_io_retry<F, Fut>(&self, op_name: &str, mut f: F) -> Result<OrderAck, crate::error::EngineError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<OrderAck, crate::error::EngineError>>,
    {
        let mut attempt = 0usize;
        loop {
            match f().await {
                Ok(ack) => return Ok(ack),
                Err(crate::error::EngineError::ExchangeIoError(msg)) => {
                    if attempt >= IO_RETRY_DELAYS.len() {
                        return Err(crate::error::EngineError::ExchangeIoError(msg));
                    }
                    warn!(op = op_name, attempt, error = %msg, "exchange I/O error, retrying");
                    tokio::time::sleep(IO_RETRY_DELAYS[attempt]).await;
                    attempt += 1;
                }
                Err(other) => return Err(other),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Account
    // -------------------------------------------------------------------------

    #[instrument(skip(self, creds), name = "exchange::get_position_amount")]
    pub async fn get_position_amount(
        &self,
        creds: &ExchangeCredentials,
        symbol: &str,
    ) -> Result<f64, crate::error::EngineError> {
        let params = format!("symbol={symbol}");
        let qs = Self::signed_query(creds, &params);
        let body = self
            .send_signed(reqwest::Method::GET, "/fapi/v2/positionRisk", creds, qs)
            .await?;

        let entries = body.as_array().ok_or_else(|| {
            crate::error::EngineError::DataIntegrity("positionRisk response is not an array".into())
        })?;

        for entry in entries {
            if entry["symbol"].as_str() == Some(symbol) {
                let amt = entry["positionAmt"]
                    .as_str()
                    .and_then(|s| s.parse::<f64>().ok())
                    .unwrap_or(0.0);
                return Ok(amt);
            }
        }

        Ok(0.0)
    }

    // -------------------------------------------------------------------------
    // Symbol precision cache (§4.1.2)
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "exchange::get_symbol_info")]
    pub async fn get_symbol_info(&self, symbol: &str) -> Result<SymbolInfo> {
        if let Some(info) = self.symbol_info.read().get(symbol).copied() {
            return Ok(info);
        }

        let url = format!("{}/fapi/v1/exchangeInfo?symbol={}", self.base_url, symbol);
        let resp = self.client.get(&url).send().await.context("exchangeInfo request failed")?;
        let status = resp.status();
        let body: serde_json::Value = resp.json().await.context("failed to parse exchangeInfo")?;
        if !status.is_success() {
            bail!("exchangeInfo returned {}: {}", status, body);
        }

        let entry = body["symbols"]
            .as_array()
            .and_then(|a| a.first())
            .context("symbol not found in exchangeInfo response")?;

        let mut tick_size = 0.01;
        let mut step_size = 0.001;
        let mut min_notional = 5.0;

        if let Some(filters) = entry["filters"].as_array() {
            for f in filters {
                match f["filterType"].as_str() {
                    Some("PRICE_FILTER") => {
                        if let Some(v) = f["tickSize"].as_str().and_then(|s| s.parse().ok()) {
                            tick_size = v;
                        }
                    }
                    Some("LOT_SIZE") => {
                        if let Some(v) = f["stepSize"].as_str().and_then(|s| s.parse().ok()) {
                            step_size = v;
                        }
                    }
                    Some("MIN_NOTIONAL") => {
                        if let Some(v) = f["notional"].as_str().and_then(|s| s.parse().ok()) {
                            min_notional = v;
                        }
                    }
                    _ => {}
                }
            }
        }

        let info = SymbolInfo { tick_size, step_size, min_notional };
        self.symbol_info.write().insert(symbol.to_string(), info);
        Ok(info)
    }

    pub fn invalidate_symbol_info(&self, symbol: &str) {
        self.symbol_info.write().remove(symbol);
    }

    // -------------------------------------------------------------------------
    // Order placement
    // -------------------------------------------------------------------------

    /// Rounds `qty` to the symbol's `step_size` and `price`/`stop_price` to
    /// its `tick_size` before interpolating them into the request — §4.1:
    /// "rounded toward zero to the symbol's exchange-reported precision at
    /// the boundary." A stale/missing precision lookup fails the call
    /// rather than submitting an unrounded value.
    async fn place(
        &self,
        creds: &ExchangeCredentials,
        symbol: &str,
        side: OrderSide,
        order_type: OrderType,
        qty: f64,
        price: Option<f64>,
        stop_price: Option<f64>,
        client_order_id: &str,
    ) -> Result<OrderAck, crate::error::EngineError> {
        let symbol_info = self
            .get_symbol_info(symbol)
            .await
            .map_err(|e| crate::error::EngineError::ExchangeIoError(e.to_string()))?;

        let qty = round_to_step(qty, symbol_info.step_size);
        let price = price.map(|p| round_to_step(p, symbol_info.tick_size));
        let stop_price = stop_price.map(|sp| round_to_step(sp, symbol_info.tick_size));

        let mut params = format!(
            "symbol={symbol}&side={}&type={}&quantity={qty}&newClientOrderId={client_order_id}",
            side.as_str(),
            order_type.as_str(),
        );
        if let Some(p) = price {
            params.push_str(&format!("&price={p}&timeInForce=GTC"));
        }
        if let Some(sp) = stop_price {
            params.push_str(&format!("&stopPrice={sp}&workingType=MARK_PRICE"));
        }

        let qs = Self::signed_query(creds, &params);
        let body = self.send_signed(reqwest::Method::POST, "/fapi/v1/order", creds, qs).await?;

        Ok(OrderAck {
            order_id: body["orderId"].as_i64().unwrap_or(0),
            client_order_id: body["clientOrderId"].as_str().unwrap_or(client_order_id).to_string(),
            filled_qty: body["executedQty"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
            avg_price: body["avgPrice"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
            status: body["status"].as_str().unwrap_or("NEW").to_string(),
        })
    }

    // -------------------------------------------------------------------------
    // User-data stream listen key lifecycle (§4.1, §6.2)
    // -------------------------------------------------------------------------

    #[instrument(skip(self, creds), name = "exchange::start_listen_key")]
    pub async fn start_listen_key(&self, creds: &ExchangeCredentials) -> Result<String, crate::error::EngineError> {
        let url = format!("{}/fapi/v1/listenKey", self.base_url);
        let resp = self
            .client
            .post(&url)
            .headers(Self::auth_headers(creds))
            .send()
            .await
            .map_err(|e| crate::error::EngineError::ExchangeIoError(e.to_string()))?;

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        if !status.is_success() {
            return Err(crate::error::EngineError::ExchangeHttpError {
                status: status.as_u16(),
                body: body.to_string(),
            });
        }

        body["listenKey"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| crate::error::EngineError::DataIntegrity("missing listenKey".into()))
    }

    #[instrument(skip(self, creds), name = "exchange::keepalive_listen_key")]
    pub async fn keepalive_listen_key(&self, creds: &ExchangeCredentials) -> Result<(), crate::error::EngineError> {
        let url = format!("{}/fapi/v1/listenKey", self.base_url);
        let resp = self
            .client
            .put(&url)
            .headers(Self::auth_headers(creds))
            .send()
            .await
            .map_err(|e| crate::error::EngineError::ExchangeIoError(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body: serde_json::Value = resp.json().await.unwrap_or_default();
            return Err(crate::error::EngineError::ExchangeHttpError {
                status: status.as_u16(),
                body: body.to_string(),
            });
        }
        Ok(())
    }

    #[instrument(skip(self, creds), name = "exchange::close_listen_key")]
    pub async fn close_listen_key(&self, creds: &ExchangeCredentials) -> Result<(), crate::error::EngineError> {
        let url = format!("{}/fapi/v1/listenKey", self.base_url);
        self.client
            .delete(&url)
            .headers(Self::auth_headers(creds))
            .send()
            .await
            .map_err(|e| crate::error::EngineError::ExchangeIoError(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl ExchangeApi for ExchangeGateway {
    /// Available USDT balance. Fails loudly on any error — callers must
    /// never substitute zero (§4.1, §4.5 step 2, §7).
    #[instrument(skip(self, creds), name = "exchange::get_balance")]
    async fn get_balance(&self, creds: &ExchangeCredentials) -> Result<f64, crate::error::EngineError> {
        let qs = Self::signed_query(creds, "");
        let body = self
            .send_signed(reqwest::Method::GET, "/fapi/v2/balance", creds, qs)
            .await?;

        let entries = body.as_array().ok_or_else(|| {
            crate::error::EngineError::DataIntegrity("balance response is not an array".into())
        })?;

        for entry in entries {
            if entry["asset"].as_str() == Some("USDT") {
                let free = entry["availableBalance"]
                    .as_str()
                    .and_then(|s| s.parse::<f64>().ok())
                    .or_else(|| entry["availableBalance"].as_f64())
                    .ok_or_else(|| {
                        crate::error::EngineError::DataIntegrity("missing availableBalance".into())
                    })?;
                debug!(free, "balance retrieved");
                return Ok(free);
            }
        }

        Err(crate::error::EngineError::DataIntegrity("USDT balance not present in response".into()))
    }

    #[instrument(skip(self), name = "exchange::get_mark_price")]
    async fn get_mark_price(&self, symbol: &str) -> Result<f64, crate::error::EngineError> {
        let url = format!("{}/fapi/v1/premiumIndex?symbol={}", self.base_url, symbol);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| crate::error::EngineError::ExchangeIoError(e.to_string()))?;

        let status = resp.status();
        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        if !status.is_success() {
            return Err(crate::error::EngineError::ExchangeHttpError {
                status: status.as_u16(),
                body: body.to_string(),
            });
        }

        body["markPrice"]
            .as_str()
            .and_then(|s| s.parse::<f64>().ok())
            .ok_or_else(|| crate::error::EngineError::DataIntegrity("missing markPrice".into()))
    }

    #[instrument(skip(self, creds), name = "exchange::get_open_orders")]
    async fn get_open_orders(
        &self,
        creds: &ExchangeCredentials,
        symbol: &str,
    ) -> Result<Vec<OrderInfo>, crate::error::EngineError> {
        let params = format!("symbol={symbol}");
        let qs = Self::signed_query(creds, &params);
        let body = self
            .send_signed(reqwest::Method::GET, "/fapi/v1/openOrders", creds, qs)
            .await?;

        let entries = body.as_array().cloned().unwrap_or_default();
        let mut orders = Vec::with_capacity(entries.len());
        for e in entries {
            orders.push(OrderInfo {
                order_id: e["orderId"].as_i64().unwrap_or(0),
                client_order_id: e["clientOrderId"].as_str().unwrap_or_default().to_string(),
                symbol: e["symbol"].as_str().unwrap_or_default().to_string(),
                side: e["side"].as_str().unwrap_or_default().to_string(),
                order_type: e["type"].as_str().unwrap_or_default().to_string(),
                status: e["status"].as_str().unwrap_or_default().to_string(),
                price: e["price"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                orig_qty: e["origQty"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
                executed_qty: e["executedQty"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0.0),
            });
        }
        Ok(orders)
    }

    async fn get_symbol_info(&self, symbol: &str) -> Result<SymbolInfo> {
        ExchangeGateway::get_symbol_info(self, symbol).await
    }

    #[instrument(skip(self, creds), name = "exchange::set_leverage")]
    async fn set_leverage(
        &self,
        creds: &ExchangeCredentials,
        symbol: &str,
        leverage: u32,
    ) -> Result<(), crate::error::EngineError> {
        let params = format!("symbol={symbol}&leverage={leverage}");
        let qs = Self::signed_query(creds, &params);
        self.send_signed(reqwest::Method::POST, "/fapi/v1/leverage", creds, qs)
            .await?;
        Ok(())
    }

    #[instrument(skip(self, creds), name = "exchange::place_limit")]
    async fn place_limit(
        &self,
        creds: &ExchangeCredentials,
        symbol: &str,
        side: OrderSide,
        price: f64,
        qty: f64,
        client_order_id: &str,
    ) -> Result<OrderAck, crate::error::EngineError> {
        self.place(creds, symbol, side, OrderType::Limit, qty, Some(price), None, client_order_id).await
    }

    #[instrument(skip(self, creds), name = "exchange::place_market")]
    async fn place_market(
        &self,
        creds: &ExchangeCredentials,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        client_order_id: &str,
    ) -> Result<OrderAck, crate::error::EngineError> {
        self.place(creds, symbol, side, OrderType::Market, qty, None, None, client_order_id).await
    }

    /// Protective stop-loss placement: retried per §4.1 failure semantics.
    #[instrument(skip(self, creds), name = "exchange::place_stop_market")]
    async fn place_stop_market(
        &self,
        creds: &ExchangeCredentials,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        trigger_price: f64,
        client_order_id: &str,
    ) -> Result<OrderAck, crate::error::EngineError> {
        self.with_io_retry("place_stop_market", || {
            self.place(creds, symbol, side, OrderType::StopMarket, qty, None, Some(trigger_price), client_order_id)
        })
        .await
    }

    /// Protective take-profit placement: retried per §4.1 failure semantics.
    #[instrument(skip(self, creds), name = "exchange::place_take_profit_market")]
    async fn place_take_profit_market(
        &self,
        creds: &ExchangeCredentials,
        symbol: &str,
        side: OrderSide,
        qty: f64,
        trigger_price: f64,
        client_order_id: &str,
    ) -> Result<OrderAck, crate::error::EngineError> {
        self.with_io_retry("place_take_profit_market", || {
            self.place(creds, symbol, side, OrderType::TakeProfitMarket, qty, None, Some(trigger_price), client_order_id)
        })
        .await
    }

    #[instrument(skip(self, creds), name = "exchange::cancel_order")]
    async fn cancel_order(
        &self,
        creds: &ExchangeCredentials,
        symbol: &str,
        order_id: i64,
    ) -> Result<(), crate::error::EngineError> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let qs = Self::signed_query(creds, &params);
        self.send_signed(reqwest::Method::DELETE, "/fapi/v1/order", creds, qs).await?;
        Ok(())
    }

    #[instrument(skip(self, creds), name = "exchange::cancel_all_orders")]
    async fn cancel_all_orders(&self, creds: &ExchangeCredentials, symbol: &str) -> Result<(), crate::error::EngineError> {
        let params = format!("symbol={symbol}");
        let qs = Self::signed_query(creds, &params);
        self.send_signed(reqwest::Method::DELETE, "/fapi/v1/allOpenOrders", creds, qs).await?;
        Ok(())
    }
}

impl std::fmt::Debug for ExchangeGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeGateway")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_to_step_truncates_toward_zero() {
        assert!((round_to_step(0.123456, 0.001) - 0.123).abs() < 1e-9);
        assert!((round_to_step(9.999, 1.0) - 9.0).abs() < 1e-9);
    }

    #[test]
    fn round_to_step_handles_zero_unit() {
        assert_eq!(round_to_step(1.2345, 0.0), 1.2345);
    }

    #[test]
    fn order_side_matches_position_direction() {
        assert_eq!(OrderSide::from_position_side(crate::types::Side::Long).as_str(), "BUY");
        assert_eq!(OrderSide::from_position_side(crate::types::Side::Short).as_str(), "SELL");
    }
}
