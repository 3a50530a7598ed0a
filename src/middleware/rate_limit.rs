// =============================================================================
// Per-IP sliding-window rate limiting — §6.1
// =============================================================================
//
// No external crate: the same hand-rolled atomic-counter idiom this
// codebase's `exchange/rate_limit.rs` already uses for exchange-side limits,
// applied here per source IP instead of per exchange endpoint. A
// `parking_lot::Mutex<HashMap<IpAddr, SlidingWindow>>` per route class is
// cheap enough at this request volume that a dedicated crate (`governor`)
// buys nothing a sibling codebase in this lineage actually reaches for.
// =============================================================================

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, State};
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use parking_lot::Mutex;
use tracing::warn;

/// Fixed 60-second window holding timestamps of admitted requests; once the
/// window's capacity is reached the request is rejected until the oldest
/// timestamp ages out.
struct SlidingWindow {
    hits: Vec<Instant>,
}

impl SlidingWindow {
    fn admit(&mut self, now: Instant, window: Duration, limit: usize) -> bool {
        self.hits.retain(|t| now.duration_since(*t) < window);
        if self.hits.len() >= limit {
            return false;
        }
        self.hits.push(now);
        true
    }
}

/// One named route class (e.g. "broadcast", "trade"), each with its own
/// limit and its own per-IP counters.
#[derive(Clone)]
pub struct RateLimiter {
    limit: usize,
    window: Duration,
    counters: Arc<Mutex<HashMap<IpAddr, SlidingWindow>>>,
    label: &'static str,
}

impl RateLimiter {
    pub fn new(label: &'static str, limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            counters: Arc::new(Mutex::new(HashMap::new())),
            label,
        }
    }

    /// `POST /broadcast-trade`: 10 requests/minute/IP (§6.1).
    pub fn broadcast() -> Self {
        Self::new("broadcast", 10, Duration::from_secs(60))
    }

    /// `POST /execute-trade`: 30 requests/minute/IP (§6.1).
    pub fn trade() -> Self {
        Self::new("trade", 30, Duration::from_secs(60))
    }

    fn admit(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut counters = self.counters.lock();
        let window = self.window;
        let limit = self.limit;
        counters
            .entry(ip)
            .or_insert_with(|| SlidingWindow { hits: Vec::new() })
            .admit(now, window, limit)
    }
}

/// `axum::middleware::from_fn_with_state` body: rejects with 429 once the
/// calling IP exceeds this route class's window. `heartbeat` is deliberately
/// not wrapped with this layer anywhere (§6.1: "heartbeat unlimited").
pub async fn enforce(
    State(limiter): State<RateLimiter>,
    ConnectInfo(addr): ConnectInfo<std::net::SocketAddr>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let ip = addr.ip();
    if !limiter.admit(ip) {
        warn!(ip = %ip, route_class = limiter.label, "rate limit exceeded");
        return (
            StatusCode::TOO_MANY_REQUESTS,
            axum::Json(serde_json::json!({
                "error": format!("rate limit exceeded for {}", limiter.label),
            })),
        )
            .into_response();
    }
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_limit_then_rejects() {
        let limiter = RateLimiter::new("test", 2, Duration::from_secs(60));
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(limiter.admit(ip));
        assert!(limiter.admit(ip));
        assert!(!limiter.admit(ip));
    }

    #[test]
    fn distinct_ips_have_independent_budgets() {
        let limiter = RateLimiter::new("test", 1, Duration::from_secs(60));
        let a: IpAddr = "127.0.0.1".parse().unwrap();
        let b: IpAddr = "127.0.0.2".parse().unwrap();
        assert!(limiter.admit(a));
        assert!(limiter.admit(b));
        assert!(!limiter.admit(a));
    }

    #[test]
    fn window_expiry_resets_budget() {
        let mut w = SlidingWindow { hits: vec![] };
        let t0 = Instant::now();
        assert!(w.admit(t0, Duration::from_millis(10), 1));
        assert!(!w.admit(t0, Duration::from_millis(10), 1));
        let t1 = t0 + Duration::from_millis(20);
        assert!(w.admit(t1, Duration::from_millis(10), 1));
    }
}
