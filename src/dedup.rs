// =============================================================================
// Dedup & Idempotency Registry (C3) — §4.3
// =============================================================================
//
// Two independent tiers with identical structure but different scopes:
// signal-layer (BroadcastDispatcher entry), per-user (OrderOrchestrator
// entry), and CANCEL (30s window, per symbol). All three share the same
// atomic put-if-absent check; only the fingerprint formula and TTL differ
// at the call site.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use hex::encode as hex_encode;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

/// In-memory map is swept once its size crosses this threshold (§4.3 step 5).
const SWEEP_THRESHOLD: usize = 500;

pub const SIGNAL_LAYER_TTL: Duration = Duration::from_secs(5 * 60);
pub const PER_USER_TTL: Duration = Duration::from_secs(5 * 60);
pub const CANCEL_TTL: Duration = Duration::from_secs(30);

/// Outcome of a dedup check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupOutcome {
    /// First observation, or a prior observation has expired — proceed.
    NotDuplicate,
    /// Seen within the window — reject.
    Duplicate,
}

struct Inner {
    map: HashMap<String, Instant>,
}

/// The in-memory tier of the registry. A single instance is shared across
/// all three scopes (signal-layer, per-user, CANCEL); callers pass distinct
/// fingerprints and windows so the scopes never collide on a key.
pub struct DedupRegistry {
    inner: Mutex<Inner>,
    enabled: std::sync::atomic::AtomicBool,
}

impl DedupRegistry {
    pub fn new(enabled: bool) -> Self {
        Self {
            inner: Mutex::new(Inner { map: HashMap::new() }),
            enabled: std::sync::atomic::AtomicBool::new(enabled),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, std::sync::atomic::Ordering::Relaxed);
    }

    /// §4.3 check algorithm, steps 1-3 and 5 (the in-memory half). Step 4
    /// (the persistent existence query) is the caller's responsibility for
    /// the signal-layer tier, since only that tier consults `LedgerStore`.
    pub fn check(&self, fingerprint: &str, window: Duration, now: Instant) -> DedupOutcome {
        if !self.enabled.load(std::sync::atomic::Ordering::Relaxed) {
            return DedupOutcome::NotDuplicate;
        }

        let mut inner = self.inner.lock();

        let outcome = match inner.map.get(fingerprint).copied() {
            Some(prev) if now.duration_since(prev) < window => DedupOutcome::Duplicate,
            _ => DedupOutcome::NotDuplicate,
        };

        // Refresh or insert regardless of outcome — a pass refreshes the
        // timestamp just as a miss installs one (step 1/3).
        inner.map.insert(fingerprint.to_string(), now);

        if inner.map.len() > SWEEP_THRESHOLD {
            let before = inner.map.len();
            inner.map.retain(|_, t| now.duration_since(*t) < window);
            debug!(before, after = inner.map.len(), "dedup registry swept");
        }

        outcome
    }
}

// =============================================================================
// Fingerprint formulas — §4.3
// =============================================================================

fn sha256_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parts.join("|").as_bytes());
    hex_encode(hasher.finalize())
}

/// `entryPriceLow`: the entry price bucketed to 2dp so immaterial float
/// noise does not produce distinct hashes for what is the same signal.
fn price_bucket(price: Option<f64>) -> String {
    match price {
        Some(p) => format!("{:.2}", p),
        None => "null".to_string(),
    }
}

/// `SHA-256( symbol | sideOrLiteral("DCA") | entryPriceLow | stopLoss )`
pub fn signal_fingerprint(symbol: &str, side_or_dca: &str, entry_price: Option<f64>, stop_loss: Option<f64>) -> String {
    sha256_hex(&[symbol, side_or_dca, &price_bucket(entry_price), &price_bucket(stop_loss)])
}

/// `SHA-256( userId | symbol | sideOrLiteral("DCA") | entryPriceLow | stopLoss )`
pub fn per_user_fingerprint(
    user_id: Uuid,
    symbol: &str,
    side_or_dca: &str,
    entry_price: Option<f64>,
    stop_loss: Option<f64>,
) -> String {
    let user = user_id.to_string();
    sha256_hex(&[&user, symbol, side_or_dca, &price_bucket(entry_price), &price_bucket(stop_loss)])
}

/// `"CANCEL|" + symbol`
pub fn cancel_fingerprint(symbol: &str) -> String {
    format!("CANCEL|{symbol}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_observation_is_not_duplicate() {
        let reg = DedupRegistry::new(true);
        let now = Instant::now();
        assert_eq!(
            reg.check("abc", SIGNAL_LAYER_TTL, now),
            DedupOutcome::NotDuplicate
        );
    }

    #[test]
    fn repeat_within_window_is_duplicate() {
        let reg = DedupRegistry::new(true);
        let now = Instant::now();
        reg.check("abc", SIGNAL_LAYER_TTL, now);
        let later = now + Duration::from_secs(60);
        assert_eq!(reg.check("abc", SIGNAL_LAYER_TTL, later), DedupOutcome::Duplicate);
    }

    #[test]
    fn repeat_after_window_is_not_duplicate() {
        let reg = DedupRegistry::new(true);
        let now = Instant::now();
        reg.check("abc", CANCEL_TTL, now);
        let later = now + Duration::from_secs(31);
        assert_eq!(reg.check("abc", CANCEL_TTL, later), DedupOutcome::NotDuplicate);
    }

    #[test]
    fn disabled_registry_never_reports_duplicate() {
        let reg = DedupRegistry::new(false);
        let now = Instant::now();
        reg.check("abc", SIGNAL_LAYER_TTL, now);
        assert_eq!(reg.check("abc", SIGNAL_LAYER_TTL, now), DedupOutcome::NotDuplicate);
    }

    #[test]
    fn fingerprints_differ_by_scope() {
        let user = Uuid::new_v4();
        let signal = signal_fingerprint("BTCUSDT", "LONG", Some(95_000.0), Some(93_000.0));
        let per_user = per_user_fingerprint(user, "BTCUSDT", "LONG", Some(95_000.0), Some(93_000.0));
        assert_ne!(signal, per_user);
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let a = signal_fingerprint("BTCUSDT", "LONG", Some(95_000.0), Some(93_000.0));
        let b = signal_fingerprint("BTCUSDT", "LONG", Some(95_000.0), Some(93_000.0));
        assert_eq!(a, b);
    }

    #[test]
    fn cancel_fingerprint_format() {
        assert_eq!(cancel_fingerprint("BTCUSDT"), "CANCEL|BTCUSDT");
    }

    #[test]
    fn dca_literal_used_when_side_absent() {
        let with_side = signal_fingerprint("BTCUSDT", "LONG", Some(95_000.0), Some(93_000.0));
        let dca = signal_fingerprint("BTCUSDT", "DCA", Some(95_000.0), Some(93_000.0));
        assert_ne!(with_side, dca);
    }
}
