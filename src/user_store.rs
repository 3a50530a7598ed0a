// =============================================================================
// UserStore — the integration seam for externally-owned user state (§6.3)
// =============================================================================
//
// Users, credentials, subscriptions, and per-user overrides live in tables
// this service does not own (§1 out-of-scope list). `UserStore` is the trait
// BroadcastDispatcher and RiskEvaluator code against to get "enumerate
// eligible users", "fetch credentials", "fetch overrides" without reaching
// into that external schema directly. `InMemoryUserStore` is a test double;
// a real deployment swaps in an implementation reading the dashboard's
// actual tables.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::config::UserConfigOverride;

/// Exchange API credentials for one user. Never logged.
#[derive(Clone)]
pub struct ExchangeCredentials {
    pub api_key: String,
    pub api_secret: String,
}

impl std::fmt::Debug for ExchangeCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeCredentials")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .finish()
    }
}

/// One subscriber eligible (or not) for auto-trade fan-out.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub user_id: Uuid,
    pub has_exchange_credentials: bool,
    pub subscription_active: bool,
    pub credentials: Option<ExchangeCredentials>,
    pub overrides: UserConfigOverride,
}

#[async_trait::async_trait]
pub trait UserStore: Send + Sync {
    /// Users where `autoTradeEnabled` (from the resolved effective config)
    /// still needs to be checked by the caller — this only filters on the
    /// externally-owned eligibility facts (§4.7 step 2): credentials present
    /// and subscription active.
    async fn eligible_for_broadcast(&self) -> anyhow::Result<Vec<UserRecord>>;

    async fn get(&self, user_id: Uuid) -> anyhow::Result<Option<UserRecord>>;
}

#[derive(Default)]
pub struct InMemoryUserStore {
    users: RwLock<HashMap<Uuid, UserRecord>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert(&self, record: UserRecord) {
        self.users.write().insert(record.user_id, record);
    }

    pub fn remove(&self, user_id: Uuid) {
        self.users.write().remove(&user_id);
    }
}

#[async_trait::async_trait]
impl UserStore for InMemoryUserStore {
    async fn eligible_for_broadcast(&self) -> anyhow::Result<Vec<UserRecord>> {
        Ok(self
            .users
            .read()
            .values()
            .filter(|u| u.has_exchange_credentials && u.subscription_active)
            .cloned()
            .collect())
    }

    async fn get(&self, user_id: Uuid) -> anyhow::Result<Option<UserRecord>> {
        Ok(self.users.read().get(&user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(user_id: Uuid, creds: bool, sub: bool) -> UserRecord {
        UserRecord {
            user_id,
            has_exchange_credentials: creds,
            subscription_active: sub,
            credentials: if creds {
                Some(ExchangeCredentials {
                    api_key: "k".into(),
                    api_secret: "s".into(),
                })
            } else {
                None
            },
            overrides: UserConfigOverride::default(),
        }
    }

    #[tokio::test]
    async fn only_credentialed_active_subscribers_are_eligible() {
        let store = InMemoryUserStore::new();
        let eligible = Uuid::new_v4();
        let no_creds = Uuid::new_v4();
        let inactive = Uuid::new_v4();

        store.upsert(record(eligible, true, true));
        store.upsert(record(no_creds, false, true));
        store.upsert(record(inactive, true, false));

        let result = store.eligible_for_broadcast().await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].user_id, eligible);
    }

    #[tokio::test]
    async fn get_returns_none_for_unknown_user() {
        let store = InMemoryUserStore::new();
        assert!(store.get(Uuid::new_v4()).await.unwrap().is_none());
    }
}
