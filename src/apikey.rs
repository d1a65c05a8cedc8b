//! API keys and the quota/limit engine.
//!
//! Same `RwLock`/`Arc` concurrent-state pattern as [`crate::credential`].
//! Day/month rollover uses UTC day boundaries (the display layer is
//! responsible for any local-time conversion), via `chrono`.

use crate::{Error, Result};
use chrono::{DateTime, Datelike, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// An API key's configured limits and live usage counters.
#[derive(Debug, Clone)]
pub struct ApiKey {
    pub id: String,
    pub display_name: String,
    pub key_value: String,
    pub active: bool,

    pub daily_limit: u64,
    pub monthly_limit: u64,
    pub total_limit: u64,
    pub concurrent_limit: u64,
    pub daily_cost_limit: f64,
    pub monthly_cost_limit: f64,
    pub total_cost_limit: f64,
    pub expires_in_days: u64,

    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,

    pub daily_requests: u64,
    pub monthly_requests: u64,
    pub total_requests: u64,
    pub current_concurrent: u64,
    pub daily_cost: f64,
    pub monthly_cost: f64,
    pub total_cost: f64,

    /// UTC date the daily counters were last reset; used for lazy rollover.
    daily_reset_date: DateTime<Utc>,
    /// UTC (year, month) the monthly counters were last reset.
    monthly_reset_period: (i32, u32),
}

impl ApiKey {
    pub fn new(display_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            display_name: display_name.into(),
            key_value: Uuid::new_v4().to_string(),
            active: true,
            daily_limit: 0,
            monthly_limit: 0,
            total_limit: 0,
            concurrent_limit: 0,
            daily_cost_limit: 0.0,
            monthly_cost_limit: 0.0,
            total_cost_limit: 0.0,
            expires_in_days: 0,
            created_at: now,
            last_used_at: None,
            daily_requests: 0,
            monthly_requests: 0,
            total_requests: 0,
            current_concurrent: 0,
            daily_cost: 0.0,
            monthly_cost: 0.0,
            total_cost: 0.0,
            daily_reset_date: now,
            monthly_reset_period: (now.year(), now.month()),
        }
    }

    /// Reset daily/monthly counters if the UTC day/month boundary has passed
    /// since the last admission.
    fn roll_over_if_needed(&mut self, now: DateTime<Utc>) {
        if now.date_naive() != self.daily_reset_date.date_naive() {
            self.daily_requests = 0;
            self.daily_cost = 0.0;
            self.daily_reset_date = now;
        }
        let period = (now.year(), now.month());
        if period != self.monthly_reset_period {
            self.monthly_requests = 0;
            self.monthly_cost = 0.0;
            self.monthly_reset_period = period;
        }
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_in_days > 0
            && now > self.created_at + chrono::Duration::days(self.expires_in_days as i64)
    }
}

/// Names the specific limit a rejected admission hit, surfaced as a 429 with
/// the limit name attached.
pub type LimitName = &'static str;

/// Per-API-key admission/accounting engine.
pub struct QuotaEngine {
    keys: RwLock<HashMap<String, ApiKey>>,
}

impl Default for QuotaEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl QuotaEngine {
    pub fn new() -> Self {
        Self {
            keys: RwLock::new(HashMap::new()),
        }
    }

    pub async fn create(&self, key: ApiKey) -> String {
        let id = key.id.clone();
        self.keys.write().await.insert(id.clone(), key);
        id
    }

    pub async fn list(&self) -> Vec<ApiKey> {
        self.keys.read().await.values().cloned().collect()
    }

    pub async fn get_by_id(&self, id: &str) -> Option<ApiKey> {
        self.keys.read().await.get(id).cloned()
    }

    pub async fn get_by_value(&self, key_value: &str) -> Option<ApiKey> {
        self.keys.read().await.values().find(|k| k.key_value == key_value).cloned()
    }

    pub async fn toggle(&self, id: &str, active: bool) -> Result<()> {
        let mut keys = self.keys.write().await;
        let key = keys
            .get_mut(id)
            .ok_or_else(|| Error::validation(format!("unknown api key id: {id}")))?;
        key.active = active;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.keys.write().await.remove(id);
        Ok(())
    }

    pub async fn update_limits(&self, id: &str, f: impl FnOnce(&mut ApiKey)) -> Result<()> {
        let mut keys = self.keys.write().await;
        let key = keys
            .get_mut(id)
            .ok_or_else(|| Error::validation(format!("unknown api key id: {id}")))?;
        f(key);
        Ok(())
    }

    /// Evaluate admission for `key_value` and, if admitted, atomically
    /// increment `current_concurrent`. Returns an [`AdmissionGuard`] whose
    /// `complete` must be called exactly once on request completion to
    /// decrement concurrency and record usage.
    pub async fn admit(&self, key_value: &str) -> Result<AdmissionGuard> {
        let now = Utc::now();
        let mut keys = self.keys.write().await;
        let key = keys
            .values_mut()
            .find(|k| k.key_value == key_value)
            .ok_or_else(|| Error::auth("unknown API key"))?;

        if !key.active {
            return Err(Error::auth("API key is disabled"));
        }

        key.roll_over_if_needed(now);

        if key.is_expired(now) {
            return Err(Error::auth("API key has expired"));
        }

        if let Some(limit) = Self::check_limits(key) {
            tracing::warn!(api_key_id = %key.id, limit, "quota admission rejected");
            return Err(Error::quota(limit));
        }

        key.current_concurrent += 1;
        key.last_used_at = Some(now);

        Ok(AdmissionGuard {
            key_id: key.id.clone(),
        })
    }

    fn check_limits(key: &ApiKey) -> Option<LimitName> {
        if key.daily_limit > 0 && key.daily_requests >= key.daily_limit {
            return Some("dailyLimit");
        }
        if key.monthly_limit > 0 && key.monthly_requests >= key.monthly_limit {
            return Some("monthlyLimit");
        }
        if key.total_limit > 0 && key.total_requests >= key.total_limit {
            return Some("totalLimit");
        }
        if key.daily_cost_limit > 0.0 && key.daily_cost >= key.daily_cost_limit {
            return Some("dailyCostLimit");
        }
        if key.monthly_cost_limit > 0.0 && key.monthly_cost >= key.monthly_cost_limit {
            return Some("monthlyCostLimit");
        }
        if key.total_cost_limit > 0.0 && key.total_cost >= key.total_cost_limit {
            return Some("totalCostLimit");
        }
        if key.concurrent_limit > 0 && key.current_concurrent >= key.concurrent_limit {
            return Some("concurrentLimit");
        }
        None
    }

    /// Complete an admitted request: decrement `current_concurrent` exactly
    /// once and record one request plus `cost` (0.0 if unknown) against the
    /// request/cost counters.
    pub async fn complete(&self, guard: AdmissionGuard, cost: f64) -> Result<()> {
        let mut keys = self.keys.write().await;
        let key = keys
            .get_mut(&guard.key_id)
            .ok_or_else(|| Error::validation("api key disappeared mid-request"))?;

        key.current_concurrent = key.current_concurrent.saturating_sub(1);
        key.daily_requests += 1;
        key.monthly_requests += 1;
        key.total_requests += 1;
        key.daily_cost += cost;
        key.monthly_cost += cost;
        key.total_cost += cost;
        Ok(())
    }

    /// Read-only status snapshot for the store's `getLimitsStatus` op.
    pub async fn limits_status(&self, id: &str) -> Option<ApiKey> {
        self.keys.read().await.get(id).cloned()
    }
}

/// Proof of an admitted request; must be passed to [`QuotaEngine::complete`]
/// exactly once so `current_concurrent` returns to its pre-admission value
/// after completion.
#[derive(Debug)]
pub struct AdmissionGuard {
    key_id: String,
}

impl AdmissionGuard {
    pub fn key_id(&self) -> &str {
        &self.key_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_admit_and_complete_round_trip() {
        let engine = QuotaEngine::new();
        let key = ApiKey::new("test-key");
        let key_value = key.key_value.clone();
        let id = engine.create(key).await;

        let guard = engine.admit(&key_value).await.unwrap();
        assert_eq!(engine.get_by_id(&id).await.unwrap().current_concurrent, 1);

        engine.complete(guard, 0.0).await.unwrap();
        let after = engine.get_by_id(&id).await.unwrap();
        assert_eq!(after.current_concurrent, 0);
        assert_eq!(after.daily_requests, 1);
        assert_eq!(after.monthly_requests, 1);
        assert_eq!(after.total_requests, 1);
    }

    #[tokio::test]
    async fn test_daily_limit_rejects() {
        let engine = QuotaEngine::new();
        let mut key = ApiKey::new("limited");
        key.daily_limit = 1;
        let key_value = key.key_value.clone();
        engine.create(key).await;

        let guard = engine.admit(&key_value).await.unwrap();
        engine.complete(guard, 0.0).await.unwrap();

        let err = engine.admit(&key_value).await.unwrap_err();
        assert!(matches!(err, Error::Quota { limit: "dailyLimit" }));
    }

    #[tokio::test]
    async fn test_concurrent_limit_rejects_while_in_flight() {
        let engine = QuotaEngine::new();
        let mut key = ApiKey::new("concurrent-limited");
        key.concurrent_limit = 1;
        let key_value = key.key_value.clone();
        engine.create(key).await;

        let _guard = engine.admit(&key_value).await.unwrap();
        let err = engine.admit(&key_value).await.unwrap_err();
        assert!(matches!(err, Error::Quota { limit: "concurrentLimit" }));
    }

    #[tokio::test]
    async fn test_disabled_key_rejected() {
        let engine = QuotaEngine::new();
        let mut key = ApiKey::new("disabled");
        key.active = false;
        let key_value = key.key_value.clone();
        engine.create(key).await;

        assert!(engine.admit(&key_value).await.is_err());
    }

    #[tokio::test]
    async fn test_expired_key_rejected() {
        let engine = QuotaEngine::new();
        let mut key = ApiKey::new("expired");
        key.expires_in_days = 1;
        key.created_at = Utc::now() - chrono::Duration::days(2);
        let key_value = key.key_value.clone();
        engine.create(key).await;

        assert!(engine.admit(&key_value).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_key_rejected() {
        let engine = QuotaEngine::new();
        assert!(engine.admit("nonexistent").await.is_err());
    }

    #[test]
    fn test_roll_over_resets_daily_counters_on_new_day() {
        let mut key = ApiKey::new("rollover");
        key.daily_requests = 10;
        key.daily_reset_date = Utc::now() - chrono::Duration::days(1);

        key.roll_over_if_needed(Utc::now());
        assert_eq!(key.daily_requests, 0);
    }
}
