//! Credential pool: per-provider collection of OAuth credentials with
//! activation, selection, refresh, error accounting, and quarantine.
//!
//! A `RwLock<HashMap<...>>`-guarded state struct backs the pool so that
//! each mutating operation (activation, error accounting, restoration) is
//! atomic under concurrent requests.

use crate::config::ProviderTag;
use crate::{Error, Result};
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Number of accumulated errors after which a credential is quarantined
/// (moved out of the selectable set).
pub const ERROR_QUARANTINE_THRESHOLD: u32 = 5;

/// One OAuth-based credential for an upstream provider.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: String,
    pub provider: ProviderTag,
    pub display_name: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix millis when `access_token` expires.
    pub expires_at: i64,
    pub auth_method: String,
    pub region: Option<String>,
    pub profile_id: Option<String>,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub active: bool,
    pub created_at: i64,
    pub updated_at: i64,
    /// Number of times this credential has been leased for an outbound
    /// request.
    pub use_count: u64,
}

impl Credential {
    pub fn new(provider: ProviderTag, display_name: impl Into<String>, access_token: impl Into<String>) -> Self {
        let now = now_millis();
        Self {
            id: Uuid::new_v4().to_string(),
            provider,
            display_name: display_name.into(),
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: 0,
            auth_method: "oauth".to_string(),
            region: None,
            profile_id: None,
            error_count: 0,
            last_error: None,
            active: false,
            created_at: now,
            updated_at: now,
            use_count: 0,
        }
    }

    /// True once `error_count` crosses the quarantine threshold.
    pub fn is_quarantined(&self) -> bool {
        self.error_count >= ERROR_QUARANTINE_THRESHOLD
    }

    /// True if the stored access token is missing or past its embedded
    /// expiry.
    pub fn needs_refresh(&self) -> bool {
        self.access_token.is_empty() || now_millis() >= self.expires_at
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Per-provider pool of [`Credential`]s with activation, selection, and
/// quarantine semantics.
///
/// One `CredentialPool` instance is scoped to a single provider; a gateway
/// fronting K/W/O holds three instances, keyed externally by [`ProviderTag`].
pub struct CredentialPool {
    provider: ProviderTag,
    live: RwLock<HashMap<String, Credential>>,
    /// Insertion order, oldest first — used by the "first in creation order"
    /// fallback-selection rule.
    order: RwLock<Vec<String>>,
    quarantined: RwLock<HashMap<String, Credential>>,
}

impl CredentialPool {
    pub fn new(provider: ProviderTag) -> Self {
        Self {
            provider,
            live: RwLock::new(HashMap::new()),
            order: RwLock::new(Vec::new()),
            quarantined: RwLock::new(HashMap::new()),
        }
    }

    pub fn provider(&self) -> ProviderTag {
        self.provider
    }

    pub async fn add(&self, credential: Credential) -> Result<String> {
        let id = credential.id.clone();
        self.order.write().await.push(id.clone());
        self.live.write().await.insert(id.clone(), credential);
        Ok(id)
    }

    pub async fn list(&self) -> Vec<Credential> {
        let order = self.order.read().await;
        let live = self.live.read().await;
        order.iter().filter_map(|id| live.get(id).cloned()).collect()
    }

    pub async fn get_by_id(&self, id: &str) -> Option<Credential> {
        self.live.read().await.get(id).cloned()
    }

    pub async fn get_by_name(&self, name: &str) -> Option<Credential> {
        self.live
            .read()
            .await
            .values()
            .find(|c| c.display_name == name)
            .cloned()
    }

    pub async fn update(&self, id: &str, f: impl FnOnce(&mut Credential)) -> Result<()> {
        let mut live = self.live.write().await;
        let credential = live
            .get_mut(id)
            .ok_or_else(|| Error::validation(format!("unknown credential id: {id}")))?;
        f(credential);
        credential.updated_at = now_millis();
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.live.write().await.remove(id);
        self.quarantined.write().await.remove(id);
        self.order.write().await.retain(|x| x != id);
        Ok(())
    }

    /// Mark `id` active, clearing `active` on every other live credential in
    /// this pool. At most one active credential per provider at a time.
    pub async fn set_active(&self, id: &str) -> Result<()> {
        let mut live = self.live.write().await;
        if !live.contains_key(id) {
            return Err(Error::validation(format!("unknown credential id: {id}")));
        }
        for (cid, credential) in live.iter_mut() {
            credential.active = cid == id;
        }
        Ok(())
    }

    pub async fn get_active(&self) -> Option<Credential> {
        self.live.read().await.values().find(|c| c.active).cloned()
    }

    /// Select a credential for outbound use: prefer the active one; else the
    /// first in creation order; else fail. Skips quarantined credentials
    /// (they live in a separate bucket already).
    pub async fn get_random_active(&self) -> Result<Credential> {
        if let Some(active) = self.get_active().await {
            return Ok(active);
        }

        let order = self.order.read().await;
        let live = self.live.read().await;
        order
            .iter()
            .find_map(|id| live.get(id).cloned())
            .ok_or_else(|| Error::auth(format!("no credential available for provider {:?}", self.provider)))
    }

    /// Increment a credential's error count; quarantine it once the count
    /// crosses [`ERROR_QUARANTINE_THRESHOLD`].
    pub async fn increment_error_count(&self, id: &str, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        let mut live = self.live.write().await;
        let credential = live
            .get_mut(id)
            .ok_or_else(|| Error::validation(format!("unknown credential id: {id}")))?;
        credential.error_count += 1;
        credential.last_error = Some(reason);
        credential.updated_at = now_millis();

        if credential.is_quarantined() {
            tracing::warn!(credential_id = %id, provider = ?self.provider, "quarantining credential after repeated errors");
            let mut quarantined = credential.clone();
            quarantined.active = false;
            live.remove(id);
            drop(live);
            self.quarantined.write().await.insert(id.to_string(), quarantined);
            self.order.write().await.retain(|x| x != id);
        }

        Ok(())
    }

    pub async fn reset_error_count(&self, id: &str) -> Result<()> {
        self.update(id, |c| {
            c.error_count = 0;
            c.last_error = None;
        })
        .await
    }

    pub async fn get_errors(&self) -> Vec<Credential> {
        self.quarantined.read().await.values().cloned().collect()
    }

    pub async fn delete_error(&self, id: &str) -> Result<()> {
        self.quarantined.write().await.remove(id);
        Ok(())
    }

    /// Restore a quarantined credential with a (possibly refreshed) token,
    /// re-inserting it with `error_count = 0`.
    pub async fn restore_from_error(&self, id: &str, access_token: impl Into<String>, expires_at: i64) -> Result<()> {
        let mut credential = self
            .quarantined
            .write()
            .await
            .remove(id)
            .ok_or_else(|| Error::validation(format!("no quarantined credential with id: {id}")))?;

        credential.access_token = access_token.into();
        credential.expires_at = expires_at;
        credential.error_count = 0;
        credential.last_error = None;
        credential.updated_at = now_millis();

        self.order.write().await.push(id.to_string());
        self.live.write().await.insert(id.to_string(), credential);
        tracing::info!(credential_id = %id, "restored credential from error bucket");
        Ok(())
    }

    /// Atomically replace a credential's access token and expiry, the token
    /// refresh success path.
    pub async fn update_token(&self, id: &str, access_token: impl Into<String>, expires_at: i64) -> Result<()> {
        self.update(id, |c| {
            c.access_token = access_token.into();
            c.expires_at = expires_at;
        })
        .await
    }

    /// Record one lease of this credential for an outbound request.
    pub async fn increment_use_count(&self, id: &str) -> Result<()> {
        self.update(id, |c| c.use_count += 1).await
    }

    /// Returns a freshly-valid access token for `id`, refreshing first if
    /// needed. `refresh` is the caller-supplied OAuth refresh call (the
    /// actual HTTP round trip lives outside this pool; only invoked here,
    /// not implemented here).
    ///
    /// This is the single funnel that breaks the cyclic refresh dependency
    /// between engine and pool: callers never cache a token past one call,
    /// they always ask the pool for a fresh one.
    pub async fn fresh_access_token<F, Fut>(&self, id: &str, refresh: F) -> Result<String>
    where
        F: FnOnce(String) -> Fut,
        Fut: std::future::Future<Output = Result<(String, i64)>>,
    {
        let credential = self
            .get_by_id(id)
            .await
            .ok_or_else(|| Error::validation(format!("unknown credential id: {id}")))?;

        if !credential.needs_refresh() {
            return Ok(credential.access_token);
        }

        let refresh_token = credential
            .refresh_token
            .clone()
            .ok_or_else(|| Error::auth("credential has no refresh token to renew an expired access token"))?;

        match refresh(refresh_token).await {
            Ok((access_token, expires_at)) => {
                self.update_token(id, access_token.clone(), expires_at).await?;
                Ok(access_token)
            }
            Err(err) => {
                self.increment_error_count(id, err.to_string()).await?;
                Err(Error::auth(format!("token refresh failed: {err}")))
            }
        }
    }
}
