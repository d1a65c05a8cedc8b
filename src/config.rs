//! # Configuration Helpers for the Gateway Core
//!
//! This module provides the provider-tag enum, the handful of environment
//! variables that are this core's only configuration surface, and the
//! shared HTTP client builder every `ChatEngine` uses to construct its own
//! owned transport.
//!
//! ## Environment Variables
//!
//! - `GATEWAY_HTTP_PROXY`: optional HTTP(S) proxy URL for outbound traffic.
//! - `GATEWAY_MACHINE_ID_SEED`: machine-identity seed, hashed via SHA-256 to
//!   produce the Upstream-K user-agent's machine-id component.
//! - `GATEWAY_BASE_URL_K` / `GATEWAY_BASE_URL_W` / `GATEWAY_BASE_URL_O`:
//!   per-provider base URL overrides.

use crate::{Error, Result};
use sha2::{Digest, Sha256};
use std::env;
use std::time::Duration;

/// Per-host idle-connection cap each engine's transport is built with. The
/// matching "active" half of the cap is enforced by each engine's own
/// concurrency limiter, not by `reqwest`, which has no knob for it.
pub const POOL_MAX_IDLE_PER_HOST: usize = 5;

/// Default request timeout for each engine's owned transport.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Tags the three upstream conversational AI providers this gateway fronts.
///
/// Named Provider-K / Provider-W / Provider-O, which do not map onto any
/// single public vendor name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderTag {
    /// Engine-K: JSON-framed event-stream parsing in an opaque binary envelope.
    K,
    /// Engine-W: hand-rolled protobuf request/response, agentic tool loop.
    W,
    /// Third provider tracked by the credential pool and quota engine only;
    /// no dedicated chat engine is specified in this core.
    O,
}

impl ProviderTag {
    /// Default base URL for this provider's upstream chat endpoint.
    pub fn default_url(&self) -> &'static str {
        match self {
            ProviderTag::K => "https://codewhisperer.us-east-1.amazonaws.com",
            ProviderTag::W => "https://app.warp.dev",
            ProviderTag::O => "https://api.example-o.com",
        }
    }

    /// Name of the environment variable that overrides this provider's base URL.
    fn env_var(&self) -> &'static str {
        match self {
            ProviderTag::K => "GATEWAY_BASE_URL_K",
            ProviderTag::W => "GATEWAY_BASE_URL_W",
            ProviderTag::O => "GATEWAY_BASE_URL_O",
        }
    }
}

/// Resolve the base URL for a provider: environment override, else default.
pub fn get_base_url(provider: ProviderTag) -> String {
    env::var(provider.env_var()).unwrap_or_else(|_| provider.default_url().to_string())
}

/// Resolve the outbound HTTP(S) proxy URL, if configured.
///
/// Consumed when building each provider's `reqwest::Client`.
pub fn get_http_proxy() -> Option<String> {
    env::var("GATEWAY_HTTP_PROXY").ok()
}

/// Build one provider's owned `reqwest::Client`: a per-`ChatEngine` transport
/// with an explicit lifecycle (constructed once, reused across calls), the
/// idle-per-host connection cap, and [`get_http_proxy`] wired in if set.
pub fn build_http_client() -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(CLIENT_TIMEOUT)
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST);

    if let Some(proxy_url) = get_http_proxy() {
        let proxy = reqwest::Proxy::all(proxy_url).map_err(Error::Http)?;
        builder = builder.proxy(proxy);
    }

    builder.build().map_err(Error::Http)
}

/// Resolve and hash the machine-identity seed for Upstream-K's pseudo-IDE
/// user-agent header: a hashed machine id, SHA-256 over the credential's
/// profile or client id.
///
/// Falls back to hashing the credential-supplied `fallback_seed` (its profile
/// or client id) when `GATEWAY_MACHINE_ID_SEED` is unset, so every request
/// still carries a stable, non-empty machine id.
pub fn machine_id_hash(fallback_seed: &str) -> String {
    let seed = env::var("GATEWAY_MACHINE_ID_SEED").unwrap_or_else(|_| fallback_seed.to_string());
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_http_client_succeeds_without_proxy() {
        unsafe {
            env::remove_var("GATEWAY_HTTP_PROXY");
        }
        assert!(build_http_client().is_ok());
    }

    #[test]
    fn test_build_http_client_succeeds_with_proxy_configured() {
        unsafe {
            env::set_var("GATEWAY_HTTP_PROXY", "http://proxy.example.test:8080");
        }
        assert!(build_http_client().is_ok());
        unsafe {
            env::remove_var("GATEWAY_HTTP_PROXY");
        }
    }

    #[test]
    fn test_provider_default_urls() {
        assert_eq!(
            ProviderTag::K.default_url(),
            "https://codewhisperer.us-east-1.amazonaws.com"
        );
        assert_eq!(ProviderTag::W.default_url(), "https://app.warp.dev");
    }

    #[test]
    fn test_get_base_url_default() {
        // SAFETY: test-local env var, not read by anything else in-process.
        unsafe {
            env::remove_var("GATEWAY_BASE_URL_K");
        }
        assert_eq!(get_base_url(ProviderTag::K), ProviderTag::K.default_url());
    }

    #[test]
    fn test_get_base_url_override() {
        // SAFETY: test-local env var; restored at the end of the test.
        unsafe {
            env::set_var("GATEWAY_BASE_URL_W", "https://warp.example.test");
        }
        assert_eq!(get_base_url(ProviderTag::W), "https://warp.example.test");
        unsafe {
            env::remove_var("GATEWAY_BASE_URL_W");
        }
    }

    #[test]
    fn test_machine_id_hash_is_stable_sha256_hex() {
        unsafe {
            env::remove_var("GATEWAY_MACHINE_ID_SEED");
        }
        let a = machine_id_hash("profile-123");
        let b = machine_id_hash("profile-123");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_machine_id_hash_env_override_wins() {
        unsafe {
            env::set_var("GATEWAY_MACHINE_ID_SEED", "seed-a");
        }
        let a = machine_id_hash("profile-123");
        let b = machine_id_hash("profile-456");
        assert_eq!(a, b, "env seed should override the fallback profile id");
        unsafe {
            env::remove_var("GATEWAY_MACHINE_ID_SEED");
        }
    }
}
