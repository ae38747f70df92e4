// ==============================================================================
// auth.rs - OAuth Client-Credentials Token Provider
// ==============================================================================
// Description: Fetches and caches access tokens per audience
// Author: Matt Barham
// Created: 2026-05-24
// Modified: 2026-08-03
// Version: 1.0.0
// ==============================================================================
// Tokens are cached per audience and refreshed once the elapsed time since
// the fetch exceeds the advertised lifetime. The cache lock is not held
// across the refresh request, so two callers holding expired tokens may
// both refresh; the token endpoint tolerates that.
// ==============================================================================

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_in: i64,
    fetched_at: i64,
}

/// True once the token's advertised lifetime has elapsed.
fn is_expired(fetched_at: i64, expires_in: i64, now: i64) -> bool {
    now - fetched_at > expires_in
}

pub struct TokenProvider {
    http: reqwest::Client,
    domain: String,
    client_id: String,
    client_secret: String,
    cache: Mutex<HashMap<String, CachedToken>>,
}

impl TokenProvider {
    pub fn new(http: reqwest::Client, domain: &str, client_id: &str, client_secret: &str) -> Self {
        Self {
            http,
            domain: domain.to_string(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a valid access token for `audience`, fetching a fresh one if
    /// the cached token is missing or expired.
    pub async fn token(&self, audience: &str) -> Result<String> {
        let now = Utc::now().timestamp();
        {
            let cache = self.cache.lock().expect("token cache poisoned");
            if let Some(cached) = cache.get(audience) {
                if !is_expired(cached.fetched_at, cached.expires_in, now) {
                    return Ok(cached.access_token.clone());
                }
            }
        }

        let fresh = self.fetch(audience).await?;
        let token = fresh.access_token.clone();

        let mut cache = self.cache.lock().expect("token cache poisoned");
        cache.insert(
            audience.to_string(),
            CachedToken {
                access_token: fresh.access_token,
                expires_in: fresh.expires_in,
                fetched_at: now,
            },
        );
        Ok(token)
    }

    async fn fetch(&self, audience: &str) -> Result<TokenResponse> {
        let payload = serde_json::json!({
            "grant_type": "client_credentials",
            "client_id": self.client_id,
            "client_secret": self.client_secret,
            "audience": audience,
        });

        let response = self
            .http
            .post(format!("https://{}/oauth/token", self.domain))
            .json(&payload)
            .send()
            .await
            .context("Token request failed")?
            .error_for_status()
            .context("Token endpoint rejected the request")?;

        response
            .json::<TokenResponse>()
            .await
            .context("Malformed token response")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expiry_math() {
        // Fetched at t=100 with a 3600s lifetime.
        assert!(!is_expired(100, 3600, 100));
        assert!(!is_expired(100, 3600, 3700));
        assert!(is_expired(100, 3600, 3701));
    }
}
