use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use rand::RngCore;
use reqwest::Client;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use url::Url;

use crate::config::Settings;
use crate::token_store::{TokenRecord, TokenStore};

const PENDING_STATE_TTL: Duration = Duration::from_secs(600);
const STATE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const EXPIRY_MARGIN_SECONDS: i64 = 60;

#[derive(Debug, Clone)]
struct PendingAuth {
    user_id: String,
    created_at: Instant,
}

#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    scope: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, schemars::JsonSchema)]
pub struct AuthStatus {
    pub authenticated: bool,
    pub scopes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

/// Per-caller OAuth 2.0 broker: authorization-code and refresh-token
/// flows against the configured identity provider, with a CSRF state
/// ledger and expiry-aware access-token vending.
#[derive(Clone)]
pub struct OAuthService {
    settings: Arc<Settings>,
    store: Arc<TokenStore>,
    pending: Arc<Mutex<HashMap<String, PendingAuth>>>,
    http: Client,
}

impl OAuthService {
    pub fn new(settings: Arc<Settings>, store: Arc<TokenStore>, http: Client) -> Self {
        Self {
            settings,
            store,
            pending: Arc::new(Mutex::new(HashMap::new())),
            http,
        }
    }

    /// Build the provider authorization URL for one caller and remember
    /// the CSRF state for the eventual callback.
    pub fn authorization_url(&self, user_id: &str) -> Result<String> {
        let oauth = &self.settings.oauth;
        if oauth.client_id.is_empty() {
            bail!("OAUTH_CLIENT_ID is not configured");
        }

        let state = random_state();
        let mut authorize_url = Url::parse(&oauth.authorize_url)
            .with_context(|| format!("invalid authorize URL '{}'", oauth.authorize_url))?;
        {
            let mut query = authorize_url.query_pairs_mut();
            query.append_pair("client_id", &oauth.client_id);
            query.append_pair("response_type", "code");
            query.append_pair("scope", &oauth.scope);
            query.append_pair("state", &state);
            query.append_pair("redirect_uri", &oauth.redirect_uri);
        }

        {
            let mut pending = lock_pending(&self.pending);
            pending.retain(|_, entry| entry.created_at.elapsed() <= PENDING_STATE_TTL);
            pending.insert(
                state,
                PendingAuth {
                    user_id: user_id.to_string(),
                    created_at: Instant::now(),
                },
            );
        }

        Ok(authorize_url.to_string())
    }

    /// Exchange the authorization code and persist the resulting token.
    /// The state entry is consumed whether or not the exchange succeeds.
    pub async fn handle_callback(&self, state: &str, code: &str) -> Result<String> {
        if code.trim().is_empty() {
            bail!("authorization code is required");
        }

        let pending = {
            let mut pending = lock_pending(&self.pending);
            let Some(entry) = pending.remove(state) else {
                bail!("invalid state");
            };
            entry
        };
        if pending.created_at.elapsed() > PENDING_STATE_TTL {
            bail!("expired state; restart authorization");
        }

        let oauth = &self.settings.oauth;
        let response = self
            .http
            .post(&oauth.token_url)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", oauth.client_id.as_str()),
                ("client_secret", oauth.client_secret.as_str()),
                ("redirect_uri", oauth.redirect_uri.as_str()),
            ])
            .send()
            .await
            .context("oauth token exchange request failed")?
            .error_for_status()
            .context("oauth token exchange returned error response")?
            .json::<TokenEndpointResponse>()
            .await
            .context("oauth token exchange response JSON is invalid")?;

        let record = build_record(response);
        self.store
            .put(&pending.user_id, &record)
            .await
            .context("failed to persist oauth token")?;
        Ok(pending.user_id)
    }

    /// Vend a usable access token for one caller, refreshing proactively
    /// when the stored token expires within the safety margin.
    pub async fn access_token_for(&self, user_id: &str) -> Result<Option<String>> {
        let Some(record) = self.store.get(user_id).await? else {
            return Ok(None);
        };

        let Some(expires_at) = record.expires_at else {
            return Ok(Some(record.access_token));
        };
        if Utc::now() < expires_at - chrono::Duration::seconds(EXPIRY_MARGIN_SECONDS) {
            return Ok(Some(record.access_token));
        }

        let Some(refresh_token) = record.refresh_token.clone() else {
            return Ok(None);
        };
        let refreshed = self.refresh(user_id, &record, &refresh_token).await?;
        Ok(Some(refreshed.access_token))
    }

    pub async fn status_for(&self, user_id: &str) -> Result<AuthStatus> {
        let record = self.store.get(user_id).await?;
        Ok(match record {
            Some(record) => AuthStatus {
                authenticated: true,
                scopes: record.scope.clone(),
                expires_at: record.expires_at.map(|at| at.to_rfc3339()),
            },
            None => AuthStatus {
                authenticated: false,
                scopes: Vec::new(),
                expires_at: None,
            },
        })
    }

    async fn refresh(
        &self,
        user_id: &str,
        current: &TokenRecord,
        refresh_token: &str,
    ) -> Result<TokenRecord> {
        let oauth = &self.settings.oauth;
        let response = self
            .http
            .post(&oauth.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", oauth.client_id.as_str()),
                ("client_secret", oauth.client_secret.as_str()),
            ])
            .send()
            .await
            .context("oauth refresh request failed")?
            .error_for_status()
            .context("oauth refresh returned error response")?
            .json::<TokenEndpointResponse>()
            .await
            .context("oauth refresh response JSON is invalid")?;

        let mut updated = build_record(response);
        if updated.refresh_token.is_none() {
            updated.refresh_token = current.refresh_token.clone();
        }
        self.store
            .put(user_id, &updated)
            .await
            .context("failed to persist refreshed oauth token")?;
        Ok(updated)
    }

    /// Periodic sweep of abandoned authorization attempts.
    pub async fn run_state_sweeper(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(STATE_SWEEP_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let mut pending = lock_pending(&self.pending);
                    pending.retain(|_, entry| entry.created_at.elapsed() <= PENDING_STATE_TTL);
                }
            }
        }
    }

    #[cfg(test)]
    fn pending_state_count(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    #[cfg(test)]
    fn age_pending_state(&self, state: &str, by: Duration) {
        let mut pending = lock_pending(&self.pending);
        if let Some(entry) = pending.get_mut(state) {
            entry.created_at = Instant::now() - by;
        }
    }
}

fn lock_pending(
    pending: &Arc<Mutex<HashMap<String, PendingAuth>>>,
) -> std::sync::MutexGuard<'_, HashMap<String, PendingAuth>> {
    match pending.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("pending oauth state lock was poisoned; continuing with recovered state");
            poisoned.into_inner()
        }
    }
}

fn build_record(response: TokenEndpointResponse) -> TokenRecord {
    let now = Utc::now();
    let expires_at: Option<DateTime<Utc>> = response
        .expires_in
        .map(|seconds| now + chrono::Duration::seconds(seconds.min(i64::MAX as u64) as i64));
    let scope = response
        .scope
        .as_deref()
        .map(split_scope)
        .unwrap_or_default();

    TokenRecord {
        access_token: response.access_token,
        token_type: response.token_type.unwrap_or_else(|| "Bearer".to_string()),
        refresh_token: response.refresh_token,
        scope,
        expires_at,
        obtained_at: Some(now),
    }
}

/// Providers disagree on the scope delimiter; accept both space and comma.
fn split_scope(raw: &str) -> Vec<String> {
    let mut scopes: Vec<String> = Vec::new();
    for part in raw.split([' ', ',']) {
        let part = part.trim();
        if !part.is_empty() && !scopes.iter().any(|existing| existing == part) {
            scopes.push(part.to_string());
        }
    }
    scopes
}

fn random_state() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}
