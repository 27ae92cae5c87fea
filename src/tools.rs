use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use reqwest::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

use crate::catalog::SchemaService;
use crate::config::Settings;
use crate::errors::ErrorEnvelope;
use crate::executor::{
    ExecuteRequest, ExecuteResponse, Executor, ExecutorDeps, SendFailure, UpstreamRequest,
    UpstreamResponse,
};
use crate::normalize::Operation;
use crate::oauth::{AuthStatus, OAuthService};
use crate::search::SearchHit;

pub const DEFAULT_CALLER_ID: &str = "default";
const FALLBACK_USER_ID_HEADER: &str = "x-user-id";

#[derive(Debug, Clone, Deserialize, schemars::JsonSchema)]
pub struct SearchRequest {
    /// Free-text intent, e.g. "list apps" or "scale web dynos".
    pub query: String,
    /// Maximum results, clamped to 1..=25 (default 8).
    #[serde(default)]
    pub limit: Option<usize>,
    /// Optional resource names to restrict results to, OR-combined.
    #[serde(default)]
    pub resource_filter: Option<Vec<String>>,
}

#[derive(Debug, Clone, serde::Serialize, schemars::JsonSchema)]
pub struct SearchResponse {
    pub results: Vec<SearchHit>,
}

/// Production capability wiring for the executor: catalog lookups, OAuth
/// vending and the real HTTP client.
#[derive(Clone)]
pub struct LiveDeps {
    catalog: Arc<SchemaService>,
    oauth: OAuthService,
    http: Client,
    settings: Arc<Settings>,
}

impl LiveDeps {
    pub fn new(
        catalog: Arc<SchemaService>,
        oauth: OAuthService,
        http: Client,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            catalog,
            oauth,
            http,
            settings,
        }
    }
}

impl ExecutorDeps for LiveDeps {
    async fn operation(&self, operation_id: &str) -> Option<Operation> {
        self.catalog.operation_by_id(operation_id).await
    }

    async fn root_schema(&self) -> Option<Arc<Value>> {
        self.catalog.root_schema().await
    }

    async fn access_token(&self, user_id: &str) -> Result<Option<String>> {
        self.oauth.access_token_for(user_id).await
    }

    async fn send(
        &self,
        request: &UpstreamRequest,
        bearer: &str,
    ) -> Result<UpstreamResponse, SendFailure> {
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|err| SendFailure::Network(format!("invalid HTTP method: {err}")))?;

        let mut builder = self
            .http
            .request(method, &request.url)
            .header(ACCEPT, &self.settings.accept_header)
            .header(AUTHORIZATION, format!("Bearer {bearer}"));
        if let Some(body) = &request.body {
            builder = builder
                .header(CONTENT_TYPE, "application/json")
                .json(body);
        }

        let timeout_ms = self.settings.request_timeout.as_millis() as u64;
        let response = tokio::time::timeout(self.settings.request_timeout, builder.send())
            .await
            .map_err(|_| SendFailure::Timeout(timeout_ms))?
            .map_err(|err| {
                if err.is_timeout() {
                    SendFailure::Timeout(timeout_ms)
                } else {
                    SendFailure::Network(err.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response
            .text()
            .await
            .map_err(|err| SendFailure::Network(format!("failed to read response body: {err}")))?;

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

/// The three-tool control surface. Each call resolves its caller from the
/// transport-supplied header map and maps every executor failure to the
/// uniform `{code, message, status}` envelope.
pub struct ToolService {
    catalog: Arc<SchemaService>,
    executor: Executor<LiveDeps>,
    oauth: OAuthService,
    settings: Arc<Settings>,
}

impl ToolService {
    pub fn new(
        catalog: Arc<SchemaService>,
        executor: Executor<LiveDeps>,
        oauth: OAuthService,
        settings: Arc<Settings>,
    ) -> Self {
        Self {
            catalog,
            executor,
            oauth,
            settings,
        }
    }

    /// Caller identity: the configured header (already lowercased), then
    /// `x-user-id`, then the shared `"default"` caller.
    pub fn caller_id(&self, headers: &HashMap<String, String>) -> String {
        resolve_caller_id(&self.settings.user_id_header, headers)
    }

    pub async fn search(&self, request: SearchRequest) -> Result<SearchResponse, ErrorEnvelope> {
        self.ensure_schema_ready().await?;

        let index = self.catalog.search_index().await;
        let results = index.search(
            &request.query,
            request.limit,
            request.resource_filter.as_deref().unwrap_or(&[]),
        );
        Ok(SearchResponse { results })
    }

    pub async fn execute(
        &self,
        headers: &HashMap<String, String>,
        request: ExecuteRequest,
    ) -> Result<ExecuteResponse, ErrorEnvelope> {
        self.ensure_schema_ready().await?;

        let user_id = self.caller_id(headers);
        self.executor
            .execute(&user_id, request)
            .await
            .map_err(|err| err.into_envelope())
    }

    pub async fn auth_status(
        &self,
        headers: &HashMap<String, String>,
    ) -> Result<AuthStatus, ErrorEnvelope> {
        let user_id = self.caller_id(headers);
        self.oauth.status_for(&user_id).await.map_err(|err| {
            warn!(error = %err, "auth status lookup failed");
            ErrorEnvelope {
                code: "AUTH_REQUIRED".to_string(),
                message: format!("failed to read stored credential: {err}"),
                status: Some(401),
            }
        })
    }

    async fn ensure_schema_ready(&self) -> Result<(), ErrorEnvelope> {
        self.catalog.ensure_ready().await.map_err(|err| {
            warn!(error = %err, "schema catalog is unavailable");
            ErrorEnvelope::schema_unavailable(format!("schema catalog is unavailable: {err}"))
        })
    }
}

fn resolve_caller_id(configured_header: &str, headers: &HashMap<String, String>) -> String {
    headers
        .get(configured_header)
        .or_else(|| headers.get(FALLBACK_USER_ID_HEADER))
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| DEFAULT_CALLER_ID.to_string())
}
