use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::warn;
use url::Url;

use crate::config::Settings;
use crate::crypto::confirmation_token;
use crate::errors::ExecuteError;
use crate::normalize::Operation;

const RETRY_BACKOFF_STEP: Duration = Duration::from_millis(150);
const READ_CACHE_MAX_ENTRIES: usize = 1_000;
const SENSITIVE_HEADER_PATTERNS: [&str; 4] =
    ["authorization", "cookie", "set-cookie", "x-api-key"];
const SENSITIVE_BODY_KEY_PATTERNS: [&str; 4] = ["token", "authorization", "password", "secret"];

/// Equivalent of JavaScript's encodeURIComponent: everything but
/// `A-Z a-z 0-9 - _ . ! ~ * ' ( )` is percent-encoded.
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

#[derive(Debug, Clone, Default, Deserialize, schemars::JsonSchema)]
pub struct ExecuteRequest {
    pub operation_id: String,
    #[serde(default)]
    pub path_params: BTreeMap<String, String>,
    #[serde(default)]
    pub query_params: serde_json::Map<String, Value>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub confirm_write_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, schemars::JsonSchema)]
pub struct RequestEcho {
    pub method: String,
    pub url: String,
    pub operation_id: String,
}

#[derive(Debug, Clone, Serialize, schemars::JsonSchema)]
pub struct ExecuteResponse {
    pub request: RequestEcho,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

/// One rendered upstream call, ready to send.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: String,
    pub url: String,
    pub body: Option<Value>,
}

/// Raw upstream outcome before parsing. Header names are lowercased.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

#[derive(Debug)]
pub enum SendFailure {
    Timeout(u64),
    Network(String),
}

/// The four capabilities the executor needs from the rest of the system.
/// Production wires them to the schema service, OAuth broker and HTTP
/// client; tests swap in scripted implementations.
pub trait ExecutorDeps: Send + Sync {
    fn operation(&self, operation_id: &str) -> impl Future<Output = Option<Operation>> + Send;
    fn root_schema(&self) -> impl Future<Output = Option<Arc<Value>>> + Send;
    fn access_token(&self, user_id: &str) -> impl Future<Output = Result<Option<String>>> + Send;
    fn send(
        &self,
        request: &UpstreamRequest,
        bearer: &str,
    ) -> impl Future<Output = Result<UpstreamResponse, SendFailure>> + Send;
}

struct CachedRead {
    expires_at: Instant,
    response: ExecuteResponse,
}

/// End-to-end pipeline for one `execute` call: validation, dry-run gate,
/// write confirmation, credential vending, per-user read cache, retrying
/// send, redaction and truncation.
pub struct Executor<D> {
    deps: D,
    settings: Arc<Settings>,
    validators: Mutex<HashMap<String, Arc<jsonschema::Validator>>>,
    read_cache: Mutex<HashMap<String, CachedRead>>,
}

impl<D: ExecutorDeps> Executor<D> {
    pub fn new(deps: D, settings: Arc<Settings>) -> Self {
        Self {
            deps,
            settings,
            validators: Mutex::new(HashMap::new()),
            read_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn deps(&self) -> &D {
        &self.deps
    }

    pub async fn execute(
        &self,
        user_id: &str,
        request: ExecuteRequest,
    ) -> Result<ExecuteResponse, ExecuteError> {
        let Some(op) = self.deps.operation(&request.operation_id).await else {
            return Err(ExecuteError::OperationNotFound(request.operation_id));
        };

        validate_path_params(&op, &request.path_params)?;
        validate_query_params(&request.query_params)?;
        if op.request_schema.is_some() {
            self.validate_body(&op, request.body.as_ref()).await?;
        }

        let url = render_url(
            &self.settings.api_base_url,
            &op,
            &request.path_params,
            &request.query_params,
        )?;
        let echo = RequestEcho {
            method: op.method.clone(),
            url: url.clone(),
            operation_id: op.operation_id.clone(),
        };

        if request.dry_run {
            return Ok(self.dry_run_response(user_id, &op, &request, echo));
        }

        if op.is_mutating {
            if !self.settings.allow_writes {
                return Err(ExecuteError::WritesDisabled);
            }
            let expected = self.expected_confirmation_token(user_id, &op.operation_id, &request);
            if request.confirm_write_token.as_deref() != Some(expected.as_str()) {
                return Err(ExecuteError::WriteConfirmationRequired(
                    "mutating operations require a confirm_write_token from a prior dry run"
                        .to_string(),
                ));
            }
        }

        let bearer = match self.deps.access_token(user_id).await {
            Ok(Some(token)) => token,
            Ok(None) => return Err(ExecuteError::AuthRequired),
            Err(err) => {
                warn!(error = %err, "access token lookup failed");
                return Err(ExecuteError::AuthRequired);
            }
        };

        let cache_key = self.read_cache_key(user_id, &op, &url);
        if let Some(key) = &cache_key
            && let Some(hit) = self.read_cache_lookup(key)
        {
            return Ok(hit);
        }

        let upstream_request = UpstreamRequest {
            method: op.method.clone(),
            url,
            body: request.body.clone(),
        };
        let idempotent = !op.is_mutating && matches!(op.method.as_str(), "GET" | "HEAD");
        let response = self
            .send_with_retry(&upstream_request, &bearer, idempotent)
            .await?;

        let mut warnings: Vec<String> = Vec::new();
        let (headers, request_id) = clean_headers(&response.headers);
        let mut body = parse_body(response.status, &response.headers, &response.body);
        redact_sensitive(&mut body);

        if !(200..300).contains(&response.status) {
            return Err(ExecuteError::UpstreamApi {
                status: response.status,
                body_preview: preview_of(&body, self.settings.execute_body_preview_chars),
            });
        }

        body = self.truncate_body(body, &mut warnings);

        let result = ExecuteResponse {
            request: echo,
            status: response.status,
            headers,
            body,
            request_id,
            warnings,
        };
        if let Some(key) = cache_key {
            self.read_cache_store(key, &result);
        }
        Ok(result)
    }

    fn dry_run_response(
        &self,
        user_id: &str,
        op: &Operation,
        request: &ExecuteRequest,
        echo: RequestEcho,
    ) -> ExecuteResponse {
        let mut warnings = Vec::new();
        let body = if op.is_mutating {
            if !self.settings.allow_writes {
                warnings.push(
                    "writes_disabled: ALLOW_WRITES is off, this operation cannot be confirmed"
                        .to_string(),
                );
            }
            let token = self.expected_confirmation_token(user_id, &op.operation_id, request);
            json!({
                "dry_run": true,
                "confirm_write_token": token,
                "message": "Re-run execute with this confirm_write_token to perform the call.",
            })
        } else {
            json!({ "dry_run": true })
        };

        ExecuteResponse {
            request: echo,
            status: 0,
            headers: BTreeMap::new(),
            body,
            request_id: None,
            warnings,
        }
    }

    fn expected_confirmation_token(
        &self,
        user_id: &str,
        operation_id: &str,
        request: &ExecuteRequest,
    ) -> String {
        let path_params = serde_json::to_value(&request.path_params).unwrap_or(Value::Null);
        let query_params = Value::Object(request.query_params.clone());
        let body = request.body.clone().unwrap_or(Value::Null);
        confirmation_token(
            &self.settings.write_confirm_secret,
            user_id,
            operation_id,
            &path_params,
            &query_params,
            &body,
        )
    }

    /// Compile-once body validator, keyed by operation id, with the root
    /// schema's `definitions` spliced in so `$ref` pointers resolve.
    async fn validate_body(
        &self,
        op: &Operation,
        body: Option<&Value>,
    ) -> Result<(), ExecuteError> {
        let validator = {
            let memoized = {
                let validators = lock_unpoisoned(&self.validators);
                validators.get(&op.operation_id).cloned()
            };
            match memoized {
                Some(validator) => validator,
                None => {
                    let root = self
                        .deps
                        .root_schema()
                        .await
                        .ok_or(ExecuteError::SchemaUnavailable)?;
                    let mut doc = op.request_schema.clone().unwrap_or_else(|| json!({}));
                    if let Some(obj) = doc.as_object_mut()
                        && !obj.contains_key("definitions")
                    {
                        obj.insert(
                            "definitions".to_string(),
                            root.get("definitions").cloned().unwrap_or(json!({})),
                        );
                    }
                    let compiled = jsonschema::validator_for(&doc).map_err(|err| {
                        ExecuteError::Validation(format!(
                            "request schema for '{}' failed to compile: {err}",
                            op.operation_id
                        ))
                    })?;
                    let validator = Arc::new(compiled);
                    let mut validators = lock_unpoisoned(&self.validators);
                    validators
                        .entry(op.operation_id.clone())
                        .or_insert_with(|| Arc::clone(&validator))
                        .clone()
                }
            }
        };

        let instance = body.cloned().unwrap_or_else(|| json!({}));
        let failures: Vec<String> = validator
            .iter_errors(&instance)
            .map(|err| {
                let path = err.instance_path.to_string();
                if path.is_empty() {
                    err.to_string()
                } else {
                    format!("{path}: {err}")
                }
            })
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ExecuteError::Validation(format!(
                "request body failed validation: {}",
                failures.join("; ")
            )))
        }
    }

    fn read_cache_key(&self, user_id: &str, op: &Operation, url: &str) -> Option<String> {
        if op.is_mutating || !matches!(op.method.as_str(), "GET" | "HEAD") {
            return None;
        }
        if self.settings.read_cache_ttl.is_zero() {
            return None;
        }
        Some(format!("{user_id}:{}:{url}", op.operation_id))
    }

    fn read_cache_lookup(&self, key: &str) -> Option<ExecuteResponse> {
        let mut cache = lock_unpoisoned(&self.read_cache);
        if let Some(entry) = cache.get(key)
            && entry.expires_at > Instant::now()
        {
            let mut hit = entry.response.clone();
            hit.warnings.push("served_from_read_cache".to_string());
            return Some(hit);
        }
        // Absent, or present but expired: drop whatever is there.
        cache.remove(key);
        None
    }

    fn read_cache_store(&self, key: String, response: &ExecuteResponse) {
        let now = Instant::now();
        let mut cache = lock_unpoisoned(&self.read_cache);
        cache.retain(|_, entry| entry.expires_at > now);
        cache.insert(
            key,
            CachedRead {
                expires_at: now + self.settings.read_cache_ttl,
                response: response.clone(),
            },
        );

        if cache.len() > READ_CACHE_MAX_ENTRIES {
            let mut by_expiry: Vec<(String, Instant)> = cache
                .iter()
                .map(|(key, entry)| (key.clone(), entry.expires_at))
                .collect();
            by_expiry.sort_by_key(|(_, expires_at)| *expires_at);
            let excess = cache.len() - READ_CACHE_MAX_ENTRIES;
            for (key, _) in by_expiry.into_iter().take(excess) {
                cache.remove(&key);
            }
        }
    }

    async fn send_with_retry(
        &self,
        request: &UpstreamRequest,
        bearer: &str,
        idempotent: bool,
    ) -> Result<UpstreamResponse, ExecuteError> {
        let attempts = if idempotent {
            self.settings.max_retries + 1
        } else {
            1
        };

        for attempt in 1..=attempts {
            match self.deps.send(request, bearer).await {
                Ok(response) => {
                    let retryable =
                        response.status == 429 || (500..=599).contains(&response.status);
                    if retryable && attempt < attempts {
                        warn!(
                            status = response.status,
                            attempt,
                            url = %request.url,
                            "retrying idempotent upstream call"
                        );
                        tokio::time::sleep(RETRY_BACKOFF_STEP * attempt).await;
                        continue;
                    }
                    return Ok(response);
                }
                Err(failure) => {
                    if attempt < attempts {
                        warn!(attempt, url = %request.url, "retrying after transport failure");
                        tokio::time::sleep(RETRY_BACKOFF_STEP * attempt).await;
                        continue;
                    }
                    return Err(match failure {
                        SendFailure::Timeout(ms) => ExecuteError::Timeout(ms),
                        SendFailure::Network(message) => ExecuteError::RequestFailed(message),
                    });
                }
            }
        }
        Err(ExecuteError::RequestFailed(
            "retry attempts exhausted".to_string(),
        ))
    }

    fn truncate_body(&self, body: Value, warnings: &mut Vec<String>) -> Value {
        let serialized = body.to_string();
        let size_bytes = serialized.len();
        if size_bytes <= self.settings.execute_max_body_bytes {
            return body;
        }

        let preview_chars = self.settings.execute_body_preview_chars;
        let preview: String = serialized.chars().take(preview_chars).collect();
        let preview_is_partial = serialized.chars().count() > preview_chars;
        warnings.push(format!(
            "response_body_truncated: {size_bytes} bytes exceeded the {} byte limit",
            self.settings.execute_max_body_bytes
        ));
        json!({
            "truncated": true,
            "original_size_bytes": size_bytes,
            "preview": preview,
            "preview_is_partial": preview_is_partial,
        })
    }
}

fn lock_unpoisoned<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!("executor lock was poisoned; continuing with recovered state");
            poisoned.into_inner()
        }
    }
}

/// Every declared path parameter must be present and non-empty. Empty
/// string counts as missing here, unlike query params.
fn validate_path_params(
    op: &Operation,
    provided: &BTreeMap<String, String>,
) -> Result<(), ExecuteError> {
    for param in &op.path_params {
        match provided.get(&param.name) {
            Some(value) if !value.is_empty() => {}
            _ => {
                return Err(ExecuteError::Validation(format!(
                    "missing required path parameter '{}'",
                    param.name
                )));
            }
        }
    }
    Ok(())
}

fn validate_query_params(params: &serde_json::Map<String, Value>) -> Result<(), ExecuteError> {
    for (name, value) in params {
        if !matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_)) {
            return Err(ExecuteError::Validation(format!(
                "query parameter '{name}' must be a string, number or boolean"
            )));
        }
    }
    Ok(())
}

fn render_url(
    base_url: &str,
    op: &Operation,
    path_params: &BTreeMap<String, String>,
    query_params: &serde_json::Map<String, Value>,
) -> Result<String, ExecuteError> {
    let mut path = op.path_template.clone();
    for param in &op.path_params {
        let raw = path_params.get(&param.name).map(String::as_str).unwrap_or("");
        let encoded = utf8_percent_encode(raw, URI_COMPONENT).to_string();
        path = path.replace(&format!("{{{}}}", param.name), &encoded);
    }

    let joined = format!("{}{path}", base_url.trim_end_matches('/'));
    let mut url = Url::parse(&joined).map_err(|err| {
        ExecuteError::Validation(format!("rendered URL '{joined}' is invalid: {err}"))
    })?;
    if !query_params.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (name, value) in query_params {
            let rendered = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            pairs.append_pair(name, &rendered);
        }
    }
    Ok(url.to_string())
}

/// Drop credential-bearing headers and pull out the upstream request id.
fn clean_headers(headers: &[(String, String)]) -> (BTreeMap<String, String>, Option<String>) {
    let mut cleaned = BTreeMap::new();
    let mut request_id = None;
    for (name, value) in headers {
        let name = name.to_ascii_lowercase();
        if name == "request-id" {
            request_id = Some(value.clone());
        }
        if SENSITIVE_HEADER_PATTERNS
            .iter()
            .any(|pattern| name.contains(pattern))
        {
            continue;
        }
        cleaned.insert(name, value.clone());
    }
    (cleaned, request_id)
}

fn parse_body(status: u16, headers: &[(String, String)], text: &str) -> Value {
    if status == 204 {
        return Value::Null;
    }
    let is_json = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
        .is_some_and(|(_, value)| value.to_ascii_lowercase().contains("application/json"));

    if is_json {
        serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
    } else if text.is_empty() {
        Value::Null
    } else {
        Value::String(text.to_string())
    }
}

/// Replace the value of any object key matching the sensitive pattern, at
/// every nesting level.
fn redact_sensitive(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, entry) in map.iter_mut() {
                let lowered = key.to_ascii_lowercase();
                if SENSITIVE_BODY_KEY_PATTERNS
                    .iter()
                    .any(|pattern| lowered.contains(pattern))
                {
                    *entry = Value::String("[REDACTED]".to_string());
                } else {
                    redact_sensitive(entry);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                redact_sensitive(item);
            }
        }
        _ => {}
    }
}

fn preview_of(body: &Value, max_chars: usize) -> String {
    body.to_string().chars().take(max_chars).collect()
}
