use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use reqwest::Client;
use reqwest::header::{ACCEPT, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::normalize::{Operation, normalize_root_schema};
use crate::search::SearchIndex;

const CACHE_FILE_VERSION: u32 = 1;
const DOCS_CONTEXT_MAX_CHARS: usize = 30_000;

/// On-disk snapshot of one published catalog. Any payload whose version
/// is not 1 or whose required fields fail to parse is discarded on boot.
#[derive(Debug, Serialize, Deserialize)]
struct CatalogCacheFile {
    version: u32,
    cached_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    schema_etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    docs_etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    docs_last_modified: Option<String>,
    operations: Vec<Operation>,
    root_schema: Value,
    #[serde(default)]
    docs_context: String,
}

#[derive(Default)]
struct Published {
    operations: Arc<Vec<Operation>>,
    by_id: Arc<HashMap<String, usize>>,
    root_schema: Option<Arc<Value>>,
    docs_context: Option<Arc<String>>,
    index: Arc<SearchIndex>,
    schema_etag: Option<String>,
    docs_etag: Option<String>,
    docs_last_modified: Option<String>,
}

/// Owns the authoritative operation catalog: cold boot from the cache
/// file, conditional refresh of schema and docs context, background
/// refresh, persistence after meaningful change. Readers clone `Arc`s out
/// of the published state and are never blocked by an in-flight refresh;
/// writers replace the whole structure atomically.
pub struct SchemaService {
    settings: Arc<Settings>,
    http: Client,
    published: RwLock<Published>,
    refresh_lock: Mutex<()>,
    generation: AtomicU64,
}

impl SchemaService {
    pub fn new(settings: Arc<Settings>, http: Client) -> Self {
        Self {
            settings,
            http,
            published: RwLock::new(Published::default()),
            refresh_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Read the cache file once at startup. A missing file is not an
    /// error; a corrupt or mis-versioned payload is discarded with a
    /// warning and the catalog starts empty.
    pub async fn cold_boot(&self) {
        let path = self.settings.catalog_cache_path.clone();
        let loaded = tokio::task::spawn_blocking(move || read_cache_file(&path)).await;
        let snapshot = match loaded {
            Ok(Ok(Some(snapshot))) => snapshot,
            Ok(Ok(None)) => {
                debug!("no catalog cache file; starting with an empty catalog");
                return;
            }
            Ok(Err(err)) => {
                warn!(error = %err, "discarding unusable catalog cache file");
                return;
            }
            Err(err) => {
                warn!(error = %err, "catalog cache load task failed");
                return;
            }
        };

        let operation_count = snapshot.operations.len();
        let docs_context = (!snapshot.docs_context.is_empty()).then_some(snapshot.docs_context);
        let index = SearchIndex::build(&snapshot.operations, docs_context.as_deref());
        let mut published = self.published.write().await;
        *published = Published {
            by_id: Arc::new(index_by_id(&snapshot.operations)),
            operations: Arc::new(snapshot.operations),
            root_schema: Some(Arc::new(snapshot.root_schema)),
            docs_context: docs_context.map(Arc::new),
            index: Arc::new(index),
            schema_etag: snapshot.schema_etag,
            docs_etag: snapshot.docs_etag,
            docs_last_modified: snapshot.docs_last_modified,
        };
        drop(published);
        self.generation.fetch_add(1, Ordering::AcqRel);
        info!(
            operations = operation_count,
            cached_at = %snapshot.cached_at,
            "catalog restored from cache file"
        );
    }

    /// Block until a non-empty catalog is available, fetching if needed.
    pub async fn ensure_ready(&self) -> Result<()> {
        if !self.published.read().await.operations.is_empty() {
            return Ok(());
        }
        self.refresh(true).await
    }

    /// Fetch the schema (conditionally unless `force`) and the docs
    /// context, republish the catalog, and persist on meaningful change.
    /// Single-flight: concurrent callers join the in-flight refresh
    /// instead of starting their own.
    pub async fn refresh(&self, force: bool) -> Result<()> {
        let joined_generation = self.generation.load(Ordering::Acquire);
        let _guard = self.refresh_lock.lock().await;
        if self.generation.load(Ordering::Acquire) != joined_generation {
            debug!("joined a refresh that completed while waiting");
            return Ok(());
        }

        let (current_etag, catalog_empty) = {
            let published = self.published.read().await;
            (published.schema_etag.clone(), published.operations.is_empty())
        };

        let mut send_conditional = !force && current_etag.is_some();
        let schema_update = loop {
            let mut request = self
                .http
                .get(&self.settings.schema_url)
                .header(ACCEPT, &self.settings.accept_header);
            if send_conditional {
                if let Some(etag) = &current_etag {
                    request = request.header(IF_NONE_MATCH, etag);
                }
            }

            let response = request
                .send()
                .await
                .context("schema fetch request failed")?;

            if response.status() == reqwest::StatusCode::NOT_MODIFIED {
                if !catalog_empty {
                    break None;
                }
                // A 304 with nothing in memory would leave us stale forever.
                warn!("schema endpoint returned 304 but the catalog is empty; refetching");
                send_conditional = false;
                continue;
            }
            if !response.status().is_success() {
                bail!("schema fetch returned status {}", response.status());
            }

            let etag = header_value(&response, ETAG.as_str()).or(current_etag.clone());
            let root: Value = response
                .json()
                .await
                .context("schema response is not valid JSON")?;
            break Some((root, etag));
        };

        let docs_markers = {
            let published = self.published.read().await;
            (
                published.docs_etag.clone(),
                published.docs_last_modified.clone(),
                published.docs_context.clone(),
            )
        };
        let docs_update = self
            .refresh_docs_context(
                docs_markers.0,
                docs_markers.1,
                docs_markers.2.as_deref().map(String::as_str),
            )
            .await;

        let schema_changed = schema_update.is_some();
        let docs_changed = docs_update.is_some();
        if !schema_changed && !docs_changed {
            self.generation.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        }

        let snapshot = {
            let mut published = self.published.write().await;
            if let Some((root, etag)) = schema_update {
                let normalized = normalize_root_schema(&root);
                info!(
                    operations = normalized.operations.len(),
                    "catalog refreshed from upstream schema"
                );
                published.by_id = Arc::new(index_by_id(&normalized.operations));
                published.operations = Arc::new(normalized.operations);
                published.root_schema = Some(Arc::new(normalized.root_schema));
                published.schema_etag = etag;
            }
            if let Some(update) = docs_update {
                published.docs_context = (!update.context.is_empty())
                    .then(|| Arc::new(update.context));
                published.docs_etag = update.etag;
                published.docs_last_modified = update.last_modified;
            }
            published.index = Arc::new(SearchIndex::build(
                &published.operations,
                published.docs_context.as_deref().map(String::as_str),
            ));

            CatalogCacheFile {
                version: CACHE_FILE_VERSION,
                cached_at: Utc::now(),
                schema_etag: published.schema_etag.clone(),
                docs_etag: published.docs_etag.clone(),
                docs_last_modified: published.docs_last_modified.clone(),
                operations: published.operations.as_ref().clone(),
                root_schema: published
                    .root_schema
                    .as_deref()
                    .cloned()
                    .unwrap_or(Value::Null),
                docs_context: published
                    .docs_context
                    .as_deref()
                    .cloned()
                    .unwrap_or_default(),
            }
        };
        self.generation.fetch_add(1, Ordering::AcqRel);

        let path = self.settings.catalog_cache_path.clone();
        let persisted = tokio::task::spawn_blocking(move || write_cache_file(&path, &snapshot))
            .await
            .context("catalog cache write task failed")?;
        if let Err(err) = persisted {
            warn!(error = %err, "failed to persist catalog cache");
        }
        Ok(())
    }

    async fn refresh_docs_context(
        &self,
        etag: Option<String>,
        last_modified: Option<String>,
        current: Option<&str>,
    ) -> Option<DocsUpdate> {
        let mut request = self
            .http
            .get(&self.settings.docs_url)
            .header(ACCEPT, "text/html");
        if let Some(etag) = &etag {
            request = request.header(IF_NONE_MATCH, etag);
        } else if let Some(last_modified) = &last_modified {
            request = request.header(IF_MODIFIED_SINCE, last_modified);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "docs context fetch failed");
                return None;
            }
        };
        if response.status() == reqwest::StatusCode::NOT_MODIFIED {
            return None;
        }
        if !response.status().is_success() {
            warn!(status = %response.status(), "docs context fetch returned non-OK status");
            return None;
        }

        let new_etag = header_value(&response, ETAG.as_str()).or(etag);
        let new_last_modified = header_value(&response, LAST_MODIFIED.as_str()).or(last_modified);
        let html = match response.text().await {
            Ok(html) => html,
            Err(err) => {
                warn!(error = %err, "failed to read docs context body");
                return None;
            }
        };

        let context = clamp_chars(&strip_html(&html), DOCS_CONTEXT_MAX_CHARS);
        if current == Some(context.as_str()) {
            return None;
        }
        Some(DocsUpdate {
            context,
            etag: new_etag,
            last_modified: new_last_modified,
        })
    }

    /// Background non-forced refresh at the configured interval.
    pub async fn run_refresh_loop(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.schema_refresh_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it, cold boot already ran.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    if let Err(err) = self.refresh(false).await {
                        warn!(error = %err, "background catalog refresh failed");
                    }
                }
            }
        }
    }

    pub async fn operations(&self) -> Arc<Vec<Operation>> {
        Arc::clone(&self.published.read().await.operations)
    }

    pub async fn operation_by_id(&self, operation_id: &str) -> Option<Operation> {
        let published = self.published.read().await;
        published
            .by_id
            .get(operation_id)
            .map(|&index| published.operations[index].clone())
    }

    pub async fn root_schema(&self) -> Option<Arc<Value>> {
        self.published.read().await.root_schema.clone()
    }

    pub async fn docs_context(&self) -> Option<Arc<String>> {
        self.published.read().await.docs_context.clone()
    }

    pub async fn search_index(&self) -> Arc<SearchIndex> {
        Arc::clone(&self.published.read().await.index)
    }
}

struct DocsUpdate {
    context: String,
    etag: Option<String>,
    last_modified: Option<String>,
}

fn index_by_id(operations: &[Operation]) -> HashMap<String, usize> {
    operations
        .iter()
        .enumerate()
        .map(|(index, op)| (op.operation_id.clone(), index))
        .collect()
}

fn header_value(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn read_cache_file(path: &Path) -> Result<Option<CatalogCacheFile>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    let snapshot: CatalogCacheFile = serde_json::from_str(&raw)
        .with_context(|| format!("invalid catalog cache in {}", path.display()))?;
    if snapshot.version != CACHE_FILE_VERSION {
        bail!(
            "catalog cache version {} is not supported (expected {CACHE_FILE_VERSION})",
            snapshot.version
        );
    }
    Ok(Some(snapshot))
}

fn write_cache_file(path: &Path, snapshot: &CatalogCacheFile) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)
        .with_context(|| format!("failed to create {}", parent.display()))?;

    let mut temp = tempfile::Builder::new()
        .prefix(".portico-tmp-")
        .tempfile_in(parent)
        .with_context(|| format!("failed to create temp file in {}", parent.display()))?;
    serde_json::to_writer(temp.as_file_mut(), snapshot)
        .with_context(|| format!("failed to serialize catalog cache for {}", path.display()))?;
    temp.as_file_mut().write_all(b"\n")?;
    temp.as_file_mut().flush()?;
    temp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("failed to persist catalog cache to {}", path.display()))?;
    Ok(())
}

/// Drop `<script>`/`<style>` blocks, then every remaining tag, so the
/// docs page becomes a plain-text blob for the search side channel.
fn strip_html(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 2);
    let mut rest = html;

    while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        rest = &rest[open..];

        if starts_with_ci(rest, "<script") {
            rest = skip_block(rest, "</script");
        } else if starts_with_ci(rest, "<style") {
            rest = skip_block(rest, "</style");
        } else {
            match rest.find('>') {
                Some(end) => rest = &rest[end + 1..],
                None => {
                    rest = "";
                }
            }
        }
        out.push(' ');
    }
    out.push_str(rest);

    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn skip_block<'a>(rest: &'a str, closing: &str) -> &'a str {
    match find_ci(rest, closing) {
        Some(pos) => {
            let after = &rest[pos..];
            match after.find('>') {
                Some(end) => &after[end + 1..],
                None => "",
            }
        }
        None => "",
    }
}

fn starts_with_ci(haystack: &str, prefix: &str) -> bool {
    haystack.len() >= prefix.len() && haystack.as_bytes()[..prefix.len()]
        .eq_ignore_ascii_case(prefix.as_bytes())
}

/// Byte-level ASCII case-insensitive find; safe because the needle is
/// pure ASCII and ASCII bytes never occur inside multibyte UTF-8.
fn find_ci(haystack: &str, needle: &str) -> Option<usize> {
    let haystack = haystack.as_bytes();
    let needle = needle.as_bytes();
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .find(|&i| haystack[i..i + needle.len()].eq_ignore_ascii_case(needle))
}

fn clamp_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((boundary, _)) => text[..boundary].trim_end().to_string(),
        None => text.trim().to_string(),
    }
}
