use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::crypto::{SealedRecord, SecretBox};

/// One caller's OAuth credential as persisted (inside the encrypted
/// envelope) and as held in memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scope: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub obtained_at: Option<DateTime<Utc>>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Per-user token persistence: a single JSON file mapping caller id to an
/// AES-256-GCM envelope. The file is read lazily once per process and the
/// in-memory copy is authoritative afterwards; this store is single-owner
/// within one process and makes no cross-process guarantees.
pub struct TokenStore {
    path: PathBuf,
    secret_box: SecretBox,
    cache: Mutex<Option<BTreeMap<String, SealedRecord>>>,
}

impl TokenStore {
    pub fn new(path: PathBuf, key: &[u8; 32]) -> Self {
        Self {
            path,
            secret_box: SecretBox::new(key),
            cache: Mutex::new(None),
        }
    }

    /// Decrypt failure is an error for that user, not an empty result:
    /// an unreadable record means the stored credential was tampered with.
    pub async fn get(&self, user_id: &str) -> Result<Option<TokenRecord>> {
        let mut cache = self.cache.lock().await;
        let entries = self.load_if_needed(&mut cache).await?;

        let Some(sealed) = entries.get(user_id) else {
            return Ok(None);
        };
        let plaintext = self
            .secret_box
            .open(sealed)
            .with_context(|| format!("failed to decrypt token record for user '{user_id}'"))?;
        let record: TokenRecord = serde_json::from_slice(&plaintext)
            .with_context(|| format!("invalid token record payload for user '{user_id}'"))?;
        Ok(Some(record))
    }

    pub async fn put(&self, user_id: &str, record: &TokenRecord) -> Result<()> {
        let plaintext = serde_json::to_vec(record).context("failed to serialize token record")?;
        let sealed = self.secret_box.seal(&plaintext)?;

        let mut cache = self.cache.lock().await;
        let entries = self.load_if_needed(&mut cache).await?;
        entries.insert(user_id.to_string(), sealed);
        self.persist(entries).await
    }

    pub async fn delete(&self, user_id: &str) -> Result<bool> {
        let mut cache = self.cache.lock().await;
        let entries = self.load_if_needed(&mut cache).await?;
        let removed = entries.remove(user_id).is_some();
        if removed {
            self.persist(entries).await?;
        }
        Ok(removed)
    }

    async fn load_if_needed<'a>(
        &self,
        cache: &'a mut Option<BTreeMap<String, SealedRecord>>,
    ) -> Result<&'a mut BTreeMap<String, SealedRecord>> {
        if cache.is_none() {
            let path = self.path.clone();
            let loaded = tokio::task::spawn_blocking(move || read_store_file(&path))
                .await
                .context("token store load task failed")??;
            *cache = Some(loaded);
        }
        Ok(cache.get_or_insert_with(BTreeMap::new))
    }

    async fn persist(&self, entries: &BTreeMap<String, SealedRecord>) -> Result<()> {
        let path = self.path.clone();
        let payload =
            serde_json::to_string_pretty(entries).context("failed to serialize token store")?;
        tokio::task::spawn_blocking(move || write_store_file(&path, &payload))
            .await
            .context("token store write task failed")?
    }
}

fn read_store_file(path: &Path) -> Result<BTreeMap<String, SealedRecord>> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn write_store_file(path: &Path, payload: &str) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    std::fs::write(path, payload).with_context(|| format!("failed to write {}", path.display()))
}
