use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use rand::RngCore;
use tracing::warn;
use url::Url;

const DEFAULT_SCHEMA_URL: &str = "https://api.heroku.com/schema";
const DEFAULT_API_BASE_URL: &str = "https://api.heroku.com";
const DEFAULT_DOCS_URL: &str = "https://devcenter.heroku.com/articles/platform-api-reference";
const DEFAULT_ACCEPT_HEADER: &str = "application/vnd.heroku+json; version=3";
const DEFAULT_AUTHORIZE_URL: &str = "https://id.heroku.com/oauth/authorize";
const DEFAULT_TOKEN_URL: &str = "https://id.heroku.com/oauth/token";
const DEFAULT_OAUTH_SCOPE: &str = "global";
const DEFAULT_USER_ID_HEADER: &str = "x-user-id";

const DEFAULT_SCHEMA_REFRESH_INTERVAL_MS: u64 = 3_600_000;
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_RETRIES: u32 = 2;
const DEFAULT_READ_CACHE_TTL_MS: u64 = 0;
const DEFAULT_EXECUTE_MAX_BODY_BYTES: usize = 51_200;
const DEFAULT_EXECUTE_BODY_PREVIEW_CHARS: usize = 500;

/// Process-wide settings, resolved once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub schema_url: String,
    pub api_base_url: String,
    pub docs_url: String,
    pub accept_header: String,
    pub schema_refresh_interval: Duration,
    pub catalog_cache_path: PathBuf,
    pub allow_writes: bool,
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub read_cache_ttl: Duration,
    pub execute_max_body_bytes: usize,
    pub execute_body_preview_chars: usize,
    /// Lowercased name of the transport header carrying the caller id.
    pub user_id_header: String,
    pub write_confirm_secret: String,
    pub token_store_path: PathBuf,
    pub token_encryption_key: [u8; 32],
    pub oauth: OAuthSettings,
}

#[derive(Debug, Clone)]
pub struct OAuthSettings {
    pub client_id: String,
    pub client_secret: String,
    pub scope: String,
    pub authorize_url: String,
    pub token_url: String,
    pub redirect_uri: String,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let schema_url = env_string("SCHEMA_URL", DEFAULT_SCHEMA_URL);
        let api_base_url = env_string("API_BASE_URL", DEFAULT_API_BASE_URL);
        let docs_url = env_string("DOCS_URL", DEFAULT_DOCS_URL);
        validate_http_url("SCHEMA_URL", &schema_url)?;
        validate_http_url("API_BASE_URL", &api_base_url)?;
        validate_http_url("DOCS_URL", &docs_url)?;

        let authorize_url = env_string("OAUTH_AUTHORIZE_URL", DEFAULT_AUTHORIZE_URL);
        let token_url = env_string("OAUTH_TOKEN_URL", DEFAULT_TOKEN_URL);
        validate_http_url("OAUTH_AUTHORIZE_URL", &authorize_url)?;
        validate_http_url("OAUTH_TOKEN_URL", &token_url)?;

        let token_encryption_key = match std::env::var("TOKEN_ENCRYPTION_KEY") {
            Ok(raw) => decode_encryption_key(&raw)?,
            Err(std::env::VarError::NotPresent) => {
                warn!(
                    "TOKEN_ENCRYPTION_KEY is not set; using an ephemeral key, stored tokens will not survive a restart"
                );
                random_key()
            }
            Err(std::env::VarError::NotUnicode(_)) => {
                bail!("TOKEN_ENCRYPTION_KEY must be valid UTF-8")
            }
        };

        let write_confirm_secret = match std::env::var("WRITE_CONFIRM_SECRET") {
            Ok(raw) if !raw.trim().is_empty() => raw.trim().to_string(),
            _ => {
                warn!(
                    "WRITE_CONFIRM_SECRET is not set; using an ephemeral secret, confirmation tokens will not survive a restart"
                );
                BASE64.encode(random_key())
            }
        };

        Ok(Self {
            schema_url,
            api_base_url,
            docs_url,
            accept_header: env_string("ACCEPT_HEADER", DEFAULT_ACCEPT_HEADER),
            schema_refresh_interval: Duration::from_millis(env_u64(
                "SCHEMA_REFRESH_INTERVAL_MS",
                DEFAULT_SCHEMA_REFRESH_INTERVAL_MS,
            )?),
            catalog_cache_path: env_path("CATALOG_CACHE_PATH", ".portico/catalog.json"),
            allow_writes: env_bool("ALLOW_WRITES", false)?,
            request_timeout: Duration::from_millis(env_u64(
                "REQUEST_TIMEOUT_MS",
                DEFAULT_REQUEST_TIMEOUT_MS,
            )?),
            max_retries: u32::try_from(env_u64("MAX_RETRIES", u64::from(DEFAULT_MAX_RETRIES))?)
                .context("MAX_RETRIES is out of range")?,
            read_cache_ttl: Duration::from_millis(env_u64(
                "READ_CACHE_TTL_MS",
                DEFAULT_READ_CACHE_TTL_MS,
            )?),
            execute_max_body_bytes: env_usize(
                "EXECUTE_MAX_BODY_BYTES",
                DEFAULT_EXECUTE_MAX_BODY_BYTES,
            )?,
            execute_body_preview_chars: env_usize(
                "EXECUTE_BODY_PREVIEW_CHARS",
                DEFAULT_EXECUTE_BODY_PREVIEW_CHARS,
            )?,
            user_id_header: env_string("USER_ID_HEADER", DEFAULT_USER_ID_HEADER)
                .to_ascii_lowercase(),
            write_confirm_secret,
            token_store_path: env_path("TOKEN_STORE_PATH", ".portico/tokens.json"),
            token_encryption_key,
            oauth: OAuthSettings {
                client_id: env_string("OAUTH_CLIENT_ID", ""),
                client_secret: env_string("OAUTH_CLIENT_SECRET", ""),
                scope: env_string("OAUTH_SCOPE", DEFAULT_OAUTH_SCOPE),
                authorize_url,
                token_url,
                redirect_uri: env_string(
                    "OAUTH_REDIRECT_URI",
                    "http://localhost:8787/oauth/callback",
                ),
            },
        })
    }
}

fn env_string(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => value.trim().to_string(),
        _ => default.to_string(),
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    PathBuf::from(env_string(key, default))
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("{key} must be a non-negative integer, got '{value}'")),
        Err(_) => Ok(default),
    }
}

fn env_usize(key: &str, default: usize) -> Result<usize> {
    usize::try_from(env_u64(key, default as u64)?).with_context(|| format!("{key} is out of range"))
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match std::env::var(key) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            other => bail!("{key} must be a boolean, got '{other}'"),
        },
        Err(_) => Ok(default),
    }
}

fn validate_http_url(key: &str, raw: &str) -> Result<()> {
    let parsed = Url::parse(raw).with_context(|| format!("{key} is not a valid URL: '{raw}'"))?;
    match parsed.scheme() {
        "http" | "https" => {}
        other => bail!("{key} must use http or https, got '{other}'"),
    }
    if parsed.host_str().is_none() {
        bail!("{key} must include a host");
    }
    Ok(())
}

fn decode_encryption_key(raw: &str) -> Result<[u8; 32]> {
    let bytes = BASE64
        .decode(raw.trim())
        .context("TOKEN_ENCRYPTION_KEY must be base64")?;
    let key: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("TOKEN_ENCRYPTION_KEY must decode to exactly 32 bytes"))?;
    Ok(key)
}

fn random_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    key
}

#[cfg(test)]
mod tests {
    use base64::{Engine, engine::general_purpose::STANDARD as BASE64};

    use super::{decode_encryption_key, env_bool, validate_http_url};

    #[test]
    fn encryption_key_must_be_32_bytes() {
        let good = BASE64.encode([7u8; 32]);
        assert_eq!(decode_encryption_key(&good).expect("valid key"), [7u8; 32]);

        let short = BASE64.encode([7u8; 16]);
        let err = decode_encryption_key(&short).expect_err("short key must fail");
        assert!(err.to_string().contains("exactly 32 bytes"));

        assert!(decode_encryption_key("not-base64!!!").is_err());
    }

    #[test]
    fn url_validation_rejects_non_http_schemes() {
        assert!(validate_http_url("SCHEMA_URL", "https://api.heroku.com/schema").is_ok());
        assert!(validate_http_url("SCHEMA_URL", "ftp://example.com").is_err());
        assert!(validate_http_url("SCHEMA_URL", "not a url").is_err());
    }

    #[test]
    fn bool_parsing_accepts_common_spellings() {
        assert!(env_bool("PORTICO_TEST_BOOL_MISSING", true).expect("default"));

        unsafe { std::env::set_var("PORTICO_TEST_BOOL", "TRUE") };
        assert!(env_bool("PORTICO_TEST_BOOL", false).expect("parse"));
        unsafe { std::env::set_var("PORTICO_TEST_BOOL", "off") };
        assert!(!env_bool("PORTICO_TEST_BOOL", true).expect("parse"));
        unsafe { std::env::set_var("PORTICO_TEST_BOOL", "maybe") };
        assert!(env_bool("PORTICO_TEST_BOOL", false).is_err());
        unsafe { std::env::remove_var("PORTICO_TEST_BOOL") };
    }
}
