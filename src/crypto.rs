use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::{Context, Result, anyhow};
use base64::{
    Engine,
    engine::general_purpose::{STANDARD as BASE64, URL_SAFE_NO_PAD},
};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;
const CONFIRMATION_TOKEN_LEN: usize = 48;

/// One encrypted value at rest: AES-256-GCM with a fresh 96-bit IV per
/// write, the tag carried separately, all fields base64.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedRecord {
    pub iv: String,
    pub tag: String,
    pub ciphertext: String,
}

/// AES-256-GCM wrapper around a caller-provided 32-byte key.
#[derive(Clone)]
pub struct SecretBox {
    cipher: Aes256Gcm,
}

impl SecretBox {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
        }
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<SealedRecord> {
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);

        let mut sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&iv), Payload::from(plaintext))
            .map_err(|_| anyhow!("AES-GCM encryption failed"))?;
        let tag = sealed.split_off(sealed.len() - TAG_LEN);

        Ok(SealedRecord {
            iv: BASE64.encode(iv),
            tag: BASE64.encode(tag),
            ciphertext: BASE64.encode(sealed),
        })
    }

    pub fn open(&self, record: &SealedRecord) -> Result<Vec<u8>> {
        let iv = BASE64
            .decode(&record.iv)
            .context("sealed record iv is not base64")?;
        let tag = BASE64
            .decode(&record.tag)
            .context("sealed record tag is not base64")?;
        let mut sealed = BASE64
            .decode(&record.ciphertext)
            .context("sealed record ciphertext is not base64")?;
        if iv.len() != IV_LEN {
            anyhow::bail!("sealed record iv must be {IV_LEN} bytes, got {}", iv.len());
        }
        sealed.extend_from_slice(&tag);

        self.cipher
            .decrypt(Nonce::from_slice(&iv), Payload::from(sealed.as_slice()))
            .map_err(|_| anyhow!("AES-GCM decryption failed; record may be tampered"))
    }
}

/// Deterministic JSON serialization: object keys sorted ascending, array
/// order preserved, null rendered as the literal `null`. Only used to
/// derive a stable byte string for HMAC payloads.
pub fn stable_stringify(value: &Value) -> String {
    let mut out = String::new();
    write_stable(value, &mut out);
    out
}

fn write_stable(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(v) => out.push_str(if *v { "true" } else { "false" }),
        Value::Number(v) => out.push_str(&v.to_string()),
        Value::String(v) => {
            out.push_str(&Value::String(v.clone()).to_string());
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_stable(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_stable(&map[key], out);
            }
            out.push('}');
        }
    }
}

/// Stateless confirmation token binding a mutating request's shape to the
/// server secret. Recomputed on the confirmed call, never stored.
pub fn confirmation_token(
    secret: &str,
    user_id: &str,
    operation_id: &str,
    path_params: &Value,
    query_params: &Value,
    body: &Value,
) -> String {
    let payload = format!(
        "{user_id}|{operation_id}|{}|{}|{}",
        stable_stringify(path_params),
        stable_stringify(query_params),
        stable_stringify(body),
    );

    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
        .expect("HMAC accepts keys of any length");
    mac.update(payload.as_bytes());
    let digest = mac.finalize().into_bytes();

    let mut token = URL_SAFE_NO_PAD.encode(digest);
    token.truncate(CONFIRMATION_TOKEN_LEN);
    token
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{SecretBox, confirmation_token, stable_stringify};

    #[test]
    fn seal_and_open_roundtrip() {
        let secret_box = SecretBox::new(&[9u8; 32]);
        let record = secret_box.seal(b"refresh-me").expect("seal");
        assert_ne!(record.iv, record.tag);
        assert_eq!(secret_box.open(&record).expect("open"), b"refresh-me");
    }

    #[test]
    fn fresh_iv_per_seal() {
        let secret_box = SecretBox::new(&[9u8; 32]);
        let first = secret_box.seal(b"same plaintext").expect("seal");
        let second = secret_box.seal(b"same plaintext").expect("seal");
        assert_ne!(first.iv, second.iv);
        assert_ne!(first.ciphertext, second.ciphertext);
    }

    #[test]
    fn tampered_ciphertext_fails_to_open() {
        let secret_box = SecretBox::new(&[9u8; 32]);
        let mut record = secret_box.seal(b"payload").expect("seal");
        record.ciphertext = record.tag.clone();
        assert!(secret_box.open(&record).is_err());
    }

    #[test]
    fn wrong_key_fails_to_open() {
        let record = SecretBox::new(&[1u8; 32]).seal(b"payload").expect("seal");
        assert!(SecretBox::new(&[2u8; 32]).open(&record).is_err());
    }

    #[test]
    fn stable_stringify_sorts_keys_and_keeps_array_order() {
        let value = json!({"b": 1, "a": [3, 1, 2], "c": {"z": null, "y": "s"}});
        assert_eq!(
            stable_stringify(&value),
            r#"{"a":[3,1,2],"b":1,"c":{"y":"s","z":null}}"#
        );
    }

    #[test]
    fn confirmation_token_is_deterministic_and_shape_sensitive() {
        let path = json!({"app_identity": "my-app"});
        let query = json!({});
        let body = json!({"name": "demo"});

        let first = confirmation_token("secret", "u1", "POST /apps", &path, &query, &body);
        let second = confirmation_token("secret", "u1", "POST /apps", &path, &query, &body);
        assert_eq!(first, second);
        assert!(first.len() <= 48);
        assert!(!first.is_empty());

        let other_user = confirmation_token("secret", "u2", "POST /apps", &path, &query, &body);
        assert_ne!(first, other_user);

        let other_body =
            confirmation_token("secret", "u1", "POST /apps", &path, &query, &json!({"name": "x"}));
        assert_ne!(first, other_body);
    }

    #[test]
    fn confirmation_token_ignores_key_ordering_at_the_source() {
        let body_one = serde_json::from_str(r#"{"name":"demo","region":"eu"}"#).expect("json");
        let body_two = serde_json::from_str(r#"{"region":"eu","name":"demo"}"#).expect("json");
        let query = serde_json::json!({});
        let path = serde_json::json!({});

        assert_eq!(
            confirmation_token("s", "u", "POST /apps", &path, &query, &body_one),
            confirmation_token("s", "u", "POST /apps", &path, &query, &body_two),
        );
    }
}
