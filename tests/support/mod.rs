// Not every test binary uses every helper.
#![allow(dead_code)]

use std::time::Duration;

use portico::config::{OAuthSettings, Settings};
use serde_json::{Value, json};

/// Baseline settings for tests; individual tests override fields inline.
pub fn test_settings(temp: &tempfile::TempDir) -> Settings {
    Settings {
        schema_url: "http://127.0.0.1:9/schema".to_string(),
        api_base_url: "https://api.heroku.com".to_string(),
        docs_url: "http://127.0.0.1:9/docs".to_string(),
        accept_header: "application/vnd.heroku+json; version=3".to_string(),
        schema_refresh_interval: Duration::from_secs(3600),
        catalog_cache_path: temp.path().join("catalog.json"),
        allow_writes: false,
        request_timeout: Duration::from_secs(5),
        max_retries: 2,
        read_cache_ttl: Duration::ZERO,
        execute_max_body_bytes: 51_200,
        execute_body_preview_chars: 500,
        user_id_header: "x-user-id".to_string(),
        write_confirm_secret: "test-write-secret".to_string(),
        token_store_path: temp.path().join("tokens.json"),
        token_encryption_key: [11u8; 32],
        oauth: OAuthSettings {
            client_id: "client-id".to_string(),
            client_secret: "client-secret".to_string(),
            scope: "global".to_string(),
            authorize_url: "https://id.heroku.com/oauth/authorize".to_string(),
            token_url: "https://id.heroku.com/oauth/token".to_string(),
            redirect_uri: "http://localhost:8787/oauth/callback".to_string(),
        },
    }
}

/// A small Heroku-shaped root schema covering reads, writes, path
/// references and a body schema.
pub fn fixture_root_schema() -> Value {
    json!({
        "definitions": {
            "app": {
                "definitions": {
                    "identity": {"type": "string"}
                },
                "links": [
                    {
                        "href": "/apps",
                        "method": "GET",
                        "rel": "instances",
                        "title": "List",
                        "description": "List existing apps."
                    },
                    {
                        "href": "/apps",
                        "method": "POST",
                        "rel": "create",
                        "title": "Create",
                        "description": "Create a new app.",
                        "schema": {
                            "type": "object",
                            "properties": {
                                "name": {"type": "string"},
                                "region": {"type": "string"}
                            },
                            "required": ["name"],
                            "additionalProperties": false
                        }
                    },
                    {
                        "href": "/apps/{(%23%2Fdefinitions%2Fapp%2Fdefinitions%2Fidentity)}",
                        "method": "GET",
                        "rel": "self",
                        "title": "Info",
                        "description": "Info for existing app."
                    },
                    {
                        "href": "/apps/{(%23%2Fdefinitions%2Fapp%2Fdefinitions%2Fidentity)}",
                        "method": "PATCH",
                        "rel": "update",
                        "title": "Update",
                        "description": "Update an existing app."
                    }
                ]
            },
            "release": {
                "links": [
                    {
                        "href": "/apps/{(%23%2Fdefinitions%2Fapp%2Fdefinitions%2Fidentity)}/releases",
                        "method": "GET",
                        "rel": "instances",
                        "title": "List releases",
                        "description": "List releases for an app."
                    }
                ]
            }
        }
    })
}
