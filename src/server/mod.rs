mod mcp;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::catalog::SchemaService;
use crate::cli::ServeArgs;
use crate::config::Settings;
use crate::executor::Executor;
use crate::oauth::OAuthService;
use crate::token_store::TokenStore;
use crate::tools::{DEFAULT_CALLER_ID, LiveDeps, ToolService};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const SERVICE_NAME: &str = "portico";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceTask {
    Http,
    Mcp,
    SchemaRefresh,
    StateSweeper,
}

impl fmt::Display for ServiceTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceTask::Http => write!(f, "http"),
            ServiceTask::Mcp => write!(f, "mcp"),
            ServiceTask::SchemaRefresh => write!(f, "schema-refresh"),
            ServiceTask::StateSweeper => write!(f, "state-sweeper"),
        }
    }
}

#[derive(Debug)]
struct TaskOutcome {
    task: ServiceTask,
    result: Result<()>,
}

pub async fn serve(args: ServeArgs, settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    let http = build_http_client(&settings);

    let store = Arc::new(TokenStore::new(
        settings.token_store_path.clone(),
        &settings.token_encryption_key,
    ));
    let oauth = OAuthService::new(Arc::clone(&settings), store, http.clone());
    let catalog = Arc::new(SchemaService::new(Arc::clone(&settings), http.clone()));
    catalog.cold_boot().await;

    let deps = LiveDeps::new(
        Arc::clone(&catalog),
        oauth.clone(),
        http,
        Arc::clone(&settings),
    );
    let executor = Executor::new(deps, Arc::clone(&settings));
    let tools = Arc::new(ToolService::new(
        Arc::clone(&catalog),
        executor,
        oauth.clone(),
        Arc::clone(&settings),
    ));

    if !settings.allow_writes {
        info!("mutating upstream calls are disabled (ALLOW_WRITES is off)");
    }

    let shutdown = CancellationToken::new();
    let mut tasks: JoinSet<TaskOutcome> = JoinSet::new();

    {
        let oauth = oauth.clone();
        let bind = SocketAddr::from((args.host, args.port));
        let http_shutdown = shutdown.child_token();
        tasks.spawn(async move {
            TaskOutcome {
                task: ServiceTask::Http,
                result: run_http(bind, oauth, http_shutdown).await,
            }
        });
    }
    {
        let catalog = Arc::clone(&catalog);
        let refresh_shutdown = shutdown.child_token();
        tasks.spawn(async move {
            catalog.run_refresh_loop(refresh_shutdown).await;
            TaskOutcome {
                task: ServiceTask::SchemaRefresh,
                result: Ok(()),
            }
        });
    }
    {
        let oauth = oauth.clone();
        let sweeper_shutdown = shutdown.child_token();
        tasks.spawn(async move {
            oauth.run_state_sweeper(sweeper_shutdown).await;
            TaskOutcome {
                task: ServiceTask::StateSweeper,
                result: Ok(()),
            }
        });
    }
    {
        let tools = Arc::clone(&tools);
        let mcp_shutdown = shutdown.child_token();
        tasks.spawn(async move {
            TaskOutcome {
                task: ServiceTask::Mcp,
                result: mcp::run(tools, mcp_shutdown).await,
            }
        });
    }

    // The MCP transport controls process lifetime: when the host closes
    // stdio, the server shuts down. Background loops are non-fatal.
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received shutdown signal");
                break;
            }
            joined = tasks.join_next() => {
                let Some(result) = joined else { break };
                match result {
                    Ok(outcome) => match outcome.result {
                        Ok(()) if matches!(outcome.task, ServiceTask::Mcp | ServiceTask::Http) => {
                            info!(task = %outcome.task, "service task exited, shutting down");
                            break;
                        }
                        Ok(()) => info!(task = %outcome.task, "service task exited"),
                        Err(err) if outcome.task == ServiceTask::Mcp => {
                            error!(error = %err, "mcp task failed");
                            shutdown.cancel();
                            drain_remaining(&mut tasks).await;
                            return Err(err);
                        }
                        Err(err) => {
                            warn!(task = %outcome.task, error = %err, "service task failed (non-fatal)");
                        }
                    },
                    Err(err) => warn!(error = %err, "service task join failed"),
                }
            }
        }
    }

    shutdown.cancel();
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, drain_remaining(&mut tasks))
        .await
        .is_err()
    {
        warn!("graceful shutdown timed out, exiting");
    }
    Ok(())
}

pub fn build_http_client(settings: &Settings) -> reqwest::Client {
    match reqwest::Client::builder()
        .timeout(settings.request_timeout)
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            warn!(error = %err, "failed to build configured HTTP client; falling back to default reqwest client");
            reqwest::Client::new()
        }
    }
}

async fn drain_remaining(tasks: &mut JoinSet<TaskOutcome>) {
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok(outcome) => match outcome.result {
                Ok(()) => info!(task = %outcome.task, "service task exited"),
                Err(err) => warn!(
                    task = %outcome.task,
                    error = %err,
                    "service task failed during shutdown"
                ),
            },
            Err(err) => warn!(error = %err, "service task panicked during shutdown"),
        }
    }
}

/// Collaborator HTTP surface: health probe plus the browser-facing OAuth
/// endpoints. Everything else goes through the MCP tool surface.
async fn run_http(
    bind: SocketAddr,
    oauth: OAuthService,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/oauth/start", get(oauth_start))
        .route("/oauth/callback", get(oauth_callback))
        .route("/oauth/status", get(oauth_status))
        .with_state(oauth);

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {bind}"))?;
    info!(addr = %bind, "HTTP endpoints listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("HTTP server terminated unexpectedly")
}

async fn healthz() -> impl IntoResponse {
    Json(json!({"ok": true, "service": SERVICE_NAME}))
}

#[derive(Debug, Deserialize)]
struct StartParams {
    user_id: Option<String>,
    mode: Option<String>,
}

async fn oauth_start(
    State(oauth): State<OAuthService>,
    Query(params): Query<StartParams>,
) -> Result<axum::response::Response, (StatusCode, String)> {
    let user_id = params
        .user_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CALLER_ID.to_string());
    let url = oauth
        .authorization_url(&user_id)
        .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?;

    if params.mode.as_deref() == Some("json") {
        Ok(Json(json!({"authorization_url": url, "user_id": user_id})).into_response())
    } else {
        Ok(Redirect::temporary(&url).into_response())
    }
}

#[derive(Debug, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
}

async fn oauth_callback(
    State(oauth): State<OAuthService>,
    Query(params): Query<CallbackParams>,
) -> Result<String, (StatusCode, String)> {
    let (Some(code), Some(state)) = (params.code, params.state) else {
        return Err((
            StatusCode::BAD_REQUEST,
            "both code and state query parameters are required".to_string(),
        ));
    };
    let user_id = oauth
        .handle_callback(&state, &code)
        .await
        .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?;
    Ok(format!(
        "Authorization complete for '{user_id}'. You can close this window."
    ))
}

#[derive(Debug, Deserialize)]
struct StatusParams {
    user_id: Option<String>,
}

async fn oauth_status(
    State(oauth): State<OAuthService>,
    Query(params): Query<StatusParams>,
) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let user_id = params
        .user_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_CALLER_ID.to_string());
    let status = oauth
        .status_for(&user_id)
        .await
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;

    let mut payload = serde_json::to_value(&status)
        .map_err(|err| (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()))?;
    if let Some(object) = payload.as_object_mut() {
        object.insert("user_id".to_string(), json!(user_id));
    }
    Ok(Json(payload))
}
