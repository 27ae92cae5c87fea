use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use rmcp::{
    Json, RoleServer, ServerHandler, ServiceExt,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{Meta, ServerCapabilities, ServerInfo},
    service::RequestContext,
    tool, tool_handler, tool_router,
};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::errors::ErrorEnvelope;
use crate::executor::{ExecuteRequest, ExecuteResponse};
use crate::oauth::AuthStatus;
use crate::tools::{SearchRequest, SearchResponse, ToolService};

#[derive(Clone)]
pub struct McpServer {
    tools: Arc<ToolService>,
    tool_router: ToolRouter<Self>,
}

impl McpServer {
    pub fn new(tools: Arc<ToolService>) -> Self {
        Self {
            tools,
            tool_router: Self::tool_router(),
        }
    }
}

#[tool_router(router = tool_router)]
impl McpServer {
    #[tool(
        name = "search",
        description = "Rank Heroku Platform API operations by free-text intent; returns operation ids for execute"
    )]
    async fn search(
        &self,
        Parameters(params): Parameters<SearchRequest>,
    ) -> Result<Json<SearchResponse>, String> {
        self.tools.search(params).await.map(Json).map_err(envelope_err)
    }

    #[tool(
        name = "execute",
        description = "Execute one operation by id. Mutating operations need a dry_run first and its confirm_write_token on the real call."
    )]
    async fn execute(
        &self,
        Parameters(params): Parameters<ExecuteRequest>,
        context: RequestContext<RoleServer>,
    ) -> Result<Json<ExecuteResponse>, String> {
        let headers = headers_from_meta(&context.meta);
        self.tools
            .execute(&headers, params)
            .await
            .map(Json)
            .map_err(envelope_err)
    }

    #[tool(
        name = "auth_status",
        description = "Report whether the caller has a stored Heroku credential, its scopes and expiry"
    )]
    async fn auth_status(
        &self,
        context: RequestContext<RoleServer>,
    ) -> Result<Json<AuthStatus>, String> {
        let headers = headers_from_meta(&context.meta);
        self.tools
            .auth_status(&headers)
            .await
            .map(Json)
            .map_err(envelope_err)
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for McpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "portico fronts the Heroku Platform API with three tools:\n\
                 1. search: find operations by intent; results carry operation_id and required_params.\n\
                 2. execute: run one operation. Reads run directly; writes need dry_run=true first,\n\
                    then the same call again with the returned confirm_write_token.\n\
                 3. auth_status: check whether this caller is authenticated; if not, complete the\n\
                    OAuth flow via the /oauth/start endpoint."
                    .into(),
            ),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

/// The MCP host forwards request-scoped transport headers through `_meta`;
/// stdio sessions without any produce an empty map and fall back to the
/// shared default caller.
fn headers_from_meta(meta: &Meta) -> HashMap<String, String> {
    match serde_json::to_value(meta) {
        Ok(Value::Object(map)) => map
            .into_iter()
            .filter_map(|(name, value)| {
                value
                    .as_str()
                    .map(|v| (name.to_ascii_lowercase(), v.to_string()))
            })
            .collect(),
        _ => HashMap::new(),
    }
}

fn envelope_err(envelope: ErrorEnvelope) -> String {
    serde_json::to_string(&envelope).unwrap_or(envelope.message)
}

/// Serve the tool surface over stdio until the transport closes or
/// shutdown is requested.
pub async fn run(tools: Arc<ToolService>, shutdown: CancellationToken) -> Result<()> {
    let server = McpServer::new(tools);
    let service = server
        .serve(rmcp::transport::stdio())
        .await
        .context("failed to start MCP stdio server")?;
    info!("MCP server listening on stdio");

    let cancel_token = service.cancellation_token();
    tokio::select! {
        _ = shutdown.cancelled() => {
            cancel_token.cancel();
        }
        result = service.waiting() => {
            result.context("MCP server terminated unexpectedly")?;
        }
    }
    Ok(())
}
