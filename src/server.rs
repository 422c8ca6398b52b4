//! Per-media query server.
//!
//! `takeout-ingest serve <kind>` starts one HTTP server for one media kind.
//! Its tools are exposed twice: as a JSON API and over MCP.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | `{status, media, version}` |
//! | `GET`  | `/tools/list` | Registered tools with parameter schemas |
//! | `POST` | `/tools/{name}` | Call a tool; result wrapped in `{ "result": ... }` |
//! | `*`    | `/sse`, `/mcp` | MCP Streamable HTTP |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `missing_api_key`
//! (400), `tool_error` (500).

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::Config;
use crate::library::MediaLibrary;
use crate::mcp::McpBridge;
use crate::media::{self, MediaError};
use crate::models::MediaKind;
use crate::tools::{validate_params, ToolContext, ToolInfo, ToolRegistry};

#[derive(Clone)]
struct AppState {
    kind: MediaKind,
    library: MediaLibrary,
    tools: Arc<ToolRegistry>,
}

/// Bind `host:port` (defaults from `[servers]`) and serve until Ctrl-C.
///
/// Audio, video, and image servers refuse to start without an API key.
pub async fn run_server(
    config: &Config,
    kind: MediaKind,
    host: Option<&str>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    media::require_api_key(&config.media, kind)?;

    let host = host.unwrap_or(&config.servers.host).to_string();
    let port = port.unwrap_or_else(|| config.servers.port_for(kind));
    let bind_addr = format!("{}:{}", host, port);

    let library = MediaLibrary::open(Arc::new(config.clone())).await?;
    let tools = Arc::new(ToolRegistry::for_media(kind));

    let app = router(kind, library, tools.clone());

    println!("takeout-{} listening on http://{}", kind.as_str(), bind_addr);
    for t in tools.tools() {
        println!("  POST /tools/{}  {}", t.name(), t.description());
    }
    println!("  MCP endpoint: http://{}/sse", bind_addr);
    tracing::info!(media = %kind, addr = %bind_addr, "server started");

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!(media = %kind, "server stopped");
    Ok(())
}

/// All routes for one media kind.
pub fn router(kind: MediaKind, library: MediaLibrary, tools: Arc<ToolRegistry>) -> Router {
    let bridge = McpBridge::new(kind, library.clone(), tools.clone());
    let mcp_service = move || {
        let bridge = bridge.clone();
        StreamableHttpService::new(
            move || Ok(bridge.clone()),
            LocalSessionManager::default().into(),
            StreamableHttpServerConfig::default(),
        )
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let state = AppState {
        kind,
        library,
        tools,
    };

    Router::new()
        .route("/health", get(handle_health))
        .route("/tools/list", get(handle_list_tools))
        .route("/tools/{name}", post(handle_tool_call))
        .nest_service("/sse", mcp_service())
        .nest_service("/mcp", mcp_service())
        .layer(cors)
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found",
        message: message.into(),
    }
}

fn missing_api_key(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "missing_api_key",
        message: message.into(),
    }
}

fn tool_error(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "tool_error",
        message: message.into(),
    }
}

/// Map a tool failure to an HTTP error. Typed media errors are checked
/// first; the rest are classified by message.
fn classify_tool_error(tool_name: &str, err: anyhow::Error) -> AppError {
    let msg = format!("{}: {}", tool_name, err);

    match err.downcast_ref::<MediaError>() {
        Some(MediaError::MissingApiKey { .. }) => return missing_api_key(msg),
        Some(MediaError::TooLarge { .. }) => return bad_request(msg),
        _ => {}
    }

    let lower = err.to_string().to_ascii_lowercase();
    if lower.contains("not found") {
        not_found(msg)
    } else if lower.contains("must")
        || lower.contains("unsupported")
        || lower.contains("requires embeddings")
        || lower.contains("invalid")
    {
        bad_request(msg)
    } else {
        tool_error(msg)
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    media: &'static str,
    version: &'static str,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        media: state.kind.as_str(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ GET /tools/list ============

#[derive(Serialize)]
struct ToolListResponse {
    media: &'static str,
    tools: Vec<ToolInfo>,
}

async fn handle_list_tools(State(state): State<AppState>) -> Json<ToolListResponse> {
    Json(ToolListResponse {
        media: state.kind.as_str(),
        tools: state.tools.infos(),
    })
}

// ============ POST /tools/{name} ============

/// An empty body counts as `{}`.
async fn handle_tool_call(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Json<serde_json::Value>, AppError> {
    let tool = state
        .tools
        .find(&name)
        .ok_or_else(|| not_found(format!("no tool registered with name: {}", name)))?;

    let params: serde_json::Value = if body.iter().all(|b| b.is_ascii_whitespace()) {
        serde_json::json!({})
    } else {
        serde_json::from_slice(&body).map_err(|e| bad_request(format!("invalid JSON body: {}", e)))?
    };

    let params = validate_params(&tool.parameters_schema(), &params)
        .map_err(|e| bad_request(e.to_string()))?;

    let ctx = ToolContext::new(state.library.clone());
    let result = tool
        .execute(params, &ctx)
        .await
        .map_err(|e| classify_tool_error(&name, e))?;

    Ok(Json(serde_json::json!({ "result": result })))
}
