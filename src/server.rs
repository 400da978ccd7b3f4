//! HTTP calling surface.
//!
//! A thin JSON API over the [`Orchestrator`]. Identity comes from request
//! headers set by whatever sits in front of this server; login and cookie
//! handling are not done here.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/chat` | Run a turn; returns a [`TurnOutcome`] |
//! | `POST` | `/interrupts/{token}/resume` | Grant a pending interrupt and continue the turn |
//! | `POST` | `/interrupts/{token}/decline` | Dismiss a pending interrupt |
//! | `GET`  | `/tools/list` | List tools with their schemas |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Headers
//!
//! | Header | Meaning |
//! |--------|---------|
//! | `x-subject` | Authenticated user id (required) |
//! | `x-refresh-token` | The user's refresh secret for the token vault |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "unknown_interrupt", "message": "no pending interrupt for token 'abc'" } }
//! ```
//!
//! Error codes: `unauthorized` (401), `forbidden` (403), `unknown_interrupt` (404),
//! `internal` (500). A turn that fails after it started is still a `200`
//! with `"status": "failed"` in the body.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::error::{as_gate_error, GateError};
use crate::orchestrator::{Orchestrator, TurnOutcome, TurnRequest};
use crate::session::{SessionProvider, StaticSession};
use crate::traits::ToolInfo;

pub const SUBJECT_HEADER: &str = "x-subject";
pub const REFRESH_TOKEN_HEADER: &str = "x-refresh-token";

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<Orchestrator>,
}

/// Serve the API on `bind` until the process is terminated.
pub async fn run_server(bind: &str, orchestrator: Arc<Orchestrator>) -> anyhow::Result<()> {
    for t in orchestrator.tools().tools() {
        let tag = if t.is_builtin() { "builtin" } else { "extension" };
        tracing::info!(tool = t.name(), kind = tag, "registered tool");
    }

    let app = router(orchestrator);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %bind, "agent gate listening");
    println!("Agent gate listening on http://{}", bind);
    axum::serve(listener, app).await?;

    Ok(())
}

/// The API routes, for embedding in a larger server.
pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/chat", post(handle_chat))
        .route("/interrupts/{token}/resume", post(handle_resume))
        .route("/interrupts/{token}/decline", post(handle_decline))
        .route("/tools/list", get(handle_list_tools))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState { orchestrator })
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
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

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized".to_string(),
        message: message.into(),
    }
}

/// Map a resume/decline error to a response.
fn classify_error(err: anyhow::Error) -> AppError {
    match as_gate_error(&err) {
        Some(GateError::UnknownInterrupt(_)) => AppError {
            status: StatusCode::NOT_FOUND,
            code: "unknown_interrupt".to_string(),
            message: err.to_string(),
        },
        Some(GateError::AuthorizationDenied(_)) => AppError {
            status: StatusCode::FORBIDDEN,
            code: "forbidden".to_string(),
            message: err.to_string(),
        },
        _ => {
            tracing::error!(error = %err, "interrupt resolution failed");
            AppError {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                code: "internal".to_string(),
                message: crate::error::GENERIC_FAILURE_MESSAGE.to_string(),
            }
        }
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// The session described by the identity headers. A missing subject is 401.
fn session_from_headers(headers: &HeaderMap) -> Result<Arc<dyn SessionProvider>, AppError> {
    let session = StaticSession::from_parts(
        header_value(headers, SUBJECT_HEADER),
        header_value(headers, REFRESH_TOKEN_HEADER),
    );
    if header_value(headers, SUBJECT_HEADER)
        .filter(|s| !s.trim().is_empty())
        .is_none()
    {
        return Err(unauthorized(format!("missing {} header", SUBJECT_HEADER)));
    }
    Ok(Arc::new(session))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /tools/list ============

#[derive(Serialize)]
struct ToolListResponse {
    tools: Vec<ToolInfo>,
}

async fn handle_list_tools(State(state): State<AppState>) -> Json<ToolListResponse> {
    Json(ToolListResponse {
        tools: state.orchestrator.tools().infos(),
    })
}

// ============ POST /chat ============

async fn handle_chat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<TurnRequest>,
) -> Result<Json<TurnOutcome>, AppError> {
    let session = session_from_headers(&headers)?;
    Ok(Json(state.orchestrator.run_turn(request, session).await))
}

// ============ POST /interrupts/{token}/... ============

async fn handle_resume(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TurnOutcome>, AppError> {
    let session = session_from_headers(&headers)?;
    state
        .orchestrator
        .resume(&token, session)
        .await
        .map(Json)
        .map_err(classify_error)
}

async fn handle_decline(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TurnOutcome>, AppError> {
    let session = session_from_headers(&headers)?;
    state
        .orchestrator
        .decline(&token, session)
        .await
        .map(Json)
        .map_err(classify_error)
}
