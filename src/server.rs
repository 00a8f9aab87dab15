//! Discord interactions endpoint.
//!
//! Discord delivers slash commands as signed HTTP POSTs. The server checks
//! the Ed25519 signature, answers pings, and hands application commands to
//! the [`Dispatcher`]. The dispatcher's reply goes back as the interaction
//! response; follow-up results arrive later as channel messages.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/interactions` | Signed Discord interaction webhook |
//! | `GET`  | `/commands` | Slash-command definitions as registered |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "unauthorized", "message": "invalid request signature" } }
//! ```
//!
//! Error codes: `bad_request` (400), `unauthorized` (401).

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ed25519_dalek::VerifyingKey;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use crate::commands::Dispatcher;
use crate::discord::{
    verify_signature, CommandDefinition, Interaction, InteractionResponse,
    INTERACTION_APPLICATION_COMMAND, INTERACTION_PING,
};

pub const SIGNATURE_HEADER: &str = "X-Signature-Ed25519";
pub const TIMESTAMP_HEADER: &str = "X-Signature-Timestamp";

#[derive(Clone)]
struct AppState {
    dispatcher: Arc<Dispatcher>,
    public_key: VerifyingKey,
}

/// Builds the router without binding, so tests can serve it on any port.
pub fn router(dispatcher: Arc<Dispatcher>, public_key: VerifyingKey) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/interactions", post(handle_interaction))
        .route("/commands", get(handle_commands))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(AppState {
            dispatcher,
            public_key,
        })
}

/// Serves `app` on `bind` until `shutdown` resolves.
pub async fn run_server(
    bind: &str,
    app: Router,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "interactions endpoint listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
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
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
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

fn unauthorized(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::UNAUTHORIZED,
        code: "unauthorized",
        message: message.into(),
    }
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

// ============ GET /commands ============

async fn handle_commands(State(state): State<AppState>) -> Json<Vec<CommandDefinition>> {
    Json(state.dispatcher.definitions())
}

// ============ POST /interactions ============

/// Signature check first, then parse: unsigned bodies are never inspected.
async fn handle_interaction(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<InteractionResponse>, AppError> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    let (Some(signature), Some(timestamp)) = (header(SIGNATURE_HEADER), header(TIMESTAMP_HEADER))
    else {
        return Err(unauthorized("missing signature headers"));
    };
    if !verify_signature(&state.public_key, signature, timestamp, &body) {
        warn!("rejected interaction with invalid signature");
        return Err(unauthorized("invalid request signature"));
    }

    let interaction: Interaction = serde_json::from_slice(&body)
        .map_err(|e| bad_request(format!("invalid interaction payload: {}", e)))?;

    match interaction.kind {
        INTERACTION_PING => {
            debug!("ping");
            Ok(Json(InteractionResponse::pong()))
        }
        INTERACTION_APPLICATION_COMMAND => {
            let channel_id = interaction
                .channel_id
                .ok_or_else(|| bad_request("interaction has no channel"))?;
            let data = interaction
                .data
                .ok_or_else(|| bad_request("interaction has no command data"))?;
            info!(id = %interaction.id, channel = %channel_id, command = %data.name, "interaction");
            // The background task, if any, outlives the request.
            let dispatch = state
                .dispatcher
                .dispatch(&channel_id, &data.name, &data.options)
                .await;
            Ok(Json(InteractionResponse::message(dispatch.reply)))
        }
        other => Err(bad_request(format!("unsupported interaction type {}", other))),
    }
}
