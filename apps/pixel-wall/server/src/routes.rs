use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{ws::rejection::WebSocketUpgradeRejection, Query, State, WebSocketUpgrade},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use metrics::counter;
use pixel_wall_core::{TokenRequest, TokenRequestError, TokenResponse};
use serde::Deserialize;
use serde_json::json;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::{session::handle_socket, state::AppState};

pub fn build_router(state: Arc<AppState>) -> Router {
    // answers every OPTIONS /token itself, preflight or not
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    let token_routes = Router::new()
        .route("/token", post(issue_token))
        .layer(cors);

    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route("/ws", get(ws_handler))
        .merge(token_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct ChannelQuery {
    otp: Option<String>,
}

/// Client-facing rejection for the token endpoint.
struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<TokenRequestError> for ApiError {
    fn from(err: TokenRequestError) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.stats())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let body = state.render_metrics();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

async fn issue_token(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<TokenResponse>, ApiError> {
    let request: TokenRequest = serde_json::from_slice(&body)
        .map_err(|err| TokenRequestError::Malformed(err.to_string()))?;
    request.validate()?;

    let grant = state.tokens.issue(&request.user_id, &request.user_name);
    counter!("pixel_wall_tokens_issued_total", 1);
    info!(
        user_id = %request.user_id,
        expires_at = %grant.expires_at,
        "issued channel token"
    );
    Ok(Json(TokenResponse::from(grant)))
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ChannelQuery>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let Some(otp) = query.otp.filter(|otp| !otp.is_empty()) else {
        counter!("pixel_wall_token_verify_total", 1, "outcome" => "missing");
        return StatusCode::UNAUTHORIZED.into_response();
    };
    // only spend the token once the upgrade can actually happen
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let identity = state.tokens.verify_and_consume(&otp);
    match &identity {
        Some(record) => {
            counter!("pixel_wall_token_verify_total", 1, "outcome" => "accepted");
            info!(user_id = %record.user_id, "channel token accepted");
        }
        None if state.config.reject_invalid_otp => {
            counter!("pixel_wall_token_verify_total", 1, "outcome" => "rejected");
            warn!("refusing upgrade with unknown or expired token");
            return StatusCode::UNAUTHORIZED.into_response();
        }
        None => {
            counter!("pixel_wall_token_verify_total", 1, "outcome" => "rejected");
            warn!("unknown or expired token; admitting client anonymously");
        }
    }

    ws.on_upgrade(move |socket| handle_socket(state, socket, identity))
}
