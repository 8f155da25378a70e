//! Supplementary HTTP API beside the socket protocol: liveness, playback
//! history, per-user notifications, and track search.

use axum::extract::{Path, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use onair_proto::config::HttpConfig;
use onair_proto::model::Genre;

use crate::DaemonContext;

pub fn start_server(config: &HttpConfig, context: DaemonContext) -> tokio::task::JoinHandle<()> {
    let app = router(config, context);
    let addr = format!("{}:{}", config.bind_address, config.port);

    tokio::spawn(async move {
        info!("HTTP API listening on http://{}", addr);
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                warn!("Failed to bind HTTP API on {}: {}", addr, e);
                return;
            }
        };
        if let Err(e) = axum::serve(listener, app).await {
            warn!("HTTP API error: {}", e);
        }
    })
}

fn router(config: &HttpConfig, context: DaemonContext) -> Router {
    Router::new()
        .route("/api/ping", get(ping))
        .route("/api/playback/{genre}", get(playback))
        .route("/api/notifications/{user_id}", get(notifications))
        .route("/api/search", post(search_youtube))
        .route("/api/search/rutube", post(search_rutube))
        .layer(cors_layer(config))
        .with_state(context)
}

fn cors_layer(config: &HttpConfig) -> CorsLayer {
    if config.allowed_origins.is_empty() {
        return CorsLayer::permissive();
    }

    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn ping() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "time": Utc::now(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn playback(Path(genre): Path<String>, State(context): State<DaemonContext>) -> Response {
    let Ok(genre) = genre.parse::<Genre>() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "message": "unknown genre" })),
        )
            .into_response();
    };

    match context.ledger.latest_for_genre(genre).await {
        Ok(Some(record)) => Json(record).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "message": "no played track for this genre" })),
        )
            .into_response(),
        Err(e) => {
            warn!("Playback lookup failed for {}: {}", genre, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "message": "ledger unavailable" })),
            )
                .into_response()
        }
    }
}

async fn notifications(
    Path(user_id): Path<String>,
    State(context): State<DaemonContext>,
) -> Response {
    Json(context.scheduler.notifications_for(&user_id).await).into_response()
}

#[derive(Debug, Deserialize)]
struct SearchBody {
    query: String,
}

async fn search_youtube(
    State(context): State<DaemonContext>,
    Json(body): Json<SearchBody>,
) -> Response {
    match context.search.youtube(&body.query).await {
        Ok(hit) => Json(hit).into_response(),
        Err(e) => search_error("YouTube", e),
    }
}

async fn search_rutube(
    State(context): State<DaemonContext>,
    Json(body): Json<SearchBody>,
) -> Response {
    match context.search.rutube(&body.query).await {
        Ok(hit) => Json(hit).into_response(),
        Err(e) => search_error("RuTube", e),
    }
}

fn search_error(platform: &str, e: anyhow::Error) -> Response {
    warn!("{} search failed: {:#}", platform, e);
    (
        StatusCode::BAD_GATEWAY,
        Json(json!({ "error": format!("{} search failed", platform) })),
    )
        .into_response()
}
