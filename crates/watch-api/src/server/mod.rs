use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Request, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use contracts::{
    ApiError, ChangeNotice, ConflictRecord, ErrorCode, Organization, OrganizationPatch, Patrol,
    PatrolPatch, PatrolSeed, StatBreakdownEntry, StatModifier, SyncConfig, SCHEMA_VERSION_V1,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use watch_core::SyncError;

use crate::WatchApi;

const DEFAULT_SQLITE_PATH: &str = "watch_sync.sqlite";

include!("error.rs");
include!("state.rs");
include!("routes/organization.rs");
include!("routes/patrols.rs");
include!("routes/sync.rs");
include!("routes/stream.rs");

/// Hosts the API with the default wiring: privileged authority, SQLite dual
/// store at `WATCH_SQLITE_PATH` (or the default path), in-process bus.
pub async fn serve(addr: SocketAddr) -> Result<(), ServerError> {
    let api = WatchApi::start_host(SyncConfig::default(), default_sqlite_path())
        .await
        .map_err(|err| ServerError::Store(err.to_string()))?;
    serve_with_api(addr, api).await
}

pub async fn serve_with_api(addr: SocketAddr, api: Arc<WatchApi>) -> Result<(), ServerError> {
    let app = router(AppState { api });

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/v1/organization",
            get(get_organization)
                .post(create_organization)
                .patch(patch_organization)
                .delete(delete_organization),
        )
        .route(
            "/api/v1/organization/breakdown",
            post(organization_breakdown),
        )
        .route("/api/v1/patrols", get(list_patrols).post(create_patrol))
        .route("/api/v1/patrols/recalc", post(recalc_patrols))
        .route(
            "/api/v1/patrols/{patrol_id}",
            get(get_patrol).patch(patch_patrol).delete(delete_patrol),
        )
        .route("/api/v1/conflicts", get(list_conflicts))
        .route("/api/v1/conflicts/{index}/resolve", post(resolve_conflict))
        .route("/api/v1/sync/request", post(request_sync))
        .route("/api/v1/sync/flush", post(flush_changes))
        .route("/api/v1/sync/refresh-stores", post(refresh_stores))
        .route("/api/v1/stream", get(stream_changes))
        .layer(middleware::from_fn(cors_middleware))
        .with_state(state)
}

async fn cors_middleware(request: Request, next: Next) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = Response::new(axum::body::Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        apply_cors_headers(response.headers_mut());
        return response;
    }

    let mut response = next.run(request).await;
    apply_cors_headers(response.headers_mut());
    response
}

fn apply_cors_headers(headers: &mut axum::http::HeaderMap) {
    headers.insert(
        HeaderName::from_static("access-control-allow-origin"),
        HeaderValue::from_static("*"),
    );
    headers.insert(
        HeaderName::from_static("access-control-allow-methods"),
        HeaderValue::from_static("GET,POST,OPTIONS,PUT,PATCH,DELETE"),
    );
    headers.insert(
        HeaderName::from_static("access-control-allow-headers"),
        HeaderValue::from_static("*"),
    );
    headers.insert(
        HeaderName::from_static("access-control-max-age"),
        HeaderValue::from_static("3600"),
    );
}

fn default_sqlite_path() -> String {
    std::env::var("WATCH_SQLITE_PATH")
        .ok()
        .filter(|path| !path.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SQLITE_PATH.to_string())
}
