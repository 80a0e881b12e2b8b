#[derive(Debug, Serialize)]
struct ConflictListResponse {
    schema_version: String,
    pending_count: usize,
    conflicts: Vec<ConflictRecord>,
}

async fn list_conflicts(State(state): State<AppState>) -> Json<ConflictListResponse> {
    let conflicts = state.api.conflicts().await;
    Json(ConflictListResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        pending_count: conflicts.len(),
        conflicts,
    })
}

#[derive(Debug, Deserialize)]
struct ResolveConflictRequest {
    choose_remote: bool,
}

async fn resolve_conflict(
    Path(index): Path<usize>,
    State(state): State<AppState>,
    Json(request): Json<ResolveConflictRequest>,
) -> Result<Json<OrganizationResponse>, HttpApiError> {
    let organization = state
        .api
        .resolve_conflict(index, request.choose_remote)
        .await
        .map_err(HttpApiError::from_sync)?;
    Ok(Json(OrganizationResponse::new(organization)))
}

#[derive(Debug, Serialize)]
struct SyncRequestResponse {
    schema_version: String,
    requested: bool,
}

async fn request_sync(State(state): State<AppState>) -> Json<SyncRequestResponse> {
    state.api.request_sync().await;
    Json(SyncRequestResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        requested: true,
    })
}

#[derive(Debug, Serialize)]
struct RefreshStoresResponse {
    schema_version: String,
    persisted: bool,
}

async fn refresh_stores(State(state): State<AppState>) -> Json<RefreshStoresResponse> {
    let persisted = state.api.refresh_stores().await;
    Json(RefreshStoresResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        persisted,
    })
}

#[derive(Debug, Serialize)]
struct FlushResponse {
    schema_version: String,
    sent: usize,
    pending: usize,
}

async fn flush_changes(State(state): State<AppState>) -> Json<FlushResponse> {
    let sent = state.api.flush_now().await;
    let pending = state.api.pending_changes().await;
    Json(FlushResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        sent,
        pending,
    })
}
