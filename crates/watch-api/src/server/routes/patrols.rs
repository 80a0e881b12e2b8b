#[derive(Debug, Serialize)]
struct PatrolResponse {
    schema_version: String,
    patrol: Patrol,
}

impl PatrolResponse {
    fn new(patrol: Patrol) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            patrol,
        }
    }
}

#[derive(Debug, Serialize)]
struct PatrolListResponse {
    schema_version: String,
    patrols: Vec<Patrol>,
}

async fn list_patrols(State(state): State<AppState>) -> Json<PatrolListResponse> {
    Json(PatrolListResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        patrols: state.api.patrols().await,
    })
}

#[derive(Debug, Default, Deserialize)]
struct CreatePatrolRequest {
    #[serde(default)]
    seed: PatrolSeed,
    /// Organization modifiers resolved by the caller; applied to the new
    /// patrol's derived stats.
    #[serde(default)]
    modifiers: Vec<StatModifier>,
}

async fn create_patrol(
    State(state): State<AppState>,
    Json(request): Json<CreatePatrolRequest>,
) -> Result<Json<PatrolResponse>, HttpApiError> {
    let patrol = state
        .api
        .create_patrol(request.seed, &request.modifiers)
        .await
        .map_err(HttpApiError::from_sync)?
        .ok_or_else(HttpApiError::organization_not_found)?;
    Ok(Json(PatrolResponse::new(patrol)))
}

async fn get_patrol(
    Path(patrol_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<PatrolResponse>, HttpApiError> {
    let patrol = state
        .api
        .patrol(&patrol_id)
        .await
        .ok_or_else(|| HttpApiError::patrol_not_found(&patrol_id))?;
    Ok(Json(PatrolResponse::new(patrol)))
}

async fn patch_patrol(
    Path(patrol_id): Path<String>,
    State(state): State<AppState>,
    Json(patch): Json<PatrolPatch>,
) -> Result<Json<PatrolResponse>, HttpApiError> {
    let patrol = state
        .api
        .update_patrol(&patrol_id, &patch)
        .await
        .map_err(HttpApiError::from_sync)?
        .ok_or_else(|| HttpApiError::patrol_not_found(&patrol_id))?;
    Ok(Json(PatrolResponse::new(patrol)))
}

async fn delete_patrol(
    Path(patrol_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<PatrolResponse>, HttpApiError> {
    let patrol = state
        .api
        .delete_patrol(&patrol_id)
        .await
        .ok_or_else(|| HttpApiError::patrol_not_found(&patrol_id))?;
    Ok(Json(PatrolResponse::new(patrol)))
}

#[derive(Debug, Default, Deserialize)]
struct RecalcRequest {
    #[serde(default)]
    modifiers: Vec<StatModifier>,
}

#[derive(Debug, Serialize)]
struct RecalcResponse {
    schema_version: String,
    changed: usize,
}

async fn recalc_patrols(
    State(state): State<AppState>,
    Json(request): Json<RecalcRequest>,
) -> Json<RecalcResponse> {
    let changed = state.api.recalc_all_patrols(&request.modifiers).await;
    Json(RecalcResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        changed,
    })
}
