#[derive(Debug, Serialize)]
struct OrganizationResponse {
    schema_version: String,
    organization: Organization,
}

impl OrganizationResponse {
    fn new(organization: Organization) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            organization,
        }
    }
}

async fn get_organization(
    State(state): State<AppState>,
) -> Result<Json<OrganizationResponse>, HttpApiError> {
    let organization = state
        .api
        .organization()
        .await
        .ok_or_else(HttpApiError::organization_not_found)?;
    Ok(Json(OrganizationResponse::new(organization)))
}

async fn create_organization(
    State(state): State<AppState>,
    Json(fields): Json<OrganizationPatch>,
) -> Result<Json<OrganizationResponse>, HttpApiError> {
    let organization = state
        .api
        .create_organization(fields)
        .await
        .map_err(HttpApiError::from_sync)?;
    Ok(Json(OrganizationResponse::new(organization)))
}

async fn patch_organization(
    State(state): State<AppState>,
    Json(patch): Json<OrganizationPatch>,
) -> Result<Json<OrganizationResponse>, HttpApiError> {
    let organization = state
        .api
        .update_organization(patch)
        .await
        .map_err(HttpApiError::from_sync)?
        .ok_or_else(HttpApiError::organization_not_found)?;
    Ok(Json(OrganizationResponse::new(organization)))
}

async fn delete_organization(State(state): State<AppState>) -> Json<OrganizationResponse> {
    let organization = state.api.delete_organization().await;
    Json(OrganizationResponse::new(organization))
}

#[derive(Debug, Deserialize)]
struct BreakdownRequest {
    #[serde(default)]
    modifiers: Vec<StatModifier>,
}

#[derive(Debug, Serialize)]
struct BreakdownResponse {
    schema_version: String,
    entries: Vec<StatBreakdownEntry>,
}

async fn organization_breakdown(
    State(state): State<AppState>,
    Json(request): Json<BreakdownRequest>,
) -> Result<Json<BreakdownResponse>, HttpApiError> {
    let entries = state
        .api
        .organization_breakdown(&request.modifiers)
        .await
        .ok_or_else(HttpApiError::organization_not_found)?;
    Ok(Json(BreakdownResponse {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        entries,
    }))
}
