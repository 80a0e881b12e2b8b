#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("server io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store error: {0}")]
    Store(String),
}

#[derive(Debug)]
struct HttpApiError {
    status: StatusCode,
    error: ApiError,
}

impl HttpApiError {
    fn organization_not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: ApiError::new(
                ErrorCode::OrganizationNotFound,
                "no organization aggregate is loaded",
                None,
            ),
        }
    }

    fn patrol_not_found(patrol_id: &str) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: ApiError::new(
                ErrorCode::PatrolNotFound,
                "patrol_id does not match a known patrol",
                Some(format!("patrol_id={patrol_id}")),
            ),
        }
    }

    fn conflict_not_found(index: usize) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            error: ApiError::new(
                ErrorCode::ConflictNotFound,
                "conflict index is out of range",
                Some(format!("index={index}")),
            ),
        }
    }

    fn invalid_patch(message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            error: ApiError::new(ErrorCode::InvalidPatch, message, details),
        }
    }

    fn from_sync(err: SyncError) -> Self {
        match err {
            SyncError::StatOutOfRange { .. } => {
                Self::invalid_patch("stat value outside the playable range", Some(err.to_string()))
            }
            SyncError::ConflictOutOfRange(index) => Self::conflict_not_found(index),
        }
    }
}

impl IntoResponse for HttpApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.error)).into_response()
    }
}
