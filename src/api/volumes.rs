//! Volume API endpoints.
//!
//! Provides endpoints for creating, describing, listing and destroying
//! secret volumes. Responses never carry a volume's credential.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};

use super::routes::AppState;
use crate::error::ErrorKind;
use crate::types::{CreateVolumeRequest, Volume};
use crate::volume::VolumeError;

/// Create volume routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_volumes).post(create_volume))
        .route("/:id", get(get_volume).delete(delete_volume))
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// List all volumes.
async fn list_volumes(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<Volume>>, (StatusCode, String)> {
    let volumes = state.manager.list().await.map_err(error_response)?;
    Ok(Json(volumes))
}

/// Create a volume and fetch its secrets.
async fn create_volume(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CreateVolumeRequest>, JsonRejection>,
) -> Result<Json<Volume>, (StatusCode, String)> {
    let Json(request) = body.map_err(|rejection| (StatusCode::BAD_REQUEST, rejection.body_text()))?;
    let volume = request.into_volume();
    tracing::info!(id = %volume.id, source = %volume.source, "creating volume");

    // The stored copy, so the credential is not echoed back.
    let created = state.manager.create(volume).await.map_err(error_response)?;
    Ok(Json(created))
}

/// Describe a volume.
async fn get_volume(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Volume>, (StatusCode, String)> {
    let volume = state.manager.get(&id).await.map_err(error_response)?;
    Ok(Json(volume))
}

/// Destroy a volume.
async fn delete_volume(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, (StatusCode, String)> {
    state.manager.destroy(&id).await.map_err(error_response)?;
    Ok(StatusCode::OK)
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

pub(crate) fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Invalid => StatusCode::BAD_REQUEST,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::DecodeFailure | ErrorKind::TransportFailure | ErrorKind::IoFailure => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(error: VolumeError) -> (StatusCode, String) {
    let kind = error.kind();
    if kind.is_client_error() {
        tracing::debug!(kind = %kind, "{}", error);
    } else {
        tracing::error!(kind = %kind, "{}", error);
    }
    (status_for(kind), error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_statuses() {
        assert_eq!(status_for(ErrorKind::Conflict), StatusCode::CONFLICT);
        assert_eq!(status_for(ErrorKind::NotFound), StatusCode::NOT_FOUND);
        assert_eq!(status_for(ErrorKind::Invalid), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(ErrorKind::Unavailable),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(ErrorKind::TransportFailure),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
