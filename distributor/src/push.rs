use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use bytes::Bytes;

use crate::api::{PushError, PushRequest, PushResponse};
use crate::router::AppState;

/// Header the tenant id travels in. Requests without it are a client error,
/// before any stream is looked at.
pub const TENANT_HEADER: &str = "X-Scope-OrgID";

pub async fn push(
    state: State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<PushResponse>, PushError> {
    let tenant = headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(PushError::MissingTenant)?;

    tracing::debug!(len = body.len(), tenant = %tenant, "new push request");

    let req: PushRequest =
        serde_json::from_slice(&body).map_err(|err| PushError::InvalidRequest {
            message: err.to_string(),
        })?;

    state.distributor.push(tenant, req).await.map(Json)
}
