//! GET /contacts/:id

use axum::{
    extract::{Path, State},
    Json,
};

use super::identify::ContactResponse;
use crate::error::ApiResult;
use crate::AppState;

/// GET /contacts/:id
///
/// Consolidated group of the record `id`, resolved through its links.
/// Read-only.
pub async fn get_contact(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<ContactResponse>> {
    let contact = state.reconciler.lookup(id).await?;
    Ok(Json(ContactResponse { contact }))
}
