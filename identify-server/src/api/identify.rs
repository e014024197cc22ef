//! POST /identify

use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::reconcile::{ConsolidatedContact, Observation};
use crate::AppState;

/// Request body; both fields optional but at least one required
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone_number: Option<PhoneNumber>,
}

/// Phone numbers are accepted as JSON strings or plain integers
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PhoneNumber {
    Text(String),
    Integer(u64),
}

impl PhoneNumber {
    pub fn into_string(self) -> String {
        match self {
            PhoneNumber::Text(s) => s,
            PhoneNumber::Integer(n) => n.to_string(),
        }
    }
}

impl IdentifyRequest {
    pub fn into_observation(self) -> identify_common::Result<Observation> {
        Observation::new(self.email, self.phone_number.map(PhoneNumber::into_string))
    }
}

/// Response envelope shared by every endpoint returning a contact group
#[derive(Debug, Serialize)]
pub struct ContactResponse {
    pub contact: ConsolidatedContact,
}

/// POST /identify
///
/// Reconciles the observation and returns the consolidated contact group.
pub async fn identify(
    State(state): State<AppState>,
    body: Result<Json<IdentifyRequest>, JsonRejection>,
) -> ApiResult<Json<ContactResponse>> {
    let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
    let observation = request.into_observation()?;

    let contact = state.reconciler.reconcile(&observation).await?;

    Ok(Json(ContactResponse { contact }))
}
