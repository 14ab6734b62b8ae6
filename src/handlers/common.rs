use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use validator::Validate;

use crate::{
    auth::{ActorContext, OverrideGrant, Screen},
    errors::{ServiceError, ServiceResult},
    AppState,
};

/// Standard success response
pub fn success_response<T: Serialize>(data: T) -> Response {
    (StatusCode::OK, Json(data)).into_response()
}

/// Standard created response
pub fn created_response<T: Serialize>(data: T) -> Response {
    (StatusCode::CREATED, Json(data)).into_response()
}

/// Validate request input
pub fn validate_input<T: Validate>(input: &T) -> Result<(), ServiceError> {
    input.validate().map_err(ServiceError::from)
}

/// Turns an `override_reason` field into a grant for the caller.
pub fn override_grant(
    state: &AppState,
    actor: &ActorContext,
    screen: Screen,
    reason: Option<&str>,
) -> ServiceResult<Option<OverrideGrant>> {
    reason
        .map(|r| state.authorizer.grant_override(actor, screen, r))
        .transpose()
}
