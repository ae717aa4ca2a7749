// rest/routes/identify.rs — POST /identify.
//
// Validation happens here, before the resolver runs: at least one of
// email/phoneNumber must be present, and each must be a string when
// present. Empty strings count as absent.

use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::error;

use crate::identity::{IdentifyRequest, IdentifyResponse};
use crate::observability::LatencyTracker;
use crate::AppContext;

type ApiError = (StatusCode, Json<Value>);

pub async fn identify(
    State(ctx): State<Arc<AppContext>>,
    Json(body): Json<Value>,
) -> Result<Json<IdentifyResponse>, ApiError> {
    let request = parse_request(&body)?;

    let tracker = LatencyTracker::start("identify");
    let result = ctx.resolver.identify(&request).await;
    tracker.finish();

    match result {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            error!(err = %e, "identify request failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Internal server error" })),
            ))
        }
    }
}

fn parse_request(body: &Value) -> Result<IdentifyRequest, ApiError> {
    let email = string_field(body, "email", "Email must be a string")?;
    let phone_number = string_field(body, "phoneNumber", "Phone number must be a string")?;

    if email.is_none() && phone_number.is_none() {
        return Err(bad_request(
            "At least one of email or phoneNumber must be provided",
        ));
    }

    Ok(IdentifyRequest {
        email,
        phone_number,
    })
}

fn string_field(body: &Value, key: &str, type_error: &str) -> Result<Option<String>, ApiError> {
    match body.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(bad_request(type_error)),
    }
}

fn bad_request(message: &str) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message })))
}
