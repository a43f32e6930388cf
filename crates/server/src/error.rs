use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use dealsync_core::errors::{ApplicationError, InterfaceError};
use serde::Serialize;
use tracing::warn;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

/// HTTP rendering of [`InterfaceError`]. Internal detail is logged, not returned.
#[derive(Debug)]
pub struct ApiError(pub InterfaceError);

impl ApiError {
    pub fn unauthorized(message: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self(InterfaceError::Unauthorized {
            message: message.into(),
            correlation_id: correlation_id.into(),
        })
    }

    pub fn bad_request(message: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self(InterfaceError::BadRequest {
            message: message.into(),
            correlation_id: correlation_id.into(),
        })
    }

    pub fn from_application(error: ApplicationError, correlation_id: impl Into<String>) -> Self {
        Self(error.into_interface(correlation_id))
    }

    pub fn status(&self) -> StatusCode {
        match &self.0 {
            InterfaceError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            InterfaceError::NotFound { .. } => StatusCode::NOT_FOUND,
            InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let correlation_id = self.0.correlation_id().to_string();
        warn!(
            event_name = "http.request.failed",
            correlation_id = %correlation_id,
            status = status.as_u16(),
            error = %self.0,
            "request failed"
        );

        // Bad requests and auth failures carry their own message; the rest stay generic.
        let error = match &self.0 {
            InterfaceError::Unauthorized { message, .. }
            | InterfaceError::BadRequest { message, .. }
            | InterfaceError::NotFound { message, .. } => message.clone(),
            other => other.user_message().to_string(),
        };
        let correlation_id = (correlation_id != "unassigned").then_some(correlation_id);
        (status, Json(ErrorBody { error, correlation_id })).into_response()
    }
}
