use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

use crate::models::{ConsultationStatus, VideoProvider};
use crate::services::lifecycle::TransitionKind;

/// Failure of a single provider adapter call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Network failure, timeout, 429 or 5xx: retry with backoff
    #[error("transient provider error: {message}")]
    Transient { message: String },

    /// Rejected request or unusable response: do not retry
    #[error("permanent provider error: {message}")]
    Permanent { message: String },

    #[error("webhook signature rejected: {message}")]
    Signature { message: String },
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        ProviderError::Transient { message: message.into() }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        ProviderError::Permanent { message: message.into() }
    }

    pub fn signature(message: impl Into<String>) -> Self {
        ProviderError::Signature { message: message.into() }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient { .. })
    }

    /// Classify a non-success HTTP response
    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let message = format!("HTTP {}: {}", status, body);
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status.is_server_error()
        {
            ProviderError::Transient { message }
        } else {
            ProviderError::Permanent { message }
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() || err.is_builder() {
            ProviderError::permanent(err.to_string())
        } else {
            ProviderError::transient(err.to_string())
        }
    }
}

#[derive(Error, Debug)]
pub enum TelemedicineError {
    #[error("Invalid participants: {message}")]
    InvalidParticipants { message: String },

    #[error("Video provider {provider} unavailable: {source}")]
    ProviderUnavailable {
        provider: VideoProvider,
        source: ProviderError,
    },

    #[error("Video provider {0} is not configured")]
    ProviderNotConfigured(VideoProvider),

    #[error("Webhook signature verification failed: {message}")]
    SignatureError { message: String },

    #[error("No consultation matches {provider} room {provider_room_id}")]
    UnknownRoom {
        provider: VideoProvider,
        provider_room_id: String,
    },

    #[error("Cannot {attempted} a consultation that is {current}")]
    InvalidTransition {
        attempted: TransitionKind,
        current: ConsultationStatus,
    },

    #[error("Not authorized for this consultation")]
    Unauthorized,

    #[error("Consultation room is closed")]
    RoomClosed,

    #[error("Consultation not found")]
    ConsultationNotFound,

    #[error("Booking not found")]
    BookingNotFound,

    #[error("Booking {booking_id} already has an active consultation {consultation_id}")]
    ActiveConsultationExists { booking_id: Uuid, consultation_id: Uuid },

    #[error("Both doctor and patient must be connected before the consultation can start")]
    ParticipantsNotPresent,

    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Database error: {message}")]
    Database { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl TelemedicineError {
    pub fn invalid_participants(message: impl Into<String>) -> Self {
        TelemedicineError::InvalidParticipants { message: message.into() }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        TelemedicineError::Validation { message: message.into() }
    }

    pub fn database(message: impl Into<String>) -> Self {
        TelemedicineError::Database { message: message.into() }
    }

    pub fn code(&self) -> &'static str {
        match self {
            TelemedicineError::InvalidParticipants { .. } => "invalid_participants",
            TelemedicineError::ProviderUnavailable { .. } => "provider_unavailable",
            TelemedicineError::ProviderNotConfigured(_) => "provider_not_configured",
            TelemedicineError::SignatureError { .. } => "signature_error",
            TelemedicineError::UnknownRoom { .. } => "unknown_room",
            TelemedicineError::InvalidTransition { .. } => "invalid_transition",
            TelemedicineError::Unauthorized => "unauthorized",
            TelemedicineError::RoomClosed => "room_closed",
            TelemedicineError::ConsultationNotFound => "consultation_not_found",
            TelemedicineError::BookingNotFound => "booking_not_found",
            TelemedicineError::ActiveConsultationExists { .. } => "active_consultation_exists",
            TelemedicineError::ParticipantsNotPresent => "participants_not_present",
            TelemedicineError::Validation { .. } => "validation_error",
            TelemedicineError::Database { .. } => "database_error",
            TelemedicineError::Internal { .. } => "internal_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            TelemedicineError::InvalidParticipants { .. }
            | TelemedicineError::ProviderNotConfigured(_)
            | TelemedicineError::Validation { .. } => StatusCode::BAD_REQUEST,
            TelemedicineError::SignatureError { .. } => StatusCode::UNAUTHORIZED,
            TelemedicineError::Unauthorized => StatusCode::FORBIDDEN,
            TelemedicineError::ConsultationNotFound
            | TelemedicineError::BookingNotFound
            | TelemedicineError::UnknownRoom { .. } => StatusCode::NOT_FOUND,
            TelemedicineError::InvalidTransition { .. }
            | TelemedicineError::ActiveConsultationExists { .. }
            | TelemedicineError::ParticipantsNotPresent => StatusCode::CONFLICT,
            TelemedicineError::RoomClosed => StatusCode::GONE,
            TelemedicineError::ProviderUnavailable { .. } => StatusCode::BAD_GATEWAY,
            TelemedicineError::Database { .. } | TelemedicineError::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<anyhow::Error> for TelemedicineError {
    fn from(err: anyhow::Error) -> Self {
        TelemedicineError::Database {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for TelemedicineError {
    fn from(err: serde_json::Error) -> Self {
        TelemedicineError::Internal {
            message: format!("Serialization error: {}", err),
        }
    }
}

impl IntoResponse for TelemedicineError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!("Error: {}: {}", status, self);
        } else {
            tracing::debug!("Request rejected: {}: {}", status, self);
        }

        let mut body = json!({
            "error": self.to_string(),
            "code": self.code(),
        });

        match &self {
            TelemedicineError::InvalidTransition { attempted, current } => {
                body["attempted"] = json!(attempted);
                body["current"] = json!(current);
            }
            TelemedicineError::ProviderUnavailable { provider, source } => {
                body["provider"] = json!(provider);
                body["transient"] = json!(source.is_transient());
            }
            TelemedicineError::ActiveConsultationExists { consultation_id, .. } => {
                body["consultation_id"] = json!(consultation_id);
            }
            _ => {}
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(ProviderError::from_status(reqwest::StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(ProviderError::from_status(reqwest::StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(!ProviderError::from_status(reqwest::StatusCode::BAD_REQUEST, "").is_transient());
        assert!(!ProviderError::from_status(reqwest::StatusCode::NOT_FOUND, "").is_transient());
    }

    #[test]
    fn test_http_mapping() {
        let err = TelemedicineError::InvalidTransition {
            attempted: TransitionKind::Cancel,
            current: ConsultationStatus::InProgress,
        };
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert_eq!(err.to_string(), "Cannot cancel a consultation that is in_progress");

        let err = TelemedicineError::ProviderUnavailable {
            provider: VideoProvider::Zoom,
            source: ProviderError::transient("timeout"),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(TelemedicineError::RoomClosed.status_code(), StatusCode::GONE);
        assert_eq!(
            TelemedicineError::SignatureError { message: "bad".into() }.status_code(),
            StatusCode::UNAUTHORIZED
        );
    }
}
