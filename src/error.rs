//! Structured error taxonomy shared by HTTP responses and WebSocket frames.
//!
//! Every failure that crosses the HTTP/WS boundary is normalized to an
//! [`AppError`] first; raw errors never leave the component that produced them.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// Closed set of failure kinds the client branches on (retry vs. restart vs. fatal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ClaudeNotFound,
    ExerciseNotFound,
    DownloadFailed,
    DownloadTimeout,
    ExtractionFailed,
    PtySpawnFailed,
    PtyExited,
    SessionNotFound,
    InvalidRequest,
}

impl ErrorCode {
    /// Fixed, total mapping from error kind to HTTP status.
    pub fn http_status(self) -> StatusCode {
        match self {
            ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorCode::ExerciseNotFound | ErrorCode::SessionNotFound => StatusCode::NOT_FOUND,
            ErrorCode::ClaudeNotFound
            | ErrorCode::DownloadFailed
            | ErrorCode::DownloadTimeout
            | ErrorCode::ExtractionFailed
            | ErrorCode::PtySpawnFailed
            | ErrorCode::PtyExited => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Wire name of this code, as serialized into error bodies.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ClaudeNotFound => "CLAUDE_NOT_FOUND",
            ErrorCode::ExerciseNotFound => "EXERCISE_NOT_FOUND",
            ErrorCode::DownloadFailed => "DOWNLOAD_FAILED",
            ErrorCode::DownloadTimeout => "DOWNLOAD_TIMEOUT",
            ErrorCode::ExtractionFailed => "EXTRACTION_FAILED",
            ErrorCode::PtySpawnFailed => "PTY_SPAWN_FAILED",
            ErrorCode::PtyExited => "PTY_EXITED",
            ErrorCode::SessionNotFound => "SESSION_NOT_FOUND",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error value carried across the HTTP/WS boundary.
///
/// Serializes to `{code, message, action?}`, the same shape in HTTP error
/// bodies and in transport error frames.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct AppError {
    pub code: ErrorCode,
    pub message: String,
    /// Suggested next step for the client UI, e.g. install instructions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

impl AppError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            action: None,
        }
    }

    pub fn with_action(
        code: ErrorCode,
        message: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            code,
            message: message.into(),
            action: Some(action.into()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.code.http_status(), Json(self)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_code_maps_to_a_status() {
        let all = [
            ErrorCode::ClaudeNotFound,
            ErrorCode::ExerciseNotFound,
            ErrorCode::DownloadFailed,
            ErrorCode::DownloadTimeout,
            ErrorCode::ExtractionFailed,
            ErrorCode::PtySpawnFailed,
            ErrorCode::PtyExited,
            ErrorCode::SessionNotFound,
            ErrorCode::InvalidRequest,
        ];
        for code in all {
            let status = code.http_status();
            assert!(
                matches!(status.as_u16(), 400 | 404 | 500),
                "{} mapped to unexpected status {}",
                code.as_str(),
                status
            );
        }
        assert_eq!(ErrorCode::InvalidRequest.http_status().as_u16(), 400);
        assert_eq!(ErrorCode::ExerciseNotFound.http_status().as_u16(), 404);
        assert_eq!(ErrorCode::SessionNotFound.http_status().as_u16(), 404);
        assert_eq!(ErrorCode::PtyExited.http_status().as_u16(), 500);
    }

    #[test]
    fn serializes_to_wire_triple() {
        let err = AppError::new(ErrorCode::PtySpawnFailed, "could not start claude");
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["code"], "PTY_SPAWN_FAILED");
        assert_eq!(value["message"], "could not start claude");
        assert!(value.get("action").is_none(), "action must be omitted when absent");

        let err = AppError::with_action(
            ErrorCode::ClaudeNotFound,
            "claude executable not found",
            "install Claude Code and ensure it is on PATH",
        );
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["code"], "CLAUDE_NOT_FOUND");
        assert_eq!(value["action"], "install Claude Code and ensure it is on PATH");
    }

    #[test]
    fn round_trips_through_json() {
        let err = AppError::new(ErrorCode::DownloadTimeout, "release fetch timed out");
        let json = serde_json::to_string(&err).unwrap();
        let back: AppError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.code, ErrorCode::DownloadTimeout);
        assert_eq!(back.message, "release fetch timed out");
    }
}
