//! # Error Handling
//!
//! Two families of errors live here:
//! - **BridgeError**: failures inside the audio relay (processes, pipes, inbound frames)
//! - **AppError**: failures of the HTTP surface, converted into JSON responses
//!
//! ## Propagation Rules:
//! - `InvalidInboundMessage` and `TransportNotReady` are recovered where they happen
//!   (the frame is dropped and logged, the session keeps running)
//! - `ProcessStreamError` and `ProcessWriteError` end the relay that hit them and
//!   tear down the whole session
//! - `SpawnFailed` and `SessionLimitReached` abort session startup; the client
//!   sees the WebSocket close
//!
//! No error is ever sent to the browser as a message. Failures are observed as
//! transport closure only.

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::io;
use thiserror::Error;

/// Why an inbound message was refused before reaching the playback process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InboundRejection {
    #[error("message payload is not binary")]
    NonBinary,

    #[error("message of {size} bytes exceeds the {limit} byte ceiling")]
    Oversized { size: usize, limit: usize },
}

/// Errors produced by the audio relay core.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// An external process could not be started.
    #[error("failed to spawn `{program}`: {source}")]
    SpawnFailed {
        program: String,
        #[source]
        source: io::Error,
    },

    /// Reading the capture process output failed.
    #[error("process output stream failed: {0}")]
    ProcessStreamError(#[source] io::Error),

    /// Writing to the playback process input failed (process gone, pipe closed).
    #[error("process input write failed: {0}")]
    ProcessWriteError(#[source] io::Error),

    /// Inbound message dropped by the validation policy.
    #[error("invalid inbound message: {0}")]
    InvalidInboundMessage(#[from] InboundRejection),

    /// Transport could not take an outbound frame right now.
    #[error("transport not ready: {0}")]
    TransportNotReady(&'static str),

    /// The configured number of concurrent sessions is already running.
    #[error("maximum concurrent sessions ({0}) reached")]
    SessionLimitReached(usize),
}

impl BridgeError {
    /// Whether this error must bring the whole session down.
    ///
    /// Validation and readiness failures are local to one frame; broken pipes
    /// mean one direction of the session is dead.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            BridgeError::ProcessStreamError(_) | BridgeError::ProcessWriteError(_)
        )
    }
}

/// Errors returned by HTTP handlers.
///
/// ## HTTP Status Code Mapping:
/// - Internal/ConfigError → 500 (Internal Server Error)
/// - NotFound → 404 (Not Found)
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

/// Converts errors into JSON HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "not_found",
///     "message": "/nope",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn status_code(&self) -> actix_web::http::StatusCode {
        match self {
            AppError::Internal(_) | AppError::ConfigError(_) => {
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::NotFound(_) => actix_web::http::StatusCode::NOT_FOUND,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let (error_type, message) = match self {
            AppError::Internal(msg) => ("internal_error", msg),
            AppError::NotFound(msg) => ("not_found", msg),
            AppError::ConfigError(msg) => ("config_error", msg),
        };

        HttpResponse::build(self.status_code()).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<io::Error> for AppError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => AppError::NotFound(err.to_string()),
            _ => AppError::Internal(err.to_string()),
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Shorthand for handler results.
pub type AppResult<T> = Result<T, AppError>;
