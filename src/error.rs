//! Error types for the edgequake-papers library.
//!
//! One enum, [`PapersError`], covers every failure the ingestion pipeline,
//! the streaming relay and the HTTP layer can report. Variants are grouped by
//! the subsystem that raises them so a handler can map each one to a stable
//! HTTP status via [`PapersError::status`].
//!
//! Handled errors reach clients as `{"error": "<message>"}`. Internal and
//! I/O failures are logged in full and reduced to a generic message so file
//! paths and upstream bodies never leak.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::path::PathBuf;
use thiserror::Error;

/// All errors returned by the edgequake-papers library.
#[derive(Debug, Error)]
pub enum PapersError {
    // ── Remote parsing ────────────────────────────────────────────────────
    /// The remote parser has no token, or rejected it.
    #[error("Remote parsing service unavailable: {reason}")]
    ServiceUnavailable { reason: String },

    /// PUT of a file to its signed upload URL failed.
    #[error("Upload of '{file}' failed: {reason}")]
    UploadFailed { file: String, reason: String },

    /// Batch did not reach a terminal state within the poll budget.
    #[error("Remote parse of batch '{batch_id}' timed out after {attempts} polls")]
    ParseTimeout { batch_id: String, attempts: u32 },

    /// Every file in the batch failed on the remote side.
    #[error("Remote parse failed for every file: {detail}")]
    ParseFailed { detail: String },

    /// Result bundle could not be fetched after all retries.
    #[error("Failed to download '{url}' after {attempts} attempts: {reason}")]
    DownloadFailed {
        url: String,
        attempts: u32,
        reason: String,
    },

    /// Result bundle was fetched but is not a readable ZIP.
    #[error("Result bundle is not a valid archive: {0}")]
    InvalidBundle(String),

    // ── LLM relay ─────────────────────────────────────────────────────────
    /// Provider unknown, disabled, or missing its API key.
    #[error("LLM provider '{provider}' is not configured: {hint}")]
    ProviderUnconfigured { provider: String, hint: String },

    /// The provider answered the initial request with a non-2xx status.
    #[error("LLM provider returned HTTP {status}: {body}")]
    UpstreamHttp { status: u16, body: String },

    /// The provider connection broke mid-stream.
    #[error("LLM stream transport error: {0}")]
    StreamTransport(String),

    /// The downstream client went away; the upstream request was dropped.
    #[error("Client disconnected before the stream completed")]
    ClientDisconnected,

    // ── Ownership / lookup ────────────────────────────────────────────────
    /// The addressed entity does not exist.
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    /// The entity exists but belongs to another user.
    #[error("Access denied to {entity} '{id}'")]
    AccessDenied { entity: &'static str, id: String },

    /// No authenticated user on the request.
    #[error("Missing or invalid user identity")]
    Unauthenticated,

    // ── Input ─────────────────────────────────────────────────────────────
    /// Request payload is malformed or incomplete.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Uploaded file is not a PDF.
    #[error("Uploaded file is not a valid PDF (first bytes: {magic:?})")]
    NotAPdf { magic: [u8; 4] },

    /// pdfium could not open or read the PDF.
    #[error("PDF '{path}' could not be read: {detail}")]
    CorruptPdf { path: PathBuf, detail: String },

    // ── Config ────────────────────────────────────────────────────────────
    /// Builder or config-file validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── I/O + catch-all ───────────────────────────────────────────────────
    /// Filesystem failure on a known path.
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Convenience alias used across the crate.
pub type Result<T, E = PapersError> = std::result::Result<T, E>;

impl PapersError {
    /// Shorthand for an [`PapersError::Io`] bound to `path`.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PapersError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        PapersError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn access_denied(entity: &'static str, id: impl ToString) -> Self {
        PapersError::AccessDenied {
            entity,
            id: id.to_string(),
        }
    }

    /// HTTP status this error maps to.
    pub fn status(&self) -> StatusCode {
        match self {
            PapersError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            PapersError::UploadFailed { .. }
            | PapersError::DownloadFailed { .. }
            | PapersError::InvalidBundle(_)
            | PapersError::ParseFailed { .. }
            | PapersError::UpstreamHttp { .. }
            | PapersError::StreamTransport(_) => StatusCode::BAD_GATEWAY,
            PapersError::ParseTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            PapersError::ProviderUnconfigured { .. } => StatusCode::BAD_REQUEST,
            PapersError::NotFound { .. } => StatusCode::NOT_FOUND,
            PapersError::AccessDenied { .. } => StatusCode::FORBIDDEN,
            PapersError::Unauthenticated => StatusCode::UNAUTHORIZED,
            PapersError::InvalidRequest(_) | PapersError::NotAPdf { .. } => {
                StatusCode::BAD_REQUEST
            }
            PapersError::CorruptPdf { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            PapersError::ClientDisconnected
            | PapersError::InvalidConfig(_)
            | PapersError::Io { .. }
            | PapersError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to a client.
    ///
    /// 5xx errors that originate inside this process are reduced to a
    /// generic string; upstream failures keep their description.
    pub fn public_message(&self) -> String {
        match self {
            PapersError::Io { .. }
            | PapersError::Internal(_)
            | PapersError::InvalidConfig(_)
            | PapersError::ClientDisconnected => "Internal server error".to_string(),
            PapersError::CorruptPdf { detail, .. } => {
                format!("PDF could not be read: {detail}")
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for PapersError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        let body = Json(serde_json::json!({ "error": self.public_message() }));
        (status, body).into_response()
    }
}
