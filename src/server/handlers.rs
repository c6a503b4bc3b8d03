//! Session, document and figure endpoints.

use super::auth::CurrentUser;
use super::AppState;
use crate::error::PapersError;
use crate::ingest::{self, IngestReport};
use crate::model::{Document, Figure, Message, ParseMode, Session};
use crate::pipeline::canonical::match_label;
use crate::pipeline::text::{check_pdf_magic, extract_text};
use crate::progress::TracingProgressCallback;
use crate::store::{owned_document, owned_session};
use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

// ── Sessions ─────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct CreateSession {
    #[serde(default)]
    pub title: Option<String>,
}

pub async fn create_session(
    State(state): State<AppState>,
    user: CurrentUser,
    body: Option<Json<CreateSession>>,
) -> Result<(StatusCode, Json<Session>), PapersError> {
    let title = body
        .and_then(|Json(b)| b.title)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "Untitled session".to_string());
    let session = Session {
        id: Uuid::new_v4(),
        owner_id: user.0,
        title,
        created_at: Utc::now(),
    };
    state.store.create_session(session.clone()).await?;
    info!(session = %session.id, "Session created");
    Ok((StatusCode::CREATED, Json(session)))
}

pub async fn list_messages(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Vec<Message>>, PapersError> {
    owned_session(state.store.as_ref(), session_id, user.id()).await?;
    Ok(Json(state.store.list_messages(session_id).await?))
}

// ── Documents ────────────────────────────────────────────────────────────

/// Document as returned to clients; the full text stays server-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSummary {
    pub id: Uuid,
    pub session_id: Uuid,
    pub file_name: String,
    pub parse_mode: ParseMode,
    pub page_count: usize,
    pub text_length: usize,
}

impl From<&Document> for DocumentSummary {
    fn from(d: &Document) -> Self {
        Self {
            id: d.id,
            session_id: d.session_id,
            file_name: d.file_name.clone(),
            parse_mode: d.parse_mode,
            page_count: d.page_count,
            text_length: d.prompt_text().chars().count(),
        }
    }
}

pub async fn upload_document(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(session_id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<DocumentSummary>), PapersError> {
    owned_session(state.store.as_ref(), session_id, user.id()).await?;

    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| PapersError::InvalidRequest(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| "document.pdf".to_string());
        let bytes = field
            .bytes()
            .await
            .map_err(|e| PapersError::InvalidRequest(e.to_string()))?;
        upload = Some((file_name, bytes));
        break;
    }
    let (file_name, bytes) =
        upload.ok_or_else(|| PapersError::InvalidRequest("multipart field 'file' is required".into()))?;
    check_pdf_magic(&bytes)?;

    let document_id = Uuid::new_v4();
    let dir = ingest::user_dir(&state.config.uploads_dir(), user.id());
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| PapersError::io(&dir, e))?;
    let storage_path = dir.join(format!("{document_id}.pdf"));
    tokio::fs::write(&storage_path, &bytes)
        .await
        .map_err(|e| PapersError::io(&storage_path, e))?;

    let extracted = match extract_text(&storage_path).await {
        Ok(t) => t,
        Err(e) => {
            if let Err(rm) = tokio::fs::remove_file(&storage_path).await {
                warn!("Could not remove rejected upload: {}", rm);
            }
            return Err(e);
        }
    };

    let document = Document {
        id: document_id,
        owner_id: user.0,
        session_id,
        file_name,
        storage_path,
        raw_text: extracted.text,
        markdown_text: None,
        parse_mode: ParseMode::TextOnly,
        page_count: extracted.page_count,
        created_at: Utc::now(),
    };
    state.store.insert_document(document.clone()).await?;
    info!(
        document = %document.id,
        pages = document.page_count,
        bytes = bytes.len(),
        "Document uploaded"
    );
    Ok((StatusCode::CREATED, Json(DocumentSummary::from(&document))))
}

pub async fn parse_images(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(document_id): Path<Uuid>,
) -> Result<Json<IngestReport>, PapersError> {
    let document = owned_document(state.store.as_ref(), document_id, user.id()).await?;
    let progress = TracingProgressCallback::new(document_id.to_string());
    let report = ingest::parse_images(
        &state.parser,
        state.store.as_ref(),
        &state.config.figures_dir(),
        &document,
        &progress,
    )
    .await?;
    Ok(Json(report))
}

// ── Figures ──────────────────────────────────────────────────────────────

pub async fn list_figures(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(document_id): Path<Uuid>,
) -> Result<Json<Vec<Figure>>, PapersError> {
    owned_document(state.store.as_ref(), document_id, user.id()).await?;
    Ok(Json(state.store.list_figures(document_id).await?))
}

pub async fn figure_by_label(
    State(state): State<AppState>,
    user: CurrentUser,
    Path((document_id, label)): Path<(Uuid, String)>,
) -> Result<impl IntoResponse, PapersError> {
    owned_document(state.store.as_ref(), document_id, user.id()).await?;
    let figures = state.store.list_figures(document_id).await?;
    let figure =
        match_label(&figures, &label).ok_or_else(|| PapersError::not_found("figure", &label))?;

    let bytes = match tokio::fs::read(&figure.file_path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(PapersError::not_found("figure image", &figure.label))
        }
        Err(e) => return Err(PapersError::io(&figure.file_path, e)),
    };
    let mime = mime_guess::from_path(&figure.file_path).first_or_octet_stream();
    Ok(([(header::CONTENT_TYPE, mime.essence_str().to_string())], bytes))
}
