//! Session/document store.
//!
//! [`Store`] is the persistence contract the handlers and the ingest
//! pipeline use. [`MemoryStore`] keeps everything in memory behind a
//! `tokio::sync::RwLock` and, when opened with a path, snapshots its state
//! to a JSON file after every mutation (temp file + rename, so a crash never
//! leaves a half-written snapshot). A mutation only becomes visible once its
//! snapshot is on disk; a failed write leaves the store as it was.

use crate::error::PapersError;
use crate::model::{Document, Figure, Message, ParseMode, Session};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

#[async_trait]
pub trait Store: Send + Sync {
    async fn create_session(&self, session: Session) -> Result<(), PapersError>;
    async fn get_session(&self, id: Uuid) -> Result<Option<Session>, PapersError>;

    async fn insert_message(&self, message: Message) -> Result<(), PapersError>;
    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, PapersError>;
    /// Messages of a session, oldest first.
    async fn list_messages(&self, session_id: Uuid) -> Result<Vec<Message>, PapersError>;

    async fn insert_document(&self, document: Document) -> Result<(), PapersError>;
    async fn get_document(&self, id: Uuid) -> Result<Option<Document>, PapersError>;
    /// Documents of a session, oldest first.
    async fn list_session_documents(&self, session_id: Uuid) -> Result<Vec<Document>, PapersError>;

    /// Record a finished image-aware parse in one step: store the markdown,
    /// move the document to `image_aware` and replace its whole figure set.
    async fn apply_image_parse(
        &self,
        document_id: Uuid,
        markdown: String,
        figures: Vec<Figure>,
    ) -> Result<Document, PapersError>;

    /// Figures of a document ordered by `image_index`.
    async fn list_figures(&self, document_id: Uuid) -> Result<Vec<Figure>, PapersError>;

    /// Delete a document and its figures.
    async fn delete_document(&self, id: Uuid) -> Result<Option<Document>, PapersError>;
}

// ── Ownership checks ─────────────────────────────────────────────────────

/// Load a session and check it belongs to `user`.
pub async fn owned_session(store: &dyn Store, id: Uuid, user: &str) -> Result<Session, PapersError> {
    let session = store
        .get_session(id)
        .await?
        .ok_or_else(|| PapersError::not_found("session", id))?;
    if session.owner_id != user {
        return Err(PapersError::access_denied("session", id));
    }
    Ok(session)
}

/// Load a document and check it belongs to `user`.
pub async fn owned_document(
    store: &dyn Store,
    id: Uuid,
    user: &str,
) -> Result<Document, PapersError> {
    let document = store
        .get_document(id)
        .await?
        .ok_or_else(|| PapersError::not_found("document", id))?;
    if document.owner_id != user {
        return Err(PapersError::access_denied("document", id));
    }
    Ok(document)
}

// ── In-memory implementation ─────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct State {
    #[serde(default)]
    sessions: HashMap<Uuid, Session>,
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default)]
    documents: HashMap<Uuid, Document>,
    #[serde(default)]
    figures: HashMap<Uuid, Vec<Figure>>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    snapshot: Option<PathBuf>,
}

impl MemoryStore {
    /// A store that lives only as long as the process.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store backed by a JSON snapshot at `path`, loaded if it exists.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, PapersError> {
        let path = path.into();
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(text) => serde_json::from_str(&text).map_err(|e| {
                PapersError::InvalidConfig(format!("store snapshot {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => State::default(),
            Err(e) => return Err(PapersError::io(&path, e)),
        };
        info!(
            "Opened store {} ({} sessions, {} documents)",
            path.display(),
            state.sessions.len(),
            state.documents.len()
        );
        Ok(Self {
            state: RwLock::new(state),
            snapshot: Some(path),
        })
    }

    /// Apply `change` under the write lock.
    ///
    /// With a snapshot the change runs on a copy that replaces the live state
    /// only after it has been written to disk.
    async fn commit<T, F>(&self, change: F) -> Result<T, PapersError>
    where
        F: FnOnce(&mut State) -> Result<T, PapersError> + Send,
        T: Send,
    {
        let mut state = self.state.write().await;
        if self.snapshot.is_none() {
            return change(&mut *state);
        }
        let mut next = (*state).clone();
        let out = change(&mut next)?;
        self.persist(&next).await?;
        *state = next;
        Ok(out)
    }

    /// Write `state` to the snapshot file, if any. Called with the write lock held.
    async fn persist(&self, state: &State) -> Result<(), PapersError> {
        let Some(path) = &self.snapshot else {
            return Ok(());
        };
        let json = serde_json::to_vec(state)
            .map_err(|e| PapersError::Internal(format!("store serialize: {e}")))?;
        write_atomic(path, &json).await?;
        debug!("Store snapshot written ({} bytes)", json.len());
        Ok(())
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PapersError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PapersError::io(parent, e))?;
        }
    }
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| PapersError::io(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| PapersError::io(path, e))
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_session(&self, session: Session) -> Result<(), PapersError> {
        self.commit(move |state| {
            state.sessions.insert(session.id, session);
            Ok(())
        })
        .await
    }

    async fn get_session(&self, id: Uuid) -> Result<Option<Session>, PapersError> {
        Ok(self.state.read().await.sessions.get(&id).cloned())
    }

    async fn insert_message(&self, message: Message) -> Result<(), PapersError> {
        self.commit(move |state| {
            if !state.sessions.contains_key(&message.session_id) {
                return Err(PapersError::not_found("session", message.session_id));
            }
            if state.messages.iter().any(|m| m.id == message.id) {
                return Err(PapersError::InvalidRequest(format!(
                    "message '{}' already exists",
                    message.id
                )));
            }
            state.messages.push(message);
            Ok(())
        })
        .await
    }

    async fn get_message(&self, id: Uuid) -> Result<Option<Message>, PapersError> {
        Ok(self
            .state
            .read()
            .await
            .messages
            .iter()
            .find(|m| m.id == id)
            .cloned())
    }

    async fn list_messages(&self, session_id: Uuid) -> Result<Vec<Message>, PapersError> {
        let state = self.state.read().await;
        let mut messages: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.created_at);
        Ok(messages)
    }

    async fn insert_document(&self, document: Document) -> Result<(), PapersError> {
        self.commit(move |state| {
            if !state.sessions.contains_key(&document.session_id) {
                return Err(PapersError::not_found("session", document.session_id));
            }
            state.documents.insert(document.id, document);
            Ok(())
        })
        .await
    }

    async fn get_document(&self, id: Uuid) -> Result<Option<Document>, PapersError> {
        Ok(self.state.read().await.documents.get(&id).cloned())
    }

    async fn list_session_documents(&self, session_id: Uuid) -> Result<Vec<Document>, PapersError> {
        let state = self.state.read().await;
        let mut docs: Vec<Document> = state
            .documents
            .values()
            .filter(|d| d.session_id == session_id)
            .cloned()
            .collect();
        docs.sort_by_key(|d| d.created_at);
        Ok(docs)
    }

    async fn apply_image_parse(
        &self,
        document_id: Uuid,
        markdown: String,
        mut figures: Vec<Figure>,
    ) -> Result<Document, PapersError> {
        if figures.iter().any(|f| f.document_id != document_id) {
            return Err(PapersError::Internal(
                "figure set contains figures of another document".into(),
            ));
        }
        figures.sort_by_key(|f| f.image_index);

        let (updated, previous) = self
            .commit(move |state| {
                let document = state
                    .documents
                    .get_mut(&document_id)
                    .ok_or_else(|| PapersError::not_found("document", document_id))?;
                document.markdown_text = Some(markdown);
                document.parse_mode = ParseMode::ImageAware;
                let updated = document.clone();
                let previous = state.figures.insert(document_id, figures);
                Ok((updated, previous.map(|p| p.len()).unwrap_or(0)))
            })
            .await?;
        debug!(
            "Document {} figure set replaced ({} previous)",
            document_id, previous
        );
        Ok(updated)
    }

    async fn list_figures(&self, document_id: Uuid) -> Result<Vec<Figure>, PapersError> {
        Ok(self
            .state
            .read()
            .await
            .figures
            .get(&document_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn delete_document(&self, id: Uuid) -> Result<Option<Document>, PapersError> {
        self.commit(move |state| {
            let removed = state.documents.remove(&id);
            state.figures.remove(&id);
            Ok(removed)
        })
        .await
    }
}
