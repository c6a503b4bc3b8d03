//! `POST /analyze`: streaming analysis over Server-Sent Events.
//!
//! Everything that can be rejected up front (ownership, task type, provider,
//! prompt inputs) is checked before the response starts and returned as a
//! plain JSON error. After that the response is an SSE stream of data-only
//! frames:
//!
//! ```text
//! {"type":"chunk","content":"…"}                       0..n times
//! {"type":"done","messageId":"…","content":"…","warnings":[…]}   or
//! {"type":"error","error":"…"}                         exactly once
//! ```
//!
//! The assistant message is stored only after the upstream stream has
//! completed; failures and disconnects store nothing. When the client goes
//! away the upstream request is dropped.

use super::auth::CurrentUser;
use super::AppState;
use crate::config::ResolvedProvider;
use crate::error::PapersError;
use crate::model::{Message, Role, StreamSession};
use crate::prompts::{attach_figures, build_messages, DocumentContext, PromptRequest, TaskType};
use crate::relay::{stream_completion, ChatMessage};
use crate::store::owned_session;
use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeRequest {
    pub session_id: Uuid,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub task_type: Option<String>,
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub custom_prompt: Option<String>,
    /// Id of a user message already stored in the session.
    #[serde(default)]
    pub user_message_id: Option<Uuid>,
}

/// One downstream SSE frame.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamFrame<'a> {
    Chunk {
        content: &'a str,
    },
    Done {
        #[serde(rename = "messageId")]
        message_id: Uuid,
        content: &'a str,
        warnings: &'a [String],
    },
    Error {
        error: String,
    },
}

impl StreamFrame<'_> {
    fn to_event(&self) -> Event {
        match serde_json::to_string(self) {
            Ok(json) => Event::default().data(json),
            Err(_) => Event::default().data(r#"{"type":"error","error":"Internal server error"}"#),
        }
    }
}

/// Everything the background relay task needs.
struct RelayJob {
    provider: ResolvedProvider,
    messages: Vec<ChatMessage>,
    warnings: Vec<String>,
    task: TaskType,
    stream: StreamSession,
}

pub async fn analyze(
    State(state): State<AppState>,
    user: CurrentUser,
    Json(req): Json<AnalyzeRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, PapersError> {
    let store = state.store.as_ref();
    owned_session(store, req.session_id, user.id()).await?;
    let task = TaskType::parse(req.task_type.as_deref())?;
    let provider = state.providers.resolve(req.provider_id.as_deref())?;

    let mut history = store.list_messages(req.session_id).await?;
    let mut message = req.message.trim().to_string();
    let mut pending_user_message = None;

    match req.user_message_id {
        Some(id) => {
            let stored = history
                .iter()
                .position(|m| m.id == id && m.role == Role::User)
                .map(|i| history.remove(i))
                .ok_or_else(|| PapersError::not_found("message", id))?;
            if message.is_empty() {
                message = stored.content;
            }
        }
        None if !message.is_empty() => {
            pending_user_message = Some(Message::user(req.session_id, message.clone()));
        }
        None => {}
    }

    let mut documents = Vec::new();
    for document in store.list_session_documents(req.session_id).await? {
        let figures = store.list_figures(document.id).await?;
        documents.push(DocumentContext { document, figures });
    }

    let mut prompt = build_messages(PromptRequest {
        task,
        message: &message,
        custom_prompt: req.custom_prompt.as_deref(),
        documents: &documents,
        history: &history,
        max_chars: state.config.max_prompt_chars,
    })?;
    if provider.config.multimodal {
        attach_figures(
            &mut prompt,
            &documents,
            state.config.max_prompt_figures,
            state.config.max_figure_pixels,
        )
        .await;
    }

    if let Some(m) = pending_user_message {
        store.insert_message(m).await?;
    }

    let job = RelayJob {
        stream: StreamSession::new(req.session_id, provider.id.clone()),
        provider,
        messages: prompt.messages,
        warnings: prompt.warnings,
        task,
    };
    let span = tracing::info_span!(
        "analyze",
        session = %req.session_id,
        message = %job.stream.message_id,
        provider = %job.provider.id,
        task = task.as_str()
    );

    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run_relay(state, job, tx).instrument(span));

    let stream = UnboundedReceiverStream::new(rx).map(Ok::<_, Infallible>);
    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

/// Relay the upstream stream into `tx`, then store and announce the result.
///
/// Dropping `tx` at the end closes the client's response.
async fn run_relay(state: AppState, mut job: RelayJob, tx: mpsc::UnboundedSender<Event>) {
    let idle = match state.config.stream_idle_timeout_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };

    let chunk_tx = tx.clone();
    let relay = stream_completion(&state.http, &job.provider, &job.messages, idle, |delta| {
        match chunk_tx.send(StreamFrame::Chunk { content: delta }.to_event()) {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        }
    });

    let result = tokio::select! {
        r = relay => r,
        _ = tx.closed() => Err(PapersError::ClientDisconnected),
    };

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(PapersError::ClientDisconnected) => {
            info!("Client disconnected; upstream request dropped, nothing stored");
            return;
        }
        Err(e) => {
            warn!("Stream failed: {}", e);
            let _ = tx.send(StreamFrame::Error { error: e.public_message() }.to_event());
            return;
        }
    };

    job.stream.accumulated_text = outcome.content;
    let mut message = Message::assistant(
        job.stream.session_id,
        job.stream.accumulated_text.clone(),
        job.stream.provider_id.clone(),
        job.task.as_str(),
    );
    message.id = job.stream.message_id;

    let frame = match state.store.insert_message(message).await {
        Ok(()) => {
            info!(
                chars = job.stream.accumulated_text.len(),
                malformed_frames = outcome.stats.malformed_frames,
                "Assistant message stored"
            );
            StreamFrame::Done {
                message_id: job.stream.message_id,
                content: &job.stream.accumulated_text,
                warnings: &job.warnings,
            }
            .to_event()
        }
        Err(e) => {
            warn!("Could not store assistant message: {}", e);
            StreamFrame::Error { error: e.public_message() }.to_event()
        }
    };
    let _ = tx.send(frame);
}
