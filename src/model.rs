//! Persistent and transient data types.
//!
//! Persistent records (`Session`, `Message`, `Document`, `Figure`) are what
//! the [`crate::store::Store`] keeps. Transient ones (`ParseJob`,
//! `StreamSession`) live only for the duration of a request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// How a document's text was obtained.
///
/// The only legal transition is `TextOnly → ImageAware`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParseMode {
    /// Plain text extracted locally at upload time.
    #[default]
    TextOnly,
    /// Markdown + figures produced by the remote parser.
    ImageAware,
}

/// A chat session owned by one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: Uuid,
    pub owner_id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One persisted chat turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub session_id: Uuid,
    pub role: Role,
    pub content: String,
    /// Provider that produced an assistant message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// Analysis task that produced an assistant message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn user(session_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            role: Role::User,
            content: content.into(),
            provider_id: None,
            task_type: None,
            created_at: Utc::now(),
        }
    }

    pub fn assistant(
        session_id: Uuid,
        content: impl Into<String>,
        provider_id: impl Into<String>,
        task_type: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            role: Role::Assistant,
            content: content.into(),
            provider_id: Some(provider_id.into()),
            task_type: Some(task_type.into()),
            created_at: Utc::now(),
        }
    }
}

/// An uploaded PDF and the text extracted from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: Uuid,
    pub owner_id: String,
    pub session_id: Uuid,
    pub file_name: String,
    pub storage_path: PathBuf,
    pub raw_text: String,
    #[serde(default)]
    pub markdown_text: Option<String>,
    #[serde(default)]
    pub parse_mode: ParseMode,
    pub page_count: usize,
    pub created_at: DateTime<Utc>,
}

impl Document {
    /// Best text available for prompting: parsed markdown, else raw text.
    pub fn prompt_text(&self) -> &str {
        match self.markdown_text.as_deref() {
            Some(md) if !md.trim().is_empty() => md,
            _ => &self.raw_text,
        }
    }
}

/// A canonically labelled figure belonging to one document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Figure {
    pub id: Uuid,
    pub document_id: Uuid,
    /// Canonical `F<n>` label.
    pub label: String,
    pub caption: String,
    /// 1-based page, 0 when unknown.
    pub page_number: u32,
    /// Dense 1..N position in markdown order; `label == format!("F{image_index}")`.
    pub image_index: u32,
    pub file_name: String,
    pub file_path: PathBuf,
    /// 0 when the image file was missing from the bundle.
    pub file_size: u64,
}

/// Remote parse job state as reported by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Running,
    Done,
    Failed,
}

impl JobState {
    /// Map the parser's free-form state string onto the four known states.
    ///
    /// Unknown non-terminal strings (`waiting-file`, `converting`, …) count
    /// as running so polling continues.
    pub fn from_remote(state: &str) -> Self {
        match state {
            "done" => JobState::Done,
            "failed" => JobState::Failed,
            "pending" | "waiting-file" => JobState::Pending,
            _ => JobState::Running,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }
}

/// One file's entry in a remote batch. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ParseJob {
    pub batch_id: String,
    pub file_name: String,
    pub state: JobState,
    pub result_bundle_url: Option<String>,
    pub error: Option<String>,
}

/// Bookkeeping for one in-flight streaming request.
#[derive(Debug, Clone)]
pub struct StreamSession {
    pub session_id: Uuid,
    pub message_id: Uuid,
    pub accumulated_text: String,
    pub provider_id: String,
}

impl StreamSession {
    pub fn new(session_id: Uuid, provider_id: impl Into<String>) -> Self {
        Self {
            session_id,
            message_id: Uuid::new_v4(),
            accumulated_text: String::new(),
            provider_id: provider_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_mapping() {
        assert_eq!(JobState::from_remote("done"), JobState::Done);
        assert_eq!(JobState::from_remote("failed"), JobState::Failed);
        assert_eq!(JobState::from_remote("waiting-file"), JobState::Pending);
        assert_eq!(JobState::from_remote("converting"), JobState::Running);
        assert!(JobState::Done.is_terminal());
        assert!(!JobState::Running.is_terminal());
    }

    #[test]
    fn prompt_text_prefers_markdown() {
        let mut doc = Document {
            id: Uuid::new_v4(),
            owner_id: "u".into(),
            session_id: Uuid::new_v4(),
            file_name: "a.pdf".into(),
            storage_path: PathBuf::from("/tmp/a.pdf"),
            raw_text: "raw".into(),
            markdown_text: None,
            parse_mode: ParseMode::TextOnly,
            page_count: 1,
            created_at: Utc::now(),
        };
        assert_eq!(doc.prompt_text(), "raw");
        doc.markdown_text = Some("  ".into());
        assert_eq!(doc.prompt_text(), "raw");
        doc.markdown_text = Some("# Title".into());
        assert_eq!(doc.prompt_text(), "# Title");
    }

    #[test]
    fn parse_mode_serialises_snake_case() {
        let s = serde_json::to_string(&ParseMode::ImageAware).unwrap();
        assert_eq!(s, "\"image_aware\"");
    }
}
