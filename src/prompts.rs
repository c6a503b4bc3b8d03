//! Analysis prompts and chat message assembly.
//!
//! Every task type has a fixed system prompt and a short instruction placed
//! in front of the user's own message. Document text from the session is
//! packed into one context block, truncated to the configured budget, and
//! figures are listed by canonical label so the model can cite `F3` the same
//! way the UI does.

use crate::error::PapersError;
use crate::model::{Document, Figure, Message, Role};
use crate::pipeline::encode::figure_data_url;
use crate::relay::ChatMessage;
use tracing::warn;

/// Previous turns carried into a request.
pub const MAX_HISTORY_MESSAGES: usize = 20;

const BASE_SYSTEM_PROMPT: &str = r#"You are a research assistant helping a reader understand scientific papers.

Ground every statement in the provided documents. When you refer to a figure, use its label exactly as given (for example F2). If the documents do not contain the answer, say so instead of guessing. Answer in Markdown."#;

/// What the user asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskType {
    Summary,
    Methods,
    Figures,
    Critique,
    #[default]
    Chat,
    Custom,
}

impl TaskType {
    /// Parse the request's `taskType`; missing or empty means `chat`.
    pub fn parse(value: Option<&str>) -> Result<Self, PapersError> {
        let Some(v) = value.map(str::trim).filter(|v| !v.is_empty()) else {
            return Ok(TaskType::Chat);
        };
        match v.to_ascii_lowercase().as_str() {
            "summary" => Ok(TaskType::Summary),
            "methods" => Ok(TaskType::Methods),
            "figures" => Ok(TaskType::Figures),
            "critique" => Ok(TaskType::Critique),
            "chat" => Ok(TaskType::Chat),
            "custom" => Ok(TaskType::Custom),
            other => Err(PapersError::InvalidRequest(format!(
                "unknown taskType '{other}'"
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Summary => "summary",
            TaskType::Methods => "methods",
            TaskType::Figures => "figures",
            TaskType::Critique => "critique",
            TaskType::Chat => "chat",
            TaskType::Custom => "custom",
        }
    }

    fn instruction(self) -> Option<&'static str> {
        match self {
            TaskType::Summary => Some(
                "Summarise the paper: research question, approach, key results with numbers, and limitations.",
            ),
            TaskType::Methods => Some(
                "Explain the methods in detail: data, model or experimental setup, evaluation protocol, and anything needed to reproduce the work.",
            ),
            TaskType::Figures => Some(
                "Walk through the figures in order. For each label, say what it shows and what conclusion the authors draw from it.",
            ),
            TaskType::Critique => Some(
                "Review the paper critically: strengths, weaknesses, missing baselines or ablations, and threats to validity.",
            ),
            TaskType::Chat | TaskType::Custom => None,
        }
    }
}

/// One document with its figures, as seen by the prompt builder.
#[derive(Debug, Clone)]
pub struct DocumentContext {
    pub document: Document,
    pub figures: Vec<Figure>,
}

/// Inputs for [`build_messages`].
#[derive(Debug, Clone, Copy)]
pub struct PromptRequest<'a> {
    pub task: TaskType,
    pub message: &'a str,
    pub custom_prompt: Option<&'a str>,
    pub documents: &'a [DocumentContext],
    /// Earlier session messages, oldest first. The current user message
    /// must not be included.
    pub history: &'a [Message],
    pub max_chars: usize,
}

/// Messages ready to send plus anything worth telling the user.
#[derive(Debug, Clone, Default)]
pub struct BuiltPrompt {
    pub messages: Vec<ChatMessage>,
    pub warnings: Vec<String>,
}

/// Assemble system prompt, document context, history and the final turn.
pub fn build_messages(req: PromptRequest<'_>) -> Result<BuiltPrompt, PapersError> {
    let custom = req.custom_prompt.map(str::trim).filter(|c| !c.is_empty());
    if req.task == TaskType::Custom && custom.is_none() {
        return Err(PapersError::InvalidRequest(
            "taskType 'custom' requires a non-empty customPrompt".into(),
        ));
    }
    if req.task == TaskType::Chat && req.message.trim().is_empty() {
        return Err(PapersError::InvalidRequest("message must not be empty".into()));
    }

    let mut warnings = Vec::new();
    let mut messages = vec![ChatMessage::system(BASE_SYSTEM_PROMPT)];

    if req.documents.is_empty() {
        warnings.push("No documents in this session; answering without document context".into());
    } else {
        let (context, truncated) = document_context(req.documents, req.max_chars);
        if truncated {
            warnings.push(format!(
                "Document text was truncated to {} characters",
                req.max_chars
            ));
        }
        messages.push(ChatMessage::system(context));
    }

    let skip = req.history.len().saturating_sub(MAX_HISTORY_MESSAGES);
    for m in &req.history[skip..] {
        messages.push(match m.role {
            Role::User => ChatMessage::user(m.content.clone()),
            Role::Assistant => ChatMessage::assistant(m.content.clone()),
        });
    }

    let instruction = match req.task {
        TaskType::Custom => custom,
        task => task.instruction(),
    };
    let final_turn = match (instruction, req.message.trim()) {
        (Some(i), "") => i.to_string(),
        (Some(i), m) => format!("{i}\n\n{m}"),
        (None, m) => m.to_string(),
    };
    messages.push(ChatMessage::user(final_turn));

    Ok(BuiltPrompt { messages, warnings })
}

/// Render documents and figure lists into one block of at most `max_chars`
/// characters. Returns the block and whether anything was cut.
fn document_context(documents: &[DocumentContext], max_chars: usize) -> (String, bool) {
    let mut out = String::from("Documents in this session:\n");
    let mut budget = max_chars;
    let mut truncated = false;

    for ctx in documents {
        let doc = &ctx.document;
        out.push_str(&format!(
            "\n## {} ({} pages)\n\n",
            doc.file_name, doc.page_count
        ));

        let text = doc.prompt_text();
        let len = text.chars().count();
        if len > budget {
            truncated = true;
            out.extend(text.chars().take(budget));
            out.push_str("\n[…truncated]\n");
            budget = 0;
        } else {
            out.push_str(text);
            out.push('\n');
            budget -= len;
        }

        if !ctx.figures.is_empty() {
            out.push_str("\nFigures:\n");
            for f in &ctx.figures {
                if f.page_number > 0 {
                    out.push_str(&format!("- {} (page {}): {}\n", f.label, f.page_number, f.caption));
                } else {
                    out.push_str(&format!("- {}: {}\n", f.label, f.caption));
                }
            }
        }
    }
    (out, truncated)
}

/// Attach up to `max_figures` figure images to the last user turn.
///
/// Figures without a readable image file are skipped and reported in
/// `prompt.warnings`.
pub async fn attach_figures(
    prompt: &mut BuiltPrompt,
    documents: &[DocumentContext],
    max_figures: usize,
    max_pixels: u32,
) {
    if max_figures == 0 {
        return;
    }
    let mut urls = Vec::new();
    for figure in documents.iter().flat_map(|d| d.figures.iter()) {
        if urls.len() >= max_figures {
            break;
        }
        if figure.file_size == 0 {
            prompt
                .warnings
                .push(format!("Figure {} has no image file", figure.label));
            continue;
        }
        match figure_data_url(&figure.file_path, max_pixels).await {
            Ok(url) => urls.push(url),
            Err(e) => {
                warn!("Could not attach {}: {}", figure.label, e);
                prompt
                    .warnings
                    .push(format!("Figure {} image could not be loaded", figure.label));
            }
        }
    }
    if urls.is_empty() {
        return;
    }

    if let Some(last) = prompt.messages.pop() {
        prompt
            .messages
            .push(ChatMessage::user_with_images(last.text(), urls));
    }
}
