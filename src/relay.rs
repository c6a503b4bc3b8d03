//! Streaming completion relay.
//!
//! Sends one `stream: true` request to a chat-completions-compatible
//! provider and turns the SSE body into incremental text chunks.
//!
//! Socket reads do not line up with SSE frames, so bytes are buffered in
//! [`SseLineBuffer`] until a full line is available. A partial UTF-8
//! sequence at a read boundary stays in the buffer with the rest of its
//! line. Malformed `data:` payloads are skipped and counted in
//! [`RelayStats::malformed_frames`]; only transport failures end the stream.

use crate::config::ResolvedProvider;
use crate::error::PapersError;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::ops::ControlFlow;
use std::time::Duration;
use tracing::{debug, info};

// ── Request types ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: "system".into(),
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: "assistant".into(),
            content: MessageContent::Text(text.into()),
        }
    }

    /// A user turn with text followed by images given as data URLs.
    pub fn user_with_images(text: impl Into<String>, image_urls: Vec<String>) -> Self {
        let mut parts = vec![ContentPart::Text { text: text.into() }];
        parts.extend(image_urls.into_iter().map(|url| ContentPart::ImageUrl {
            image_url: ImageUrl {
                url,
                detail: Some("high".into()),
            },
        }));
        Self {
            role: "user".into(),
            content: MessageContent::Parts(parts),
        }
    }

    /// Text content, ignoring image parts.
    pub fn text(&self) -> String {
        match &self.content {
            MessageContent::Text(t) => t.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

// ── Stream types ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Counters for one relayed stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub bytes: usize,
    /// `data:` lines seen, `[DONE]` included.
    pub frames: usize,
    /// Frames that produced text.
    pub chunks: usize,
    pub malformed_frames: usize,
}

/// Line splitter and frame decoder for an SSE body.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buf: Vec<u8>,
    done: bool,
    stats: RelayStats,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns the text deltas of every line completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.stats.bytes += bytes.len();
        self.buf.extend_from_slice(bytes);

        let mut deltas = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(delta) = self.decode_line(&line[..line.len() - 1]) {
                deltas.push(delta);
            }
        }
        deltas
    }

    /// Flush a trailing line that never got its newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.buf.is_empty() {
            return None;
        }
        let line = std::mem::take(&mut self.buf);
        self.decode_line(&line)
    }

    /// `data: [DONE]` has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn stats(&self) -> RelayStats {
        self.stats
    }

    fn decode_line(&mut self, raw: &[u8]) -> Option<String> {
        if self.done {
            return None;
        }
        let line = String::from_utf8_lossy(raw);
        let line = line.trim_end_matches('\r');
        // Blank separators, comments and `event:`/`id:` fields carry no text.
        let data = line.strip_prefix("data:")?.trim_start();

        self.stats.frames += 1;
        if data == "[DONE]" {
            self.done = true;
            return None;
        }

        match serde_json::from_str::<ChatCompletionChunk>(data) {
            Ok(chunk) => {
                let content = chunk
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.delta.content)
                    .filter(|c| !c.is_empty())?;
                self.stats.chunks += 1;
                Some(content)
            }
            Err(e) => {
                self.stats.malformed_frames += 1;
                debug!("Skipping malformed stream frame: {}", e);
                None
            }
        }
    }
}

/// Result of a completed stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    pub content: String,
    pub stats: RelayStats,
}

/// Stream a completion, calling `on_chunk` with each text delta in order.
///
/// `on_chunk` returns [`ControlFlow::Break`] when the consumer is gone; the
/// upstream response is dropped at once and `ClientDisconnected` returned.
/// `idle_timeout` bounds the wait for each read.
pub async fn stream_completion<F>(
    http: &reqwest::Client,
    provider: &ResolvedProvider,
    messages: &[ChatMessage],
    idle_timeout: Option<Duration>,
    mut on_chunk: F,
) -> Result<RelayOutcome, PapersError>
where
    F: FnMut(&str) -> ControlFlow<()>,
{
    let body = ChatRequest {
        model: &provider.config.model,
        messages,
        temperature: provider.config.temperature,
        max_tokens: provider.config.max_tokens,
        stream: true,
    };

    debug!(
        provider = %provider.id,
        model = %provider.config.model,
        messages = messages.len(),
        "Sending streaming completion request"
    );
    let response = http
        .post(provider.completions_url())
        .bearer_auth(&provider.api_key)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .json(&body)
        .send()
        .await
        .map_err(|e| PapersError::StreamTransport(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(PapersError::UpstreamHttp {
            status: status.as_u16(),
            body,
        });
    }

    let mut stream = response.bytes_stream();
    let mut buffer = SseLineBuffer::new();
    let mut content = String::new();

    loop {
        let next = match idle_timeout {
            Some(limit) => tokio::time::timeout(limit, stream.next())
                .await
                .map_err(|_| {
                    PapersError::StreamTransport(format!("no data from provider for {limit:?}"))
                })?,
            None => stream.next().await,
        };

        let (deltas, ended) = match next {
            Some(Ok(bytes)) => (buffer.push(&bytes), false),
            Some(Err(e)) => return Err(PapersError::StreamTransport(e.to_string())),
            None => {
                if !buffer.is_done() {
                    debug!("Provider closed the stream without [DONE]");
                }
                (buffer.finish().into_iter().collect(), true)
            }
        };
        let finished = ended || buffer.is_done();

        for delta in deltas {
            content.push_str(&delta);
            if on_chunk(&delta).is_break() {
                info!(provider = %provider.id, "Client went away, dropping upstream stream");
                return Err(PapersError::ClientDisconnected);
            }
        }

        if finished {
            break;
        }
    }

    let stats = buffer.stats();
    info!(
        provider = %provider.id,
        chars = content.chars().count(),
        chunks = stats.chunks,
        malformed = stats.malformed_frames,
        "Completion stream finished"
    );
    Ok(RelayOutcome { content, stats })
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELLO: &str = "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n\
data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n\
data: [DONE]\n\n";

    fn run(chunks: &[&[u8]]) -> (Vec<String>, SseLineBuffer) {
        let mut buffer = SseLineBuffer::new();
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend(buffer.push(chunk));
        }
        out.extend(buffer.finish());
        (out, buffer)
    }

    #[test]
    fn hello_scenario() {
        let (deltas, buffer) = run(&[HELLO.as_bytes()]);
        assert_eq!(deltas, vec!["Hel", "lo"]);
        assert!(buffer.is_done());
        assert_eq!(buffer.stats().frames, 3);
        assert_eq!(buffer.stats().chunks, 2);
    }

    #[test]
    fn every_split_point_gives_the_same_text() {
        let bytes = HELLO.as_bytes();
        let (whole, _) = run(&[bytes]);
        let expected: String = whole.concat();
        for i in 0..=bytes.len() {
            let (a, b) = bytes.split_at(i);
            let (deltas, _) = run(&[a, b]);
            assert_eq!(deltas.concat(), expected, "split at {i}");
        }
    }

    #[test]
    fn byte_at_a_time_with_multibyte_text() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"héllo 图\"}}]}\r\n\r\ndata: [DONE]\r\n";
        let chunks: Vec<&[u8]> = body.as_bytes().chunks(1).collect();
        let (deltas, buffer) = run(&chunks);
        assert_eq!(deltas.concat(), "héllo 图");
        assert!(buffer.is_done());
    }

    #[test]
    fn malformed_frames_are_counted_and_skipped() {
        let body = "data: {not json}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\n";
        let (deltas, buffer) = run(&[body.as_bytes()]);
        assert_eq!(deltas, vec!["ok"]);
        assert_eq!(buffer.stats().malformed_frames, 1);
    }

    #[test]
    fn ignores_comments_roles_and_frames_after_done() {
        let body = ": keep-alive\n\
event: message\n\
data: {\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\
data: {\"choices\":[]}\n\
data: [DONE]\n\
data: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n";
        let (deltas, buffer) = run(&[body.as_bytes()]);
        assert!(deltas.is_empty());
        assert_eq!(buffer.stats().malformed_frames, 0);
    }

    #[test]
    fn trailing_line_without_newline_is_flushed() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"tail\"}}]}";
        let (deltas, _) = run(&[body.as_bytes()]);
        assert_eq!(deltas, vec!["tail"]);
    }

    #[test]
    fn user_with_images_serializes_as_parts() {
        let msg = ChatMessage::user_with_images("look", vec!["data:image/png;base64,AAA".into()]);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["content"][1]["type"], "image_url");
        assert_eq!(json["content"][1]["image_url"]["url"], "data:image/png;base64,AAA");
        assert_eq!(msg.text(), "look");

        let plain = serde_json::to_value(ChatMessage::system("s")).unwrap();
        assert_eq!(plain["content"], "s");
    }
}
