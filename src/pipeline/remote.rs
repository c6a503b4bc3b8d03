//! Remote parsing orchestrator.
//!
//! Drives a batch job on a MinerU-compatible parsing service in four
//! sequential phases:
//!
//! 1. **Upload URLs**: one signed PUT URL per file (`POST /api/v4/file-urls/batch`).
//!    A missing or rejected token fails fast with `ServiceUnavailable`.
//! 2. **Upload**: PUT each file's bytes. Any non-2xx aborts the whole batch.
//! 3. **Poll**: `GET /api/v4/extract-results/batch/{id}` every
//!    `poll_interval` until every file is `done` or `failed`, up to
//!    `max_poll_attempts`. Failed files are reported and dropped; the done
//!    subset is returned.
//! 4. **Download**: fetch the first done file's ZIP with bounded retries,
//!    each attempt capped by a total and an idle-read timeout, then unpack it.
//!
//! No phase retries internally except the download; the caller decides
//! whether to run the whole thing again.

use super::bundle::{open_bundle, ParsedDocument};
use super::dns::FallbackResolver;
use crate::config::ParserConfig;
use crate::error::PapersError;
use crate::model::{JobState, ParseJob};
use crate::progress::{ParsePhase, ParseProgressCallback, StateCounts};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

// ── Wire types ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    msg: String,
    data: Option<T>,
}

#[derive(Debug, Serialize)]
struct BatchRequest<'a> {
    files: Vec<BatchFile<'a>>,
    enable_formula: bool,
    enable_table: bool,
    language: &'a str,
    model_version: &'a str,
}

#[derive(Debug, Serialize)]
struct BatchFile<'a> {
    name: &'a str,
    is_ocr: bool,
    data_id: String,
}

#[derive(Debug, Deserialize)]
struct BatchUrls {
    batch_id: String,
    #[serde(default)]
    file_urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct BatchStatus {
    #[serde(default)]
    extract_result: Vec<FileResult>,
}

#[derive(Debug, Deserialize)]
struct FileResult {
    file_name: String,
    state: String,
    #[serde(default)]
    full_zip_url: Option<String>,
    #[serde(default)]
    err_msg: Option<String>,
}

/// A file to submit in a batch.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub data: Bytes,
}

/// Signed upload targets for one batch, in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadBatch {
    pub batch_id: String,
    pub file_urls: Vec<String>,
}

// ── Orchestrator ─────────────────────────────────────────────────────────

/// Client for the remote parsing service.
///
/// Built once at startup and shared; holds no per-request state.
pub struct RemoteParser {
    http: reqwest::Client,
    config: ParserConfig,
}

impl RemoteParser {
    pub fn new(config: ParserConfig) -> Result<Self, PapersError> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .dns_resolver(Arc::new(FallbackResolver::new(&config)))
            .build()
            .map_err(|e| PapersError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ParserConfig {
        &self.config
    }

    /// True when a token is present. Says nothing about whether it is valid.
    pub fn is_configured(&self) -> bool {
        self.config.api_token.is_some()
    }

    fn token(&self) -> Result<&str, PapersError> {
        self.config
            .api_token
            .as_deref()
            .ok_or_else(|| PapersError::ServiceUnavailable {
                reason: "MINERU_API_TOKEN is not set".into(),
            })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Run all four phases for one local PDF and unpack the result.
    pub async fn parse_document(
        &self,
        path: &Path,
        progress: &dyn ParseProgressCallback,
    ) -> Result<ParsedDocument, PapersError> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| PapersError::io(path, e))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document.pdf".to_string());

        let done = self
            .parse_files(
                vec![UploadFile {
                    name,
                    data: Bytes::from(data),
                }],
                progress,
            )
            .await?;

        let job = done
            .into_iter()
            .next()
            .ok_or_else(|| PapersError::ParseFailed {
                detail: "no file finished successfully".into(),
            })?;
        let url = job.result_bundle_url.ok_or_else(|| PapersError::ParseFailed {
            detail: format!("'{}' finished without a result URL", job.file_name),
        })?;

        progress.on_phase_start(ParsePhase::Download);
        let archive = self.download_bundle(&url, progress).await?;

        progress.on_phase_start(ParsePhase::Extract);
        open_bundle(archive).await
    }

    /// Phases 1-3 for a batch of files. Returns the files that finished `done`.
    ///
    /// Errors with `ParseFailed` when every file failed.
    pub async fn parse_files(
        &self,
        files: Vec<UploadFile>,
        progress: &dyn ParseProgressCallback,
    ) -> Result<Vec<ParseJob>, PapersError> {
        if files.is_empty() {
            return Err(PapersError::InvalidRequest("no files to parse".into()));
        }

        progress.on_phase_start(ParsePhase::RequestUploadUrls);
        let names: Vec<String> = files.iter().map(|f| f.name.clone()).collect();
        let batch = self.request_upload_urls(&names).await?;
        info!(
            "Remote batch {} created for {} file(s)",
            batch.batch_id,
            files.len()
        );

        progress.on_phase_start(ParsePhase::Upload);
        for (file, url) in files.into_iter().zip(batch.file_urls.iter()) {
            self.upload_file(url, &file.name, file.data).await?;
        }

        progress.on_phase_start(ParsePhase::Poll);
        let done = self.poll_batch(&batch.batch_id, progress).await?;
        if done.is_empty() {
            return Err(PapersError::ParseFailed {
                detail: format!("every file in batch {} failed", batch.batch_id),
            });
        }
        Ok(done)
    }

    /// Phase 1: ask for one signed upload URL per file name.
    pub async fn request_upload_urls(&self, names: &[String]) -> Result<UploadBatch, PapersError> {
        let token = self.token()?;
        let body = BatchRequest {
            files: names
                .iter()
                .map(|name| BatchFile {
                    name,
                    is_ocr: self.config.is_ocr,
                    data_id: uuid::Uuid::new_v4().simple().to_string(),
                })
                .collect(),
            enable_formula: self.config.enable_formula,
            enable_table: self.config.enable_table,
            language: &self.config.language,
            model_version: &self.config.model_version,
        };

        let response = self
            .http
            .post(self.api_url("/api/v4/file-urls/batch"))
            .bearer_auth(token)
            .timeout(self.config.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| PapersError::ServiceUnavailable {
                reason: e.to_string(),
            })?;

        let batch: BatchUrls = read_envelope(response).await?;
        if batch.file_urls.len() != names.len() {
            return Err(PapersError::ServiceUnavailable {
                reason: format!(
                    "got {} upload URLs for {} files",
                    batch.file_urls.len(),
                    names.len()
                ),
            });
        }
        Ok(UploadBatch {
            batch_id: batch.batch_id,
            file_urls: batch.file_urls,
        })
    }

    /// Phase 2: PUT one file to its signed URL.
    pub async fn upload_file(&self, url: &str, name: &str, data: Bytes) -> Result<(), PapersError> {
        let size = data.len();
        let response = self
            .http
            .put(url)
            .timeout(self.config.request_timeout.max(Duration::from_secs(300)))
            .body(data)
            .send()
            .await
            .map_err(|e| PapersError::UploadFailed {
                file: name.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PapersError::UploadFailed {
                file: name.to_string(),
                reason: format!("HTTP {status}: {}", truncate(&body, 200)),
            });
        }
        debug!("Uploaded '{}' ({} bytes)", name, size);
        Ok(())
    }

    /// One status request for `batch_id`.
    pub async fn fetch_batch_status(&self, batch_id: &str) -> Result<Vec<ParseJob>, PapersError> {
        let token = self.token()?;
        let response = self
            .http
            .get(self.api_url(&format!("/api/v4/extract-results/batch/{batch_id}")))
            .bearer_auth(token)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| PapersError::ServiceUnavailable {
                reason: e.to_string(),
            })?;

        let status: BatchStatus = read_envelope(response).await?;
        Ok(status
            .extract_result
            .into_iter()
            .map(|r| ParseJob {
                batch_id: batch_id.to_string(),
                file_name: r.file_name,
                state: JobState::from_remote(&r.state),
                result_bundle_url: r.full_zip_url.filter(|u| !u.is_empty()),
                error: r.err_msg.filter(|m| !m.is_empty()),
            })
            .collect())
    }

    /// Phase 3: poll until every file is terminal. Returns the `done` subset.
    ///
    /// A failed status request counts as an attempt; only an authentication
    /// failure ends polling early.
    pub async fn poll_batch(
        &self,
        batch_id: &str,
        progress: &dyn ParseProgressCallback,
    ) -> Result<Vec<ParseJob>, PapersError> {
        let max = self.config.max_poll_attempts;
        for attempt in 1..=max {
            tokio::time::sleep(self.config.poll_interval).await;

            let jobs = match self.fetch_batch_status(batch_id).await {
                Ok(jobs) => jobs,
                Err(e) if is_auth_failure(&e) => return Err(e),
                Err(e) => {
                    warn!("Batch {} status poll {}/{} failed: {}", batch_id, attempt, max, e);
                    continue;
                }
            };

            let counts = count_states(&jobs);
            progress.on_poll(attempt, max, &counts);
            debug!("Batch {} poll {}/{}: {:?}", batch_id, attempt, max, counts);

            if counts.all_terminal() {
                let (done, failed): (Vec<_>, Vec<_>) =
                    jobs.into_iter().partition(|j| j.state == JobState::Done);
                for job in &failed {
                    let err = job.error.as_deref().unwrap_or("unknown error");
                    warn!("Remote parse of '{}' failed: {}", job.file_name, err);
                    progress.on_file_failed(&job.file_name, err);
                }
                info!(
                    "Batch {} finished: {} done, {} failed",
                    batch_id,
                    done.len(),
                    failed.len()
                );
                return Ok(done);
            }
        }

        Err(PapersError::ParseTimeout {
            batch_id: batch_id.to_string(),
            attempts: max,
        })
    }

    /// Phase 4: download a result bundle with bounded retries.
    pub async fn download_bundle(
        &self,
        url: &str,
        progress: &dyn ParseProgressCallback,
    ) -> Result<Bytes, PapersError> {
        let attempts = self.config.download_attempts.max(1);
        let mut last_err = String::new();

        for attempt in 1..=attempts {
            let delay = self.config.download_delay(attempt);
            if !delay.is_zero() {
                debug!("Waiting {:?} before download attempt {}", delay, attempt);
                tokio::time::sleep(delay).await;
            }

            match self.download_once(url).await {
                Ok(bytes) => {
                    info!("Downloaded result bundle ({} bytes)", bytes.len());
                    return Ok(bytes);
                }
                Err(e) => {
                    warn!("Download attempt {}/{} failed: {}", attempt, attempts, e);
                    if attempt < attempts {
                        progress.on_download_retry(attempt, attempts, &e);
                    }
                    last_err = e;
                }
            }
        }

        Err(PapersError::DownloadFailed {
            url: url.to_string(),
            attempts,
            reason: last_err,
        })
    }

    async fn download_once(&self, url: &str) -> Result<Bytes, String> {
        let idle = self.config.download_idle_timeout;
        let fetch = async {
            let response = self.http.get(url).send().await.map_err(|e| e.to_string())?;
            let status = response.status();
            if !status.is_success() {
                return Err(format!("HTTP {status}"));
            }

            let mut stream = response.bytes_stream();
            let mut buf = BytesMut::new();
            loop {
                match tokio::time::timeout(idle, stream.next()).await {
                    Ok(Some(Ok(chunk))) => buf.extend_from_slice(&chunk),
                    Ok(Some(Err(e))) => return Err(e.to_string()),
                    Ok(None) => break,
                    Err(_) => return Err(format!("no data received for {idle:?}")),
                }
            }
            Ok(buf.freeze())
        };

        tokio::time::timeout(self.config.download_timeout, fetch)
            .await
            .map_err(|_| format!("timed out after {:?}", self.config.download_timeout))?
    }
}

/// Check status and code of a parser API response and return its `data`.
async fn read_envelope<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, PapersError> {
    let status = response.status();
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(PapersError::ServiceUnavailable {
            reason: format!("authentication rejected (HTTP {status})"),
        });
    }
    let text = response
        .text()
        .await
        .map_err(|e| PapersError::ServiceUnavailable {
            reason: e.to_string(),
        })?;
    if !status.is_success() {
        return Err(PapersError::ServiceUnavailable {
            reason: format!("HTTP {status}: {}", truncate(&text, 200)),
        });
    }

    let envelope: Envelope<T> =
        serde_json::from_str(&text).map_err(|e| PapersError::ServiceUnavailable {
            reason: format!("unexpected response: {e}"),
        })?;
    if envelope.code != 0 {
        return Err(PapersError::ServiceUnavailable {
            reason: format!("code {}: {}", envelope.code, envelope.msg),
        });
    }
    envelope.data.ok_or_else(|| PapersError::ServiceUnavailable {
        reason: "response has no data".into(),
    })
}

fn is_auth_failure(e: &PapersError) -> bool {
    matches!(e, PapersError::ServiceUnavailable { reason } if reason.starts_with("authentication"))
}

fn count_states(jobs: &[ParseJob]) -> StateCounts {
    let mut counts = StateCounts::default();
    for job in jobs {
        match job.state {
            JobState::Pending => counts.pending += 1,
            JobState::Running => counts.running += 1,
            JobState::Done => counts.done += 1,
            JobState::Failed => counts.failed += 1,
        }
    }
    counts
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((i, _)) => &s[..i],
        None => s,
    }
}
