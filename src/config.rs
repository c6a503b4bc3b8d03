//! Configuration types for the server, the remote parser and LLM providers.
//!
//! [`ServerConfig`] is built via [`ServerConfigBuilder`] so callers set only
//! what they care about. [`ParserConfig`] holds every knob of the remote
//! parsing orchestrator, and [`ProviderRegistry`] is the provider contract
//! loaded from a JSON file.

use crate::error::PapersError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ── Server ───────────────────────────────────────────────────────────────

/// Configuration for the HTTP server.
///
/// # Example
/// ```rust
/// use edgequake_papers::ServerConfig;
///
/// let config = ServerConfig::builder()
///     .data_dir("/var/lib/papers")
///     .max_prompt_chars(60_000)
///     .build()
///     .unwrap();
/// ```
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Socket address the server binds to. Default: `127.0.0.1:8080`.
    pub bind: SocketAddr,

    /// Root for uploads, figures and the store snapshot. Default: `./data`.
    pub data_dir: PathBuf,

    /// Maximum characters of document text placed into one prompt. Default: 80 000.
    ///
    /// Longer documents are truncated and the `done` event carries a warning.
    pub max_prompt_chars: usize,

    /// Maximum figure images attached to a multimodal prompt. Default: 8.
    pub max_prompt_figures: usize,

    /// Longest edge of a figure image sent to a multimodal provider. Default: 1568.
    pub max_figure_pixels: u32,

    /// Maximum accepted upload size in bytes. Default: 100 MiB.
    pub max_upload_bytes: usize,

    /// Idle timeout between chat-completion stream reads in seconds. Default: 120.
    pub stream_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            data_dir: PathBuf::from("./data"),
            max_prompt_chars: 80_000,
            max_prompt_figures: 8,
            max_figure_pixels: 1568,
            max_upload_bytes: 100 * 1024 * 1024,
            stream_idle_timeout_secs: 120,
        }
    }
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.data_dir.join("uploads")
    }

    pub fn figures_dir(&self) -> PathBuf {
        self.data_dir.join("figures")
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("store.json")
    }
}

/// Builder for [`ServerConfig`].
#[derive(Debug)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.config.bind = addr;
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = dir.into();
        self
    }

    pub fn max_prompt_chars(mut self, n: usize) -> Self {
        self.config.max_prompt_chars = n;
        self
    }

    pub fn max_prompt_figures(mut self, n: usize) -> Self {
        self.config.max_prompt_figures = n;
        self
    }

    pub fn max_figure_pixels(mut self, px: u32) -> Self {
        self.config.max_figure_pixels = px.max(64);
        self
    }

    pub fn max_upload_bytes(mut self, n: usize) -> Self {
        self.config.max_upload_bytes = n;
        self
    }

    pub fn stream_idle_timeout_secs(mut self, secs: u64) -> Self {
        self.config.stream_idle_timeout_secs = secs;
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ServerConfig, PapersError> {
        let c = &self.config;
        if c.max_prompt_chars < 1000 {
            return Err(PapersError::InvalidConfig(format!(
                "max_prompt_chars must be ≥ 1000, got {}",
                c.max_prompt_chars
            )));
        }
        if c.max_upload_bytes == 0 {
            return Err(PapersError::InvalidConfig(
                "max_upload_bytes must be > 0".into(),
            ));
        }
        if c.stream_idle_timeout_secs == 0 {
            return Err(PapersError::InvalidConfig(
                "stream_idle_timeout_secs must be > 0".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Remote parser ────────────────────────────────────────────────────────

/// Public resolvers consulted for the parser's own domains.
pub const DEFAULT_DNS_SERVERS: &[IpAddr] = &[
    IpAddr::V4(Ipv4Addr::new(223, 5, 5, 5)),
    IpAddr::V4(Ipv4Addr::new(119, 29, 29, 29)),
    IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)),
    IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
];

/// Hostname suffixes that are resolved through [`DEFAULT_DNS_SERVERS`].
pub const DEFAULT_DNS_DOMAINS: &[&str] = &["mineru.net", "openxlab.org.cn", "aliyuncs.com"];

/// Configuration for the remote PDF-to-markdown parsing service.
#[derive(Clone)]
pub struct ParserConfig {
    /// Service base URL. Default: `https://mineru.net`.
    pub base_url: String,

    /// Bearer token. `None` means the service is unavailable.
    pub api_token: Option<String>,

    /// Parser model version sent with each batch. Default: `"vlm"`.
    pub model_version: String,

    /// Force OCR on every page. Default: true.
    pub is_ocr: bool,

    /// Ask the parser to recognise formulas. Default: true.
    pub enable_formula: bool,

    /// Ask the parser to recognise tables. Default: true.
    pub enable_table: bool,

    /// Document language hint. Default: `"en"`.
    pub language: String,

    /// Delay between batch-status polls. Default: 3 s.
    pub poll_interval: Duration,

    /// Polls before giving up with `ParseTimeout`. Default: 200 (≈ 10 min).
    pub max_poll_attempts: u32,

    /// Result-bundle download attempts. Default: 3.
    pub download_attempts: u32,

    /// First retry delay; doubles per attempt. Default: 5 s.
    pub download_backoff: Duration,

    /// Retry delay ceiling. Default: 30 s.
    pub download_backoff_cap: Duration,

    /// Hard limit for one download attempt. Default: 20 min.
    pub download_timeout: Duration,

    /// Maximum silence between two body reads. Default: 30 s.
    pub download_idle_timeout: Duration,

    /// Timeout for API calls other than the bundle download. Default: 60 s.
    pub request_timeout: Duration,

    /// Fallback resolvers for [`ParserConfig::dns_domains`].
    pub dns_servers: Vec<IpAddr>,

    /// Hostname suffixes resolved through `dns_servers`.
    pub dns_domains: Vec<String>,

    /// Per-lookup timeout of the fallback resolver. Default: 3 s.
    pub dns_timeout: Duration,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            base_url: "https://mineru.net".to_string(),
            api_token: None,
            model_version: "vlm".to_string(),
            is_ocr: true,
            enable_formula: true,
            enable_table: true,
            language: "en".to_string(),
            poll_interval: Duration::from_secs(3),
            max_poll_attempts: 200,
            download_attempts: 3,
            download_backoff: Duration::from_secs(5),
            download_backoff_cap: Duration::from_secs(30),
            download_timeout: Duration::from_secs(20 * 60),
            download_idle_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(60),
            dns_servers: DEFAULT_DNS_SERVERS.to_vec(),
            dns_domains: DEFAULT_DNS_DOMAINS.iter().map(|d| d.to_string()).collect(),
            dns_timeout: Duration::from_secs(3),
        }
    }
}

impl fmt::Debug for ParserConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParserConfig")
            .field("base_url", &self.base_url)
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .field("model_version", &self.model_version)
            .field("language", &self.language)
            .field("poll_interval", &self.poll_interval)
            .field("max_poll_attempts", &self.max_poll_attempts)
            .field("download_attempts", &self.download_attempts)
            .field("download_timeout", &self.download_timeout)
            .field("dns_domains", &self.dns_domains)
            .finish()
    }
}

impl ParserConfig {
    /// Defaults with the token taken from `MINERU_API_TOKEN`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.api_token = std::env::var("MINERU_API_TOKEN")
            .ok()
            .filter(|t| !t.trim().is_empty());
        if let Ok(url) = std::env::var("MINERU_BASE_URL") {
            if !url.trim().is_empty() {
                config.base_url = url.trim_end_matches('/').to_string();
            }
        }
        config
    }

    /// Backoff before download attempt `attempt` (1-based; attempt 1 has none).
    pub fn download_delay(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempt - 2);
        self.download_backoff
            .saturating_mul(factor)
            .min(self.download_backoff_cap)
    }
}

// ── LLM providers ────────────────────────────────────────────────────────

/// One entry of the provider file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    /// Chat-completions-compatible base URL, e.g. `https://api.openai.com/v1`.
    pub base_url: String,
    /// Name of the env var holding the API key.
    pub api_key_env: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Accepts `image_url` content parts.
    #[serde(default)]
    pub multimodal: bool,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_temperature() -> f32 {
    0.3
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_enabled() -> bool {
    true
}

/// A provider that passed every pre-flight check.
#[derive(Clone)]
pub struct ResolvedProvider {
    pub id: String,
    pub config: ProviderConfig,
    pub api_key: String,
}

impl ResolvedProvider {
    /// Full URL of the chat-completions endpoint.
    pub fn completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        )
    }
}

impl fmt::Debug for ResolvedProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedProvider")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

/// The set of configured LLM providers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRegistry {
    #[serde(default)]
    pub default_provider: Option<String>,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
}

impl ProviderRegistry {
    /// Parse and validate a registry from JSON text.
    pub fn from_json(text: &str) -> Result<Self, PapersError> {
        let registry: Self = serde_json::from_str(text)
            .map_err(|e| PapersError::InvalidConfig(format!("provider file: {e}")))?;
        registry.validate()?;
        Ok(registry)
    }

    /// Load a registry from a JSON file.
    pub fn load(path: &Path) -> Result<Self, PapersError> {
        let text = std::fs::read_to_string(path).map_err(|e| PapersError::io(path, e))?;
        Self::from_json(&text)
    }

    fn validate(&self) -> Result<(), PapersError> {
        if let Some(ref id) = self.default_provider {
            if !self.providers.contains_key(id) {
                return Err(PapersError::InvalidConfig(format!(
                    "defaultProvider '{id}' is not listed under providers"
                )));
            }
        }
        for (id, p) in &self.providers {
            if p.base_url.trim().is_empty() || p.model.trim().is_empty() {
                return Err(PapersError::InvalidConfig(format!(
                    "provider '{id}' needs baseUrl and model"
                )));
            }
        }
        Ok(())
    }

    /// Resolve `provider_id` (or the default) against the environment.
    pub fn resolve(&self, provider_id: Option<&str>) -> Result<ResolvedProvider, PapersError> {
        self.resolve_with(provider_id, |var| std::env::var(var).ok())
    }

    /// Same as [`ProviderRegistry::resolve`] with an injectable env lookup.
    pub fn resolve_with(
        &self,
        provider_id: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<ResolvedProvider, PapersError> {
        let id = provider_id
            .filter(|p| !p.trim().is_empty())
            .map(str::to_string)
            .or_else(|| self.default_provider.clone())
            .ok_or_else(|| PapersError::ProviderUnconfigured {
                provider: "default".into(),
                hint: "no providerId given and no defaultProvider configured".into(),
            })?;

        let config = self
            .providers
            .get(&id)
            .ok_or_else(|| PapersError::ProviderUnconfigured {
                provider: id.clone(),
                hint: "unknown provider".into(),
            })?;

        if !config.enabled {
            return Err(PapersError::ProviderUnconfigured {
                provider: id,
                hint: "provider is disabled".into(),
            });
        }

        let api_key = env(&config.api_key_env)
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| PapersError::ProviderUnconfigured {
                provider: id.clone(),
                hint: format!("{} is not set", config.api_key_env),
            })?;

        Ok(ResolvedProvider {
            id,
            config: config.clone(),
            api_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROVIDERS: &str = r#"{
        "defaultProvider": "openai",
        "providers": {
            "openai": {
                "baseUrl": "https://api.openai.com/v1/",
                "apiKeyEnv": "OPENAI_API_KEY",
                "model": "gpt-4.1-mini",
                "multimodal": true
            },
            "local": {
                "baseUrl": "http://localhost:11434/v1",
                "apiKeyEnv": "LOCAL_KEY",
                "model": "llama3",
                "enabled": false
            }
        }
    }"#;

    fn env_with_openai(var: &str) -> Option<String> {
        (var == "OPENAI_API_KEY").then(|| "sk-test".to_string())
    }

    #[test]
    fn resolves_default_provider() {
        let reg = ProviderRegistry::from_json(PROVIDERS).unwrap();
        let p = reg.resolve_with(None, env_with_openai).unwrap();
        assert_eq!(p.id, "openai");
        assert_eq!(p.api_key, "sk-test");
        assert!(p.config.multimodal);
        assert_eq!(p.config.max_tokens, 4096);
        assert_eq!(
            p.completions_url(),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn rejects_disabled_provider() {
        let reg = ProviderRegistry::from_json(PROVIDERS).unwrap();
        let err = reg.resolve_with(Some("local"), |_| Some("k".into())).unwrap_err();
        assert!(matches!(err, PapersError::ProviderUnconfigured { .. }));
        assert!(err.to_string().contains("disabled"));
    }

    #[test]
    fn rejects_missing_api_key() {
        let reg = ProviderRegistry::from_json(PROVIDERS).unwrap();
        let err = reg.resolve_with(Some("openai"), |_| None).unwrap_err();
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }

    #[test]
    fn rejects_unknown_default() {
        let bad = r#"{"defaultProvider":"x","providers":{}}"#;
        assert!(matches!(
            ProviderRegistry::from_json(bad),
            Err(PapersError::InvalidConfig(_))
        ));
    }

    #[test]
    fn download_backoff_doubles_and_caps() {
        let c = ParserConfig::default();
        assert_eq!(c.download_delay(1), Duration::ZERO);
        assert_eq!(c.download_delay(2), Duration::from_secs(5));
        assert_eq!(c.download_delay(3), Duration::from_secs(10));
        assert_eq!(c.download_delay(6), Duration::from_secs(30));
    }

    #[test]
    fn parser_debug_redacts_token() {
        let mut c = ParserConfig::default();
        c.api_token = Some("secret-token".into());
        let dbg = format!("{c:?}");
        assert!(!dbg.contains("secret-token"));
    }

    #[test]
    fn server_builder_validates() {
        assert!(ServerConfig::builder().max_prompt_chars(10).build().is_err());
        let c = ServerConfig::builder().data_dir("/tmp/x").build().unwrap();
        assert_eq!(c.figures_dir(), PathBuf::from("/tmp/x/figures"));
    }
}
