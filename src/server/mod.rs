//! HTTP API.
//!
//! Thin axum handlers over the ingest pipeline and the streaming relay.
//! Every route except `/health` acts for the user named in `X-User-Id`
//! and checks ownership before touching anything.

mod analyze;
mod auth;
mod handlers;

pub use analyze::{AnalyzeRequest, StreamFrame};
pub use auth::{CurrentUser, USER_HEADER};
pub use handlers::DocumentSummary;

use crate::config::{ProviderRegistry, ServerConfig};
use crate::error::PapersError;
use crate::pipeline::remote::RemoteParser;
use crate::store::Store;
use axum::extract::DefaultBodyLimit;
use axum::http::{header, Response, StatusCode};
use axum::routing::{get, post};
use axum::Router;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared state for the web server.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub parser: Arc<RemoteParser>,
    pub providers: Arc<ProviderRegistry>,
    /// Client for LLM provider requests.
    pub http: reqwest::Client,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn Store>,
        parser: RemoteParser,
        providers: ProviderRegistry,
    ) -> Result<Self, PapersError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PapersError::Internal(format!("HTTP client: {e}")))?;
        Ok(Self {
            store,
            parser: Arc::new(parser),
            providers: Arc::new(providers),
            http,
            config: Arc::new(config),
        })
    }
}

pub fn create_router(state: AppState) -> Router {
    let upload_limit = state.config.max_upload_bytes;

    Router::new()
        .route("/health", get(handlers::health))
        .route("/sessions", post(handlers::create_session))
        .route("/sessions/:session_id/messages", get(handlers::list_messages))
        .route(
            "/sessions/:session_id/documents",
            post(handlers::upload_document).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/documents/:document_id/figures", get(handlers::list_figures))
        .route(
            "/documents/:document_id/figures/by-label/:label",
            get(handlers::figure_by_label),
        )
        .route(
            "/documents/:document_id/parse-images",
            post(handlers::parse_images),
        )
        .route("/analyze", post(analyze::analyze))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(CatchPanicLayer::custom(panic_response))
        .with_state(state)
}

/// Unhandled panics become the same generic 500 as internal errors.
fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response<axum::body::Body> {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!("Handler panicked: {}", detail);

    let body = serde_json::json!({ "error": "Internal server error" }).to_string();
    let mut response = Response::new(axum::body::Body::from(body));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}

/// Bind `state.config.bind` and serve until Ctrl-C.
pub async fn serve(state: AppState) -> Result<(), PapersError> {
    let addr = state.config.bind;
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| PapersError::Internal(format!("bind {addr}: {e}")))?;
    info!("Starting server at http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await
        .map_err(|e| PapersError::Internal(format!("server: {e}")))
}
