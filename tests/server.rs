//! HTTP API tests driven through the router with `tower::ServiceExt::oneshot`.
//!
//! The LLM provider is a `wiremock` server; the remote parser is left
//! unconfigured so no test reaches the network beyond localhost.

use axum::body::{to_bytes, Body, Bytes};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use chrono::Utc;
use edgequake_papers::{
    create_router, AppState, Document, Figure, MemoryStore, ParseMode, ParserConfig,
    ProviderRegistry, RemoteParser, Role, ServerConfig, Session, Store,
};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const KEY_ENV: &str = "PAPERS_TEST_PROVIDER_KEY";

// ── Harness ──────────────────────────────────────────────────────────────────

struct Harness {
    app: Router,
    store: Arc<MemoryStore>,
    dir: TempDir,
}

fn harness(provider_base: &str) -> Harness {
    std::env::set_var(KEY_ENV, "sk-test");
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig::builder()
        .data_dir(dir.path())
        .stream_idle_timeout_secs(10)
        .build()
        .unwrap();
    let providers = ProviderRegistry::from_json(
        &json!({
            "defaultProvider": "fake",
            "providers": {
                "fake": {
                    "baseUrl": format!("{provider_base}/v1"),
                    "apiKeyEnv": KEY_ENV,
                    "model": "fake-model"
                },
                "off": {
                    "baseUrl": format!("{provider_base}/v1"),
                    "apiKeyEnv": KEY_ENV,
                    "model": "fake-model",
                    "enabled": false
                }
            }
        })
        .to_string(),
    )
    .unwrap();
    let parser = RemoteParser::new(ParserConfig::default()).unwrap();
    let store = Arc::new(MemoryStore::new());
    let state = AppState::new(config, store.clone(), parser, providers).unwrap();
    Harness {
        app: create_router(state),
        store,
        dir,
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Bytes) {
    let response = app.clone().oneshot(req).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body)
}

fn get(uri: &str, user: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("x-user-id", user)
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, user: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("x-user-id", user)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn error_of(body: &Bytes) -> String {
    let v: Value = serde_json::from_slice(body).unwrap();
    v["error"].as_str().unwrap_or_default().to_string()
}

async fn seed_session(store: &MemoryStore, owner: &str) -> Session {
    let session = Session {
        id: Uuid::new_v4(),
        owner_id: owner.into(),
        title: "Reading group".into(),
        created_at: Utc::now(),
    };
    store.create_session(session.clone()).await.unwrap();
    session
}

async fn seed_document(store: &MemoryStore, session: &Session, dir: &Path) -> Document {
    let storage_path = dir.join(format!("{}.pdf", Uuid::new_v4()));
    std::fs::write(&storage_path, b"%PDF-1.7 stored").unwrap();
    let document = Document {
        id: Uuid::new_v4(),
        owner_id: session.owner_id.clone(),
        session_id: session.id,
        file_name: "attention.pdf".into(),
        storage_path,
        raw_text: "We propose the Transformer, based solely on attention.".into(),
        markdown_text: None,
        parse_mode: ParseMode::TextOnly,
        page_count: 11,
        created_at: Utc::now(),
    };
    store.insert_document(document.clone()).await.unwrap();
    document
}

fn figure(document: &Document, index: u32, caption: &str, file: &Path) -> Figure {
    Figure {
        id: Uuid::new_v4(),
        document_id: document.id,
        label: format!("F{index}"),
        caption: caption.into(),
        page_number: index + 1,
        image_index: index,
        file_name: file
            .file_name()
            .unwrap()
            .to_string_lossy()
            .into_owned(),
        file_path: file.to_path_buf(),
        file_size: std::fs::metadata(file).map(|m| m.len()).unwrap_or(0),
    }
}

/// Data payloads of an SSE body, parsed as JSON.
fn sse_frames(body: &Bytes) -> Vec<Value> {
    std::str::from_utf8(body)
        .unwrap()
        .lines()
        .filter_map(|l| l.strip_prefix("data:"))
        .map(|d| serde_json::from_str(d.trim()).unwrap())
        .collect()
}

fn provider_delta(text: &str) -> String {
    format!(
        "data: {}\n\n",
        json!({ "choices": [{ "index": 0, "delta": { "content": text } }] })
    )
}

// ── Identity and sessions ────────────────────────────────────────────────────

#[tokio::test]
async fn health_needs_no_identity() {
    let h = harness("http://127.0.0.1:9");
    let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::OK);
    let v: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(v["status"], "ok");
}

#[tokio::test]
async fn missing_user_header_is_unauthorized() {
    let h = harness("http://127.0.0.1:9");
    let req = Request::builder()
        .method(Method::POST)
        .uri("/sessions")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(!error_of(&body).is_empty());
}

#[tokio::test]
async fn sessions_are_private_to_their_owner() {
    let h = harness("http://127.0.0.1:9");
    let (status, body) = send(&h.app, post_json("/sessions", "alice", json!({ "title": "RG" }))).await;
    assert_eq!(status, StatusCode::CREATED);
    let session: Value = serde_json::from_slice(&body).unwrap();
    let id = session["id"].as_str().unwrap().to_string();
    assert_eq!(session["ownerId"], "alice");

    let uri = format!("/sessions/{id}/messages");
    let (status, body) = send(&h.app, get(&uri, "alice")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(serde_json::from_slice::<Value>(&body).unwrap(), json!([]));

    let (status, _) = send(&h.app, get(&uri, "mallory")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&h.app, get(&format!("/sessions/{}/messages", Uuid::new_v4()), "alice")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

// ── Documents ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn upload_rejects_non_pdf() {
    let h = harness("http://127.0.0.1:9");
    let session = seed_session(&h.store, "alice").await;

    let boundary = "papers-test-boundary";
    let body = format!(
        "--{boundary}\r\n\
         Content-Disposition: form-data; name=\"file\"; filename=\"notes.txt\"\r\n\
         Content-Type: text/plain\r\n\r\n\
         just some notes\r\n\
         --{boundary}--\r\n"
    );
    let req = Request::builder()
        .method(Method::POST)
        .uri(format!("/sessions/{}/documents", session.id))
        .header("x-user-id", "alice")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(Body::from(body))
        .unwrap();

    let (status, body) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(error_of(&body).to_lowercase().contains("pdf"));
    assert!(h
        .store
        .list_session_documents(session.id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn parse_images_without_parser_token_is_unavailable() {
    let h = harness("http://127.0.0.1:9");
    let session = seed_session(&h.store, "alice").await;
    let document = seed_document(&h.store, &session, h.dir.path()).await;

    let req = Request::builder()
        .method(Method::POST)
        .uri(format!("/documents/{}/parse-images", document.id))
        .header("x-user-id", "alice")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&h.app, req).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(error_of(&body).contains("MINERU_API_TOKEN"));

    let stored = h.store.get_document(document.id).await.unwrap().unwrap();
    assert_eq!(stored.parse_mode, ParseMode::TextOnly);
    assert!(h.store.list_figures(document.id).await.unwrap().is_empty());
}

// ── Figures ──────────────────────────────────────────────────────────────────

async fn seed_figures(h: &Harness) -> Document {
    let session = seed_session(&h.store, "alice").await;
    let document = seed_document(&h.store, &session, h.dir.path()).await;

    let files = h.dir.path().join("figs");
    std::fs::create_dir_all(&files).unwrap();
    let mut figures = Vec::new();
    for (i, caption) in [
        (1, "Figure 1: The Transformer architecture"),
        (2, "Figure 2: Scaled dot-product attention"),
        (3, "Attention heatmap for layer 5"),
    ] {
        let file = files.join(format!("attention_{}_{i}.png", i + 1));
        std::fs::write(&file, format!("png-{i}")).unwrap();
        figures.push(figure(&document, i, caption, &file));
    }
    let missing = files.join("attention_5_4.png");
    figures.push(figure(&document, 4, "F4", &missing));

    h.store
        .apply_image_parse(document.id, "# Attention\n".into(), figures)
        .await
        .unwrap();
    document
}

#[tokio::test]
async fn figure_lookup_accepts_label_number_and_legacy_forms() {
    let h = harness("http://127.0.0.1:9");
    let document = seed_figures(&h).await;

    for query in ["F3", "f3", "3", "Figure%203", "Fig.%203", "heatmap"] {
        let uri = format!("/documents/{}/figures/by-label/{query}", document.id);
        let response = h.app.clone().oneshot(get(&uri, "alice")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "query {query}");
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "image/png",
            "query {query}"
        );
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"png-3", "query {query}");
    }
}

#[tokio::test]
async fn figure_lookup_misses_are_not_found() {
    let h = harness("http://127.0.0.1:9");
    let document = seed_figures(&h).await;

    let uri = format!("/documents/{}/figures/by-label/F9", document.id);
    let (status, _) = send(&h.app, get(&uri, "alice")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Placeholder figure whose image never made it into the bundle.
    let uri = format!("/documents/{}/figures/by-label/F4", document.id);
    let (status, body) = send(&h.app, get(&uri, "alice")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(error_of(&body).contains("figure image"));

    let uri = format!("/documents/{}/figures/by-label/F1", document.id);
    let (status, _) = send(&h.app, get(&uri, "bob")).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn figures_list_in_canonical_order() {
    let h = harness("http://127.0.0.1:9");
    let document = seed_figures(&h).await;

    let (status, body) = send(&h.app, get(&format!("/documents/{}/figures", document.id), "alice")).await;
    assert_eq!(status, StatusCode::OK);
    let list: Vec<Value> = serde_json::from_slice(&body).unwrap();
    let labels: Vec<&str> = list.iter().map(|f| f["label"].as_str().unwrap()).collect();
    assert_eq!(labels, vec!["F1", "F2", "F3", "F4"]);
    assert_eq!(list[3]["fileSize"], 0);
}

// ── Analyze ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn analyze_streams_chunks_and_stores_reply_once() {
    let provider = MockServer::start().await;
    let sse = format!(
        "{}{}data: [DONE]\n\n",
        provider_delta("Hel"),
        provider_delta("lo")
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse),
        )
        .expect(1)
        .mount(&provider)
        .await;

    let h = harness(&provider.uri());
    let session = seed_session(&h.store, "alice").await;
    seed_document(&h.store, &session, h.dir.path()).await;

    let (status, body) = send(
        &h.app,
        post_json(
            "/analyze",
            "alice",
            json!({
                "sessionId": session.id,
                "message": "What is the main idea?",
                "taskType": "summary",
                "providerId": "fake"
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let frames = sse_frames(&body);
    let kinds: Vec<&str> = frames.iter().map(|f| f["type"].as_str().unwrap()).collect();
    assert_eq!(kinds, vec!["chunk", "chunk", "done"]);
    assert_eq!(frames[0]["content"], "Hel");
    assert_eq!(frames[1]["content"], "lo");
    assert_eq!(frames[2]["content"], "Hello");

    let messages = h.store.list_messages(session.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "What is the main idea?");
    assert_eq!(messages[1].role, Role::Assistant);
    assert_eq!(messages[1].content, "Hello");
    assert_eq!(messages[1].provider_id.as_deref(), Some("fake"));
    assert_eq!(messages[1].task_type.as_deref(), Some("summary"));
    assert_eq!(frames[2]["messageId"], messages[1].id.to_string());
}

#[tokio::test]
async fn analyze_upstream_failure_sends_error_frame_and_stores_nothing() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("model overloaded"))
        .mount(&provider)
        .await;

    let h = harness(&provider.uri());
    let session = seed_session(&h.store, "alice").await;

    let (status, body) = send(
        &h.app,
        post_json(
            "/analyze",
            "alice",
            json!({ "sessionId": session.id, "message": "hi" }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let frames = sse_frames(&body);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["type"], "error");
    assert!(frames[0]["error"].as_str().unwrap().contains("500"));

    let messages = h.store.list_messages(session.id).await.unwrap();
    assert!(messages.iter().all(|m| m.role == Role::User));
}

#[tokio::test]
async fn analyze_rejects_bad_requests_before_streaming() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&provider)
        .await;

    let h = harness(&provider.uri());
    let session = seed_session(&h.store, "alice").await;

    let cases = [
        (json!({ "sessionId": session.id, "message": "hi", "providerId": "off" }), StatusCode::BAD_REQUEST),
        (json!({ "sessionId": session.id, "message": "hi", "providerId": "nope" }), StatusCode::BAD_REQUEST),
        (json!({ "sessionId": session.id, "message": "hi", "taskType": "poem" }), StatusCode::BAD_REQUEST),
        (json!({ "sessionId": session.id, "taskType": "custom" }), StatusCode::BAD_REQUEST),
        (json!({ "sessionId": session.id, "message": "   " }), StatusCode::BAD_REQUEST),
        (json!({ "sessionId": Uuid::new_v4(), "message": "hi" }), StatusCode::NOT_FOUND),
    ];
    for (body, expected) in cases {
        let (status, resp) = send(&h.app, post_json("/analyze", "alice", body.clone())).await;
        assert_eq!(status, expected, "request {body}");
        assert!(!error_of(&resp).is_empty(), "request {body}");
    }

    let (status, _) = send(
        &h.app,
        post_json("/analyze", "bob", json!({ "sessionId": session.id, "message": "hi" })),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    assert!(h.store.list_messages(session.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn analyze_reuses_stored_user_message() {
    let provider = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(format!("{}data: [DONE]\n\n", provider_delta("Sure."))),
        )
        .mount(&provider)
        .await;

    let h = harness(&provider.uri());
    let session = seed_session(&h.store, "alice").await;
    let question = edgequake_papers::Message::user(session.id, "Explain F2");
    let question_id = question.id;
    h.store.insert_message(question).await.unwrap();

    let (status, body) = send(
        &h.app,
        post_json(
            "/analyze",
            "alice",
            json!({ "sessionId": session.id, "userMessageId": question_id }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sse_frames(&body).last().unwrap()["type"], "done");

    let messages = h.store.list_messages(session.id).await.unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].id, question_id);
    assert_eq!(messages[1].content, "Sure.");
}
