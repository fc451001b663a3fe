use std::sync::Arc;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;

use super::*;
use crate::web::{router, SharedState};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn app(harness: &Harness) -> Router {
    router(Arc::new(SharedState::new(harness.service.clone())))
}

fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(body) => Body::from(body.to_string()),
            None => Body::empty(),
        })
        .unwrap();

    runtime().block_on(async {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    })
}

fn post(app: &Router, uri: &str, body: Value) -> (StatusCode, Value) {
    call(app, Method::POST, uri, Some(body))
}

const NOTES: &[(&str, &str)] = &[
    ("projects/b.md", "---\ntitle: B\n---\nThe b note.\n"),
    ("a.md", "# A\n\nSee [[B]].\n"),
];

#[test]
fn test_create_then_get() {
    let h = Harness::new(NOTES, true);
    let app = app(&h);

    let (status, body) = post(
        &app,
        "/api/note/create",
        json!({ "title": "Web Note", "directory": "projects", "tags": ["demo"], "body": "Hello over http." }),
    );
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["path"], "projects/web-note.md");

    let (status, body) = post(&app, "/api/note/get", json!({ "path": "projects/web-note.md" }));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["title"], "Web Note");
    assert_eq!(body["tags"], json!(["demo"]));
    assert!(body["content"].as_str().unwrap().contains("Hello over http."));

    let (status, body) = post(
        &app,
        "/api/note/create",
        json!({ "title": "Web Note", "directory": "projects" }),
    );
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["kind"], "ALREADY_EXISTS");
}

#[test]
fn test_errors_have_kind_and_detail() {
    let h = Harness::new(NOTES, false);
    let app = app(&h);

    let (status, body) = post(&app, "/api/note/get", json!({ "path": "missing.md" }));
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "NOT_FOUND");
    assert_eq!(body["error"]["detail"]["path"], "missing.md");

    let (status, body) = post(&app, "/api/note/get", json!({ "path": "../../etc/passwd" }));
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "OUTSIDE_VAULT");

    let (status, body) = post(
        &app,
        "/api/note/replace_section",
        json!({ "path": "a.md", "section": "Nope", "content": "x" }),
    );
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["kind"], "SECTION_NOT_FOUND");
}

#[test]
fn test_search_over_http() {
    let h = Harness::new(NOTES, false);
    let app = app(&h);

    let (status, body) = post(&app, "/api/search", json!({ "query": "b note" }));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["mode"], "keyword");
    assert_eq!(body["hits"][0]["path"], "projects/b.md");
    assert_eq!(body["hits"][0]["score"], Value::Null);

    let (status, body) = post(
        &app,
        "/api/search",
        json!({ "query": "b note", "since": "yesterday-ish" }),
    );
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "INVALID_ARGUMENT");
}

#[test]
fn test_rebuild_needs_confirmation() {
    let h = Harness::new(NOTES, false);
    let app = app(&h);

    let (status, body) = call(&app, Method::GET, "/api/index/status", None);
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "unavailable");

    let (status, body) = post(&app, "/api/index/rebuild", json!({}));
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "INVALID_ARGUMENT");
    assert_eq!(h.index.health().state, "unavailable");

    let (status, body) = post(&app, "/api/index/rebuild", json!({ "confirm": true }));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["notes_indexed"], 2);

    let (_, body) = call(&app, Method::GET, "/api/index/status", None);
    assert_eq!(body["state"], "ready");
    assert_eq!(body["notes"], 2);
    assert_eq!(body["model"], MODEL);
}

#[test]
fn test_structural_tools_over_http() {
    let h = Harness::new(NOTES, true);
    let app = app(&h);

    let (status, body) = post(&app, "/api/references", json!({ "title": "B" }));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["references"][0]["source_path"], "a.md");
    assert_eq!(body["references"][0]["link_kind"], "structural");

    let (status, body) = post(
        &app,
        "/api/note/rename",
        json!({ "path": "projects/b.md", "new_title": "a" }),
    );
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"]["kind"], "RENAME_CONFLICT");
    assert_eq!(body["error"]["detail"]["existing"], "a.md");

    let (status, body) = post(
        &app,
        "/api/note/rename",
        json!({ "path": "projects/b.md", "new_title": "Bee" }),
    );
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["new_path"], "projects/bee.md");
    assert_eq!(body["modified"], json!(["projects/bee.md", "a.md"]));

    let (status, body) = post(
        &app,
        "/api/note/delete",
        json!({ "path": "projects/bee.md", "reason": "merged" }),
    );
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["archived_to"], "archives/bee.md");
}

#[test]
fn test_overview_over_http() {
    let h = Harness::new(NOTES, true);
    let app = app(&h);

    let (status, body) = post(&app, "/api/notes", json!({ "directory": "projects" }));
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([{ "path": "projects/b.md", "title": "B", "date": "", "tags": [] }]));

    let (status, body) = post(&app, "/api/notes", json!({ "limit": 0 }));
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["kind"], "INVALID_ARGUMENT");

    let (status, body) = call(&app, Method::GET, "/api/tags", None);
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tags"], json!([]));

    let (status, body) = call(&app, Method::GET, "/api/stats", None);
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["notes"], 2);
    assert_eq!(body["index_state"], "ready");
    assert_eq!(body["indexed_notes"], 2);
}
