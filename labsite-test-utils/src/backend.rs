//! In-process mock of the lab REST backend.
//!
//! Serves the canonical `/api` resource set from in-memory collections on an
//! ephemeral localhost port. Tests can seed data, inject one-shot failures,
//! hold write requests open, and count requests per method and path.

use axum::extract::{Multipart, OriginalUri, Path, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Map, Value};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// One request the backend received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub authorization: Option<String>,
}

#[derive(Debug, Clone)]
struct FailureRule {
    method: Method,
    path_prefix: String,
    status: StatusCode,
    body: Value,
}

struct BackendState {
    collections: Mutex<HashMap<String, Vec<Value>>>,
    meta: Mutex<HashMap<String, Value>>,
    failures: Mutex<VecDeque<FailureRule>>,
    requests: Mutex<Vec<RecordedRequest>>,
    next_id: AtomicU64,
    next_upload: AtomicU64,
    writes_open: watch::Sender<bool>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl BackendState {
    fn new() -> Self {
        let (writes_open, _) = watch::channel(true);
        Self {
            collections: Mutex::new(HashMap::new()),
            meta: Mutex::new(HashMap::new()),
            failures: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            next_upload: AtomicU64::new(1),
            writes_open,
        }
    }

    /// Record the request, wait on the write gate and apply failure rules.
    async fn intercept(
        &self,
        method: &Method,
        path: &str,
        authorization: Option<String>,
    ) -> Option<Response> {
        lock(&self.requests).push(RecordedRequest {
            method: method.to_string(),
            path: path.to_string(),
            authorization,
        });

        if method != Method::GET {
            let mut open = self.writes_open.subscribe();
            while !*open.borrow_and_update() {
                if open.changed().await.is_err() {
                    break;
                }
            }
        }

        let mut failures = lock(&self.failures);
        let position = failures
            .iter()
            .position(|rule| rule.method == method && path.starts_with(&rule.path_prefix))?;
        let rule = failures.remove(position)?;
        Some((rule.status, Json(rule.body)).into_response())
    }
}

/// Handle to a running mock backend. The server stops when dropped.
pub struct MockBackend {
    addr: SocketAddr,
    state: Arc<BackendState>,
    server: JoinHandle<()>,
}

impl MockBackend {
    /// Bind to `127.0.0.1:0` and start serving.
    pub async fn start() -> Self {
        let state = Arc::new(BackendState::new());
        let app = Router::new()
            .route("/api/upload", post(upload))
            .route("/api/meta/:page", get(get_meta).put(put_meta))
            .route("/api/:resource", get(list_records).post(create_record))
            .route(
                "/api/:resource/:id",
                get(get_record).put(update_record).delete(delete_record),
            )
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock backend");
        let addr = listener.local_addr().expect("mock backend address");
        let server = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                tracing::error!(error = %err, "mock backend stopped");
            }
        });

        Self {
            addr,
            state,
            server,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Replace a collection's records.
    pub fn seed(&self, resource: &str, records: Vec<Value>) {
        lock(&self.state.collections).insert(resource.to_string(), records);
    }

    pub fn seed_meta(&self, page: &str, meta: Value) {
        lock(&self.state.meta).insert(page.to_string(), meta);
    }

    pub fn records(&self, resource: &str) -> Vec<Value> {
        lock(&self.state.collections)
            .get(resource)
            .cloned()
            .unwrap_or_default()
    }

    pub fn meta(&self, page: &str) -> Option<Value> {
        lock(&self.state.meta).get(page).cloned()
    }

    /// Fail the next request matching `method` and `path_prefix` once.
    pub fn fail_next(&self, method: Method, path_prefix: &str, status: u16, message: &str) {
        self.fail_next_with_body(method, path_prefix, status, json!({ "message": message }));
    }

    pub fn fail_next_with_body(&self, method: Method, path_prefix: &str, status: u16, body: Value) {
        lock(&self.state.failures).push_back(FailureRule {
            method,
            path_prefix: path_prefix.to_string(),
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            body,
        });
    }

    /// Block non-GET requests until [`MockBackend::release_writes`].
    pub fn hold_writes(&self) {
        self.state.writes_open.send_replace(false);
    }

    pub fn release_writes(&self) {
        self.state.writes_open.send_replace(true);
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        lock(&self.state.requests).clone()
    }

    /// Number of requests seen for `method` whose path starts with `path_prefix`.
    pub fn request_count(&self, method: &str, path_prefix: &str) -> usize {
        lock(&self.state.requests)
            .iter()
            .filter(|r| r.method == method && r.path.starts_with(path_prefix))
            .count()
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.server.abort();
    }
}

type Shared = State<Arc<BackendState>>;

fn authorization(headers: &axum::http::HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn not_found(what: &str) -> Response {
    (StatusCode::NOT_FOUND, Json(json!({ "message": format!("{} not found", what) })))
        .into_response()
}

fn matches_id(record: &Value, id: &str) -> bool {
    ["id", "_id"].iter().any(|field| match record.get(*field) {
        Some(Value::String(s)) => s == id,
        Some(Value::Number(n)) => n.to_string() == id,
        _ => false,
    })
}

async fn list_records(
    State(state): Shared,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: axum::http::HeaderMap,
    Path(resource): Path<String>,
    Query(filter): Query<HashMap<String, String>>,
) -> Response {
    if let Some(rejection) = state
        .intercept(&method, uri.path(), authorization(&headers))
        .await
    {
        return rejection;
    }
    let records: Vec<Value> = lock(&state.collections)
        .get(&resource)
        .cloned()
        .unwrap_or_default()
        .into_iter()
        .filter(|record| {
            filter
                .iter()
                .all(|(field, wanted)| record.get(field).and_then(Value::as_str) == Some(wanted.as_str()))
        })
        .collect();
    Json(json!({ "data": records })).into_response()
}

async fn get_record(
    State(state): Shared,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: axum::http::HeaderMap,
    Path((resource, id)): Path<(String, String)>,
) -> Response {
    if let Some(rejection) = state
        .intercept(&method, uri.path(), authorization(&headers))
        .await
    {
        return rejection;
    }
    let found = lock(&state.collections)
        .get(&resource)
        .and_then(|records| records.iter().find(|r| matches_id(r, &id)).cloned());
    match found {
        Some(record) => Json(json!({ "data": record })).into_response(),
        None => not_found(&resource),
    }
}

async fn create_record(
    State(state): Shared,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: axum::http::HeaderMap,
    Path(resource): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    if let Some(rejection) = state
        .intercept(&method, uri.path(), authorization(&headers))
        .await
    {
        return rejection;
    }
    let mut record = match body {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let id = format!("srv-{}", state.next_id.fetch_add(1, Ordering::SeqCst));
    record.insert("id".to_string(), Value::String(id));
    record.remove("_id");
    let record = Value::Object(record);
    lock(&state.collections)
        .entry(resource)
        .or_default()
        .push(record.clone());
    (StatusCode::CREATED, Json(json!({ "data": record }))).into_response()
}

async fn update_record(
    State(state): Shared,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: axum::http::HeaderMap,
    Path((resource, id)): Path<(String, String)>,
    Json(body): Json<Value>,
) -> Response {
    if let Some(rejection) = state
        .intercept(&method, uri.path(), authorization(&headers))
        .await
    {
        return rejection;
    }
    let mut collections = lock(&state.collections);
    let Some(record) = collections
        .get_mut(&resource)
        .and_then(|records| records.iter_mut().find(|r| matches_id(r, &id)))
    else {
        return not_found(&resource);
    };
    if let (Value::Object(target), Value::Object(fields)) = (&mut *record, body) {
        for (name, value) in fields {
            if name != "id" && name != "_id" {
                target.insert(name, value);
            }
        }
    }
    Json(json!({ "data": record.clone() })).into_response()
}

async fn delete_record(
    State(state): Shared,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: axum::http::HeaderMap,
    Path((resource, id)): Path<(String, String)>,
) -> Response {
    if let Some(rejection) = state
        .intercept(&method, uri.path(), authorization(&headers))
        .await
    {
        return rejection;
    }
    let mut collections = lock(&state.collections);
    let Some(records) = collections.get_mut(&resource) else {
        return not_found(&resource);
    };
    let before = records.len();
    records.retain(|r| !matches_id(r, &id));
    if records.len() == before {
        return not_found(&resource);
    }
    Json(json!({ "data": { "id": id } })).into_response()
}

async fn get_meta(
    State(state): Shared,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: axum::http::HeaderMap,
    Path(page): Path<String>,
) -> Response {
    if let Some(rejection) = state
        .intercept(&method, uri.path(), authorization(&headers))
        .await
    {
        return rejection;
    }
    match lock(&state.meta).get(&page) {
        Some(meta) => Json(json!({ "data": meta })).into_response(),
        None => not_found("page"),
    }
}

async fn put_meta(
    State(state): Shared,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: axum::http::HeaderMap,
    Path(page): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    if let Some(rejection) = state
        .intercept(&method, uri.path(), authorization(&headers))
        .await
    {
        return rejection;
    }
    let mut meta = lock(&state.meta);
    let entry = meta.entry(page).or_insert_with(|| json!({}));
    if let (Value::Object(target), Value::Object(fields)) = (&mut *entry, body) {
        for (name, value) in fields {
            target.insert(name, value);
        }
    }
    Json(json!({ "data": entry.clone() })).into_response()
}

async fn upload(
    State(state): Shared,
    method: Method,
    OriginalUri(uri): OriginalUri,
    headers: axum::http::HeaderMap,
    mut multipart: Multipart,
) -> Response {
    if let Some(rejection) = state
        .intercept(&method, uri.path(), authorization(&headers))
        .await
    {
        return rejection;
    }
    let mut urls = Vec::new();
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                let name = field.file_name().unwrap_or("upload.bin").to_string();
                if field.bytes().await.is_err() {
                    return (StatusCode::BAD_REQUEST, Json(json!({ "message": "bad part" })))
                        .into_response();
                }
                let n = state.next_upload.fetch_add(1, Ordering::SeqCst);
                urls.push(format!("/uploads/{}-{}", n, name));
            }
            Ok(None) => break,
            Err(_) => {
                return (StatusCode::BAD_REQUEST, Json(json!({ "message": "bad multipart" })))
                    .into_response()
            }
        }
    }
    Json(json!({ "urls": urls })).into_response()
}
