//! In-process emulation of the Coze API surface the client core talks to.
//!
//! Every response carries an `x-tt-logid` header: the request's own value
//! when it sent one, a fresh id otherwise. `/v1` and `/v3` routes require a
//! `Bearer` token; the OAuth routes do not.

use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::{
    body::Body,
    extract::{Multipart, Path, Query, Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use uuid::Uuid;

pub const LOGID_HEADER: &str = "x-tt-logid";
pub const ITEM_COUNT: usize = 13;
pub const DEVICE_CODE: &str = "dev-code-1";
/// Token polls answered with `authorization_pending` before a token is issued.
pub const PENDING_POLLS: usize = 2;
/// Authorization code the token route accepts for the PKCE grant.
pub const AUTH_CODE: &str = "auth-code-1";
/// Verifier paired with [`AUTH_CODE`].
pub const CODE_VERIFIER: &str = "verifier-0123456789";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: usize,
    pub name: String,
}

#[derive(Default)]
struct Counters {
    list_calls: AtomicUsize,
    token_polls: AtomicUsize,
    refreshes: AtomicUsize,
    stream_closed: AtomicBool,
}

/// Shared server state; tests keep a clone to observe what the server saw.
#[derive(Clone, Default)]
pub struct AppState {
    inner: Arc<Counters>,
}

impl AppState {
    pub fn list_calls(&self) -> usize {
        self.inner.list_calls.load(Ordering::SeqCst)
    }

    pub fn token_polls(&self) -> usize {
        self.inner.token_polls.load(Ordering::SeqCst)
    }

    pub fn refreshes(&self) -> usize {
        self.inner.refreshes.load(Ordering::SeqCst)
    }

    /// Whether the body of the endless stream has been dropped.
    pub fn stream_closed(&self) -> bool {
        self.inner.stream_closed.load(Ordering::SeqCst)
    }
}

pub fn app() -> Router {
    app_with_state(AppState::default())
}

pub fn app_with_state(state: AppState) -> Router {
    let api = Router::new()
        .route("/v1/bots/{bot_id}", get(get_bot))
        .route("/v1/whoami", get(whoami))
        .route("/v1/items", get(list_items))
        .route("/v1/cursor_items", get(list_cursor_items))
        .route("/v1/files/upload", post(upload_file))
        .route("/v1/gateway_error", get(gateway_error))
        .route("/v1/slow", get(slow))
        .route("/v3/chat", post(chat))
        .route("/v1/workflow/stream_run", post(workflow_run))
        .route("/v1/workflow/stream_resume", post(workflow_resume))
        .route("/v1/workflow/stream_error", post(workflow_error))
        .route("/v1/stream/truncated", get(truncated_stream))
        .route("/v1/stream/endless", get(endless_stream))
        .route_layer(middleware::from_fn(require_bearer));

    let oauth = Router::new()
        .route("/api/permission/oauth2/device/code", post(device_code))
        .route("/api/permission/oauth2/token", post(token));

    api.merge(oauth)
        .layer(middleware::from_fn(trace_id))
        .with_state(state)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    run_with_state(listener, AppState::default()).await
}

pub async fn run_with_state(listener: TcpListener, state: AppState) -> Result<(), std::io::Error> {
    axum::serve(listener, app_with_state(state)).await
}

// --- middleware ---

async fn trace_id(req: Request, next: Next) -> Response {
    let logid = req
        .headers()
        .get(LOGID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&logid) {
        response.headers_mut().insert(LOGID_HEADER, value);
    }
    response
}

async fn require_bearer(req: Request, next: Next) -> Response {
    let authorized = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| !token.is_empty());
    if !authorized {
        return failure(StatusCode::UNAUTHORIZED, 4100, "authentication is invalid");
    }
    next.run(req).await
}

// --- helpers ---

fn envelope<T: Serialize>(data: T) -> Response {
    Json(json!({"code": 0, "msg": "", "data": data})).into_response()
}

fn failure(status: StatusCode, code: i64, msg: &str) -> Response {
    (status, Json(json!({"code": code, "msg": msg}))).into_response()
}

fn oauth_failure(error_code: &str, message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error_code": error_code, "error_message": message})),
    )
        .into_response()
}

fn event_stream<S>(body: S) -> Response
where
    S: futures::Stream<Item = Result<Bytes, Infallible>> + Send + 'static,
{
    ([(header::CONTENT_TYPE, "text/event-stream")], Body::from_stream(body)).into_response()
}

/// Serve `text` in `chunk` sized pieces to exercise line reassembly.
fn chunked(text: String, chunk: usize) -> Response {
    let pieces: Vec<Result<Bytes, Infallible>> = text
        .into_bytes()
        .chunks(chunk)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    event_stream(futures::stream::iter(pieces))
}

fn frame(id: Option<usize>, event: &str, data: &serde_json::Value) -> String {
    match id {
        Some(id) => format!("id: {id}\nevent: {event}\ndata: {data}\n\n"),
        None => format!("event: {event}\ndata: {data}\n\n"),
    }
}

fn items() -> impl Iterator<Item = Item> {
    (0..ITEM_COUNT).map(|id| Item {
        id,
        name: format!("item-{id}"),
    })
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

// --- resources ---

async fn get_bot(Path(bot_id): Path<String>) -> Response {
    if bot_id == "missing" {
        // Business failures come back with HTTP 200 and a non-zero code.
        return failure(StatusCode::OK, 4200, "bot not found");
    }
    envelope(json!({"bot_id": bot_id, "name": "Helper"}))
}

async fn whoami(headers: HeaderMap) -> Response {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or_default();
    envelope(json!({"token": token}))
}

#[derive(Deserialize)]
struct NumberQuery {
    page_num: Option<usize>,
    page_size: Option<usize>,
}

async fn list_items(State(state): State<AppState>, Query(query): Query<NumberQuery>) -> Response {
    state.inner.list_calls.fetch_add(1, Ordering::SeqCst);
    let size = query.page_size.unwrap_or(20).max(1);
    let start = (query.page_num.unwrap_or(1).max(1) - 1) * size;
    let page: Vec<Item> = items().skip(start).take(size).collect();
    let has_more = start + page.len() < ITEM_COUNT;
    envelope(json!({"items": page, "has_more": has_more, "total": ITEM_COUNT}))
}

#[derive(Deserialize)]
struct CursorQuery {
    page_token: Option<String>,
    page_size: Option<usize>,
}

async fn list_cursor_items(State(state): State<AppState>, Query(query): Query<CursorQuery>) -> Response {
    state.inner.list_calls.fetch_add(1, Ordering::SeqCst);
    let size = query.page_size.unwrap_or(20).max(1);
    let start = match query.page_token.as_deref().map(str::parse::<usize>) {
        None => 0,
        Some(Ok(offset)) => offset,
        Some(Err(_)) => return failure(StatusCode::BAD_REQUEST, 4000, "invalid page_token"),
    };
    let page: Vec<Item> = items().skip(start).take(size).collect();
    let end = start + page.len();
    let has_more = end < ITEM_COUNT;
    let next = has_more.then(|| end.to_string());
    envelope(json!({"items": page, "has_more": has_more, "next_page_token": next}))
}

async fn upload_file(mut multipart: Multipart) -> Response {
    match multipart.next_field().await {
        Ok(Some(field)) => {
            let name = field.name().unwrap_or_default().to_string();
            let file_name = field.file_name().unwrap_or_default().to_string();
            match field.bytes().await {
                Ok(data) => envelope(json!({"field": name, "file_name": file_name, "bytes": data.len()})),
                Err(e) => failure(StatusCode::BAD_REQUEST, 4000, &e.to_string()),
            }
        }
        Ok(None) => failure(StatusCode::BAD_REQUEST, 4000, "missing file"),
        Err(e) => failure(StatusCode::BAD_REQUEST, 4000, &e.to_string()),
    }
}

async fn gateway_error() -> Response {
    (StatusCode::BAD_GATEWAY, "upstream unavailable").into_response()
}

async fn slow() -> Response {
    tokio::time::sleep(Duration::from_secs(3)).await;
    envelope(json!({}))
}

// --- streams ---

#[derive(Deserialize)]
struct ChatRequest {
    bot_id: String,
    #[serde(default)]
    additional_messages: Vec<serde_json::Value>,
}

async fn chat(Json(input): Json<ChatRequest>) -> Response {
    if input.bot_id == "missing" {
        return failure(StatusCode::OK, 4200, "bot not found");
    }
    let chat = json!({"id": "chat-1", "conversation_id": "conv-1", "bot_id": input.bot_id, "status": "created"});
    let message = json!({
        "id": "msg-1",
        "conversation_id": "conv-1",
        "bot_id": input.bot_id,
        "chat_id": "chat-1",
        "role": "assistant",
        "type": "answer",
        "content": "hi",
        "content_type": "text",
    });
    let completed = json!({
        "id": "chat-1",
        "conversation_id": "conv-1",
        "bot_id": input.bot_id,
        "status": "completed",
        "usage": {"token_count": input.additional_messages.len() + 1, "output_count": 1, "input_count": input.additional_messages.len()},
    });
    let body = [
        frame(None, "conversation.chat.created", &chat),
        frame(None, "conversation.message.delta", &message),
        frame(None, "conversation.message.completed", &message),
        frame(None, "conversation.chat.completed", &completed),
        frame(None, "done", &json!("[DONE]")),
    ]
    .concat();
    chunked(body, 7)
}

#[derive(Deserialize)]
struct ResumeRequest {
    event_id: String,
    resume_data: String,
    #[serde(default)]
    interrupt_type: i32,
}

fn interrupt(id: usize, event_id: &str) -> String {
    frame(
        Some(id),
        "Interrupt",
        &json!({"interrupt_data": {"event_id": event_id, "type": 2}, "node_title": "Question"}),
    )
}

async fn workflow_run() -> Response {
    let body = [
        frame(Some(0), "Message", &json!({"content": "thinking", "node_title": "Start", "node_seq_id": "0"})),
        interrupt(1, "evt-1"),
        frame(Some(2), "Done", &json!({})),
    ]
    .concat();
    chunked(body, 16)
}

async fn workflow_resume(Json(input): Json<ResumeRequest>) -> Response {
    let body = if input.resume_data == "again" {
        [
            interrupt(0, &format!("{}-again", input.event_id)),
            frame(Some(1), "Done", &json!({})),
        ]
        .concat()
    } else {
        let content = format!("{}:{}:{}", input.event_id, input.interrupt_type, input.resume_data);
        [
            frame(
                Some(0),
                "Message",
                &json!({"content": content, "node_title": "End", "node_is_finish": true}),
            ),
            frame(Some(1), "Done", &json!({})),
        ]
        .concat()
    };
    chunked(body, 16)
}

async fn workflow_error() -> Response {
    let body = [
        frame(Some(0), "Message", &json!({"content": "partial"})),
        frame(
            Some(1),
            "Error",
            &json!({"error_code": 4200, "error_message": "workflow not published"}),
        ),
    ]
    .concat();
    chunked(body, 64)
}

async fn truncated_stream() -> Response {
    chunked("event: conversation.message.delta\ndata: {\"conte".to_string(), 64)
}

/// Sets the shared flag once the response body is dropped.
struct CloseFlag(AppState);

impl Drop for CloseFlag {
    fn drop(&mut self) {
        self.0.inner.stream_closed.store(true, Ordering::SeqCst);
    }
}

async fn endless_stream(State(state): State<AppState>) -> Response {
    let body = futures::stream::unfold((0usize, CloseFlag(state)), |(n, flag)| async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        let data = json!({"id": format!("msg-{n}"), "content": format!("tick {n}")});
        let chunk = Bytes::from(frame(None, "conversation.message.delta", &data));
        Some((Ok(chunk), (n + 1, flag)))
    });
    event_stream(body)
}

// --- oauth ---

#[derive(Deserialize)]
struct DeviceCodeRequest {
    client_id: String,
}

async fn device_code(Json(input): Json<DeviceCodeRequest>) -> Response {
    if input.client_id.is_empty() {
        return oauth_failure("invalid_client", "client_id is required");
    }
    Json(json!({
        "device_code": DEVICE_CODE,
        "user_code": "USER-CODE",
        "verification_uri": "https://www.coze.com/device",
        "interval": 0,
        "expires_in": unix_now() + 600,
    }))
    .into_response()
}

#[derive(Deserialize)]
struct TokenRequest {
    grant_type: String,
    #[serde(default)]
    device_code: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    redirect_uri: Option<String>,
    #[serde(default)]
    code_verifier: Option<String>,
}

fn issue_token(n: usize, ttl: u64) -> Response {
    Json(json!({
        "access_token": format!("at-{n}"),
        "expires_in": unix_now() + ttl,
        "refresh_token": format!("rt-{n}"),
        "token_type": "Bearer",
    }))
    .into_response()
}

async fn token(State(state): State<AppState>, Json(input): Json<TokenRequest>) -> Response {
    match input.grant_type.as_str() {
        "urn:ietf:params:oauth:grant-type:device_code" => match input.device_code.as_deref() {
            Some(DEVICE_CODE) => {
                let polls = state.inner.token_polls.fetch_add(1, Ordering::SeqCst) + 1;
                if polls <= PENDING_POLLS {
                    return oauth_failure("authorization_pending", "the user has not authorized yet");
                }
                issue_token(0, 900)
            }
            Some("denied") => oauth_failure("access_denied", "the user denied the request"),
            _ => oauth_failure("expired_token", "the device code has expired"),
        },
        "refresh_token" => match input.refresh_token.as_deref() {
            Some(token) if token.starts_with("rt-") => {
                let n = state.inner.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
                issue_token(n, 900)
            }
            _ => oauth_failure("invalid_grant", "refresh token is invalid"),
        },
        "authorization_code" => {
            let redirect = input.redirect_uri.as_deref().unwrap_or_default();
            match (input.code.as_deref(), input.code_verifier.as_deref()) {
                (Some(AUTH_CODE), Some(CODE_VERIFIER)) if !redirect.is_empty() => issue_token(0, 900),
                (Some(AUTH_CODE), _) => oauth_failure("invalid_grant", "code verifier does not match"),
                _ => oauth_failure("invalid_grant", "authorization code is invalid"),
            }
        }
        _ => oauth_failure("unsupported_grant_type", "unsupported grant type"),
    }
}
