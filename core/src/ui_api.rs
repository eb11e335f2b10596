/// UI API: JSON over HTTP plus an SSE stream of sync events
///
/// Endpoints:
///   GET  /api/status
///   GET  /api/conversations
///   GET  /api/conversations/:id        navigate by id, returns the chat
///   GET  /api/unread
///   GET  /api/chat                     ?since_revision=N
///   POST /api/chat/open                body: {"conversation_id":"..."}
///   POST /api/chat/send                body: {"text":"..."}
///   POST /api/chat/close
///   POST /api/contact                  body: {"listing_id","title","seller_id","seller_name","text"?}
///   GET  /events                       SSE stream of SyncEvent JSON
use crate::config::Config;
use crate::controller::SyncController;
use crate::error::{Result, SyncError};
use crate::types::{ConversationId, Listing, SyncEvent};
use futures_util::stream::{unfold, StreamExt};
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Body, Frame};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type BoxBody = http_body_util::combinators::BoxBody<bytes::Bytes, Infallible>;
type Resp = Response<BoxBody>;

struct ApiState {
    controller: SyncController,
    first_contact_text: String,
}

// ─── Responses ───────────────────────────────────────────────────────────────

/// Every response goes through here so the browser UI can call from any origin
fn respond(status: StatusCode, content_type: Option<&str>, body: BoxBody) -> Resp {
    let mut builder = Response::builder()
        .status(status)
        .header("Access-Control-Allow-Origin", "*")
        .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
        .header("Access-Control-Allow-Headers", "Content-Type");
    if let Some(ct) = content_type {
        builder = builder.header("Content-Type", ct);
    }
    builder
        .body(body)
        .unwrap_or_else(|_| Response::new(Full::new(bytes::Bytes::new()).boxed()))
}

fn empty_resp(status: StatusCode) -> Resp {
    respond(status, None, Full::new(bytes::Bytes::new()).boxed())
}

fn json_resp(status: StatusCode, value: &serde_json::Value) -> Resp {
    let body = serde_json::to_vec(value).unwrap_or_default();
    respond(
        status,
        Some("application/json"),
        Full::new(bytes::Bytes::from(body)).boxed(),
    )
}

fn json_ok(value: serde_json::Value) -> Resp {
    json_resp(StatusCode::OK, &value)
}

fn json_err(status: StatusCode, msg: &str) -> Resp {
    json_resp(status, &serde_json::json!({ "error": msg }))
}

fn status_for(err: &SyncError) -> StatusCode {
    match err {
        SyncError::Validation(_) => StatusCode::BAD_REQUEST,
        SyncError::NotFound(_) => StatusCode::NOT_FOUND,
        SyncError::SendFailed { .. } | SyncError::UniqueViolation(_) => StatusCode::CONFLICT,
        e if e.is_retryable() => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_resp(err: &SyncError) -> Resp {
    let mut body = serde_json::json!({ "error": err.to_string() });
    if let SyncError::SendFailed { content, .. } = err {
        // Hand the text back so the compose box can keep it
        body["content"] = serde_json::json!(content);
    }
    json_resp(status_for(err), &body)
}

/// `/events`: a comment line on connect, then one `data:` frame per event
fn sse_resp(rx: broadcast::Receiver<SyncEvent>) -> Resp {
    let hello = futures_util::stream::once(async {
        Ok::<_, Infallible>(Frame::data(bytes::Bytes::from_static(b": connected\n\n")))
    });

    let frames = unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let line = format!("data: {}\n\n", serde_json::to_string(&event).unwrap_or_default());
                    return Some((Ok::<_, Infallible>(Frame::data(bytes::Bytes::from(line))), rx));
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    // Missed events are recovered by re-reading the list and chat
                    warn!("Event stream client missed {} events", missed);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    let mut resp = respond(
        StatusCode::OK,
        Some("text/event-stream; charset=utf-8"),
        StreamBody::new(hello.chain(frames)).boxed(),
    );
    let headers = resp.headers_mut();
    headers.insert("Cache-Control", hyper::header::HeaderValue::from_static("no-cache"));
    headers.insert("X-Accel-Buffering", hyper::header::HeaderValue::from_static("no"));
    resp
}

// ─── Entry point ─────────────────────────────────────────────────────────────

pub async fn start_ui_api(controller: SyncController, config: &Config) -> Result<()> {
    let listener = TcpListener::bind(config.api_addr).await?;
    info!("UI API started on http://{}", config.api_addr);
    serve(listener, controller, config.first_contact_text.clone()).await
}

/// Serve one task per connection, forever; stop it by dropping the future
pub async fn serve(listener: TcpListener, controller: SyncController, first_contact_text: String) -> Result<()> {
    let state = Arc::new(ApiState {
        controller,
        first_contact_text,
    });
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let io = TokioIo::new(stream);
                let state = state.clone();
                tokio::spawn(async move {
                    let svc = service_fn(move |req| {
                        let state = state.clone();
                        async move { Ok::<_, Infallible>(handle(req, state).await) }
                    });
                    if let Err(e) = http1::Builder::new().serve_connection(io, svc).await {
                        // Closing the event stream tab ends the connection mid-body
                        if !e.is_incomplete_message() {
                            error!("UI API connection from {} failed: {:?}", peer, e);
                        }
                    }
                });
            }
            Err(e) => error!("UI API accept error: {}", e),
        }
    }
}

// ─── Router ──────────────────────────────────────────────────────────────────

async fn handle<B>(req: Request<B>, state: Arc<ApiState>) -> Resp
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();
    debug!("{} {}", method, path);

    if method == Method::OPTIONS {
        return empty_resp(StatusCode::NO_CONTENT);
    }

    let ctl = &state.controller;
    match (method.clone(), path.as_str()) {
        (Method::GET, "/api/status") => get_status(ctl).await,
        (Method::GET, "/api/conversations") => get_conversations(ctl).await,
        (Method::GET, "/api/unread") => get_unread(ctl).await,
        (Method::GET, "/api/chat") => get_chat(ctl, &query).await,
        (Method::POST, "/api/chat/open") => post_open(req, ctl).await,
        (Method::POST, "/api/chat/send") => post_send(req, ctl).await,
        (Method::POST, "/api/chat/close") => {
            ctl.close().await;
            json_ok(serde_json::json!({ "closed": true }))
        }
        (Method::POST, "/api/contact") => post_contact(req, &state).await,
        (Method::GET, "/events") => sse_resp(ctl.subscribe_events()),
        _ => {
            if method == Method::GET && path.starts_with("/api/conversations/") {
                let segment = path.trim_start_matches("/api/conversations/");
                return get_navigate(segment, ctl).await;
            }
            json_err(StatusCode::NOT_FOUND, "not found")
        }
    }
}

// ─── Handlers ────────────────────────────────────────────────────────────────

async fn get_status(ctl: &SyncController) -> Resp {
    json_ok(serde_json::json!({
        "viewer_id": ctl.session().viewer().id,
        "active": ctl.session().is_active(),
        "list_state": ctl.list_state().await,
        "chat_state": ctl.chat_state().await,
        "selected_conversation_id": ctl.selected_conversation_id().await,
        "unread_total": ctl.unread_total().await,
        "draft": ctl.draft().await,
    }))
}

async fn get_conversations(ctl: &SyncController) -> Resp {
    let conversations = ctl.conversations().await;
    json_ok(serde_json::json!({ "conversations": conversations }))
}

async fn get_unread(ctl: &SyncController) -> Resp {
    json_ok(serde_json::json!({ "unread_total": ctl.unread_total().await }))
}

async fn get_chat(ctl: &SyncController, query: &str) -> Resp {
    let since = parse_query_u64(query, "since_revision");
    match ctl.chat_view().await {
        Some(view) if since == Some(view.revision) => json_ok(serde_json::json!({
            "unchanged": true,
            "revision": view.revision,
        })),
        Some(view) => json_ok(serde_json::json!({
            "chat": view,
            "state": ctl.chat_state().await,
            "draft": ctl.draft().await,
        })),
        None => json_ok(serde_json::json!({ "chat": null, "state": ctl.chat_state().await })),
    }
}

async fn get_navigate(segment: &str, ctl: &SyncController) -> Resp {
    let id = match parse_conversation_id(segment) {
        Ok(id) => id,
        Err(e) => return error_resp(&e),
    };
    match ctl.navigate_to(id).await {
        Ok(()) => json_ok(serde_json::json!({ "chat": ctl.chat_view().await })),
        Err(e) => error_resp(&e),
    }
}

#[derive(Deserialize)]
struct OpenRequest {
    conversation_id: ConversationId,
}

async fn post_open<B>(req: Request<B>, ctl: &SyncController) -> Resp
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let r: OpenRequest = match read_json(req).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match ctl.open_conversation(r.conversation_id).await {
        Ok(()) => json_ok(serde_json::json!({ "chat": ctl.chat_view().await })),
        Err(e) => error_resp(&e),
    }
}

#[derive(Deserialize)]
struct SendRequest {
    text: String,
}

async fn post_send<B>(req: Request<B>, ctl: &SyncController) -> Resp
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let r: SendRequest = match read_json(req).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    match ctl.send(&r.text).await {
        Ok(message) => json_ok(serde_json::json!({ "message": message })),
        Err(e) => error_resp(&e),
    }
}

#[derive(Deserialize)]
struct ContactRequest {
    listing_id: String,
    #[serde(default)]
    title: String,
    seller_id: String,
    #[serde(default)]
    seller_name: String,
    text: Option<String>,
}

async fn post_contact<B>(req: Request<B>, state: &ApiState) -> Resp
where
    B: Body,
    B::Error: std::fmt::Display,
{
    let r: ContactRequest = match read_json(req).await {
        Ok(r) => r,
        Err(resp) => return resp,
    };
    let listing = Listing {
        id: r.listing_id,
        title: r.title,
        seller_id: r.seller_id,
        seller_name: r.seller_name,
    };
    let text = r.text.unwrap_or_else(|| state.first_contact_text.clone());
    match state.controller.start_conversation(&listing, &text).await {
        Ok(message) => json_ok(serde_json::json!({
            "conversation_id": message.conversation_id,
            "message": message,
        })),
        Err(e) => error_resp(&e),
    }
}

// ─── Utilities ────────────────────────────────────────────────────────────────

async fn read_json<T, B>(req: Request<B>) -> std::result::Result<T, Resp>
where
    T: DeserializeOwned,
    B: Body,
    B::Error: std::fmt::Display,
{
    let body = req
        .into_body()
        .collect()
        .await
        .map(|c| c.to_bytes())
        .map_err(|e| json_err(StatusCode::BAD_REQUEST, &format!("body read error: {}", e)))?;
    serde_json::from_slice(&body)
        .map_err(|e| json_err(StatusCode::BAD_REQUEST, &format!("invalid JSON: {}", e)))
}

fn parse_conversation_id(segment: &str) -> Result<ConversationId> {
    let decoded = urlencoding::decode(segment)
        .map_err(|e| SyncError::Validation(format!("bad path segment: {}", e)))?;
    Uuid::parse_str(decoded.trim())
        .map_err(|e| SyncError::Validation(format!("invalid conversation id: {}", e)))
}

fn parse_query_u64(query: &str, key: &str) -> Option<u64> {
    for pair in query.split('&') {
        if let Some((k, v)) = pair.split_once('=') {
            if k == key {
                return v.parse().ok();
            }
        }
    }
    None
}
