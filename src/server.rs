//! HTTP and WebSocket surface over the [`Engine`].
//!
//! Handlers only translate between wire shapes and engine calls; every
//! decision lives in the engine.

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broadcast::{ClientMessage, SessionEvent};
use crate::config::ServerConfig;
use crate::engine::{Decision, Engine, EngineError, Injected};
use crate::keys::Submission;
use crate::pending::PendingRequest;

/// Events buffered per socket before the broadcaster starts skipping it.
const OUTBOUND_CAPACITY: usize = 256;

#[derive(Debug, Deserialize)]
struct PermissionHook {
    tool_use_id: String,
    session_id: String,
    tool_name: String,
    #[serde(default)]
    tool_input: Value,
}

#[derive(Debug, Deserialize)]
struct PendingQuery {
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResolveBody {
    tool_use_id: String,
    session_id: String,
    approved: bool,
    /// Approve and stop asking for this kind of call.
    #[serde(default)]
    always: bool,
}

#[derive(Debug, Deserialize)]
struct SocketQuery {
    device_id: Option<String>,
}

pub fn router(engine: Engine, dev_endpoints: bool) -> Router {
    let mut router = Router::new()
        .route("/hook/permission", post(handle_permission))
        .route("/hook/pending", get(handle_pending))
        .route("/hook/resolve", post(handle_resolve))
        .route("/api/sessions/{session}/send", post(handle_send))
        .route("/api/sessions/{session}/messages", get(handle_messages))
        .route("/ws/{session}", get(handle_socket_upgrade));
    if dev_endpoints {
        router = router.route("/dev/inject/{session}", post(handle_inject));
    }
    router.with_state(engine)
}

/// Bind and serve until ctrl-c.
pub async fn serve(engine: Engine, config: &ServerConfig) -> Result<()> {
    let addr = format!("{}:{}", config.bind, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve listen address")?;
    info!(addr = %local_addr, dev_endpoints = config.dev_endpoints, "server listening");

    axum::serve(listener, router(engine, config.dev_endpoints))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
        .context("server exited unexpectedly")?;
    Ok(())
}

fn error_response(error: EngineError) -> Response {
    let (status, code) = match &error {
        EngineError::SessionNotFound(_) => (StatusCode::NOT_FOUND, "session_not_found"),
        EngineError::WrongSession { .. } => (StatusCode::CONFLICT, "wrong_session"),
        EngineError::InvalidInjection(_) => (StatusCode::BAD_REQUEST, "invalid_payload"),
        EngineError::LogNotFound(_) => (StatusCode::NOT_FOUND, "log_not_found"),
        EngineError::Encode(_) => (StatusCode::BAD_REQUEST, "invalid_action"),
        EngineError::Delivery(_) => (StatusCode::BAD_GATEWAY, "delivery_failed"),
        EngineError::Log(_) => (StatusCode::INTERNAL_SERVER_ERROR, "log_read_failed"),
    };
    (
        status,
        Json(json!({
            "error": {
                "code": code,
                "message": error.to_string(),
            }
        })),
    )
        .into_response()
}

async fn handle_permission(
    State(engine): State<Engine>,
    Json(hook): Json<PermissionHook>,
) -> Response {
    let request = PendingRequest::new(
        hook.tool_use_id,
        hook.session_id,
        hook.tool_name,
        hook.tool_input,
    );
    engine.record_request(request);
    (StatusCode::OK, Json(json!({"status": "recorded"}))).into_response()
}

async fn handle_pending(
    State(engine): State<Engine>,
    Query(query): Query<PendingQuery>,
) -> Json<Vec<PendingRequest>> {
    Json(engine.list_requests(query.session_id.as_deref()))
}

async fn handle_resolve(State(engine): State<Engine>, Json(body): Json<ResolveBody>) -> Response {
    let decision = Decision::from_flags(body.approved, body.always);
    match engine
        .resolve_request(&body.tool_use_id, &body.session_id, decision)
        .await
    {
        Ok(outcome) => (StatusCode::OK, Json(json!({"status": outcome.as_str()}))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_send(
    State(engine): State<Engine>,
    Path(session): Path<String>,
    Json(submission): Json<Submission>,
) -> Response {
    match engine.submit_action(&session, &submission).await {
        Ok(()) => (StatusCode::OK, Json(json!({"status": "sent"}))).into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_messages(State(engine): State<Engine>, Path(session): Path<String>) -> Response {
    match engine.snapshot(&session).await {
        Ok(snapshot) => (
            StatusCode::OK,
            Json(json!({
                "messages": snapshot.messages,
                "ready": snapshot.ready,
            })),
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

async fn handle_inject(
    State(engine): State<Engine>,
    Path(session): Path<String>,
    Json(payload): Json<Value>,
) -> Response {
    match engine.inject(&session, payload) {
        Ok(Injected::Recorded(tool_use_id)) => {
            debug!(session = %session, tool_use_id = %tool_use_id, "injected pending request");
            (StatusCode::OK, Json(json!({"recorded": tool_use_id}))).into_response()
        }
        Ok(Injected::Forwarded(delivered)) => {
            debug!(session = %session, delivered, "injected event");
            (StatusCode::OK, Json(json!({"delivered": delivered}))).into_response()
        }
        Err(e) => error_response(e),
    }
}

async fn handle_socket_upgrade(
    ws: WebSocketUpgrade,
    State(engine): State<Engine>,
    Path(session): Path<String>,
    Query(query): Query<SocketQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, engine, session, query.device_id))
}

async fn handle_socket(socket: WebSocket, engine: Engine, session: String, device: Option<String>) {
    info!(session = %session, device = ?device, "observer connected");
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (event_tx, mut event_rx) = mpsc::channel::<SessionEvent>(OUTBOUND_CAPACITY);

    let send_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "failed to serialize event");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                debug!("socket send failed, observer gone");
                break;
            }
        }
    });

    // Live events may overlap the snapshot; observers key messages by id.
    let attachment = engine.attach(&session, device.as_deref(), event_tx.clone());
    match engine.snapshot(&session).await {
        Ok(snapshot) => {
            let _ = event_tx
                .send(SessionEvent::Messages {
                    messages: snapshot.messages,
                })
                .await;
            if let Some(turn_id) = snapshot.ready {
                let _ = event_tx.send(SessionEvent::Ready { turn_id }).await;
            }
        }
        Err(e) => warn!(session = %session, error = %e, "failed to read log for snapshot"),
    }

    while let Some(result) = ws_rx.next().await {
        let text = match result {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(session = %session, error = %e, "socket error");
                break;
            }
        };

        let reply = match serde_json::from_str::<ClientMessage>(text.as_str()) {
            Ok(message) => handle_client_message(&engine, &session, device.as_deref(), message).await,
            Err(e) => Some(SessionEvent::Error {
                message: format!("invalid message: {e}"),
            }),
        };
        if let Some(reply) = reply {
            let _ = event_tx.send(reply).await;
        }
    }

    attachment.detach();
    send_task.abort();
    info!(session = %session, "observer disconnected");
}

/// Handle one inbound message; the returned event goes to this socket only.
async fn handle_client_message(
    engine: &Engine,
    session: &str,
    connection_device: Option<&str>,
    message: ClientMessage,
) -> Option<SessionEvent> {
    match message {
        ClientMessage::Heartbeat { device_id } => {
            let Some(device) = device_id.as_deref().or(connection_device) else {
                return Some(SessionEvent::Error {
                    message: "heartbeat needs a device_id".to_string(),
                });
            };
            engine.heartbeat(session, device);
            Some(SessionEvent::HeartbeatAck {
                holder: engine.lease_holder(session),
                heartbeat_secs: engine.settings().lease_heartbeat.as_secs(),
            })
        }
        ClientMessage::SubmitAction { text, action } => engine
            .submit_action(session, &Submission { text, action })
            .await
            .err()
            .map(|e| SessionEvent::Error {
                message: e.to_string(),
            }),
        ClientMessage::CancelCurrent => {
            engine
                .cancel_current(session)
                .await
                .err()
                .map(|e| SessionEvent::Error {
                    message: e.to_string(),
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::testing::RecordingControl;
    use crate::engine::EngineSettings;
    use crate::watcher::TailerSettings;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    struct Harness {
        engine: Engine,
        control: Arc<RecordingControl>,
        tmp: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let control = Arc::new(RecordingControl::default());
        let settings = EngineSettings {
            tailer: TailerSettings {
                projects_dir: tmp.path().to_path_buf(),
                poll_interval: Duration::from_millis(20),
                idle_debounce: Duration::from_millis(100),
            },
            step_delay: Duration::from_millis(1),
            ..EngineSettings::default()
        };
        let engine = Engine::new(settings, control.clone());
        Harness {
            engine,
            control,
            tmp,
        }
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(body) => {
                request = request.header("content-type", "application/json");
                Body::from(body.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(request.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    fn permission(key: &str, session: &str) -> Value {
        json!({
            "tool_use_id": key,
            "session_id": session,
            "tool_name": "Bash",
            "tool_input": {"command": "echo test"}
        })
    }

    #[tokio::test]
    async fn permission_round_trip() {
        let h = harness();
        let app = router(h.engine.clone(), false);

        let (status, _) = call(&app, "POST", "/hook/permission", Some(permission("t1", "s1"))).await;
        assert_eq!(status, StatusCode::OK);
        call(&app, "POST", "/hook/permission", Some(permission("t2", "s2"))).await;

        let (status, pending) = call(&app, "GET", "/hook/pending?session_id=s1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pending.as_array().unwrap().len(), 1);
        assert_eq!(pending[0]["tool_use_id"], "t1");
        assert_eq!(pending[0]["tool_input"]["command"], "echo test");

        let (_, all) = call(&app, "GET", "/hook/pending", None).await;
        assert_eq!(all.as_array().unwrap().len(), 2);

        let resolve = json!({"tool_use_id": "t1", "session_id": "s1", "approved": true});
        let (status, body) = call(&app, "POST", "/hook/resolve", Some(resolve.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "resolved");

        let (status, body) = call(&app, "POST", "/hook/resolve", Some(resolve)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "already_resolved");

        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.control.sent_to("s1"), vec!["1", "Enter"]);
        h.engine.shutdown();
    }

    #[tokio::test]
    async fn resolve_always_sends_second_option() {
        let h = harness();
        let app = router(h.engine.clone(), false);
        call(&app, "POST", "/hook/permission", Some(permission("t1", "s1"))).await;

        let resolve = json!({"tool_use_id": "t1", "session_id": "s1", "approved": true, "always": true});
        let (status, body) = call(&app, "POST", "/hook/resolve", Some(resolve.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "resolved");
        let (_, body) = call(&app, "POST", "/hook/resolve", Some(resolve)).await;
        assert_eq!(body["status"], "already_resolved");

        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(h.control.sent_to("s1"), vec!["2", "Enter"]);
        let (_, pending) = call(&app, "GET", "/hook/pending", None).await;
        assert_eq!(pending, json!([]));
        h.engine.shutdown();
    }

    #[tokio::test]
    async fn resolve_naming_another_session_is_409() {
        let h = harness();
        let app = router(h.engine.clone(), false);
        call(&app, "POST", "/hook/permission", Some(permission("t1", "A"))).await;

        let resolve = json!({"tool_use_id": "t1", "session_id": "B", "approved": true});
        let (status, body) = call(&app, "POST", "/hook/resolve", Some(resolve)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["error"]["code"], "wrong_session");

        let (_, pending) = call(&app, "GET", "/hook/pending?session_id=A", None).await;
        assert_eq!(pending[0]["tool_use_id"], "t1");
        assert!(h.control.sent_to("B").is_empty());
        h.engine.shutdown();
    }

    #[tokio::test]
    async fn resolve_for_missing_session_is_404() {
        let h = harness();
        h.control.kill("gone");
        let app = router(h.engine.clone(), false);
        call(&app, "POST", "/hook/permission", Some(permission("t1", "gone"))).await;

        let resolve = json!({"tool_use_id": "t1", "session_id": "gone", "approved": false});
        let (status, body) = call(&app, "POST", "/hook/resolve", Some(resolve)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], "session_not_found");
        h.engine.shutdown();
    }

    #[tokio::test]
    async fn send_maps_errors_to_statuses() {
        let h = harness();
        h.control.kill("gone");
        let app = router(h.engine.clone(), false);

        let (status, body) = call(
            &app,
            "POST",
            "/api/sessions/s1/send",
            Some(json!({"text": "1", "action": "answer"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "sent");
        assert_eq!(h.control.sent_to("s1"), vec!["1", "Tab", "Enter"]);

        let (status, body) = call(
            &app,
            "POST",
            "/api/sessions/s1/send",
            Some(json!({"text": "1", "action": "dance"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "invalid_action");

        let (status, _) = call(
            &app,
            "POST",
            "/api/sessions/gone/send",
            Some(json!({"text": "hello"})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        h.engine.shutdown();
    }

    #[tokio::test]
    async fn messages_reads_the_log() {
        let h = harness();
        let project = h.tmp.path().join("-work");
        std::fs::create_dir_all(&project).unwrap();
        let line = json!({"type": "user", "uuid": "u1", "message": {"content": "hello"}});
        std::fs::write(project.join("s1.jsonl"), format!("{line}\n")).unwrap();
        let app = router(h.engine.clone(), false);

        let (status, body) = call(&app, "GET", "/api/sessions/s1/messages", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["messages"][0]["id"], "u1");
        assert_eq!(body["messages"][0]["kind"], "user_text");
        assert!(body["ready"].is_null());

        let (status, body) = call(&app, "GET", "/api/sessions/nope/messages", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["messages"], json!([]));
    }

    #[tokio::test]
    async fn dev_inject_only_when_enabled() {
        let h = harness();
        let payload = json!({"type": "messages", "data": []});

        let app = router(h.engine.clone(), false);
        let (status, _) = call(&app, "POST", "/dev/inject/s1", Some(payload.clone())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let app = router(h.engine.clone(), true);
        let (tx, mut rx) = mpsc::channel(4);
        let _sub = h.engine.broadcaster().subscribe("s1", tx);
        let (status, body) = call(&app, "POST", "/dev/inject/s1", Some(payload.clone())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["delivered"], 1);
        assert!(matches!(rx.try_recv(), Ok(SessionEvent::Raw(v)) if v == payload));
    }

    #[tokio::test]
    async fn dev_inject_records_permission_requests() {
        let h = harness();
        let app = router(h.engine.clone(), true);

        for key in ["toolu_a", "toolu_b"] {
            let payload = json!({
                "type": "permission_request",
                "data": {
                    "tool_use_id": key,
                    "session_id": "s1",
                    "tool_name": "Write",
                    "tool_input": {"file_path": "/tmp/x"},
                    "received_at": 1_700_000_000_000i64
                }
            });
            let (status, body) = call(&app, "POST", "/dev/inject/s1", Some(payload)).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["recorded"], key);
        }

        let (_, pending) = call(&app, "GET", "/hook/pending?session_id=s1", None).await;
        let ids: Vec<_> = pending
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["tool_use_id"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["toolu_a", "toolu_b"]);
        assert_eq!(pending[0]["received_at"], 1_700_000_000_000i64);

        let broken = json!({"type": "permission_request", "data": {"session_id": "s1"}});
        let (status, body) = call(&app, "POST", "/dev/inject/s1", Some(broken)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "invalid_payload");
        h.engine.shutdown();
    }

    #[tokio::test]
    async fn heartbeat_reply_reports_holder() {
        let h = harness();
        let reply = handle_client_message(
            &h.engine,
            "s1",
            Some("laptop"),
            ClientMessage::Heartbeat { device_id: None },
        )
        .await;
        assert!(matches!(
            reply,
            Some(SessionEvent::HeartbeatAck { holder: Some(ref d), heartbeat_secs: 5 }) if d == "laptop"
        ));

        let reply = handle_client_message(
            &h.engine,
            "s1",
            None,
            ClientMessage::Heartbeat { device_id: None },
        )
        .await;
        assert!(matches!(reply, Some(SessionEvent::Error { .. })));
    }

    #[tokio::test]
    async fn socket_actions_report_errors_back() {
        let h = harness();
        h.control.kill("gone");
        let reply = handle_client_message(&h.engine, "gone", None, ClientMessage::CancelCurrent).await;
        assert!(matches!(reply, Some(SessionEvent::Error { .. })));

        let reply = handle_client_message(
            &h.engine,
            "s1",
            None,
            ClientMessage::SubmitAction {
                text: Some("hi".to_string()),
                action: None,
            },
        )
        .await;
        assert!(reply.is_none());
        assert_eq!(h.control.sent_to("s1"), vec!["hi", "Enter"]);
    }
}
