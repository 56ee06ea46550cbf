use std::{collections::HashMap, sync::Arc};

use anyhow::Context;
use axum::{
    body::Bytes,
    extract::{Path, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::error::StoreError;
use crate::llm::{CompletionBackend, OpenAiClient, ReplyGenerator};
use crate::processor::{dispatch, DispatchOutcome};
use crate::realtime::{Publisher, NEW_MESSAGE_EVENT};
use crate::store::Store;
use crate::types::{ContactToggle, MessageRecord, SendMessageBody};
use crate::whatsapp::{MessageTransport, WhatsAppClient};

pub struct AppState {
    pub verify_token: String,
    pub store: Store,
    pub publisher: Publisher,
    pub replies: ReplyGenerator,
    pub transport: Arc<dyn MessageTransport>,
    pub honor_bot_toggle: bool,
    /// Receives the outcome of every background dispatch when set.
    pub dispatch_hook: Option<mpsc::UnboundedSender<DispatchOutcome>>,
}

impl AppState {
    pub fn new(
        config: &Config,
        store: Store,
        transport: Arc<dyn MessageTransport>,
        completions: Arc<dyn CompletionBackend>,
    ) -> Self {
        Self {
            verify_token: config.verify_token.clone(),
            store,
            publisher: Publisher::default(),
            replies: ReplyGenerator::new(completions, config),
            transport,
            honor_bot_toggle: config.honor_bot_toggle,
            dispatch_hook: None,
        }
    }

    pub fn with_dispatch_hook(mut self, hook: mpsc::UnboundedSender<DispatchOutcome>) -> Self {
        self.dispatch_hook = Some(hook);
        self
    }
}

/// Persist a transcript line, then push it to live observers.
pub async fn add_message(state: &Arc<AppState>, record: MessageRecord) -> Result<(), StoreError> {
    state.store.append(&record).await?;
    state.publisher.publish(NEW_MESSAGE_EVENT, &record).await;
    Ok(())
}

fn storage_error(err: StoreError) -> axum::response::Response {
    tracing::error!(error = %err, "storage failure");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "status": "error", "message": "storage unavailable" })),
    )
        .into_response()
}

async fn liveness(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    format!(
        "chat relay running (store: {}, observers: {})",
        state.store.backend_name(),
        state.publisher.observer_count().await
    )
}

async fn webhook_verify(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let verify_token = params.get("hub.verify_token").map(String::as_str);
    let challenge = params.get("hub.challenge").cloned().unwrap_or_default();

    if verify_token == Some(state.verify_token.as_str()) {
        tracing::info!("webhook verification accepted");
        return (StatusCode::OK, challenge).into_response();
    }

    tracing::warn!("webhook verification rejected: token mismatch");
    (StatusCode::FORBIDDEN, "invalid verification token").into_response()
}

fn parse_event_body(body: &[u8]) -> Option<Value> {
    let payload = serde_json::from_slice::<Value>(body).ok()?;
    let empty = match &payload {
        Value::Null => true,
        Value::Bool(flag) => !flag,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(text) => text.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
    };
    (!empty).then_some(payload)
}

async fn webhook_event(State(state): State<Arc<AppState>>, body: Bytes) -> impl IntoResponse {
    let Some(payload) = parse_event_body(&body) else {
        tracing::warn!(bytes = body.len(), "webhook called without data");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "error", "message": "no data received" })),
        )
            .into_response();
    };

    let event_id = dispatch(state, payload);
    tracing::info!(%event_id, "webhook event accepted");
    (StatusCode::OK, Json(json!({ "status": "received" }))).into_response()
}

async fn send_message(State(state): State<Arc<AppState>>, body: Bytes) -> impl IntoResponse {
    let body = serde_json::from_slice::<SendMessageBody>(&body).unwrap_or_default();
    let phone = body.phone.as_deref().map(str::trim).unwrap_or("");
    let message = body.message.as_deref().unwrap_or("");
    if phone.is_empty() || message.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "status": "error", "message": "phone and message are required" })),
        )
            .into_response();
    }

    let outcome = state.transport.send_text(phone, message).await;
    if !outcome.is_delivered() {
        tracing::warn!(to = phone, ?outcome, "manual message not delivered");
    }

    if let Err(err) = add_message(&state, MessageRecord::from_bot(phone, message)).await {
        return storage_error(err);
    }

    (StatusCode::OK, Json(json!({ "status": "success" }))).into_response()
}

async fn list_conversations(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.list_all().await {
        Ok(records) => Json(records).into_response(),
        Err(err) => storage_error(err),
    }
}

async fn toggle_bot(
    Path(phone): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match state.store.toggle(&phone).await {
        Ok(bot_enabled) => {
            tracing::info!(%phone, bot_enabled, "bot toggled");
            Json(ContactToggle { phone, bot_enabled }).into_response()
        }
        Err(err) => storage_error(err),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move { state.publisher.serve_socket(socket).await })
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route("/webhook", get(webhook_verify).post(webhook_event))
        .route("/send-message", post(send_message))
        .route("/conversations", get(list_conversations))
        .route("/toggle-bot/{phone}", post(toggle_bot))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_relay=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("invalid configuration")?;
    tracing::debug!(?config, "configuration loaded");

    let store = Store::connect(&config.database_url)
        .await
        .context("failed to open conversation store")?;
    let transport = Arc::new(WhatsAppClient::new(&config).context("failed to build whatsapp client")?);
    let completions = Arc::new(OpenAiClient::new(&config).context("failed to build completion client")?);
    let state = Arc::new(AppState::new(&config, store, transport, completions));

    if config.honor_bot_toggle {
        tracing::info!("per-contact bot toggle is enforced before auto-replies");
    }

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(%addr, store = state.store.backend_name(), "chat relay listening");
    axum::serve(listener, router(state))
        .await
        .context("server runtime failure")
}


#[cfg(test)]
mod tests {
    use super::testing::{test_state, test_state_with_hook};
    use super::*;
    use crate::llm::testing::ScriptedBackend;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use tower::ServiceExt;

    async fn call(app: Router, request: Request<Body>) -> (StatusCode, Bytes) {
        let response = app.oneshot(request).await.expect("router response");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response bytes");
        (status, body)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_raw(uri: &str, body: &'static str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::from(body))
            .unwrap()
    }

    fn as_json(body: &Bytes) -> Value {
        serde_json::from_slice(body).expect("response json")
    }

    #[tokio::test]
    async fn liveness_reports_running() {
        let (state, _) = test_state(Arc::new(ScriptedBackend::answering("hi")), false);
        let (status, body) = call(router(state), get("/")).await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8_lossy(&body).contains("running"));
    }

    #[tokio::test]
    async fn verification_echoes_challenge_for_matching_token() {
        let (state, _) = test_state(Arc::new(ScriptedBackend::answering("hi")), false);
        let (status, body) = call(
            router(state),
            get("/webhook?hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=1158201444"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(&body[..], b"1158201444");
    }

    #[tokio::test]
    async fn verification_rejects_other_tokens() {
        for uri in [
            "/webhook?hub.verify_token=wrong&hub.challenge=abc",
            "/webhook?hub.verify_token=&hub.challenge=abc",
            "/webhook?hub.challenge=abc",
            "/webhook?hub.verify_token=verify-me%20&hub.challenge=abc",
        ] {
            let (state, _) = test_state(Arc::new(ScriptedBackend::answering("hi")), false);
            let (status, body) = call(router(state), get(uri)).await;
            assert_eq!(status, StatusCode::FORBIDDEN, "{uri}");
            assert!(!String::from_utf8_lossy(&body).contains("abc"));
        }
    }

    #[tokio::test]
    async fn webhook_without_data_is_rejected() {
        for body in ["", "null", "{}", "[]", "not json", "\"\"", "false", "0", "0.0", "-0"] {
            let (state, transport) = test_state(Arc::new(ScriptedBackend::answering("hi")), false);
            let (status, response) =
                call(router(state.clone()), post_raw("/webhook", body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "body {body:?}");
            assert_eq!(
                as_json(&response),
                json!({ "status": "error", "message": "no data received" })
            );
            assert!(transport.sent().is_empty());
            assert!(state.store.list_all().await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn truthy_scalar_body_is_acknowledged() {
        for body in ["true", "1", "\"ping\""] {
            let (state, _transport) = test_state(Arc::new(ScriptedBackend::answering("hi")), false);
            let (status, response) = call(router(state), post_raw("/webhook", body)).await;
            assert_eq!(status, StatusCode::OK, "body {body:?}");
            assert_eq!(as_json(&response), json!({ "status": "received" }));
        }
    }

    #[tokio::test]
    async fn storage_failure_maps_to_500() {
        let response = storage_error(StoreError::UnsupportedScheme("mongodb".to_string()));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("response bytes");
        assert_eq!(
            as_json(&body),
            json!({ "status": "error", "message": "storage unavailable" })
        );
    }

    #[tokio::test]
    async fn webhook_acknowledges_and_processes_in_background() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (state, transport) =
            test_state_with_hook(Arc::new(ScriptedBackend::answering("Oi!")), false, tx);

        let payload = json!({
            "entry": [{ "changes": [{ "value": { "messages": [
                { "from": "5551234", "text": { "body": "Hello" } }
            ] } }] }]
        });
        let (status, body) = call(router(state.clone()), post_json("/webhook", payload)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(as_json(&body), json!({ "status": "received" }));

        let outcome = rx.recv().await.expect("dispatch outcome");
        assert_eq!(outcome.result.unwrap().replied, 1);
        assert_eq!(transport.sent(), vec![("5551234".to_string(), "Oi!".to_string())]);
    }

    #[tokio::test]
    async fn manual_send_requires_phone_and_message() {
        for body in [
            json!({ "phone": "", "message": "hi" }),
            json!({ "phone": "5551234", "message": "" }),
            json!({ "message": "hi" }),
            json!({ "phone": "5551234" }),
            json!({}),
        ] {
            let (state, transport) = test_state(Arc::new(ScriptedBackend::answering("hi")), false);
            let (status, response) =
                call(router(state.clone()), post_json("/send-message", body.clone())).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
            assert_eq!(as_json(&response)["status"], "error");
            assert!(transport.sent().is_empty());
            assert!(state.store.list_all().await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn manual_send_delivers_records_and_publishes() {
        let (state, transport) = test_state(Arc::new(ScriptedBackend::answering("hi")), false);
        let (_, mut observer) = state.publisher.subscribe().await;

        let (status, body) = call(
            router(state.clone()),
            post_json("/send-message", json!({ "phone": "5551234", "message": "Seu pedido saiu" })),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(as_json(&body), json!({ "status": "success" }));
        assert_eq!(
            transport.sent(),
            vec![("5551234".to_string(), "Seu pedido saiu".to_string())]
        );
        assert_eq!(
            state.store.list_all().await.unwrap(),
            vec![MessageRecord::from_bot("5551234", "Seu pedido saiu")]
        );
        let event: Value = serde_json::from_str(&observer.recv().await.unwrap()).unwrap();
        assert_eq!(event["data"]["from_user"], false);
    }

    #[tokio::test]
    async fn manual_send_reports_success_even_when_delivery_fails() {
        let (state, transport) = test_state(Arc::new(ScriptedBackend::answering("hi")), false);
        transport.fail_all();

        let (status, _) = call(
            router(state.clone()),
            post_json("/send-message", json!({ "phone": "5551234", "message": "hi" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(state.store.list_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn conversations_list_in_append_order_across_paths() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (state, _) =
            test_state_with_hook(Arc::new(ScriptedBackend::answering("auto")), false, tx);
        let app = router(state.clone());

        call(
            app.clone(),
            post_json("/send-message", json!({ "phone": "1", "message": "first" })),
        )
        .await;
        call(
            app.clone(),
            post_json(
                "/webhook",
                json!({ "entry": [{ "changes": [{ "value": { "messages": [
                    { "from": "2", "text": { "body": "second" } }
                ] } }] }] }),
            ),
        )
        .await;
        rx.recv().await.expect("dispatch outcome");
        call(
            app.clone(),
            post_json("/send-message", json!({ "phone": "1", "message": "last" })),
        )
        .await;

        let (status, body) = call(app, get("/conversations")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            as_json(&body),
            json!([
                { "phone": "1", "message": "first", "from_user": false },
                { "phone": "2", "message": "second", "from_user": true },
                { "phone": "2", "message": "auto", "from_user": false },
                { "phone": "1", "message": "last", "from_user": false }
            ])
        );
    }

    #[tokio::test]
    async fn toggle_bot_flips_per_contact() {
        let (state, _) = test_state(Arc::new(ScriptedBackend::answering("hi")), false);
        let app = router(state);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let (status, body) = call(app.clone(), post_raw("/toggle-bot/5551234", "")).await;
            assert_eq!(status, StatusCode::OK);
            let body = as_json(&body);
            assert_eq!(body["phone"], "5551234");
            seen.push(body["bot_enabled"].as_bool().unwrap());
        }
        assert_eq!(seen, vec![true, false, true]);
    }
}
