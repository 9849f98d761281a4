//! Webhook delivery against a local axum stub with scripted responses.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::{Value, json};
use splitvault_settlement::{SettlementNotifier, WebhookNotifier};
use splitvault_types::{
    DeliveryStatus, NotificationPayload, PaymentStatus, SettlementReference, WalletId,
    WebhookConfig,
};
use tokio::{
    net::TcpListener,
    sync::{Mutex, oneshot},
};

/// One scripted reply: status code and how long to stall first.
#[derive(Debug, Clone, Copy)]
struct Reply {
    status: u16,
    delay_ms: u64,
}

const fn reply(status: u16) -> Reply {
    Reply {
        status,
        delay_ms: 0,
    }
}

#[derive(Debug, Clone)]
struct Call {
    authorization: Option<String>,
    idempotency_key: Option<String>,
    body: Value,
}

#[derive(Clone)]
struct StubState {
    script: Arc<Mutex<VecDeque<Reply>>>,
    fallback: Reply,
    calls: Arc<Mutex<Vec<Call>>>,
}

struct WebhookStub {
    url: String,
    calls: Arc<Mutex<Vec<Call>>>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl WebhookStub {
    async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

async fn spawn_stub(script: Vec<Reply>, fallback: Reply) -> WebhookStub {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let state = StubState {
        script: Arc::new(Mutex::new(script.into())),
        fallback,
        calls: calls.clone(),
    };
    let app = Router::new()
        .route("/hooks/settled", post(settled_hook))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let server = axum::serve(listener, app).with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        });
        let _ = server.await;
    });

    WebhookStub {
        url: format!("http://{addr}/hooks/settled"),
        calls,
        shutdown: Some(shutdown_tx),
    }
}

async fn settled_hook(
    State(state): State<StubState>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };
    state.calls.lock().await.push(Call {
        authorization: header("authorization"),
        idempotency_key: header("idempotency-key"),
        body,
    });

    let next = state.script.lock().await.pop_front().unwrap_or(state.fallback);
    if next.delay_ms > 0 {
        tokio::time::sleep(Duration::from_millis(next.delay_ms)).await;
    }
    let status = StatusCode::from_u16(next.status).unwrap();
    if status.is_success() {
        (status, Json(json!({ "success": true, "status": "recorded" }))).into_response()
    } else if status.is_client_error() {
        (status, Json(json!({ "error": "signature mismatch", "code": "E_SIG" }))).into_response()
    } else {
        (status, "upstream exploded").into_response()
    }
}

fn payload() -> NotificationPayload {
    NotificationPayload {
        external_order_id: Some("order-1".to_string()),
        wallet_id: WalletId::new(),
        settlement_reference: SettlementReference::new("sig-abc"),
        amount: Decimal::new(12_550, 2),
        currency: "USDC".to_string(),
        payout_addresses: vec!["payee".to_string()],
        status: PaymentStatus::Paid,
        timestamp: Utc::now(),
    }
}

fn config() -> WebhookConfig {
    WebhookConfig {
        base_backoff_ms: 5,
        attempt_timeout_ms: 2_000,
        ..WebhookConfig::default()
    }
}

#[tokio::test]
async fn retries_server_errors_until_delivered() {
    let stub = spawn_stub(vec![reply(500), reply(503)], reply(200)).await;
    let notifier = WebhookNotifier::new(&stub.url, Some("hook-token".to_string()), config());
    let payload = payload();

    let status = notifier.notify(&payload).await;
    assert_eq!(status, DeliveryStatus::Delivered { attempts: 3 });

    let calls = stub.calls.lock().await.clone();
    assert_eq!(calls.len(), 3);
    for call in &calls {
        assert_eq!(call.authorization.as_deref(), Some("Bearer hook-token"));
        assert_eq!(call.idempotency_key.as_deref(), Some("sig-abc"));
    }
    assert_eq!(calls[0].body["externalOrderId"], "order-1");
    assert_eq!(calls[0].body["settlementReference"], "sig-abc");
    assert_eq!(calls[0].body["status"], "paid");
    assert_eq!(calls[0].body, calls[2].body);
    stub.stop().await;
}

#[tokio::test]
async fn gives_up_after_max_attempts() {
    let stub = spawn_stub(Vec::new(), reply(500)).await;
    let notifier = WebhookNotifier::new(&stub.url, None, config());

    match notifier.notify(&payload()).await {
        DeliveryStatus::Undelivered { attempts, reason } => {
            assert_eq!(attempts, 3);
            assert!(reason.contains("500"), "reason: {reason}");
        }
        other => panic!("expected undelivered, got {other:?}"),
    }
    let calls = stub.calls.lock().await;
    assert_eq!(calls.len(), 3);
    assert!(calls[0].authorization.is_none());
    drop(calls);
    stub.stop().await;
}

#[tokio::test]
async fn client_error_is_not_retried() {
    let stub = spawn_stub(vec![reply(400)], reply(200)).await;
    let notifier = WebhookNotifier::new(&stub.url, None, config());

    match notifier.notify(&payload()).await {
        DeliveryStatus::Undelivered { attempts, reason } => {
            assert_eq!(attempts, 1);
            assert!(reason.contains("E_SIG"), "reason: {reason}");
            assert!(reason.contains("signature mismatch"), "reason: {reason}");
        }
        other => panic!("expected undelivered, got {other:?}"),
    }
    assert_eq!(stub.calls.lock().await.len(), 1);
    stub.stop().await;
}

#[tokio::test]
async fn slow_attempt_times_out_and_is_retried() {
    let stub = spawn_stub(
        vec![Reply {
            status: 200,
            delay_ms: 1_000,
        }],
        reply(200),
    )
    .await;
    let notifier = WebhookNotifier::new(
        &stub.url,
        None,
        WebhookConfig {
            attempt_timeout_ms: 100,
            ..config()
        },
    );

    let status = notifier.notify(&payload()).await;
    assert_eq!(status, DeliveryStatus::Delivered { attempts: 2 });
    stub.stop().await;
}

#[tokio::test]
async fn unreachable_endpoint_is_undelivered() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let notifier = WebhookNotifier::new(format!("http://{addr}/hooks/settled"), None, config());
    let err = notifier.deliver(&payload()).await.unwrap_err();
    assert!(matches!(
        err,
        splitvault_types::SplitvaultError::WebhookDeliveryFailure { attempts: 3, .. }
    ));
}
