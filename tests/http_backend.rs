//! HttpBackend against a loopback axum server.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use resync::config::BackendConfig;
use resync::{Backend, CancelToken, ErrorKind, HttpBackend, SyncError};
use serde_json::{json, Value};

#[derive(Default)]
struct ServerState {
  unauthorized: AtomicBool,
  unavailable: AtomicBool,
  probes: AtomicU32,
}

async fn health(State(state): State<Arc<ServerState>>) -> StatusCode {
  state.probes.fetch_add(1, Ordering::SeqCst);
  if state.unauthorized.load(Ordering::SeqCst) {
    StatusCode::UNAUTHORIZED
  } else if state.unavailable.load(Ordering::SeqCst) {
    StatusCode::SERVICE_UNAVAILABLE
  } else {
    StatusCode::OK
  }
}

async fn clients() -> Json<Value> {
  Json(json!([{ "name": "alice" }, { "name": "bob" }]))
}

async fn slow() -> Json<Value> {
  tokio::time::sleep(Duration::from_secs(5)).await;
  Json(json!([]))
}

async fn gateway() -> StatusCode {
  StatusCode::GATEWAY_TIMEOUT
}

async fn me(headers: HeaderMap) -> Result<Json<Value>, StatusCode> {
  match headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
    Some("Bearer secret") => Ok(Json(json!({ "name": "alice" }))),
    _ => Err(StatusCode::UNAUTHORIZED),
  }
}

async fn spawn_server(state: Arc<ServerState>) -> SocketAddr {
  let app = Router::new()
    .route("/health", get(health))
    .route("/clients", get(clients))
    .route("/slow", get(slow))
    .route("/me", get(me))
    .route("/gateway", get(gateway))
    .with_state(state);

  let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    axum::serve(listener, app).await.unwrap();
  });
  addr
}

fn backend(addr: SocketAddr) -> HttpBackend {
  backend_with_timeout(addr, 2_000)
}

fn backend_with_timeout(addr: SocketAddr, request_timeout_ms: u64) -> HttpBackend {
  let backend = HttpBackend::new(&BackendConfig {
    url: format!("http://{}", addr),
    probe_path: "/health".to_string(),
    request_timeout_ms,
  })
  .unwrap();
  // Do not depend on the environment of whoever runs the tests
  backend.set_token(None);
  backend
}

#[tokio::test]
async fn test_probe_reachable() {
  let state = Arc::new(ServerState::default());
  let addr = spawn_server(state.clone()).await;

  backend(addr).probe().await.unwrap();
  assert_eq!(state.probes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_probe_maps_statuses() {
  let state = Arc::new(ServerState::default());
  let backend = backend(spawn_server(state.clone()).await);

  state.unavailable.store(true, Ordering::SeqCst);
  let err = backend.probe().await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::TransportError);
  assert!(err.is_connectivity());

  state.unauthorized.store(true, Ordering::SeqCst);
  let err = backend.probe().await.unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Unauthenticated);
  assert!(!err.is_connectivity());
}

#[tokio::test]
async fn test_get_json_decodes_body() {
  let backend = backend(spawn_server(Arc::default()).await);

  let clients: Vec<Value> = backend
    .get_json("/clients", &CancelToken::new(1))
    .await
    .unwrap();
  assert_eq!(clients.len(), 2);
  assert_eq!(clients[0]["name"], "alice");
}

#[tokio::test]
async fn test_bearer_token_is_sent() {
  let backend = backend(spawn_server(Arc::default()).await);

  let err = backend
    .get_json::<Value>("/me", &CancelToken::new(1))
    .await
    .unwrap_err();
  assert!(err.is_unauthenticated());

  backend.set_token(Some("secret".to_string()));
  let me: Value = backend.get_json("/me", &CancelToken::new(2)).await.unwrap();
  assert_eq!(me["name"], "alice");
}

#[tokio::test]
async fn test_cancelled_request_returns_promptly() {
  let backend = backend(spawn_server(Arc::default()).await);
  let token = CancelToken::new(1);

  let canceller = token.clone();
  tokio::spawn(async move {
    tokio::time::sleep(Duration::from_millis(50)).await;
    canceller.cancel();
  });

  let started = std::time::Instant::now();
  let result = backend.get_json::<Value>("/slow", &token).await;
  assert_eq!(result.unwrap_err(), SyncError::Cancelled);
  assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_refused_connection_is_transport_error() {
  // Bind and release a port so nothing is listening on it
  let addr = {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
  };

  let err = backend(addr).probe().await.unwrap_err();
  assert!(err.is_connectivity(), "unexpected error: {err:?}");
}

#[tokio::test]
async fn test_request_timeout_reports_configured_duration() {
  let backend = backend_with_timeout(spawn_server(Arc::default()).await, 200);

  let err = backend
    .get_json::<Value>("/slow", &CancelToken::new(1))
    .await
    .unwrap_err();
  assert_eq!(err, SyncError::Timeout(Duration::from_millis(200)));
  assert_eq!(err.to_string(), "Request timed out after 200ms");
}

#[tokio::test]
async fn test_gateway_timeout_has_no_bogus_duration() {
  let backend = backend(spawn_server(Arc::default()).await);

  let err = backend
    .get_json::<Value>("/gateway", &CancelToken::new(1))
    .await
    .unwrap_err();
  assert_eq!(err.kind(), ErrorKind::Timeout);
  assert!(err.is_connectivity());
  assert!(!err.to_string().contains("0ms"), "{}", err);
}
