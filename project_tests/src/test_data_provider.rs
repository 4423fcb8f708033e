//! # Data Provider Integration Tests
//!
//! Runs the `DataProvider` against a local `axum` backend that mimics the
//! dashboard REST endpoints, covering normalization, related lookups,
//! updates and error surfacing.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{Value, json};

use lib_portdash::provider::{ConfigType, DataProvider, ListParams, ProviderError, Resource};
use lib_portdash::retrieve::ky_http::ApiClient;

#[derive(Clone, Default)]
struct Backend {
    hits: Arc<AtomicUsize>,
}

impl Backend {
    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }
}

async fn accounts(State(b): State<Backend>) -> Json<Value> {
    b.hit();
    Json(json!([
        {"account_id": "DU123", "net_liquidation": 1000.5},
        {"account_id": "DU456", "net_liquidation": 20.0}
    ]))
}

async fn account(State(b): State<Backend>, Path(id): Path<String>) -> Json<Value> {
    b.hit();
    Json(json!({"account_id": id, "currency": "USD"}))
}

async fn positions(State(b): State<Backend>, Path(id): Path<String>) -> Json<Value> {
    b.hit();
    Json(json!([
        {"symbol": "AAPL", "account": id, "qty": 10},
        {"symbol": "MSFT", "account": id, "qty": 5}
    ]))
}

async fn containers(State(b): State<Backend>, Query(q): Query<HashMap<String, String>>) -> Json<Value> {
    b.hit();
    let status = q.get("status").cloned().unwrap_or_else(|| "any".to_string());
    Json(json!([{"name": "gateway", "status": status}]))
}

async fn env_get(State(b): State<Backend>) -> Json<Value> {
    b.hit();
    Json(json!({"API_HOST": "0.0.0.0", "API_PORT": "8000"}))
}

async fn env_put(State(b): State<Backend>) -> (StatusCode, &'static str) {
    b.hit();
    (StatusCode::INTERNAL_SERVER_ERROR, "bad value")
}

async fn accounts_put(State(b): State<Backend>, Json(_body): Json<Value>) -> StatusCode {
    b.hit();
    StatusCode::NO_CONTENT
}

async fn restart(State(b): State<Backend>, Query(q): Query<HashMap<String, String>>) -> Json<Value> {
    b.hit();
    Json(json!({"restarted": q.get("config_type")}))
}

async fn spawn_backend() -> (String, Backend) {
    let backend = Backend::default();
    let app = Router::new()
        .route("/api/dashboard/accounts", get(accounts))
        .route("/api/dashboard/accounts/{id}", get(account))
        .route("/api/dashboard/accounts/{id}/positions", get(positions))
        .route("/api/containers", get(containers))
        .route("/api/config/env", get(env_get).put(env_put))
        .route("/api/config/accounts", get(env_get).put(accounts_put))
        .route("/api/config/restart-services", post(restart))
        .with_state(backend.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}/", addr), backend)
}

async fn provider() -> (DataProvider, Backend) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (base, backend) = spawn_backend().await;
    // No retries: a 500 must come straight back.
    let client = ApiClient::new(&base, 0).unwrap();
    (DataProvider::new(client).unwrap(), backend)
}

#[tokio::test]
async fn test_list_accounts_uses_account_id() {
    let (p, _) = provider().await;
    let set = p.list(Resource::Accounts, &ListParams::default()).await.unwrap();

    assert_eq!(set.total, 2);
    let ids: Vec<_> = set.records.iter().map(|r| r.id_string()).collect();
    assert_eq!(ids, vec!["DU123", "DU456"]);
    assert_eq!(set.records[0].get("net_liquidation"), Some(&json!(1000.5)));
}

#[tokio::test]
async fn test_bare_object_lists_as_single_record() {
    let (p, _) = provider().await;
    let set = p.list(Resource::ConfigEnv, &ListParams::default()).await.unwrap();

    assert_eq!(set.total, 1);
    assert_eq!(set.records.len(), 1);
    assert_eq!(set.records[0].get("API_PORT"), Some(&json!("8000")));
}

#[tokio::test]
async fn test_get_single_account() {
    let (p, _) = provider().await;
    let record = p.get(Resource::Accounts, "DU123").await.unwrap();
    assert_eq!(record.id_string(), "DU123");
    assert_eq!(record.get("currency"), Some(&json!("USD")));
}

#[tokio::test]
async fn test_positions_of_account() {
    let (p, _) = provider().await;
    let set = p.get_related(Resource::Positions, "DU123").await.unwrap();

    assert_eq!(set.total, 2);
    assert!(set.records.iter().all(|r| r.get("account") == Some(&json!("DU123"))));
    // Positions carry no generic key; the symbol identifies them.
    let ids: Vec<_> = set.records.iter().map(|r| r.id_string()).collect();
    assert_eq!(ids, vec!["AAPL", "MSFT"]);
}

#[tokio::test]
async fn test_list_params_reach_the_query_string() {
    let (p, _) = provider().await;
    let params = ListParams::default().with("status", "running");
    let set = p.list(Resource::Containers, &params).await.unwrap();

    assert_eq!(set.records[0].get("status"), Some(&json!("running")));
    assert_eq!(set.records[0].id_string(), "gateway");
}

#[tokio::test]
async fn test_update_failure_surfaces_status_and_body() {
    let (p, _) = provider().await;
    let err = p
        .update(Resource::ConfigEnv, "id1", &json!({"A": "1"}))
        .await
        .unwrap_err();

    assert_eq!(err.status(), Some(500));
    assert!(err.to_string().contains("bad value"), "{err}");
}

#[tokio::test]
async fn test_update_with_empty_body_returns_id() {
    let (p, _) = provider().await;
    let record = p
        .update(Resource::ConfigAccounts, "accounts", &json!({"accounts": []}))
        .await
        .unwrap();
    assert_eq!(record.into_value(), json!({"id": "accounts"}));
}

#[tokio::test]
async fn test_restart_services_sends_config_type() {
    let (p, _) = provider().await;
    let record = p.restart_services(ConfigType::Env).await.unwrap();
    assert_eq!(record.get("restarted"), Some(&json!("env")));
}

#[tokio::test]
async fn test_unsupported_operations_make_no_request() {
    let (p, backend) = provider().await;

    let err = p.get(Resource::Containers, "gateway").await.unwrap_err();
    assert!(matches!(err, ProviderError::NotSupported { .. }));
    let err = p.list(Resource::SystemStatus, &ListParams::default()).await.unwrap_err();
    assert!(err.is_not_supported());
    assert!(matches!(
        "widgets".parse::<Resource>(),
        Err(ProviderError::UnknownResource(_))
    ));

    assert_eq!(backend.hits.load(Ordering::SeqCst), 0);
}
