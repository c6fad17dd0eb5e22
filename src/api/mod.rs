//! HTTP API for health checks, transaction history and watch submission

use crate::chain::ChainManager;
use crate::config::ApiConfig;
use crate::coordination::{WatchCoordinator, WatchOptions};
use crate::error::{WatcherError, WatcherResult};
use crate::state::{RecordStore, StatusCounts, TransactionRecord, TransferInfo};
use crate::tx::SignedPayload;

use alloy_primitives::B256;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

const DEFAULT_LIMIT: usize = 20;
const MAX_LIMIT: usize = 100;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RecordStore>,
    pub chain_manager: Arc<ChainManager>,
    pub coordinator: Arc<WatchCoordinator>,
}

/// Build the API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/stats", get(get_stats))
        .route("/transactions", get(list_transactions))
        .route("/transactions/watch", post(watch_transaction))
        .route(
            "/transactions/:hash",
            get(get_transaction).delete(dismiss_transaction),
        )
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> WatcherResult<()> {
    let app = router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| WatcherError::Internal(format!("API bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| WatcherError::Internal(format!("API server: {}", e)))?;

    Ok(())
}

/// Error response wrapper
struct ApiError(WatcherError);

impl From<WatcherError> for ApiError {
    fn from(e: WatcherError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            WatcherError::TransactionNotFound { .. } => StatusCode::NOT_FOUND,
            WatcherError::DuplicateTransaction { .. } => StatusCode::CONFLICT,
            e if e.is_client_error() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

fn parse_hash(hash: &str) -> Result<B256, ApiError> {
    hash.parse::<B256>()
        .map_err(|e| ApiError(WatcherError::Decode(format!("invalid hash {}: {}", hash, e))))
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - verify all dependencies
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state.store.health_check().await.is_ok();

    let chain_health = state.chain_manager.health_check().await;
    let chains_ok = chain_health.iter().all(|(_, healthy)| *healthy);

    let status = if db_ok && chains_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready: db_ok && chains_ok,
            database: db_ok,
            networks: chains_ok,
            active_watches: state.coordinator.active_watches(),
            details: chain_health
                .into_iter()
                .map(|(network, healthy)| NetworkHealth { network, healthy })
                .collect(),
        }),
    )
}

/// Most recent records first
async fn list_transactions(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<TransactionRecord>>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_LIMIT).min(MAX_LIMIT);
    Ok(Json(state.store.recent(limit).await?))
}

async fn get_transaction(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Json<TransactionRecord>, ApiError> {
    let hash = parse_hash(&hash)?;
    state
        .store
        .get(&hash)
        .await?
        .map(Json)
        .ok_or_else(|| {
            ApiError(WatcherError::TransactionNotFound {
                hash: hash.to_string(),
            })
        })
}

/// User dismissal
async fn dismiss_transaction(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<StatusCode, ApiError> {
    let hash = parse_hash(&hash)?;
    if state.coordinator.dismiss(&hash).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError(WatcherError::TransactionNotFound {
            hash: hash.to_string(),
        }))
    }
}

async fn watch_transaction(
    State(state): State<AppState>,
    Json(request): Json<WatchRequest>,
) -> Result<(StatusCode, Json<WatchResponse>), ApiError> {
    let options = WatchOptions {
        label: request.label,
        site_url: request.site_url,
        transfer: request.transfer,
    };
    let hash = state
        .coordinator
        .watch(
            &request.genesis_hash,
            &request.payload,
            &request.signature,
            options,
        )
        .await?;

    Ok((StatusCode::ACCEPTED, Json(WatchResponse { hash })))
}

/// Get transaction statistics
async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let counts = state.store.count_by_status().await?;
    Ok(Json(StatsResponse {
        total: counts.total(),
        counts,
        active_watches: state.coordinator.active_watches(),
    }))
}

// Request and response types

#[derive(Deserialize)]
struct ListParams {
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct WatchRequest {
    genesis_hash: B256,
    payload: SignedPayload,
    signature: String,
    #[serde(default)]
    label: String,
    site_url: Option<String>,
    transfer: Option<TransferInfo>,
}

#[derive(Serialize, Deserialize)]
struct WatchResponse {
    hash: B256,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    networks: bool,
    active_watches: usize,
    details: Vec<NetworkHealth>,
}

#[derive(Serialize)]
struct NetworkHealth {
    network: String,
    healthy: bool,
}

#[derive(Serialize)]
struct StatsResponse {
    total: u64,
    counts: StatusCounts,
    active_watches: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::*;
    use crate::coordination::StatusReconciler;
    use crate::notify::{MockErrorReporter, MockNotifier};
    use crate::state::{MemoryRecordStore, NetworkRef, TxStatus};
    use crate::tx::payload::fixtures::*;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<MemoryRecordStore>, B256) {
        let handle = network(FakeConnector::new());
        let genesis = handle.genesis_hash;
        let chains = Arc::new(ChainManager::empty());
        chains.insert(handle);

        let store = Arc::new(MemoryRecordStore::new());
        let reconciler = Arc::new(StatusReconciler::new(store.clone(), 100));

        let mut notifier = MockNotifier::new();
        notifier.expect_notify().returning(|_, _, _, _| ());
        let mut reporter = MockErrorReporter::new();
        reporter.expect_report().returning(|_, _| ());

        let coordinator = Arc::new(WatchCoordinator::new(
            chains.clone(),
            reconciler,
            Arc::new(notifier),
            Arc::new(reporter),
            Duration::from_secs(90),
        ));

        let state = AppState {
            store: store.clone(),
            chain_manager: chains,
            coordinator,
        };
        (router(state), store, genesis)
    }

    async fn body_json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn watch_request(genesis: &str, nonce: u64) -> Request<Body> {
        let body = json!({
            "genesis_hash": genesis,
            "payload": remark_payload(nonce),
            "signature": signature(0xaa),
            "label": "remark",
        });
        Request::builder()
            .method("POST")
            .uri("/transactions/watch")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _, _) = app();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_ready() {
        let (app, _, _) = app();
        let response = app
            .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["ready"], true);
        assert_eq!(body["details"][0]["network"], "Polkadot");
    }

    #[tokio::test]
    async fn test_watch_then_fetch_and_dismiss() {
        let (app, store, genesis) = app();

        let response = app
            .clone()
            .oneshot(watch_request(&genesis.to_string(), 3))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let hash = body_json(response).await["hash"].as_str().unwrap().to_string();

        let record = store.get(&hash.parse().unwrap()).await.unwrap().unwrap();
        assert_eq!(record.status, TxStatus::Pending);
        assert_eq!(record.label, "remark");

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri(format!("/transactions/{}", hash))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "pending");
        assert_eq!(body["nonce"], 3);
        assert_eq!(body["network"]["kind"], "substrate");

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(format!("/transactions/{}", hash))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/transactions/{}", hash))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_watch_rejects_unknown_network() {
        let (app, store, _) = app();
        let response = app
            .oneshot(watch_request(&format!("0x{}", "22".repeat(32)), 1))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(store.recent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_and_stats() {
        let (app, store, genesis) = app();
        for (seed, status) in [(1u8, TxStatus::Success), (2, TxStatus::Pending), (3, TxStatus::Success)] {
            let mut record = TransactionRecord::new_pending(
                B256::repeat_byte(seed),
                "0xa".to_string(),
                NetworkRef::Substrate { genesis_hash: genesis },
                seed as u64,
                "",
            );
            record.status = status;
            record.timestamp = seed as i64;
            store.add(record).await.unwrap();
        }

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/transactions?limit=2")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let body = body_json(response).await;
        let listed = body.as_array().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0]["hash"], B256::repeat_byte(3).to_string());

        let response = app
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = body_json(response).await;
        assert_eq!(body["total"], 3);
        assert_eq!(body["counts"]["success"], 2);
        assert_eq!(body["counts"]["pending"], 1);
    }

    #[tokio::test]
    async fn test_bad_hash_is_rejected() {
        let (app, _, _) = app();
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/transactions/not-a-hash")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
