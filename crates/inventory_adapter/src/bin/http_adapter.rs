#![forbid(unsafe_code)]

use std::{
    env,
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard},
};

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use inventory_adapter::{
    principal_from_header_map, AdapterFailure, AdapterRuntime, AssetFieldsRequest,
    UpdateRecordRequest,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

type SharedRuntime = Arc<Mutex<AdapterRuntime>>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let bind = env::var("INVENTORY_HTTP_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let addr: SocketAddr = bind.parse()?;

    let runtime = AdapterRuntime::default_from_env()?;
    let lock_timeout_minutes = runtime.config().lock_timeout.as_minutes();
    let runtime: SharedRuntime = Arc::new(Mutex::new(runtime));

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/session/login", post(login))
        .route("/v1/records", get(list_records).post(create_record))
        .route("/v1/records/:id", get(read_record).put(update_record).delete(delete_record))
        .route("/v1/records/:id/edit", post(open_edit).delete(release_edit))
        .route("/v1/records/:id/lock", get(lock_status))
        .route("/v1/history", get(list_history))
        .route("/v1/history/verify", get(verify_history))
        .route("/v1/stats", get(statistics))
        .with_state(runtime);

    info!(%addr, lock_timeout_minutes, "inventory_adapter_http listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("inventory_adapter_http stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
    }
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    asset_id: Option<u64>,
    q: Option<String>,
}

fn lock_runtime(runtime: &SharedRuntime) -> Result<MutexGuard<'_, AdapterRuntime>, AdapterFailure> {
    runtime
        .lock()
        .map_err(|_| AdapterFailure::internal("adapter runtime lock poisoned"))
}

fn respond<T: Serialize>(success: StatusCode, out: Result<T, AdapterFailure>) -> Response {
    match out {
        Ok(body) => (success, Json(body)).into_response(),
        Err(failure) => {
            let status = StatusCode::from_u16(failure.http_status)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(failure.body)).into_response()
        }
    }
}

async fn healthz(State(runtime): State<SharedRuntime>) -> Response {
    respond(StatusCode::OK, lock_runtime(&runtime).and_then(|rt| rt.health()))
}

async fn login(State(runtime): State<SharedRuntime>, headers: HeaderMap) -> Response {
    let out = principal_from_header_map(&headers).and_then(|principal| {
        lock_runtime(&runtime).and_then(|mut rt| rt.login(&principal, None))
    });
    respond(StatusCode::OK, out)
}

async fn list_records(
    State(runtime): State<SharedRuntime>,
    Query(query): Query<SearchQuery>,
) -> Response {
    respond(
        StatusCode::OK,
        lock_runtime(&runtime).and_then(|rt| rt.list_records(query.q.as_deref())),
    )
}

async fn create_record(
    State(runtime): State<SharedRuntime>,
    headers: HeaderMap,
    Json(request): Json<AssetFieldsRequest>,
) -> Response {
    let out = principal_from_header_map(&headers).and_then(|principal| {
        lock_runtime(&runtime).and_then(|mut rt| rt.create_record(&principal, &request, None))
    });
    respond(StatusCode::CREATED, out)
}

async fn read_record(State(runtime): State<SharedRuntime>, Path(id): Path<u64>) -> Response {
    respond(
        StatusCode::OK,
        lock_runtime(&runtime).and_then(|rt| rt.read_record(id)),
    )
}

async fn update_record(
    State(runtime): State<SharedRuntime>,
    headers: HeaderMap,
    Path(id): Path<u64>,
    Json(request): Json<UpdateRecordRequest>,
) -> Response {
    let out = principal_from_header_map(&headers).and_then(|principal| {
        lock_runtime(&runtime).and_then(|mut rt| rt.update_record(&principal, id, &request, None))
    });
    respond(StatusCode::OK, out)
}

async fn delete_record(
    State(runtime): State<SharedRuntime>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Response {
    let out = principal_from_header_map(&headers).and_then(|principal| {
        lock_runtime(&runtime).and_then(|mut rt| rt.delete_record(&principal, id, None))
    });
    respond(StatusCode::OK, out)
}

async fn open_edit(
    State(runtime): State<SharedRuntime>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Response {
    let out = principal_from_header_map(&headers).and_then(|principal| {
        lock_runtime(&runtime).and_then(|mut rt| rt.open_edit(&principal, id, None))
    });
    respond(StatusCode::OK, out)
}

async fn release_edit(
    State(runtime): State<SharedRuntime>,
    headers: HeaderMap,
    Path(id): Path<u64>,
) -> Response {
    let out = principal_from_header_map(&headers).and_then(|principal| {
        lock_runtime(&runtime).and_then(|mut rt| rt.release_edit(&principal, id, None))
    });
    respond(StatusCode::OK, out)
}

async fn lock_status(State(runtime): State<SharedRuntime>, Path(id): Path<u64>) -> Response {
    respond(
        StatusCode::OK,
        lock_runtime(&runtime).and_then(|rt| rt.lock_status(id, None)),
    )
}

async fn list_history(
    State(runtime): State<SharedRuntime>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    respond(
        StatusCode::OK,
        lock_runtime(&runtime).and_then(|rt| rt.list_history(query.asset_id, query.q.as_deref())),
    )
}

async fn verify_history(State(runtime): State<SharedRuntime>) -> Response {
    respond(
        StatusCode::OK,
        lock_runtime(&runtime).and_then(|rt| rt.verify_history()),
    )
}

async fn statistics(State(runtime): State<SharedRuntime>) -> Response {
    respond(
        StatusCode::OK,
        lock_runtime(&runtime).and_then(|rt| rt.statistics()),
    )
}
