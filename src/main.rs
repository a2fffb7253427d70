use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use chrono::Local;
use serde::{Deserialize, Serialize};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_sdk::commitment_config::CommitmentConfig;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;
use tpu_fanout_sender::{config::ServerConfig, TpuClient};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

struct AppState {
    tpu_client: TpuClient,
    repeat_count: usize,
}

#[derive(Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum TransactionEncoding {
    #[default]
    Base64,
    Base58,
}

#[derive(Deserialize, Debug)]
struct TransactionRequest {
    txn: String,
    #[serde(default)]
    encoding: TransactionEncoding,
}

#[derive(Serialize)]
struct TransactionResponse {
    status: String,
    error: Option<String>,
    processing_time_ms: u64,
}

#[derive(Serialize)]
struct LeadersResponse {
    estimated_current_slot: u64,
    fanout_slots: u64,
    leaders: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    let config = ServerConfig::from_env()?;
    info!(
        rpc_url = %config.rpc_url,
        ws_url = %config.ws_url,
        fanout_slots = config.tpu_client.fanout_slots,
        repeat_count = config.repeat_count,
        "Starting TPU fan-out sender"
    );

    let rpc_client = Arc::new(RpcClient::new_with_commitment(
        config.rpc_url.clone(),
        CommitmentConfig::processed(),
    ));
    let tpu_client = TpuClient::new(rpc_client, &config.ws_url, config.tpu_client.clone()).await?;

    let state = Arc::new(AppState {
        tpu_client,
        repeat_count: config.repeat_count,
    });

    let app = Router::new()
        .route("/", get(get_time))
        .route("/leaders", get(get_leaders))
        .route("/send_txn", post(handle_transaction))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!(address = %listener.local_addr()?, "Listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    match Arc::try_unwrap(state) {
        Ok(mut state) => state.tpu_client.shutdown().await,
        Err(_) => warn!("TPU client still in use, leaving background tasks to exit on drop"),
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "Failed to listen for shutdown signal");
    }
}

fn decode_transaction(txn: &str, encoding: TransactionEncoding) -> Result<Vec<u8>, String> {
    match encoding {
        TransactionEncoding::Base64 => base64::engine::general_purpose::STANDARD
            .decode(txn)
            .map_err(|err| format!("invalid base64 transaction: {err}")),
        TransactionEncoding::Base58 => bs58::decode(txn)
            .into_vec()
            .map_err(|err| format!("invalid base58 transaction: {err}")),
    }
}

async fn handle_transaction(
    State(state): State<Arc<AppState>>,
    Json(request): Json<TransactionRequest>,
) -> impl IntoResponse {
    let start_time = Instant::now();

    let wire_transaction = match decode_transaction(&request.txn, request.encoding) {
        Ok(wire_transaction) => wire_transaction,
        Err(err) => {
            warn!(error = %err, "Rejected transaction request");
            return (
                StatusCode::BAD_REQUEST,
                Json(TransactionResponse {
                    status: "error".to_string(),
                    error: Some(err),
                    processing_time_ms: start_time.elapsed().as_millis() as u64,
                }),
            );
        }
    };

    info!(
        transaction_size = wire_transaction.len(),
        "Received transaction request"
    );

    let result = state
        .tpu_client
        .send_raw_transaction(&wire_transaction, state.repeat_count)
        .await;
    let processing_time_ms = start_time.elapsed().as_millis() as u64;

    match result {
        Ok(()) => {
            info!(processing_time_ms, "Transaction fanned out");
            (
                StatusCode::OK,
                Json(TransactionResponse {
                    status: "success".to_string(),
                    error: None,
                    processing_time_ms,
                }),
            )
        }
        Err(err) => {
            error!(error = %err, processing_time_ms, "Transaction fan-out failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(TransactionResponse {
                    status: "error".to_string(),
                    error: Some(err.to_string()),
                    processing_time_ms,
                }),
            )
        }
    }
}

async fn get_leaders(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(LeadersResponse {
        estimated_current_slot: state.tpu_client.estimated_current_slot(),
        fanout_slots: state.tpu_client.fanout_slots(),
        leaders: state.tpu_client.leader_tpu_sockets().addresses,
    })
}

async fn get_time() -> impl IntoResponse {
    let current_time = Local::now().to_rfc3339();
    Json(serde_json::json!({
        "time": current_time
    }))
}
