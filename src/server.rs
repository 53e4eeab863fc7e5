use std::sync::Arc;

use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer, Responder};
use serde::{Deserialize, Deserializer};
use serde_json::json;
use tracing::{info, warn};

use crate::coordinator::Coordinator;
use crate::miner::MineWork;
use crate::monitor::{MonitorState, MonitorStats};
use crate::notify::CompletionSink;
use crate::relay::SubmitWork;
use crate::types::{PlantedFarmer, PlantingNotification};

pub struct AppState<M, S, N> {
    pub coordinator: Arc<Coordinator<M, S, N>>,
    pub stats: Arc<MonitorStats>,
    pub auth_token: String,
    pub max_error_count: u32,
}

/// The backend emits both snake_case and camelCase encodings of the same
/// fields; aliases fold them into one structure at decode time.
#[derive(Debug, Default, Deserialize)]
pub struct PlantingStatusBody {
    #[serde(default, alias = "blockIndex", deserialize_with = "flexible_u64")]
    pub block_index: Option<u64>,
    #[serde(default, alias = "poolerId")]
    pub pooler_id: Option<String>,
    #[serde(default, alias = "successfulPlants")]
    pub successful_plants: Option<u32>,
    #[serde(default, alias = "failedPlants")]
    pub failed_plants: Option<u32>,
    #[serde(default, alias = "plantedFarmers")]
    pub planted_farmers: Option<Vec<PlantedFarmerBody>>,
    #[serde(default, alias = "blockData")]
    pub block_data: Option<BlockDataBody>,
    #[serde(default, alias = "blockTimestamp", deserialize_with = "flexible_u64")]
    pub block_timestamp: Option<u64>,
    #[serde(default)]
    pub entropy: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BlockDataBody {
    #[serde(default)]
    pub entropy: Option<String>,
    #[serde(default, deserialize_with = "flexible_u64")]
    pub timestamp: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct PlantedFarmerBody {
    #[serde(alias = "farmerId")]
    pub farmer_id: String,
    #[serde(alias = "custodialWallet")]
    pub custodial_wallet: String,
    #[serde(alias = "custodialSecretKey")]
    pub custodial_secret_key: String,
    #[serde(default, alias = "stakeAmount", deserialize_with = "flexible_string")]
    pub stake_amount: Option<String>,
    #[serde(default, alias = "plantingTime")]
    pub planting_time: Option<String>,
}

/// Accepts a JSON number or a numeric string.
fn flexible_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrStr {
        Num(u64),
        Str(String),
    }
    Option::<NumOrStr>::deserialize(deserializer)?
        .map(|v| match v {
            NumOrStr::Num(n) => Ok(n),
            NumOrStr::Str(s) => s.parse::<u64>().map_err(serde::de::Error::custom),
        })
        .transpose()
}

/// Accepts a JSON string or number and keeps the textual form.
fn flexible_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StrOrNum {
        Str(String),
        Num(serde_json::Number),
    }
    Ok(Option::<StrOrNum>::deserialize(deserializer)?.map(|v| match v {
        StrOrNum::Str(s) => s,
        StrOrNum::Num(n) => n.to_string(),
    }))
}

/// Fold a decoded body into the normalized notification the coordinator
/// takes. Errors here mean the backend sent something unusable; the caller
/// logs and ignores.
pub fn normalize(body: PlantingStatusBody) -> Result<PlantingNotification, String> {
    let block_index = body.block_index.ok_or("missing block index")?;
    let block_index =
        u32::try_from(block_index).map_err(|_| format!("block index {block_index} out of range"))?;

    let entropy_hex = body
        .entropy
        .or_else(|| body.block_data.as_ref().and_then(|d| d.entropy.clone()))
        .ok_or("missing entropy")?;
    let entropy = hex::decode(&entropy_hex).map_err(|e| format!("bad entropy: {e}"))?;
    if entropy.len() != 32 {
        return Err(format!("entropy is {} bytes, want 32", entropy.len()));
    }

    let block_timestamp = body
        .block_timestamp
        .or_else(|| body.block_data.as_ref().and_then(|d| d.timestamp))
        .ok_or("missing block timestamp")?;

    let farmers: Vec<PlantedFarmer> = body
        .planted_farmers
        .unwrap_or_default()
        .into_iter()
        .map(|f| PlantedFarmer {
            farmer_id: f.farmer_id,
            custodial_wallet: f.custodial_wallet,
            custodial_secret_key: f.custodial_secret_key,
            stake_amount: f.stake_amount.unwrap_or_else(|| "0".to_string()),
            planting_time: f.planting_time,
        })
        .collect();
    if farmers.is_empty() {
        return Err("no planted farmers".to_string());
    }

    Ok(PlantingNotification {
        block_index,
        block_timestamp,
        entropy_hex: entropy_hex.to_lowercase(),
        farmers,
    })
}

async fn planting_status<M, S, N>(
    state: web::Data<AppState<M, S, N>>,
    body: web::Json<PlantingStatusBody>,
) -> impl Responder
where
    M: MineWork + Send + Sync + 'static,
    S: SubmitWork + Send + Sync + 'static,
    N: CompletionSink + Send + Sync + 'static,
{
    let body = body.into_inner();
    info!(
        block_index = ?body.block_index,
        successful = ?body.successful_plants,
        failed = ?body.failed_plants,
        "planting status received"
    );

    // status-only reports carry no farmer list; nothing to schedule
    if body.planted_farmers.as_ref().map_or(true, |f| f.is_empty()) {
        return HttpResponse::Ok().json(json!({"status": "acknowledged"}));
    }

    match normalize(body) {
        Ok(notification) => {
            state.coordinator.receive(notification);
            HttpResponse::Ok().json(json!({"status": "scheduled"}))
        }
        Err(err) => {
            // the backend is trusted: log and acknowledge
            warn!(%err, "unusable planting status");
            HttpResponse::Ok().json(json!({"status": "ignored", "reason": err}))
        }
    }
}

async fn planted_farmers<M, S, N>(
    request: HttpRequest,
    state: web::Data<AppState<M, S, N>>,
    body: web::Json<PlantingStatusBody>,
) -> impl Responder
where
    M: MineWork + Send + Sync + 'static,
    S: SubmitWork + Send + Sync + 'static,
    N: CompletionSink + Send + Sync + 'static,
{
    let Some(header) = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
    else {
        return HttpResponse::Unauthorized().json(json!({"error": "missing bearer token"}));
    };
    if header != format!("Bearer {}", state.auth_token) {
        return HttpResponse::Forbidden().json(json!({"error": "bad bearer token"}));
    }

    match normalize(body.into_inner()) {
        Ok(notification) => {
            state.coordinator.receive(notification);
            HttpResponse::Ok().json(json!({"status": "scheduled"}))
        }
        Err(err) => {
            warn!(%err, "unusable planted-farmers payload");
            HttpResponse::Ok().json(json!({"status": "ignored", "reason": err}))
        }
    }
}

async fn health<M, S, N>(state: web::Data<AppState<M, S, N>>) -> impl Responder
where
    M: MineWork + Send + Sync + 'static,
    S: SubmitWork + Send + Sync + 'static,
    N: CompletionSink + Send + Sync + 'static,
{
    let stats = &state.stats;
    let healthy = stats.healthy(state.max_error_count);
    let body = json!({
        "status": if healthy { "ok" } else { "unhealthy" },
        "monitorState": match stats.state() {
            MonitorState::Idle => "idle",
            MonitorState::Running => "running",
            MonitorState::Halted => "halted",
        },
        "consecutiveErrors": stats.consecutive_errors(),
        "totalBlocksDiscovered": stats.total_blocks_discovered(),
        "lastBlockTimestamp": stats.last_block_timestamp(),
        "lastNotificationMs": stats.last_notification_ms(),
        "uptimeMs": stats.uptime_ms(),
    });
    if healthy {
        HttpResponse::Ok().json(body)
    } else {
        HttpResponse::ServiceUnavailable().json(body)
    }
}

async fn work_status<M, S, N>(state: web::Data<AppState<M, S, N>>) -> impl Responder
where
    M: MineWork + Send + Sync + 'static,
    S: SubmitWork + Send + Sync + 'static,
    N: CompletionSink + Send + Sync + 'static,
{
    HttpResponse::Ok().json(json!({
        "pendingBlocks": state.coordinator.pending_blocks(),
        "activeBlocks": state.coordinator.active_blocks(),
        "minerRunning": state.coordinator.miner_running(),
    }))
}

/// Build the inbound server. Signals are handled by the caller, not actix.
pub fn build<M, S, N>(
    state: AppState<M, S, N>,
    port: u16,
) -> std::io::Result<actix_web::dev::Server>
where
    M: MineWork + Send + Sync + 'static,
    S: SubmitWork + Send + Sync + 'static,
    N: CompletionSink + Send + Sync + 'static,
{
    let data = web::Data::new(state);
    Ok(HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route(
                "/backend/planting-status",
                web::post().to(planting_status::<M, S, N>),
            )
            .route(
                "/backend/planted-farmers",
                web::post().to(planted_farmers::<M, S, N>),
            )
            .route("/health", web::get().to(health::<M, S, N>))
            .route("/status/work", web::get().to(work_status::<M, S, N>))
    })
    .disable_signals()
    .bind(("0.0.0.0", port))?
    .run())
}
