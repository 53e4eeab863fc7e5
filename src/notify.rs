use std::future::Future;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::config::Config;
use crate::types::{WorkResult, WorkStatus};

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("backend transport: {0}")]
    Transport(String),
    #[error("backend replied {status}: {body}")]
    Status { status: u16, body: String },
}

/// Block-discovery payload, nested form used by the regular monitor path.
#[derive(Debug, Clone, Serialize)]
pub struct BlockDiscovered {
    pub event: &'static str,
    #[serde(rename = "poolerId")]
    pub pooler_id: String,
    #[serde(rename = "blockIndex")]
    pub block_index: u32,
    #[serde(rename = "blockData")]
    pub block_data: BlockData,
    pub metadata: DiscoveryMetadata,
}

/// Stake bounds travel as strings: they are i128 stroop amounts and JSON
/// numbers would lose precision.
#[derive(Debug, Clone, Serialize)]
pub struct BlockData {
    pub index: u32,
    pub timestamp: String,
    pub entropy: String,
    #[serde(rename = "blockAge")]
    pub block_age: i64,
    pub plantable: bool,
    pub min_stake: String,
    pub max_stake: String,
    pub min_zeros: u32,
    pub max_zeros: u32,
    pub min_gap: u32,
    pub max_gap: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryMetadata {
    #[serde(rename = "discoveredAt")]
    pub discovered_at: String,
    #[serde(rename = "poolerUptime")]
    pub pooler_uptime_ms: u64,
    #[serde(rename = "totalBlocksDiscovered")]
    pub total_blocks_discovered: u64,
}

/// Flat variant emitted once when the monitor boots onto a still-fresh block.
#[derive(Debug, Clone, Serialize)]
pub struct StartupDiscovery {
    #[serde(rename = "poolerId")]
    pub pooler_id: String,
    #[serde(rename = "blockIndex")]
    pub block_index: u32,
    pub entropy: String,
    #[serde(rename = "blockTimestamp")]
    pub block_timestamp: u64,
    #[serde(rename = "blockAge")]
    pub block_age: i64,
    #[serde(rename = "discoveredAt")]
    pub discovered_at: String,
    pub source: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkCompletionReport {
    #[serde(rename = "blockIndex")]
    pub block_index: u32,
    #[serde(rename = "poolerId")]
    pub pooler_id: String,
    #[serde(rename = "workResults")]
    pub work_results: Vec<WorkResult>,
    pub summary: WorkSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkSummary {
    #[serde(rename = "totalFarmers")]
    pub total_farmers: usize,
    #[serde(rename = "successfulWork")]
    pub successful_work: usize,
    #[serde(rename = "failedWork")]
    pub failed_work: usize,
    #[serde(rename = "totalWorkTime")]
    pub total_work_time_ms: u64,
    pub timestamp: String,
}

impl WorkCompletionReport {
    /// Recovered proofs made it on chain, so they count as successful work.
    pub fn new(block_index: u32, pooler_id: String, work_results: Vec<WorkResult>) -> Self {
        let successful_work = work_results
            .iter()
            .filter(|r| r.status != WorkStatus::Failed)
            .count();
        let summary = WorkSummary {
            total_farmers: work_results.len(),
            successful_work,
            failed_work: work_results.len() - successful_work,
            total_work_time_ms: work_results.iter().map(|r| r.work_time_ms).sum(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        WorkCompletionReport {
            block_index,
            pooler_id,
            work_results,
            summary,
        }
    }
}

/// Where the monitor reports discoveries. Trait seam so poll sequences can
/// run against a recording sink.
pub trait DiscoverySink {
    fn block_discovered(
        &self,
        event: &BlockDiscovered,
    ) -> impl Future<Output = Result<(), NotifyError>>;

    fn startup_block(
        &self,
        event: &StartupDiscovery,
    ) -> impl Future<Output = Result<(), NotifyError>>;
}

impl<T: DiscoverySink> DiscoverySink for std::sync::Arc<T> {
    async fn block_discovered(&self, event: &BlockDiscovered) -> Result<(), NotifyError> {
        (**self).block_discovered(event).await
    }

    async fn startup_block(&self, event: &StartupDiscovery) -> Result<(), NotifyError> {
        (**self).startup_block(event).await
    }
}

/// Where the coordinator reports finished batches.
pub trait CompletionSink {
    fn work_completed(
        &self,
        report: &WorkCompletionReport,
    ) -> impl Future<Output = Result<(), NotifyError>>;
}

/// Outbound half of the backend boundary.
pub struct BackendNotifier {
    http: reqwest::Client,
    base_url: String,
    pooler_id: String,
    auth_token: String,
}

impl BackendNotifier {
    pub fn new(config: &Config) -> Result<Self, NotifyError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.backend_timeout_ms))
            .user_agent(concat!("kale-pooler/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        Ok(BackendNotifier {
            http,
            base_url: config.backend_url.trim_end_matches('/').to_string(),
            pooler_id: config.pooler_id.clone(),
            auth_token: config.auth_token.clone(),
        })
    }

    async fn post_json<T: Serialize>(
        &self,
        path: &str,
        body: &T,
        authorized: bool,
    ) -> Result<(), NotifyError> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.http.post(&url).json(body);
        if authorized {
            request = request
                .bearer_auth(&self.auth_token)
                .header("X-Pooler-ID", &self.pooler_id);
        }
        let response = request
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Status {
                status: status.as_u16(),
                body,
            });
        }
        debug!(%url, "backend accepted POST");
        Ok(())
    }
}

impl DiscoverySink for BackendNotifier {
    async fn block_discovered(&self, event: &BlockDiscovered) -> Result<(), NotifyError> {
        self.post_json("/pooler/block-discovered", event, false).await
    }

    async fn startup_block(&self, event: &StartupDiscovery) -> Result<(), NotifyError> {
        self.post_json("/pooler/block-discovered", event, false).await
    }
}

impl CompletionSink for BackendNotifier {
    async fn work_completed(&self, report: &WorkCompletionReport) -> Result<(), NotifyError> {
        self.post_json("/pooler/work-completed", report, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PlantedFarmer;

    fn result(status: WorkStatus, ms: u64) -> WorkResult {
        let farmer = PlantedFarmer {
            farmer_id: "F1".to_string(),
            custodial_wallet: "GW".to_string(),
            custodial_secret_key: "SK".to_string(),
            stake_amount: "1".to_string(),
            planting_time: None,
        };
        WorkResult {
            farmer_id: farmer.farmer_id,
            custodial_wallet: farmer.custodial_wallet,
            status,
            nonce: None,
            hash: None,
            zeros: None,
            gap: None,
            work_time_ms: ms,
            attempts: 1,
            error: None,
            compensation_required: status == WorkStatus::Failed,
        }
    }

    #[test]
    fn summary_counts_recovered_as_successful() {
        let report = WorkCompletionReport::new(
            201,
            "pool-1".to_string(),
            vec![
                result(WorkStatus::Success, 100),
                result(WorkStatus::Recovered, 250),
                result(WorkStatus::Failed, 50),
            ],
        );
        assert_eq!(report.summary.total_farmers, 3);
        assert_eq!(report.summary.successful_work, 2);
        assert_eq!(report.summary.failed_work, 1);
        assert_eq!(report.summary.total_work_time_ms, 400);
    }

    #[test]
    fn discovery_payload_wire_shape() {
        let event = BlockDiscovered {
            event: "new_block_discovered",
            pooler_id: "pool-1".to_string(),
            block_index: 101,
            block_data: BlockData {
                index: 101,
                timestamp: "2026-08-02T00:00:00+00:00".to_string(),
                entropy: "ab".repeat(32),
                block_age: 45,
                plantable: true,
                min_stake: "10000000".to_string(),
                max_stake: "100000000".to_string(),
                min_zeros: 6,
                max_zeros: 9,
                min_gap: 0,
                max_gap: 30,
            },
            metadata: DiscoveryMetadata {
                discovered_at: "2026-08-02T00:00:45+00:00".to_string(),
                pooler_uptime_ms: 12_000,
                total_blocks_discovered: 1,
            },
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["event"], "new_block_discovered");
        assert_eq!(v["blockIndex"], 101);
        assert_eq!(v["blockData"]["blockAge"], 45);
        assert_eq!(v["blockData"]["plantable"], true);
        // stake bounds stay snake_case strings
        assert_eq!(v["blockData"]["min_stake"], "10000000");
        assert_eq!(v["metadata"]["totalBlocksDiscovered"], 1);
    }

    #[test]
    fn startup_payload_is_flat_with_source_tag() {
        let event = StartupDiscovery {
            pooler_id: "pool-1".to_string(),
            block_index: 100,
            entropy: "00".repeat(32),
            block_timestamp: 1_700_000_000,
            block_age: 60,
            discovered_at: "2026-08-02T00:01:00+00:00".to_string(),
            source: "startup_check",
        };
        let v = serde_json::to_value(&event).unwrap();
        assert_eq!(v["source"], "startup_check");
        assert_eq!(v["blockTimestamp"], 1_700_000_000);
        assert!(v.get("blockData").is_none());
    }
}
