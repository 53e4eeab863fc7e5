use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Decoded state of one on-chain block. Fields the ledger entry did not
/// carry stay `None`; the monitor substitutes its tie-break values when it
/// builds the outbound notification.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct BlockRecord {
    pub timestamp: Option<u64>,
    pub entropy: Option<[u8; 32]>,
    pub min_gap: u32,
    pub max_gap: u32,
    pub min_stake: i128,
    pub max_stake: i128,
    pub min_zeros: u32,
    pub max_zeros: u32,
}

/// Result of one chain poll: the current farm index plus the block entry at
/// that index, when the ledger still holds it.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainSnapshot {
    pub index: u32,
    pub block: Option<BlockRecord>,
}

/// One farmer the backend planted for a block, custody material included.
/// The secret key only ever lives in memory.
#[derive(Debug, Clone)]
pub struct PlantedFarmer {
    pub farmer_id: String,
    pub custodial_wallet: String,
    pub custodial_secret_key: String,
    pub stake_amount: String,
    pub planting_time: Option<String>,
}

/// Normalized planting notification, after alias folding and validation.
#[derive(Debug, Clone)]
pub struct PlantingNotification {
    pub block_index: u32,
    pub block_timestamp: u64,
    pub entropy_hex: String,
    pub farmers: Vec<PlantedFarmer>,
}

/// Lifecycle of one (block, farmer) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Mining,
    Submitting,
    Success,
    FailedMining,
    FailedSubmitting,
    TimedOut,
}

/// One unit of scheduled work, carried through the scheduler in
/// notification order.
#[derive(Debug, Clone)]
pub struct WorkJob {
    pub farmer: PlantedFarmer,
    pub state: JobState,
}

impl WorkJob {
    pub fn new(farmer: PlantedFarmer) -> Self {
        WorkJob {
            farmer,
            state: JobState::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkStatus {
    Success,
    Recovered,
    Failed,
}

/// Terminal per-farmer outcome, serialized into the completion report.
/// `gap` stays absent: deriving it needs contract state the pooler does not
/// read, so nothing is fabricated here.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkResult {
    pub farmer_id: String,
    pub custodial_wallet: String,
    pub status: WorkStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zeros: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gap: Option<u32>,
    #[serde(rename = "workTime")]
    pub work_time_ms: u64,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub compensation_required: bool,
}

impl WorkResult {
    /// A failed result is exactly the compensable one.
    pub fn failed(
        farmer: &PlantedFarmer,
        error: impl Into<String>,
        attempts: u32,
        work_time_ms: u64,
    ) -> Self {
        WorkResult {
            farmer_id: farmer.farmer_id.clone(),
            custodial_wallet: farmer.custodial_wallet.clone(),
            status: WorkStatus::Failed,
            nonce: None,
            hash: None,
            zeros: None,
            gap: None,
            work_time_ms,
            attempts,
            error: Some(error.into()),
            compensation_required: true,
        }
    }
}

pub fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn unix_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn farmer() -> PlantedFarmer {
        PlantedFarmer {
            farmer_id: "F1".to_string(),
            custodial_wallet: "GWALLET".to_string(),
            custodial_secret_key: "SSECRET".to_string(),
            stake_amount: "1000000".to_string(),
            planting_time: None,
        }
    }

    #[test]
    fn failed_result_is_compensable() {
        let r = WorkResult::failed(&farmer(), "mining exhausted", 4, 1200);
        assert_eq!(r.status, WorkStatus::Failed);
        assert!(r.compensation_required);
        assert!(r.nonce.is_none());
        assert!(r.gap.is_none());
    }

    #[test]
    fn work_result_wire_shape() {
        let r = WorkResult {
            farmer_id: "F1".to_string(),
            custodial_wallet: "GWALLET".to_string(),
            status: WorkStatus::Success,
            nonce: Some(12345),
            hash: Some("0000007abc".to_string()),
            zeros: Some(7),
            gap: None,
            work_time_ms: 60000,
            attempts: 1,
            error: None,
            compensation_required: false,
        };
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["farmerId"], "F1");
        assert_eq!(v["status"], "success");
        assert_eq!(v["workTime"], 60000);
        assert_eq!(v["compensationRequired"], false);
        // absent optionals must not appear at all
        assert!(v.get("gap").is_none());
        assert!(v.get("error").is_none());
    }
}
