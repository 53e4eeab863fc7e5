use clap::Parser;

/// Process-wide configuration, read once at startup. Every value can come
/// from the environment or a flag.
#[derive(Parser, Debug, Clone)]
#[command(version, about = "Pooled work coordinator for the KALE farming contract", long_about = None)]
pub struct Config {
    /// Port for the inbound backend API
    #[arg(long, env = "POOLER_PORT", default_value_t = 3001)]
    pub port: u16,

    /// Opaque pooler identifier, echoed in every backend payload
    #[arg(long, env = "POOLER_ID")]
    pub pooler_id: String,

    /// Bearer token the backend must present on privileged endpoints
    #[arg(long, env = "POOLER_AUTH_TOKEN")]
    pub auth_token: String,

    /// Soroban RPC endpoint
    #[arg(long, env = "RPC_URL")]
    pub rpc_url: String,

    /// The farming contract
    #[arg(long, env = "CONTRACT_ID")]
    pub contract_id: String,

    /// Network passphrase for transaction signing
    #[arg(long, env = "NETWORK_PASSPHRASE")]
    pub network_passphrase: String,

    /// Backend base URL for discovery and completion POSTs
    #[arg(long, env = "BACKEND_API_URL")]
    pub backend_url: String,

    /// Backend POST timeout in milliseconds
    #[arg(long, env = "BACKEND_TIMEOUT", default_value_t = 30_000)]
    pub backend_timeout_ms: u64,

    /// Relay gateway that forwards signed envelopes to the ledger
    #[arg(long, env = "LAUNCHTUBE_URL")]
    pub launchtube_url: String,

    /// Bearer credential for the relay gateway
    #[arg(long, env = "LAUNCHTUBE_JWT")]
    pub launchtube_jwt: String,

    /// Path to the external hash-search executable
    #[arg(long, env = "MINER_PATH")]
    pub miner_path: String,

    /// Block monitor poll period in milliseconds
    #[arg(long, env = "BLOCK_POLL_INTERVAL_MS", default_value_t = 5_000)]
    pub poll_interval_ms: u64,

    /// Delay before the monitor's first poll in milliseconds
    #[arg(long, env = "INITIAL_BLOCK_CHECK_DELAY_MS", default_value_t = 10_000)]
    pub initial_delay_ms: u64,

    /// Consecutive poll failures after which the monitor halts
    #[arg(long, env = "MAX_ERROR_COUNT", default_value_t = 10)]
    pub max_error_count: u32,

    /// Index jump past the cursor that is logged as missed blocks
    #[arg(long, env = "MAX_MISSED_BLOCKS", default_value_t = 5)]
    pub max_missed_blocks: u32,

    /// Total relay submission attempts per proof
    #[arg(long, env = "RETRY_ATTEMPTS", default_value_t = 3)]
    pub retry_attempts: u32,

    /// Offset from the block timestamp to the work start, milliseconds
    #[arg(long, env = "WORK_DELAY_MS", default_value_t = 150_000)]
    pub work_delay_ms: u64,

    /// Wall-clock ceiling for one miner child, seconds
    #[arg(long, env = "MINER_TIMEOUT_SECS", default_value_t = 300)]
    pub miner_timeout_secs: u64,

    /// Base nonce batch handed to the miner per attempt
    #[arg(long, env = "NONCE_COUNT", default_value_t = 10_000_000)]
    pub nonce_count: u64,
}

/// Extra mining attempts granted when the miner produces no output.
pub const MAX_RECOVERY_ATTEMPTS: u32 = 3;

/// Nonce-count increment per recovery attempt.
pub const RECOVERY_NONCE_STEP: u64 = 1_000_000;

/// Fixed sleep between relay submission attempts.
pub const RELAY_RETRY_BACKOFF_SECS: u64 = 2;

/// A block older than this is no longer worth planting against.
pub const PLANTABLE_MAX_AGE_SECS: i64 = 240;

/// A block younger than this has not finished settling.
pub const PLANTABLE_MIN_AGE_SECS: i64 = 30;

/// Startup shortcut window: notify for the seed block if younger than this.
pub const STARTUP_DISCOVERY_MAX_AGE_SECS: i64 = 120;

impl Config {
    /// Startup validation beyond what clap enforces. Failures here are the
    /// exit-1 path.
    pub fn validate(&self) -> Result<(), String> {
        if self.pooler_id.trim().is_empty() {
            return Err("POOLER_ID must not be empty".to_string());
        }
        if self.auth_token.trim().is_empty() {
            return Err("POOLER_AUTH_TOKEN must not be empty".to_string());
        }
        if !self.contract_id.starts_with('C') {
            return Err(format!("CONTRACT_ID {:?} is not a contract address", self.contract_id));
        }
        if self.miner_path.trim().is_empty() {
            return Err("MINER_PATH must not be empty".to_string());
        }
        if self.retry_attempts == 0 {
            return Err("RETRY_ATTEMPTS must be at least 1".to_string());
        }
        Ok(())
    }
}
