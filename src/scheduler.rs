use std::sync::Arc;
use std::time::{Duration, Instant};

use soroban_client::keypair::{Keypair, KeypairBehavior};
use tracing::{debug, info, warn};

use crate::config::{Config, MAX_RECOVERY_ATTEMPTS, RECOVERY_NONCE_STEP};
use crate::miner::MineWork;
use crate::relay::SubmitWork;
use crate::types::{
    unix_now_millis, JobState, PlantedFarmer, PlantingNotification, WorkJob, WorkResult,
    WorkStatus,
};

/// Runs one block's work cycle: wait for the work window, then mine and
/// submit for each planted farmer strictly in notification order. The hash
/// search saturates the CPU, so farmers are never processed in parallel.
pub struct WorkScheduler<M, S> {
    miner: Arc<M>,
    submitter: Arc<S>,
    work_delay_ms: u64,
    nonce_count: u64,
}

impl<M, S> WorkScheduler<M, S>
where
    M: MineWork,
    S: SubmitWork,
{
    pub fn new(config: &Config, miner: Arc<M>, submitter: Arc<S>) -> Self {
        WorkScheduler {
            miner,
            submitter,
            work_delay_ms: config.work_delay_ms,
            nonce_count: config.nonce_count,
        }
    }

    pub async fn schedule(&self, notification: &PlantingNotification) -> Vec<WorkResult> {
        self.wait_for_work_window(notification.block_timestamp)
            .await;
        let mut jobs: Vec<WorkJob> = notification
            .farmers
            .iter()
            .cloned()
            .map(WorkJob::new)
            .collect();
        let mut results = Vec::with_capacity(jobs.len());
        for job in &mut jobs {
            let result = self.work_farmer(notification, job).await;
            results.push(result);
        }
        info!(
            block_index = notification.block_index,
            farmers = results.len(),
            "block work cycle finished"
        );
        results
    }

    /// Sleep until `block_timestamp + work_delay`; no-op when already past.
    async fn wait_for_work_window(&self, block_timestamp: u64) {
        let target_ms = block_timestamp * 1000 + self.work_delay_ms;
        let now = unix_now_millis();
        if target_ms > now {
            debug!(wait_ms = target_ms - now, "waiting for the work window");
            tokio::time::sleep(Duration::from_millis(target_ms - now)).await;
        }
    }

    async fn work_farmer(
        &self,
        notification: &PlantingNotification,
        job: &mut WorkJob,
    ) -> WorkResult {
        let started = Instant::now();
        let farmer = job.farmer.clone();
        let farmer_hex = match derive_farmer_hex(&farmer) {
            Ok(hex) => hex,
            Err(err) => {
                warn!(farmer_id = %farmer.farmer_id, %err, "unusable custodial key");
                job.state = JobState::FailedMining;
                return WorkResult::failed(&farmer, err, 0, elapsed_ms(started));
            }
        };

        let mut attempts = 0u32;
        let mut last_error = "miner produced no proof".to_string();

        // attempt 0 is the base run; later ones are recoveries with a
        // widened nonce batch
        for recovery in 0..=MAX_RECOVERY_ATTEMPTS {
            let nonce_count = self.nonce_count + u64::from(recovery) * RECOVERY_NONCE_STEP;
            attempts += 1;
            job.state = JobState::Mining;

            let mined = match self
                .miner
                .mine(
                    &farmer_hex,
                    notification.block_index,
                    &notification.entropy_hex,
                    nonce_count,
                )
                .await
            {
                Ok(mined) => mined,
                Err(err) => {
                    warn!(
                        farmer_id = %farmer.farmer_id,
                        block_index = notification.block_index,
                        attempt = attempts,
                        %err,
                        "miner attempt failed"
                    );
                    last_error = err.to_string();
                    continue;
                }
            };
            let Some(output) = mined else {
                warn!(
                    farmer_id = %farmer.farmer_id,
                    block_index = notification.block_index,
                    attempt = attempts,
                    nonce_count,
                    "no proof found, widening nonce batch"
                );
                last_error = "miner produced no proof".to_string();
                continue;
            };

            job.state = JobState::Submitting;
            match self
                .submitter
                .submit(&farmer, &output.hash, output.nonce)
                .await
            {
                Ok(receipt) => {
                    let status = if recovery == 0 {
                        WorkStatus::Success
                    } else {
                        WorkStatus::Recovered
                    };
                    job.state = JobState::Success;
                    info!(
                        farmer_id = %farmer.farmer_id,
                        block_index = notification.block_index,
                        tx_hash = %receipt.tx_hash,
                        zeros = output.zeros,
                        attempts,
                        "work landed on chain"
                    );
                    return WorkResult {
                        farmer_id: farmer.farmer_id.clone(),
                        custodial_wallet: farmer.custodial_wallet.clone(),
                        status,
                        nonce: Some(output.nonce),
                        hash: Some(output.hash_hex.clone()),
                        zeros: Some(output.zeros),
                        gap: None,
                        work_time_ms: elapsed_ms(started),
                        attempts,
                        error: None,
                        compensation_required: false,
                    };
                }
                Err(err) => {
                    // a proof that never reached the chain is not
                    // harvestable, so the farmer must be made whole
                    warn!(
                        farmer_id = %farmer.farmer_id,
                        block_index = notification.block_index,
                        %err,
                        "proof found but submission failed"
                    );
                    job.state = JobState::FailedSubmitting;
                    return WorkResult {
                        farmer_id: farmer.farmer_id.clone(),
                        custodial_wallet: farmer.custodial_wallet.clone(),
                        status: WorkStatus::Failed,
                        nonce: Some(output.nonce),
                        hash: Some(output.hash_hex.clone()),
                        zeros: Some(output.zeros),
                        gap: None,
                        work_time_ms: elapsed_ms(started),
                        attempts,
                        error: Some(err.to_string()),
                        compensation_required: true,
                    };
                }
            }
        }

        job.state = JobState::TimedOut;
        WorkResult::failed(&farmer, last_error, attempts, elapsed_ms(started))
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// 32-byte raw public key of the farmer's signing material, lowercase hex.
/// This is the farmer argument the hash-search binary expects.
fn derive_farmer_hex(farmer: &PlantedFarmer) -> Result<String, String> {
    let keypair = Keypair::from_secret(&farmer.custodial_secret_key)
        .map_err(|e| format!("custodial key for {}: {e:?}", farmer.farmer_id))?;
    Ok(hex::encode(keypair.raw_pubkey()))
}
