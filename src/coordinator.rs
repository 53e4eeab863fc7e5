use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::miner::MineWork;
use crate::notify::{CompletionSink, WorkCompletionReport};
use crate::relay::SubmitWork;
use crate::scheduler::WorkScheduler;
use crate::types::PlantingNotification;

/// Owns every in-flight block batch: the notification that started it and
/// the handle of its scheduler task. Both maps are keyed by block index.
pub struct Coordinator<M, S, N> {
    scheduler: WorkScheduler<M, S>,
    miner: Arc<M>,
    completion: Arc<N>,
    pooler_id: String,
    pending: Mutex<HashMap<u32, PlantingNotification>>,
    active: Mutex<HashMap<u32, JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl<M, S, N> Coordinator<M, S, N>
where
    M: MineWork + 'static,
    S: SubmitWork + 'static,
    N: CompletionSink + 'static,
{
    pub fn new(config: &Config, miner: Arc<M>, submitter: Arc<S>, completion: Arc<N>) -> Self {
        Coordinator {
            scheduler: WorkScheduler::new(config, miner.clone(), submitter),
            miner,
            completion,
            pooler_id: config.pooler_id.clone(),
            pending: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
            stopped: AtomicBool::new(false),
        }
    }

    /// Accept one planting notification and launch its work cycle. The task
    /// runs on the calling thread's local executor because the submission
    /// futures are not `Send`.
    pub fn receive(self: &Arc<Self>, notification: PlantingNotification) {
        if self.stopped.load(Ordering::SeqCst) {
            warn!(
                block_index = notification.block_index,
                "stopping, notification dropped"
            );
            return;
        }
        if notification.farmers.is_empty() {
            warn!(
                block_index = notification.block_index,
                "notification without farmers, nothing to schedule"
            );
            return;
        }
        let block_index = notification.block_index;
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&block_index) {
                warn!(block_index, "block already scheduled, duplicate dropped");
                return;
            }
            pending.insert(block_index, notification.clone());
        }
        info!(
            block_index,
            farmers = notification.farmers.len(),
            "planting notification accepted"
        );

        let me = Arc::clone(self);
        let handle = actix_web::rt::spawn(async move {
            let results = me.scheduler.schedule(&notification).await;
            if me.stopped.load(Ordering::SeqCst) {
                // late completion after an emergency stop
                warn!(block_index, "results discarded after stop");
            } else {
                let report =
                    WorkCompletionReport::new(block_index, me.pooler_id.clone(), results);
                // completion reports are not retried
                if let Err(err) = me.completion.work_completed(&report).await {
                    error!(%err, block_index, "work completion report failed");
                } else {
                    info!(
                        block_index,
                        successful = report.summary.successful_work,
                        failed = report.summary.failed_work,
                        "work completion reported"
                    );
                }
            }
            me.pending.lock().remove(&block_index);
            me.active.lock().remove(&block_index);
        });
        self.active.lock().insert(block_index, handle);
    }

    /// Drop queued work, kill the live miner child, and mark in-flight
    /// batches as discardable while their tasks unwind.
    pub fn emergency_stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.miner.kill_current();
        let dropped = {
            let mut pending = self.pending.lock();
            let n = pending.len();
            pending.clear();
            n
        };
        if dropped > 0 {
            info!(dropped, "pending block batches dropped");
        }
    }

    pub fn pending_blocks(&self) -> Vec<u32> {
        let mut blocks: Vec<u32> = self.pending.lock().keys().copied().collect();
        blocks.sort_unstable();
        blocks
    }

    pub fn active_blocks(&self) -> Vec<u32> {
        let mut blocks: Vec<u32> = self.active.lock().keys().copied().collect();
        blocks.sort_unstable();
        blocks
    }

    pub fn miner_running(&self) -> bool {
        self.miner.is_mining()
    }
}
