use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::chain::ChainRead;
use crate::config::{
    Config, PLANTABLE_MAX_AGE_SECS, PLANTABLE_MIN_AGE_SECS, STARTUP_DISCOVERY_MAX_AGE_SECS,
};
use crate::notify::{BlockData, BlockDiscovered, DiscoveryMetadata, DiscoverySink, StartupDiscovery};
use crate::types::{unix_now_millis, unix_now_secs, BlockRecord, ChainSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MonitorState {
    Idle = 0,
    Running = 1,
    Halted = 2,
}

/// Single-writer counters, read by `/health` and `/status/work`.
pub struct MonitorStats {
    state: AtomicU8,
    started_at_ms: u64,
    total_blocks_discovered: AtomicU64,
    consecutive_errors: AtomicU32,
    last_block_timestamp: AtomicU64,
    last_notification_ms: AtomicU64,
}

impl Default for MonitorStats {
    fn default() -> Self {
        MonitorStats {
            state: AtomicU8::new(MonitorState::Idle as u8),
            started_at_ms: unix_now_millis(),
            total_blocks_discovered: AtomicU64::new(0),
            consecutive_errors: AtomicU32::new(0),
            last_block_timestamp: AtomicU64::new(0),
            last_notification_ms: AtomicU64::new(0),
        }
    }
}

impl MonitorStats {
    pub fn state(&self) -> MonitorState {
        match self.state.load(Ordering::SeqCst) {
            1 => MonitorState::Running,
            2 => MonitorState::Halted,
            _ => MonitorState::Idle,
        }
    }

    fn set_state(&self, state: MonitorState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn uptime_ms(&self) -> u64 {
        unix_now_millis().saturating_sub(self.started_at_ms)
    }

    pub fn total_blocks_discovered(&self) -> u64 {
        self.total_blocks_discovered.load(Ordering::SeqCst)
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::SeqCst)
    }

    pub fn last_block_timestamp(&self) -> Option<u64> {
        match self.last_block_timestamp.load(Ordering::SeqCst) {
            0 => None,
            ts => Some(ts),
        }
    }

    pub fn last_notification_ms(&self) -> Option<u64> {
        match self.last_notification_ms.load(Ordering::SeqCst) {
            0 => None,
            ms => Some(ms),
        }
    }

    pub fn healthy(&self, max_error_count: u32) -> bool {
        self.state() == MonitorState::Running && self.consecutive_errors() < max_error_count
    }
}

/// Polls the chain for farm-index advances and reports fresh blocks to the
/// backend. Owns the cursor; nothing else writes it.
pub struct BlockMonitor<C, S> {
    chain: C,
    sink: S,
    stats: std::sync::Arc<MonitorStats>,
    pooler_id: String,
    poll_interval: Duration,
    initial_delay: Duration,
    max_error_count: u32,
    max_missed_blocks: u32,
    cursor: u32,
}

impl<C, S> BlockMonitor<C, S>
where
    C: ChainRead,
    S: DiscoverySink,
{
    pub fn new(
        config: &Config,
        chain: C,
        sink: S,
        stats: std::sync::Arc<MonitorStats>,
    ) -> Self {
        BlockMonitor {
            chain,
            sink,
            stats,
            pooler_id: config.pooler_id.clone(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_error_count: config.max_error_count,
            max_missed_blocks: config.max_missed_blocks,
            cursor: 0,
        }
    }

    /// Seed the cursor, run the startup check, then poll until halt or
    /// shutdown.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let seed = loop {
            match self.chain.snapshot().await {
                Ok(snapshot) => {
                    self.stats.consecutive_errors.store(0, Ordering::SeqCst);
                    break snapshot;
                }
                Err(err) => {
                    let errors = self.stats.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
                    error!(%err, errors, "seed chain read failed");
                    if errors >= self.max_error_count {
                        self.stats.set_state(MonitorState::Halted);
                        return;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.poll_interval) => {}
                        _ = shutdown.changed() => return,
                    }
                }
            }
        };

        self.cursor = seed.index;
        self.stats.set_state(MonitorState::Running);
        info!(cursor = self.cursor, "block monitor running");

        self.startup_check(&seed).await;

        tokio::time::sleep(self.initial_delay).await;
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.poll_once().await;
                    if self.stats.consecutive_errors() >= self.max_error_count {
                        error!(
                            errors = self.stats.consecutive_errors(),
                            "error ceiling reached, halting block monitor"
                        );
                        self.stats.set_state(MonitorState::Halted);
                        return;
                    }
                }
                _ = shutdown.changed() => {
                    info!("block monitor stopping");
                    return;
                }
            }
        }
    }

    /// One-shot notification when the process boots onto a block that is
    /// still young enough to act on.
    async fn startup_check(&self, seed: &ChainSnapshot) {
        if seed.index == 0 {
            return;
        }
        let Some(block) = &seed.block else { return };
        let timestamp = block.timestamp.unwrap_or_else(unix_now_secs);
        let age = unix_now_secs() as i64 - timestamp as i64;
        if age >= STARTUP_DISCOVERY_MAX_AGE_SECS {
            return;
        }
        let entropy = block.entropy.unwrap_or([0u8; 32]);
        let event = StartupDiscovery {
            pooler_id: self.pooler_id.clone(),
            block_index: seed.index,
            entropy: hex::encode(entropy),
            block_timestamp: timestamp,
            block_age: age,
            discovered_at: chrono::Utc::now().to_rfc3339(),
            source: "startup_check",
        };
        match self.sink.startup_block(&event).await {
            Ok(()) => {
                info!(block_index = seed.index, age, "startup block reported");
                self.stats
                    .last_notification_ms
                    .store(unix_now_millis(), Ordering::SeqCst);
            }
            Err(err) => warn!(%err, block_index = seed.index, "startup notification failed"),
        }
    }

    async fn poll_once(&mut self) {
        match self.chain.snapshot().await {
            Ok(snapshot) => {
                self.stats.consecutive_errors.store(0, Ordering::SeqCst);
                self.apply(snapshot).await;
            }
            Err(err) => {
                let errors = self.stats.consecutive_errors.fetch_add(1, Ordering::SeqCst) + 1;
                error!(%err, errors, cursor = self.cursor, "chain poll failed");
            }
        }
    }

    async fn apply(&mut self, snapshot: ChainSnapshot) {
        if snapshot.index > self.cursor {
            if snapshot.index - self.cursor > self.max_missed_blocks {
                warn!(
                    cursor = self.cursor,
                    index = snapshot.index,
                    "index jumped past the missed-block threshold"
                );
            }
            self.discovered(snapshot.index, snapshot.block.unwrap_or_default())
                .await;
        } else if snapshot.index < self.cursor {
            // chain reorganization: follow silently, never re-announce
            warn!(
                cursor = self.cursor,
                index = snapshot.index,
                "farm index regressed, following reorg"
            );
            self.cursor = snapshot.index;
        }
    }

    async fn discovered(&mut self, index: u32, block: BlockRecord) {
        let now = unix_now_secs();
        let (timestamp, age) = match block.timestamp {
            Some(ts) => (ts, now as i64 - ts as i64),
            None => (now, 0),
        };
        let plantable = (PLANTABLE_MIN_AGE_SECS..PLANTABLE_MAX_AGE_SECS).contains(&age);
        let entropy = block.entropy.unwrap_or([0u8; 32]);

        let event = BlockDiscovered {
            event: "new_block_discovered",
            pooler_id: self.pooler_id.clone(),
            block_index: index,
            block_data: BlockData {
                index,
                timestamp: chrono::DateTime::<chrono::Utc>::from_timestamp(timestamp as i64, 0)
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default(),
                entropy: hex::encode(entropy),
                block_age: age,
                plantable,
                min_stake: block.min_stake.to_string(),
                max_stake: block.max_stake.to_string(),
                min_zeros: block.min_zeros,
                max_zeros: block.max_zeros,
                min_gap: block.min_gap,
                max_gap: block.max_gap,
            },
            metadata: DiscoveryMetadata {
                discovered_at: chrono::Utc::now().to_rfc3339(),
                pooler_uptime_ms: self.stats.uptime_ms(),
                total_blocks_discovered: self.stats.total_blocks_discovered() + 1,
            },
        };

        match self.sink.block_discovered(&event).await {
            Ok(()) => {
                info!(block_index = index, age, plantable, "new block reported");
                self.cursor = index;
                self.stats
                    .total_blocks_discovered
                    .fetch_add(1, Ordering::SeqCst);
                self.stats
                    .last_block_timestamp
                    .store(timestamp, Ordering::SeqCst);
                self.stats
                    .last_notification_ms
                    .store(unix_now_millis(), Ordering::SeqCst);
            }
            Err(err) => {
                // cursor stays put so the next poll retries this index
                warn!(%err, block_index = index, "discovery notification failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainError;
    use crate::notify::NotifyError;
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::sync::Arc;

    struct ScriptedChain {
        responses: RefCell<VecDeque<Result<ChainSnapshot, ChainError>>>,
        reads: Cell<u32>,
    }

    impl ScriptedChain {
        fn new(responses: Vec<Result<ChainSnapshot, ChainError>>) -> Self {
            ScriptedChain {
                responses: RefCell::new(responses.into()),
                reads: Cell::new(0),
            }
        }
    }

    impl ChainRead for ScriptedChain {
        async fn snapshot(&self) -> Result<ChainSnapshot, ChainError> {
            self.reads.set(self.reads.get() + 1);
            self.responses
                .borrow_mut()
                .pop_front()
                .unwrap_or(Err(ChainError::Rpc("script exhausted".to_string())))
        }
    }

    #[derive(Default)]
    struct SinkInner {
        discovered: RefCell<Vec<BlockDiscovered>>,
        startup: RefCell<Vec<StartupDiscovery>>,
        fail_discoveries: Cell<u32>,
    }

    #[derive(Default, Clone)]
    struct RecordingSink(std::rc::Rc<SinkInner>);

    impl DiscoverySink for RecordingSink {
        async fn block_discovered(&self, event: &BlockDiscovered) -> Result<(), NotifyError> {
            if self.0.fail_discoveries.get() > 0 {
                self.0.fail_discoveries.set(self.0.fail_discoveries.get() - 1);
                return Err(NotifyError::Transport("backend down".to_string()));
            }
            self.0.discovered.borrow_mut().push(event.clone());
            Ok(())
        }

        async fn startup_block(&self, event: &StartupDiscovery) -> Result<(), NotifyError> {
            self.0.startup.borrow_mut().push(event.clone());
            Ok(())
        }
    }

    fn config() -> Config {
        use clap::Parser;
        Config::parse_from([
            "kale-pooler",
            "--pooler-id", "pool-1",
            "--auth-token", "secret",
            "--rpc-url", "https://rpc.example",
            "--contract-id", "CDL74RF5BLYR2YBLCCI7F5FB6TPSCLKEJUBSD2RSVWZ4YHF3VMFAIGWA",
            "--network-passphrase", "Test SDF Network ; September 2015",
            "--backend-url", "https://backend.example",
            "--launchtube-url", "https://relay.example",
            "--launchtube-jwt", "jwt",
            "--miner-path", "/usr/local/bin/kale-farmer",
        ])
    }

    fn block_at(age_secs: i64) -> BlockRecord {
        BlockRecord {
            timestamp: Some((unix_now_secs() as i64 - age_secs) as u64),
            entropy: Some([0xab; 32]),
            min_gap: 0,
            max_gap: 30,
            min_stake: 10_000_000,
            max_stake: 100_000_000,
            min_zeros: 6,
            max_zeros: 9,
        }
    }

    fn monitor(
        chain: ScriptedChain,
        sink: RecordingSink,
        cursor: u32,
    ) -> BlockMonitor<ScriptedChain, RecordingSink> {
        let mut m = BlockMonitor::new(&config(), chain, sink, Arc::new(MonitorStats::default()));
        m.cursor = cursor;
        m
    }

    #[tokio::test]
    async fn fresh_block_is_reported_and_cursor_advances() {
        let chain = ScriptedChain::new(vec![Ok(ChainSnapshot {
            index: 101,
            block: Some(block_at(45)),
        })]);
        let mut m = monitor(chain, RecordingSink::default(), 100);
        m.poll_once().await;

        assert_eq!(m.cursor, 101);
        assert_eq!(m.chain.reads.get(), 1);
        assert_eq!(m.stats.total_blocks_discovered(), 1);
        let events = m.sink.0.discovered.borrow();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].block_index, 101);
        assert!(events[0].block_data.plantable);
        assert!((44..=46).contains(&events[0].block_data.block_age));
        assert_eq!(events[0].block_data.entropy, "ab".repeat(32));
        assert_eq!(events[0].block_data.min_stake, "10000000");
    }

    #[tokio::test]
    async fn stale_block_still_reported_but_not_plantable() {
        let chain = ScriptedChain::new(vec![Ok(ChainSnapshot {
            index: 101,
            block: Some(block_at(400)),
        })]);
        let mut m = monitor(chain, RecordingSink::default(), 100);
        m.poll_once().await;

        assert_eq!(m.cursor, 101);
        let events = m.sink.0.discovered.borrow();
        assert_eq!(events.len(), 1);
        assert!(!events[0].block_data.plantable);
    }

    #[tokio::test]
    async fn regression_follows_reorg_without_event() {
        let chain = ScriptedChain::new(vec![Ok(ChainSnapshot {
            index: 199,
            block: None,
        })]);
        let mut m = monitor(chain, RecordingSink::default(), 200);
        m.poll_once().await;

        assert_eq!(m.cursor, 199);
        assert!(m.sink.0.discovered.borrow().is_empty());
        assert_eq!(m.stats.total_blocks_discovered(), 0);
    }

    #[tokio::test]
    async fn failed_notification_leaves_cursor_for_retry() {
        let snapshot = || {
            Ok(ChainSnapshot {
                index: 101,
                block: Some(block_at(45)),
            })
        };
        let chain = ScriptedChain::new(vec![snapshot(), snapshot(), snapshot()]);
        let sink = RecordingSink::default();
        sink.0.fail_discoveries.set(1);
        let mut m = monitor(chain, sink, 100);

        m.poll_once().await;
        assert_eq!(m.cursor, 100);
        assert!(m.sink.0.discovered.borrow().is_empty());

        m.poll_once().await;
        assert_eq!(m.cursor, 101);
        assert_eq!(m.sink.0.discovered.borrow().len(), 1);

        // same index again: no duplicate notification
        m.poll_once().await;
        assert_eq!(m.sink.0.discovered.borrow().len(), 1);
    }

    #[tokio::test]
    async fn missing_block_fields_use_tie_breaks() {
        let chain = ScriptedChain::new(vec![Ok(ChainSnapshot {
            index: 101,
            block: Some(BlockRecord::default()),
        })]);
        let mut m = monitor(chain, RecordingSink::default(), 100);
        m.poll_once().await;

        let events = m.sink.0.discovered.borrow();
        assert_eq!(events[0].block_data.block_age, 0);
        assert!(!events[0].block_data.plantable);
        assert_eq!(events[0].block_data.entropy, "0".repeat(64));
    }

    #[tokio::test]
    async fn error_counter_resets_on_success() {
        let chain = ScriptedChain::new(vec![
            Err(ChainError::Rpc("boom".to_string())),
            Err(ChainError::Rpc("boom".to_string())),
            Ok(ChainSnapshot {
                index: 100,
                block: None,
            }),
        ]);
        let mut m = monitor(chain, RecordingSink::default(), 100);

        m.poll_once().await;
        m.poll_once().await;
        assert_eq!(m.stats.consecutive_errors(), 2);

        m.poll_once().await;
        assert_eq!(m.stats.consecutive_errors(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn halts_after_error_ceiling_and_stops_reading() {
        let mut cfg = config();
        cfg.max_error_count = 3;
        let chain = ScriptedChain::new(vec![Ok(ChainSnapshot {
            index: 100,
            block: None,
        })]);
        let m = BlockMonitor::new(
            &cfg,
            chain,
            RecordingSink::default(),
            Arc::new(MonitorStats::default()),
        );
        let stats = m.stats.clone();

        let (_tx, rx) = watch::channel(false);
        // seed read succeeds, every scripted-exhausted poll after it fails
        m.run(rx).await;

        assert_eq!(stats.state(), MonitorState::Halted);
        assert_eq!(stats.consecutive_errors(), 3);
        assert!(!stats.healthy(cfg.max_error_count));
    }

    #[tokio::test(start_paused = true)]
    async fn startup_check_reports_young_seed_block() {
        let chain = ScriptedChain::new(vec![Ok(ChainSnapshot {
            index: 100,
            block: Some(block_at(60)),
        })]);
        let sink = RecordingSink::default();
        let m = BlockMonitor::new(
            &config(),
            chain,
            sink.clone(),
            Arc::new(MonitorStats::default()),
        );
        let stats = m.stats.clone();

        // seed + startup check happen before the initial poll delay, so a
        // shorter race is enough to observe them
        let (_tx, rx) = watch::channel(false);
        tokio::select! {
            _ = m.run(rx) => {}
            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
        }

        assert_eq!(stats.state(), MonitorState::Running);
        assert_eq!(sink.0.startup.borrow().len(), 1);
        let startup = &sink.0.startup.borrow()[0];
        assert_eq!(startup.block_index, 100);
        assert_eq!(startup.source, "startup_check");
        assert!(sink.0.discovered.borrow().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn startup_check_skips_old_seed_block() {
        let chain = ScriptedChain::new(vec![Ok(ChainSnapshot {
            index: 100,
            block: Some(block_at(300)),
        })]);
        let sink = RecordingSink::default();
        let m = BlockMonitor::new(
            &config(),
            chain,
            sink.clone(),
            Arc::new(MonitorStats::default()),
        );

        let (_tx, rx) = watch::channel(false);
        tokio::select! {
            _ = m.run(rx) => {}
            _ = tokio::time::sleep(Duration::from_secs(5)) => {}
        }

        assert!(sink.0.startup.borrow().is_empty());
    }
}
