use std::future::Future;
use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum MinerError {
    #[error("failed to spawn miner: {0}")]
    Spawn(io::Error),
    #[error("miner io: {0}")]
    Io(io::Error),
}

#[derive(Debug, Clone)]
pub struct MinerOutput {
    pub nonce: u64,
    pub hash: [u8; 32],
    pub hash_hex: String,
    pub zeros: u32,
}

/// Hash-search boundary. `Ok(None)` is the no-proof outcome (timeout,
/// abnormal exit, unparseable output); the caller decides on recovery.
pub trait MineWork {
    fn mine(
        &self,
        farmer_hex: &str,
        block_index: u32,
        entropy_hex: &str,
        nonce_count: u64,
    ) -> impl Future<Output = Result<Option<MinerOutput>, MinerError>>;

    fn is_mining(&self) -> bool;

    /// Kill the live child, if any. A no-op while nothing is mining.
    fn kill_current(&self);
}

/// Supervises the external hash-search executable. At most one child is
/// alive per process: the search is CPU-bound and must not be multiplexed.
pub struct MinerRunner {
    binary: String,
    timeout: Duration,
    serialize: Mutex<()>,
    mining: AtomicBool,
    shutdown: watch::Receiver<bool>,
    cancel: Notify,
}

enum Exit {
    Done(io::Result<std::process::ExitStatus>),
    TimedOut,
    Interrupted,
}

impl MinerRunner {
    pub fn new(binary: String, timeout: Duration, shutdown: watch::Receiver<bool>) -> Self {
        MinerRunner {
            binary,
            timeout,
            serialize: Mutex::new(()),
            mining: AtomicBool::new(false),
            shutdown,
            cancel: Notify::new(),
        }
    }

    async fn run_child(
        &self,
        farmer_hex: &str,
        block_index: u32,
        entropy_hex: &str,
        nonce_count: u64,
    ) -> Result<Option<MinerOutput>, MinerError> {
        let started = Instant::now();
        let mut child = Command::new(&self.binary)
            .arg(farmer_hex)
            .arg(block_index.to_string())
            .arg(entropy_hex)
            .arg(nonce_count.to_string())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(MinerError::Spawn)?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| MinerError::Io(io::Error::other("stdout not captured")))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| MinerError::Io(io::Error::other("stderr not captured")))?;
        let mut stdout_buf = String::new();
        let mut stderr_buf = String::new();
        let mut shutdown = self.shutdown.clone();

        let exit = tokio::select! {
            status = async {
                let _ = tokio::join!(
                    stdout.read_to_string(&mut stdout_buf),
                    stderr.read_to_string(&mut stderr_buf),
                );
                child.wait().await
            } => Exit::Done(status),
            _ = tokio::time::sleep(self.timeout) => Exit::TimedOut,
            _ = shutdown.changed() => Exit::Interrupted,
            _ = self.cancel.notified() => Exit::Interrupted,
        };

        match exit {
            Exit::Done(Ok(status)) if status.success() => {
                let output = parse_miner_line(&stdout_buf);
                if output.is_none() {
                    warn!(
                        block_index,
                        stderr = %stderr_buf.trim(),
                        "miner produced no parseable proof"
                    );
                }
                Ok(output)
            }
            Exit::Done(Ok(status)) => {
                warn!(block_index, %status, stderr = %stderr_buf.trim(), "miner exited abnormally");
                Ok(None)
            }
            Exit::Done(Err(e)) => Err(MinerError::Io(e)),
            Exit::TimedOut => {
                warn!(
                    block_index,
                    elapsed_secs = started.elapsed().as_secs(),
                    stderr = %stderr_buf.trim(),
                    "miner hit the wall-clock ceiling, killing child"
                );
                let _ = child.kill().await;
                Ok(None)
            }
            Exit::Interrupted => {
                debug!(block_index, "stop requested, killing miner child");
                let _ = child.kill().await;
                Ok(None)
            }
        }
    }
}

impl MineWork for MinerRunner {
    async fn mine(
        &self,
        farmer_hex: &str,
        block_index: u32,
        entropy_hex: &str,
        nonce_count: u64,
    ) -> Result<Option<MinerOutput>, MinerError> {
        let _exclusive = self.serialize.lock().await;
        self.mining.store(true, Ordering::SeqCst);
        let result = self
            .run_child(farmer_hex, block_index, entropy_hex, nonce_count)
            .await;
        self.mining.store(false, Ordering::SeqCst);
        result
    }

    fn is_mining(&self) -> bool {
        self.mining.load(Ordering::SeqCst)
    }

    fn kill_current(&self) {
        // notify_waiters wakes only a live child's select, so a stray kill
        // with nothing running does not poison the next run
        self.cancel.notify_waiters();
    }
}

/// Final non-empty stdout line is a two-element JSON array `[nonce, hash]`.
/// Anything else counts as no proof.
fn parse_miner_line(stdout: &str) -> Option<MinerOutput> {
    let line = stdout.lines().rev().find(|l| !l.trim().is_empty())?;
    let (nonce, hash_hex): (u64, String) = serde_json::from_str(line.trim()).ok()?;
    let raw = hex::decode(&hash_hex).ok()?;
    let hash: [u8; 32] = raw.as_slice().try_into().ok()?;
    let zeros = hash_hex.chars().take_while(|c| *c == '0').count() as u32;
    Some(MinerOutput {
        nonce,
        hash,
        hash_hex,
        zeros,
    })
}
