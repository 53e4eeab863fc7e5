use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use soroban_client::address::{Address, AddressTrait as _};
use soroban_client::contract::{ContractBehavior, Contracts};
use soroban_client::keypair::{Keypair, KeypairBehavior};
use soroban_client::server::{Options, Server};
use soroban_client::transaction::{TransactionBehavior, TransactionBuilder};
use soroban_client::transaction_builder::TransactionBuilderBehavior;
use soroban_client::xdr::{Limits, ScVal, WriteXdr};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{Config, RELAY_RETRY_BACKOFF_SECS};
use crate::types::PlantedFarmer;

/// Error substrings the relay path treats as transient.
const RETRYABLE_TOKENS: [&str; 7] = [
    "not_found",
    "timeout",
    "econnreset",
    "enotfound",
    "etimedout",
    "fetch failed",
    "network error",
];

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("simulation rejected: {0}")]
    Simulation(String),
    #[error("transaction build failed: {0}")]
    Build(String),
    #[error("relay rejected: {0}")]
    Gateway(String),
    #[error("relay transport: {0}")]
    Transport(String),
}

impl RelayError {
    /// Simulation and build failures are domain errors and never retried;
    /// everything else is classified by message content.
    pub fn is_retryable(&self) -> bool {
        match self {
            RelayError::Simulation(_) | RelayError::Build(_) => false,
            RelayError::Gateway(msg) | RelayError::Transport(msg) => is_retryable_message(msg),
        }
    }
}

pub fn is_retryable_message(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    RETRYABLE_TOKENS.iter().any(|token| msg.contains(token))
}

#[derive(Debug, Clone)]
pub struct SubmissionReceipt {
    pub tx_hash: String,
}

/// Proof submission boundary, kept behind a trait so the scheduler can be
/// exercised with a scripted submitter.
pub trait SubmitWork {
    fn submit(
        &self,
        farmer: &PlantedFarmer,
        hash: &[u8; 32],
        nonce: u64,
    ) -> impl Future<Output = Result<SubmissionReceipt, RelayError>>;
}

/// Builds the `work` contract call for a custodial farmer, simulates it,
/// signs with the farmer's key, and hands the envelope to launchtube.
pub struct LaunchtubeSubmitter {
    server: Server,
    contract: Contracts,
    network: String,
    relay_url: String,
    relay_jwt: String,
    http: reqwest::Client,
    attempts: u32,
    backoff: Duration,
}

impl LaunchtubeSubmitter {
    pub fn new(config: &Config) -> Result<Self, RelayError> {
        let contract = Contracts::new(&config.contract_id)
            .map_err(|e| RelayError::Build(format!("{}: {e:?}", config.contract_id)))?;
        let options = Options {
            allow_http: None,
            timeout: None,
            headers: None,
        };
        Ok(LaunchtubeSubmitter {
            server: Server::new(&config.rpc_url, options)
                .map_err(|e| RelayError::Build(format!("{}: {e:?}", config.rpc_url)))?,
            contract,
            network: config.network_passphrase.clone(),
            relay_url: config.launchtube_url.clone(),
            relay_jwt: config.launchtube_jwt.clone(),
            http: reqwest::Client::new(),
            attempts: config.retry_attempts.max(1),
            backoff: Duration::from_secs(RELAY_RETRY_BACKOFF_SECS),
        })
    }

    /// One full build/simulate/sign/POST pass.
    async fn submit_once(
        &self,
        farmer: &PlantedFarmer,
        hash: &[u8; 32],
        nonce: u64,
    ) -> Result<SubmissionReceipt, RelayError> {
        let keypair = Keypair::from_secret(&farmer.custodial_secret_key)
            .map_err(|e| RelayError::Build(format!("custodial key: {e:?}")))?;
        let wallet = Address::new(&farmer.custodial_wallet)
            .map_err(|e| RelayError::Build(format!("custodial wallet: {e:?}")))?;

        let farmer_val = wallet
            .to_sc_val()
            .map_err(|e| RelayError::Build(format!("wallet scval: {e:?}")))?;
        let hash_val: ScVal = hash
            .to_vec()
            .try_into()
            .map_err(|e| RelayError::Build(format!("hash scval: {e:?}")))?;
        let nonce_val = ScVal::U64(nonce);

        let account = self
            .server
            .get_account(keypair.public_key().as_str())
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        let source = Rc::new(RefCell::new(account));

        let tx = TransactionBuilder::new(source, self.network.as_str(), None)
            .fee(10000u32)
            .add_operation(
                self.contract
                    .call("work", Some(vec![farmer_val, hash_val, nonce_val])),
            )
            .set_timeout(30)
            .map_err(|e| RelayError::Build(format!("timeout bound: {e:?}")))?
            .build();

        let simulation = self
            .server
            .simulate_transaction(tx.clone(), None)
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        if let Some(err) = simulation.error {
            return Err(RelayError::Simulation(format!("{err:?}")));
        }

        let mut prepared = self
            .server
            .prepare_transaction(tx, self.network.as_str())
            .await
            .map_err(|e| RelayError::Build(format!("prepare: {e:?}")))?;
        prepared.sign(&[keypair.clone()]);

        let envelope = prepared
            .to_envelope()
            .map_err(|e| RelayError::Build(format!("envelope: {e:?}")))?;
        let xdr = envelope
            .to_xdr_base64(Limits::none())
            .map_err(|e| RelayError::Build(format!("xdr: {e:?}")))?;

        self.post_envelope(xdr).await
    }

    async fn post_envelope(&self, xdr: String) -> Result<SubmissionReceipt, RelayError> {
        let form = reqwest::multipart::Form::new().text("xdr", xdr);
        let response = self
            .http
            .post(&self.relay_url)
            .bearer_auth(&self.relay_jwt)
            .header("X-Client-Name", "kale-pooler")
            .header("X-Client-Version", env!("CARGO_PKG_VERSION"))
            .multipart(form)
            .send()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        if !status.is_success() {
            return Err(RelayError::Gateway(format!("{status}: {body}")));
        }

        let parsed: serde_json::Value = serde_json::from_str(&body)
            .map_err(|e| RelayError::Gateway(format!("unparseable relay body: {e}")))?;
        let tx_hash = parsed
            .get("transactionHash")
            .or_else(|| parsed.get("hash"))
            .and_then(|h| h.as_str())
            .ok_or_else(|| RelayError::Gateway(format!("no transaction hash in: {body}")))?
            .to_string();
        debug!(%tx_hash, "relay accepted envelope");
        Ok(SubmissionReceipt { tx_hash })
    }
}

/// Drives one submission operation through the fixed-backoff retry policy.
/// Split out from the submitter so the attempt accounting is testable with
/// a scripted operation.
async fn submit_with_retries<F, Fut>(
    farmer_id: &str,
    attempts: u32,
    backoff: Duration,
    mut op: F,
) -> Result<SubmissionReceipt, RelayError>
where
    F: FnMut(u32) -> Fut,
    Fut: std::future::Future<Output = Result<SubmissionReceipt, RelayError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op(attempt).await {
            Ok(receipt) => return Ok(receipt),
            Err(err) if attempt < attempts && err.is_retryable() => {
                warn!(
                    farmer_id,
                    attempt,
                    error = %err,
                    "transient relay failure, backing off"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(err) => return Err(err),
        }
    }
}

impl SubmitWork for LaunchtubeSubmitter {
    async fn submit(
        &self,
        farmer: &PlantedFarmer,
        hash: &[u8; 32],
        nonce: u64,
    ) -> Result<SubmissionReceipt, RelayError> {
        submit_with_retries(&farmer.farmer_id, self.attempts, self.backoff, |_| {
            self.submit_once(farmer, hash, nonce)
        })
        .await
    }
}
