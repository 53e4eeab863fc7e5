use std::future::Future;

use soroban_client::contract::{contract_id_strkey, ContractBehavior, Contracts};
use soroban_client::server::{Options, Server};
use soroban_client::xdr::{
    ContractDataDurability, Hash, LedgerEntryData, LedgerKey, LedgerKeyContractData, Limits,
    ReadXdr, ScAddress, ScBytes, ScMap, ScSymbol, ScVal, ScVec,
};
use thiserror::Error;
use tracing::trace;

use crate::types::{BlockRecord, ChainSnapshot};

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("chain rpc failure: {0}")]
    Rpc(String),
    #[error("malformed contract data: {0}")]
    Decode(String),
    #[error("bad contract id: {0}")]
    Config(String),
}

/// Read access to the farm contract's storage. The monitor only sees this
/// trait, so poll sequences are testable without an RPC server.
pub trait ChainRead {
    fn snapshot(&self) -> impl Future<Output = Result<ChainSnapshot, ChainError>> + Send;
}

/// Soroban-backed reader: farm index from instance storage, block entries
/// from temporary storage.
pub struct KaleChain {
    server: Server,
    contract: Contracts,
}

fn sym(name: &str) -> ScVal {
    ScVal::Symbol(ScSymbol(name.try_into().expect("symbol fits 32 bytes")))
}

impl KaleChain {
    pub fn new(rpc_url: &str, contract_id: &str) -> Result<Self, ChainError> {
        let contract = Contracts::new(contract_id)
            .map_err(|e| ChainError::Config(format!("{contract_id}: {e:?}")))?;
        let options = Options {
            allow_http: None,
            timeout: None,
            headers: None,
        };
        Ok(KaleChain {
            server: Server::new(rpc_url, options)
                .map_err(|e| ChainError::Config(format!("{rpc_url}: {e:?}")))?,
            contract,
        })
    }

    fn contract_address(&self) -> ScAddress {
        ScAddress::Contract(Hash(contract_id_strkey(&self.contract.contract_id()).0))
    }

    /// Current `FarmIndex` from the contract instance. Absent entry means
    /// the farm has not produced a block yet.
    pub async fn farm_index(&self) -> Result<u32, ChainError> {
        let data = self
            .server
            .get_ledger_entries(vec![self.contract.get_footprint()])
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;

        let Some(entries) = data.result.entries else {
            return Ok(0);
        };
        for entry in entries {
            let decoded = LedgerEntryData::from_xdr_base64(entry.xdr, Limits::none())
                .map_err(|e| ChainError::Decode(e.to_string()))?;
            if let LedgerEntryData::ContractData(contract_data) = decoded {
                if let ScVal::ContractInstance(instance) = contract_data.val {
                    if let Some(storage) = instance.storage {
                        return farm_index_from_instance(&storage);
                    }
                }
            }
        }
        Ok(0)
    }

    /// Block entry at `index` from temporary storage. Evicted or not yet
    /// written entries come back as `None`.
    pub async fn block(&self, index: u32) -> Result<Option<BlockRecord>, ChainError> {
        let block_key = ScVal::Vec(Some(ScVec(
            [sym("Block"), ScVal::U32(index)]
                .try_into()
                .expect("two-element key vec"),
        )));
        let key = LedgerKey::ContractData(LedgerKeyContractData {
            contract: self.contract_address(),
            key: block_key,
            durability: ContractDataDurability::Temporary,
        });

        let data = self
            .server
            .get_ledger_entries(vec![key])
            .await
            .map_err(|e| ChainError::Rpc(e.to_string()))?;

        let Some(entries) = data.result.entries else {
            return Ok(None);
        };
        for entry in entries {
            let decoded = LedgerEntryData::from_xdr_base64(entry.xdr, Limits::none())
                .map_err(|e| ChainError::Decode(e.to_string()))?;
            if let LedgerEntryData::ContractData(contract_data) = decoded {
                if let ScVal::Map(Some(storage)) = contract_data.val {
                    return Ok(Some(block_from_map(&storage)?));
                }
            }
        }
        Ok(None)
    }
}

impl ChainRead for KaleChain {
    async fn snapshot(&self) -> Result<ChainSnapshot, ChainError> {
        let index = self.farm_index().await?;
        let block = if index > 0 { self.block(index).await? } else { None };
        trace!(index, has_block = block.is_some(), "chain snapshot");
        Ok(ChainSnapshot { index, block })
    }
}

fn farm_index_from_instance(storage: &ScMap) -> Result<u32, ChainError> {
    for entry in storage.iter() {
        let matches = match &entry.key {
            // instance keys are enum-encoded as a vec led by the variant symbol
            ScVal::Vec(Some(v)) => v.first() == Some(&sym("FarmIndex")),
            key => *key == sym("FarmIndex"),
        };
        if matches {
            return match entry.val {
                ScVal::U32(index) => Ok(index),
                ref other => Err(ChainError::Decode(format!(
                    "FarmIndex is not a u32: {other:?}"
                ))),
            };
        }
    }
    Ok(0)
}

fn block_from_map(storage: &ScMap) -> Result<BlockRecord, ChainError> {
    let mut block = BlockRecord::default();
    for entry in storage.iter() {
        if entry.key == sym("timestamp") {
            if let ScVal::U64(v) = entry.val {
                block.timestamp = Some(v);
            }
        } else if entry.key == sym("entropy") {
            if let ScVal::Bytes(ScBytes(b)) = &entry.val {
                let raw = b.to_vec();
                let bytes: [u8; 32] = raw.as_slice().try_into().map_err(|_| {
                    ChainError::Decode(format!("entropy is {} bytes, want 32", raw.len()))
                })?;
                block.entropy = Some(bytes);
            }
        } else if entry.key == sym("min_gap") {
            if let ScVal::U32(v) = entry.val {
                block.min_gap = v;
            }
        } else if entry.key == sym("max_gap") {
            if let ScVal::U32(v) = entry.val {
                block.max_gap = v;
            }
        } else if entry.key == sym("min_zeros") {
            if let ScVal::U32(v) = entry.val {
                block.min_zeros = v;
            }
        } else if entry.key == sym("max_zeros") {
            if let ScVal::U32(v) = entry.val {
                block.max_zeros = v;
            }
        } else if entry.key == sym("min_stake") {
            if let ScVal::I128(v) = &entry.val {
                block.min_stake = soroban_client::xdr::int128_helpers::i128_from_pieces(
                    v.hi, v.lo,
                );
            }
        } else if entry.key == sym("max_stake") {
            if let ScVal::I128(v) = &entry.val {
                block.max_stake = soroban_client::xdr::int128_helpers::i128_from_pieces(
                    v.hi, v.lo,
                );
            }
        }
    }
    Ok(block)
}
