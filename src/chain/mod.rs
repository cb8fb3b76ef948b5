//! Chain access used by the benchmark.
//!
//! The harness only sees these capabilities through traits:
//! - `TransactionSubmitter`: sends the test transfer (the trial trigger)
//! - `StateQuery`: account nonce at a block tag (`eth_getTransactionCount`)
//! - `ReceiptQuery`: receipt lookup (`eth_getTransactionReceipt`)
//!
//! `RpcClient` and `WalletSubmitter` implement them over alloy HTTP
//! providers; tests implement them with in-memory fakes.

pub mod rpc;
pub mod submitter;

pub use rpc::RpcClient;
pub use submitter::WalletSubmitter;

use crate::harness::Submission;
use alloy::eips::BlockNumberOrTag;
use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("rpc error: {0}")]
    Rpc(#[from] alloy::transports::TransportError),
    #[error("invalid rpc url: {0}")]
    Url(#[from] url::ParseError),
    #[error("invalid private key: {0}")]
    Key(String),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[async_trait]
pub trait TransactionSubmitter: Send + Sync {
    /// Address the transfers are sent from.
    fn sender(&self) -> Address;

    /// Submit a value transfer and return once the node accepted it.
    async fn submit(&self, to: Address, amount_wei: U256) -> Result<Submission, ChainError>;
}

#[async_trait]
pub trait StateQuery: Send + Sync {
    async fn nonce(&self, address: Address, tag: BlockNumberOrTag) -> Result<u64, ChainError>;
}

#[async_trait]
pub trait ReceiptQuery: Send + Sync {
    /// `Ok(None)` while the transaction is not yet mined.
    async fn receipt(&self, id: B256) -> Result<Option<serde_json::Value>, ChainError>;
}

/// Short, stable name for a tag, used in strategy names (`nonce-pending`).
pub fn tag_label(tag: &BlockNumberOrTag) -> String {
    match tag {
        BlockNumberOrTag::Number(n) => format!("block-{n}"),
        named => named.to_string(),
    }
}
