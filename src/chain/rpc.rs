//! Read-only JSON-RPC access over an alloy HTTP provider.

use crate::chain::{ChainError, ReceiptQuery, StateQuery};
use alloy::eips::{BlockId, BlockNumberOrTag};
use alloy::primitives::{Address, B256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use async_trait::async_trait;
use tracing::{debug, info};
use url::Url;

/// Query client for nonces and receipts.
#[derive(Clone)]
pub struct RpcClient {
    provider: DynProvider,
    url: String,
}

impl RpcClient {
    pub fn connect(http_url: &str) -> Result<Self, ChainError> {
        let url: Url = http_url.parse()?;
        let provider = ProviderBuilder::new().connect_http(url).erased();
        info!(url = %http_url, "rpc client ready");
        Ok(Self {
            provider,
            url: http_url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn chain_id(&self) -> Result<u64, ChainError> {
        Ok(self.provider.get_chain_id().await?)
    }

    pub async fn block_number(&self) -> Result<u64, ChainError> {
        Ok(self.provider.get_block_number().await?)
    }
}

#[async_trait]
impl StateQuery for RpcClient {
    async fn nonce(&self, address: Address, tag: BlockNumberOrTag) -> Result<u64, ChainError> {
        let nonce = self
            .provider
            .get_transaction_count(address)
            .block_id(BlockId::Number(tag))
            .await?;
        debug!(address = %address, tag = %tag, nonce, "eth_getTransactionCount");
        Ok(nonce)
    }
}

#[async_trait]
impl ReceiptQuery for RpcClient {
    async fn receipt(&self, id: B256) -> Result<Option<serde_json::Value>, ChainError> {
        match self.provider.get_transaction_receipt(id).await? {
            Some(receipt) => {
                debug!(tx = %id, block = ?receipt.block_number, "receipt available");
                Ok(Some(serde_json::to_value(&receipt)?))
            }
            None => Ok(None),
        }
    }
}
