//! Test-transfer submitter.
//!
//! Signs locally with a private key and sends a plain value transfer.
//! Nonce, gas and chain id are filled by alloy's recommended fillers, so
//! each call costs a few RPC round trips before the send itself; that time
//! is part of every trial's measurement.

use crate::chain::{ChainError, TransactionSubmitter};
use crate::harness::Submission;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, U256};
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use std::time::Instant;
use tracing::info;
use url::Url;

pub struct WalletSubmitter {
    provider: DynProvider,
    sender: Address,
}

impl WalletSubmitter {
    pub fn new(http_url: &str, private_key: &str) -> Result<Self, ChainError> {
        let signer: PrivateKeySigner = private_key
            .trim()
            .trim_start_matches("0x")
            .parse()
            .map_err(|e: alloy::signers::local::LocalSignerError| ChainError::Key(e.to_string()))?;
        let sender = signer.address();
        let url: Url = http_url.parse()?;

        let provider = ProviderBuilder::new()
            .wallet(EthereumWallet::from(signer))
            .connect_http(url)
            .erased();

        info!(sender = %sender, "wallet submitter ready");
        Ok(Self { provider, sender })
    }

    pub async fn balance(&self) -> Result<U256, ChainError> {
        Ok(self.provider.get_balance(self.sender).await?)
    }
}

#[async_trait]
impl TransactionSubmitter for WalletSubmitter {
    fn sender(&self) -> Address {
        self.sender
    }

    async fn submit(&self, to: Address, amount_wei: U256) -> Result<Submission, ChainError> {
        let started = Instant::now();
        let tx = TransactionRequest::default()
            .with_from(self.sender)
            .with_to(to)
            .with_value(amount_wei);

        let pending = self.provider.send_transaction(tx).await?;
        let id = *pending.tx_hash();

        info!(
            tx = %id,
            to = %to,
            value = %amount_wei,
            send_ms = started.elapsed().as_millis() as u64,
            "test transfer submitted"
        );

        Ok(Submission {
            id,
            sender: self.sender,
        })
    }
}
