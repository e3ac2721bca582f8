//! Narrow chain interfaces and their alloy-backed adapters
//!
//! The generated bindings are collapsed into three seams:
//! - [`BridgeContract`]: the handful of view calls the protocol reads
//! - [`TransactionSender`]: pricing, nonce, submission and receipts for bridge writes
//! - [`ChainView`]: finalized block height and a stream of new finalized heights
//!
//! Production adapters talk JSON-RPC through alloy; in-memory doubles live in
//! [`crate::testing`].

use std::str::FromStr;
use std::time::Duration;

use alloy::network::{Ethereum, EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, Bytes, FixedBytes, B256, U256};
use alloy::providers::fillers::{FillProvider, JoinFill, WalletFiller};
use alloy::providers::{Identity, Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolCall;
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::contracts::{BitcoinBridge, BitcoinUtxo, UnlockEntry};
use crate::error::{BridgeOutError, Result};
use crate::types::{UnlockEvent, ValidatorId};

/// Read-only view of the Ethereum bridge contract
#[async_trait]
pub trait BridgeContract: Send + Sync {
    async fn confirmed_unlocks(&self, sequence_number: U256) -> Result<bool>;

    async fn attestations(&self, attestation_key: B256) -> Result<U256>;

    async fn validator_id(&self, validator: Address) -> Result<ValidatorId>;

    async fn bridge_validators_count(&self) -> Result<u64>;

    async fn attestation_threshold(&self) -> Result<u64>;

    async fn pending_btc_withdrawals(&self, entry_hash: B256) -> Result<bool>;
}

/// Gas and nonce attached to a bridge write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxParams {
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
}

/// Main UTXO of the wallet servicing a BTC withdrawal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MainUtxo {
    pub tx_hash: B256,
    pub output_index: u32,
    pub value: u64,
}

/// Wallet that services BTC withdrawals submitted by this validator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BtcWallet {
    pub pubkey_hash: [u8; 20],
    pub main_utxo: MainUtxo,
}

impl BtcWallet {
    pub fn withdraw_call(&self, event: &UnlockEvent) -> BridgeCall {
        BridgeCall::WithdrawBtc {
            event: event.clone(),
            wallet_pubkey_hash: self.pubkey_hash,
            main_utxo: self.main_utxo,
        }
    }
}

/// A bridge write that goes through the priced/submitted/confirmed pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeCall {
    AttestBridgeOut(UnlockEvent),
    AttestBridgeOutWithSignatures {
        event: UnlockEvent,
        signatures: Bytes,
    },
    WithdrawBtc {
        event: UnlockEvent,
        wallet_pubkey_hash: [u8; 20],
        main_utxo: MainUtxo,
    },
}

impl BridgeCall {
    pub fn event(&self) -> &UnlockEvent {
        match self {
            BridgeCall::AttestBridgeOut(event) => event,
            BridgeCall::AttestBridgeOutWithSignatures { event, .. } => event,
            BridgeCall::WithdrawBtc { event, .. } => event,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            BridgeCall::AttestBridgeOut(_) => "attestBridgeOut",
            BridgeCall::AttestBridgeOutWithSignatures { .. } => "attestBridgeOutWithSignatures",
            BridgeCall::WithdrawBtc { .. } => "withdrawBTC",
        }
    }

    /// ABI-encoded call data for the bridge contract
    pub fn calldata(&self) -> Bytes {
        match self {
            BridgeCall::AttestBridgeOut(event) => BitcoinBridge::attestBridgeOutCall {
                entry: unlock_entry(event),
            }
            .abi_encode()
            .into(),
            BridgeCall::AttestBridgeOutWithSignatures { event, signatures } => {
                BitcoinBridge::attestBridgeOutWithSignaturesCall {
                    entry: unlock_entry(event),
                    signatures: signatures.clone(),
                }
                .abi_encode()
                .into()
            }
            BridgeCall::WithdrawBtc {
                event,
                wallet_pubkey_hash,
                main_utxo,
            } => BitcoinBridge::withdrawBTCCall {
                entry: unlock_entry(event),
                walletPubKeyHash: FixedBytes::from(*wallet_pubkey_hash),
                mainUtxo: BitcoinUtxo {
                    txHash: main_utxo.tx_hash,
                    txOutputIndex: main_utxo.output_index,
                    txOutputValue: main_utxo.value,
                },
            }
            .abi_encode()
            .into(),
        }
    }
}

/// Convert a domain event into the contract's entry struct
pub fn unlock_entry(event: &UnlockEvent) -> UnlockEntry {
    UnlockEntry {
        unlockSequenceNumber: event.sequence_number,
        recipient: event.recipient.clone(),
        token: event.token,
        amount: event.amount,
        chain: event.chain.as_u8(),
    }
}

/// Write side of the bridge: everything the submission state machine needs
#[async_trait]
pub trait TransactionSender: Send + Sync {
    /// Address transactions are sent from
    fn sender_address(&self) -> Address;

    async fn gas_price(&self) -> Result<u128>;

    async fn pending_nonce(&self) -> Result<u64>;

    async fn estimate_gas(&self, call: &BridgeCall) -> Result<u64>;

    async fn send(&self, call: &BridgeCall, params: &TxParams) -> Result<B256>;

    /// `None` while the transaction has no receipt, otherwise its success flag
    async fn receipt_status(&self, tx_hash: B256) -> Result<Option<bool>>;
}

/// Finalized view of the Ethereum chain
#[async_trait]
pub trait ChainView: Send + Sync {
    async fn finalized_block(&self) -> Result<u64>;

    /// Stream of strictly increasing finalized heights; ends on cancellation
    fn watch_blocks(&self, cancel: CancellationToken) -> BoxStream<'static, u64>;
}

fn rpc_error(method: &str, e: impl std::fmt::Display) -> BridgeOutError {
    BridgeOutError::Rpc(format!("{}: {}", method, e))
}

fn parse_rpc_url(rpc_url: &str) -> Result<reqwest::Url> {
    rpc_url
        .parse()
        .map_err(|e| BridgeOutError::Config(format!("Invalid RPC URL {}: {}", rpc_url, e)))
}

/// alloy-backed [`BridgeContract`]
#[derive(Clone)]
pub struct EvmBridge {
    provider: RootProvider<Http<Client>>,
    bridge_address: Address,
}

impl EvmBridge {
    pub fn new(rpc_url: &str, bridge_address: &str) -> Result<Self> {
        let bridge_address = Address::from_str(bridge_address)
            .map_err(|e| BridgeOutError::Config(format!("Invalid bridge address: {}", e)))?;
        let provider = ProviderBuilder::new().on_http(parse_rpc_url(rpc_url)?);

        Ok(Self {
            provider,
            bridge_address,
        })
    }
}

#[async_trait]
impl BridgeContract for EvmBridge {
    async fn confirmed_unlocks(&self, sequence_number: U256) -> Result<bool> {
        let contract = BitcoinBridge::new(self.bridge_address, &self.provider);
        let result = contract
            .confirmedUnlocks(sequence_number)
            .call()
            .await
            .map_err(|e| rpc_error("confirmedUnlocks", e))?;
        Ok(result._0)
    }

    async fn attestations(&self, attestation_key: B256) -> Result<U256> {
        let contract = BitcoinBridge::new(self.bridge_address, &self.provider);
        let result = contract
            .attestations(attestation_key)
            .call()
            .await
            .map_err(|e| rpc_error("attestations", e))?;
        Ok(result._0)
    }

    async fn validator_id(&self, validator: Address) -> Result<ValidatorId> {
        let contract = BitcoinBridge::new(self.bridge_address, &self.provider);
        let result = contract
            .validatorIDs(validator)
            .call()
            .await
            .map_err(|e| rpc_error("validatorIDs", e))?;
        Ok(result._0)
    }

    async fn bridge_validators_count(&self) -> Result<u64> {
        let contract = BitcoinBridge::new(self.bridge_address, &self.provider);
        let result = contract
            .bridgeValidatorsCount()
            .call()
            .await
            .map_err(|e| rpc_error("bridgeValidatorsCount", e))?;
        u64::try_from(result._0).map_err(|e| rpc_error("bridgeValidatorsCount", e))
    }

    async fn attestation_threshold(&self) -> Result<u64> {
        let contract = BitcoinBridge::new(self.bridge_address, &self.provider);
        let result = contract
            .attestationThreshold()
            .call()
            .await
            .map_err(|e| rpc_error("attestationThreshold", e))?;
        u64::try_from(result._0).map_err(|e| rpc_error("attestationThreshold", e))
    }

    async fn pending_btc_withdrawals(&self, entry_hash: B256) -> Result<bool> {
        let contract = BitcoinBridge::new(self.bridge_address, &self.provider);
        let result = contract
            .pendingBTCWithdrawals(entry_hash)
            .call()
            .await
            .map_err(|e| rpc_error("pendingBTCWithdrawals", e))?;
        Ok(result._0)
    }
}

type WalletProvider = FillProvider<
    JoinFill<Identity, WalletFiller<EthereumWallet>>,
    RootProvider<Http<Client>>,
    Http<Client>,
    Ethereum,
>;

/// alloy-backed [`TransactionSender`] signing with the validator key.
///
/// Only the wallet filler is installed: nonce, gas price and gas limit are
/// always set explicitly by the submission state machine.
pub struct EvmTransactionSender {
    provider: WalletProvider,
    address: Address,
    bridge_address: Address,
    chain_id: u64,
}

impl EvmTransactionSender {
    pub fn new(
        rpc_url: &str,
        bridge_address: &str,
        chain_id: u64,
        signer: PrivateKeySigner,
    ) -> Result<Self> {
        let bridge_address = Address::from_str(bridge_address)
            .map_err(|e| BridgeOutError::Config(format!("Invalid bridge address: {}", e)))?;
        let address = signer.address();
        let wallet = EthereumWallet::from(signer);
        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .on_http(parse_rpc_url(rpc_url)?);

        info!(
            sender = %address,
            chain_id,
            bridge_address = %bridge_address,
            "EVM transaction sender initialized"
        );

        Ok(Self {
            provider,
            address,
            bridge_address,
            chain_id,
        })
    }

    fn base_request(&self, call: &BridgeCall) -> TransactionRequest {
        TransactionRequest::default()
            .with_from(self.address)
            .with_to(self.bridge_address)
            .with_input(call.calldata())
    }
}

#[async_trait]
impl TransactionSender for EvmTransactionSender {
    fn sender_address(&self) -> Address {
        self.address
    }

    async fn gas_price(&self) -> Result<u128> {
        self.provider
            .get_gas_price()
            .await
            .map_err(|e| rpc_error("eth_gasPrice", e))
    }

    async fn pending_nonce(&self) -> Result<u64> {
        self.provider
            .get_transaction_count(self.address)
            .pending()
            .await
            .map_err(|e| rpc_error("eth_getTransactionCount", e))
    }

    async fn estimate_gas(&self, call: &BridgeCall) -> Result<u64> {
        let tx = self.base_request(call);
        self.provider
            .estimate_gas(&tx)
            .await
            .map_err(|e| rpc_error("eth_estimateGas", e))
    }

    async fn send(&self, call: &BridgeCall, params: &TxParams) -> Result<B256> {
        let tx = self
            .base_request(call)
            .with_nonce(params.nonce)
            .with_gas_price(params.gas_price)
            .with_gas_limit(params.gas_limit)
            .with_chain_id(self.chain_id);

        debug!(
            method = call.name(),
            sequence_number = %call.event().sequence_number,
            nonce = params.nonce,
            gas_price = params.gas_price,
            gas_limit = params.gas_limit,
            "Sending bridge transaction"
        );

        let pending = self
            .provider
            .send_transaction(tx)
            .await
            .map_err(|e| rpc_error("eth_sendRawTransaction", e))?;
        Ok(*pending.tx_hash())
    }

    async fn receipt_status(&self, tx_hash: B256) -> Result<Option<bool>> {
        let receipt = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| rpc_error("eth_getTransactionReceipt", e))?;
        Ok(receipt.map(|r| r.status()))
    }
}

/// [`ChainView`] treating `head - finality_blocks` as finalized
#[derive(Clone)]
pub struct EvmChainView {
    provider: RootProvider<Http<Client>>,
    finality_blocks: u64,
    poll_interval: Duration,
}

impl EvmChainView {
    pub fn new(rpc_url: &str, finality_blocks: u64, poll_interval: Duration) -> Result<Self> {
        let provider = ProviderBuilder::new().on_http(parse_rpc_url(rpc_url)?);
        Ok(Self {
            provider,
            finality_blocks,
            poll_interval,
        })
    }
}

#[async_trait]
impl ChainView for EvmChainView {
    async fn finalized_block(&self) -> Result<u64> {
        let head = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| rpc_error("eth_blockNumber", e))?;
        Ok(head.saturating_sub(self.finality_blocks))
    }

    fn watch_blocks(&self, cancel: CancellationToken) -> BoxStream<'static, u64> {
        finalized_height_stream(self.clone(), self.poll_interval, cancel).boxed()
    }
}

/// Poll `view` for its finalized height, yielding only strictly increasing
/// heights. The first poll happens immediately; the stream ends once `cancel`
/// fires.
pub fn finalized_height_stream<V>(
    view: V,
    poll_interval: Duration,
    cancel: CancellationToken,
) -> impl Stream<Item = u64> + Send + 'static
where
    V: ChainView + 'static,
{
    stream::unfold(
        (view, None::<u64>, true, cancel),
        move |(view, mut last, mut first, cancel)| async move {
            loop {
                if first {
                    first = false;
                    if cancel.is_cancelled() {
                        return None;
                    }
                } else {
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(poll_interval) => {}
                    }
                }

                match view.finalized_block().await {
                    Ok(height) if last.map_or(true, |l| height > l) => {
                        last = Some(height);
                        return Some((height, (view, last, first, cancel)));
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "Failed to read finalized block, will retry");
                    }
                }
            }
        },
    )
}
