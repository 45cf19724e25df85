//! The per-network chain capability consumed by settlement and funding checks.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, Bytes, TxHash, U256};
use alloy_signer_local::PrivateKeySigner;
use serde::Serialize;

/// Target and calldata of a contract call sent by a facilitator wallet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaTransaction {
    /// Target contract address.
    pub to: Address,
    /// Encoded function call.
    pub calldata: Bytes,
}

/// An ERC-20 `Transfer` event found in a receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferLog {
    /// Emitting token contract.
    pub token: Address,
    /// Sender.
    pub from: Address,
    /// Recipient.
    pub to: Address,
    /// Amount in atomic units.
    pub value: U256,
}

/// Receipt of a mined transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementReceipt {
    /// Transaction hash.
    pub tx_hash: TxHash,
    /// Block that included it.
    pub block_number: Option<u64>,
    /// `false` if execution reverted.
    pub success: bool,
    /// Gas consumed.
    pub gas_used: u64,
    /// Price paid per gas unit (wei).
    pub effective_gas_price: u128,
    /// Token transfers emitted during execution.
    pub transfers: Vec<TransferLog>,
}

impl SettlementReceipt {
    /// Wei actually paid for gas.
    #[must_use]
    pub fn gas_spent(&self) -> U256 {
        U256::from(self.gas_used) * U256::from(self.effective_gas_price)
    }

    /// Sum of `token` transfers from `from` to `to`.
    #[must_use]
    pub fn transferred(&self, token: Address, from: Address, to: Address) -> Option<U256> {
        self.transfers
            .iter()
            .filter(|t| t.token == token && t.from == from && t.to == to)
            .map(|t| t.value)
            .reduce(|a, b| a.saturating_add(b))
    }
}

/// Errors from chain I/O.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    /// The node refused the call (revert during estimation, bad nonce,
    /// insufficient gas funds). Nothing was broadcast.
    #[error("rejected by node: {reason}")]
    Rejected {
        /// Node-provided reason.
        reason: String,
    },
    /// No receipt arrived within the timeout. The transaction may still land.
    #[error("no receipt for {tx_hash} after {timeout_secs}s")]
    ConfirmationTimeout {
        /// Broadcast transaction.
        tx_hash: TxHash,
        /// Elapsed wait.
        timeout_secs: u64,
    },
    /// The node could not be reached or answered garbage.
    #[error("transport error: {0}")]
    Transport(String),
    /// The provider could not be built.
    #[error("chain provider unavailable: {0}")]
    Unavailable(String),
}

impl ChainError {
    /// Extracts the revert reason from a node message such as
    /// `execution reverted: FiatTokenV2: invalid signature`.
    #[must_use]
    pub fn revert_reason(message: &str) -> String {
        message
            .strip_prefix("execution reverted: ")
            .unwrap_or(message)
            .to_owned()
    }
}

/// Blockchain RPC for one network.
///
/// `send_transaction` and `wait_for_receipt` are separate so callers can
/// record that a transaction was broadcast before blocking on confirmation.
#[async_trait::async_trait]
pub trait ChainRpc: Send + Sync {
    /// Network id this RPC serves.
    fn network_id(&self) -> &str;

    /// Native-token balance of `address` in wei.
    async fn get_balance(&self, address: Address) -> Result<U256, ChainError>;

    /// Gas a call would consume if sent by `from`.
    async fn estimate_gas(&self, from: Address, tx: &MetaTransaction) -> Result<u64, ChainError>;

    /// Signs `tx` with `signer`, broadcasts it and returns its hash.
    async fn send_transaction(
        &self,
        signer: &PrivateKeySigner,
        tx: MetaTransaction,
    ) -> Result<TxHash, ChainError>;

    /// Blocks until `tx_hash` is mined or `timeout` elapses.
    async fn wait_for_receipt(
        &self,
        tx_hash: TxHash,
        timeout: Duration,
    ) -> Result<SettlementReceipt, ChainError>;

    /// Re-executes `tx` from `from` against the state before `block` and
    /// returns the reason the node gives for reverting, if any.
    async fn replay_revert_reason(
        &self,
        from: Address,
        tx: &MetaTransaction,
        block: Option<u64>,
    ) -> Option<String>;
}

/// Chain RPCs keyed by network id.
#[derive(Clone, Default)]
pub struct ChainRegistry(HashMap<String, Arc<dyn ChainRpc>>);

impl fmt::Debug for ChainRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut networks: Vec<_> = self.0.keys().collect();
        networks.sort();
        f.debug_struct("ChainRegistry")
            .field("networks", &networks)
            .finish()
    }
}

impl ChainRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `rpc` under its network id, replacing any previous entry.
    pub fn insert(&mut self, rpc: Arc<dyn ChainRpc>) {
        self.0.insert(rpc.network_id().to_owned(), rpc);
    }

    /// Returns the RPC for `network_id`.
    #[must_use]
    pub fn get(&self, network_id: &str) -> Option<Arc<dyn ChainRpc>> {
        self.0.get(network_id).cloned()
    }

    /// Returns `true` if no RPC is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Arc<dyn ChainRpc>> for ChainRegistry {
    fn from_iter<T: IntoIterator<Item = Arc<dyn ChainRpc>>>(iter: T) -> Self {
        let mut registry = Self::new();
        for rpc in iter {
            registry.insert(rpc);
        }
        registry
    }
}
