//! Executes signed ERC-3009 authorizations on-chain with a facilitator's key.
//!
//! Every attempt walks `Pending → FacilitatorResolved → KeyDecrypted →
//! Submitted → Confirmed`. Failures carry the last stage reached and a
//! [`Disposition`] telling the caller whether retrying is meaningful:
//!
//! - [`Disposition::Terminal`]: the input or the authorization is bad; a
//!   retry with the same input fails the same way.
//! - [`Disposition::Ambiguous`]: transport trouble or a confirmation timeout;
//!   the transaction may still land, so re-query before resubmitting.
//! - [`Disposition::Fatal`]: misconfiguration, such as a master secret that
//!   cannot decrypt stored keys.
//!
//! Batches run legs strictly one after another: leg `i + 1` is not submitted
//! until leg `i` is confirmed, because every leg is signed by the same
//! account and shares its transaction nonce sequence.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy_primitives::{Address, Bytes, TxHash, U256};
use alloy_signer_local::PrivateKeySigner;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use settle402::authorization::{SignedAuthorization, WindowCheck};
use settle402::chain::{
    ChainError, ChainRegistry, ChainRpc, MetaTransaction, transfer_with_authorization_calldata,
};
use settle402::networks::{ChainId, NetworkDescriptor, RegistryError};
use settle402::signature::{SignatureError, SignatureParts};
use settle402::timestamp::UnixTimestamp;

use crate::audit::{AuditEvent, AuditSink};
use crate::crypto::{KeyCipher, decrypt_off_runtime};
use crate::directory::{Directory, DirectoryError, FacilitatorRecord, MasterSecret};

/// Progress of one settlement attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SettleStage {
    /// Nothing resolved yet.
    Pending,
    /// Record and network resolved.
    FacilitatorResolved,
    /// Signing key available.
    KeyDecrypted,
    /// Transaction broadcast.
    Submitted,
    /// Receipt received.
    Confirmed,
}

impl fmt::Display for SettleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::FacilitatorResolved => "facilitator_resolved",
            Self::KeyDecrypted => "key_decrypted",
            Self::Submitted => "submitted",
            Self::Confirmed => "confirmed",
        })
    }
}

/// Whether a failed attempt may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Retrying the same input fails again.
    Terminal,
    /// The outcome is unknown.
    Ambiguous,
    /// Operator intervention required.
    Fatal,
}

/// Errors from settlement.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettleError {
    /// No facilitator with this id.
    #[error("facilitator `{0}` not found")]
    FacilitatorNotFound(String),
    /// No `Active` facilitator is bound to the network.
    #[error("no active facilitator on `{0}`")]
    NoEligibleFacilitator(String),
    /// The requested or bound network is not registered.
    #[error(transparent)]
    UnknownNetwork(#[from] RegistryError),
    /// The request targets a network other than the facilitator's.
    #[error("facilitator `{facilitator_id}` is bound to `{bound}`, not `{requested}`")]
    NetworkMismatch {
        /// Facilitator id.
        facilitator_id: String,
        /// Network the record is bound to.
        bound: String,
        /// Network the request resolved to.
        requested: String,
    },
    /// No RPC is configured for the network.
    #[error("no chain provider for network `{0}`")]
    ChainUnavailable(String),
    /// The system copy of the signing key did not decrypt.
    #[error("failed to decrypt signing key of facilitator `{0}`")]
    DecryptionFailed(String),
    /// The decrypted key is not a valid secp256k1 key.
    #[error("stored signing key of facilitator `{0}` is invalid")]
    InvalidSigningKey(String),
    /// `validBefore` has passed.
    #[error("authorization expired at {valid_before}")]
    AuthorizationExpired {
        /// End of the window.
        valid_before: UnixTimestamp,
    },
    /// `validAfter` has not passed yet.
    #[error("authorization not valid until after {valid_after}")]
    AuthorizationNotYetValid {
        /// Start of the window.
        valid_after: UnixTimestamp,
    },
    /// The 65-byte signature does not decompose.
    #[error("invalid signature: {0}")]
    InvalidSignature(#[from] SignatureError),
    /// A token override was supplied while overrides are disabled.
    #[error("token override {requested} rejected; network token is {expected}")]
    TokenOverrideRejected {
        /// Address in the request.
        requested: Address,
        /// Registry token.
        expected: Address,
    },
    /// A batch with no legs.
    #[error("batch contains no authorizations")]
    EmptyBatch,
    /// The chain refused or reverted the transfer.
    #[error("settlement failed: {reason}")]
    SettlementFailed {
        /// Revert reason or node message.
        reason: String,
        /// Mined transaction, if the failure happened on-chain.
        tx_hash: Option<TxHash>,
    },
    /// No receipt within the network's confirmation timeout.
    #[error("no confirmation for {tx_hash} after {timeout_secs}s")]
    ConfirmationTimeout {
        /// Broadcast transaction.
        tx_hash: TxHash,
        /// Elapsed wait.
        timeout_secs: u64,
    },
    /// RPC transport failure.
    #[error("transport error during {stage}: {message}")]
    Transport {
        /// Stage reached before the failure.
        stage: SettleStage,
        /// Transport message.
        message: String,
    },
    /// Store failure while reading the record.
    #[error("directory error: {0}")]
    Directory(String),
}

impl SettleError {
    /// Last stage reached before the failure.
    #[must_use]
    pub const fn stage(&self) -> SettleStage {
        match self {
            Self::FacilitatorNotFound(_)
            | Self::NoEligibleFacilitator(_)
            | Self::EmptyBatch
            | Self::Directory(_) => SettleStage::Pending,
            Self::UnknownNetwork(_)
            | Self::NetworkMismatch { .. }
            | Self::ChainUnavailable(_)
            | Self::DecryptionFailed(_)
            | Self::InvalidSigningKey(_) => SettleStage::FacilitatorResolved,
            Self::AuthorizationExpired { .. }
            | Self::AuthorizationNotYetValid { .. }
            | Self::InvalidSignature(_)
            | Self::TokenOverrideRejected { .. }
            | Self::SettlementFailed { tx_hash: None, .. } => SettleStage::KeyDecrypted,
            Self::SettlementFailed { tx_hash: Some(_), .. } | Self::ConfirmationTimeout { .. } => {
                SettleStage::Submitted
            }
            Self::Transport { stage, .. } => *stage,
        }
    }

    /// Whether retrying is meaningful.
    #[must_use]
    pub const fn disposition(&self) -> Disposition {
        match self {
            Self::DecryptionFailed(_) | Self::InvalidSigningKey(_) | Self::ChainUnavailable(_) => {
                Disposition::Fatal
            }
            Self::ConfirmationTimeout { .. } | Self::Transport { .. } | Self::Directory(_) => {
                Disposition::Ambiguous
            }
            _ => Disposition::Terminal,
        }
    }

    /// Hash of a transaction that reached the chain, if any.
    #[must_use]
    pub const fn tx_hash(&self) -> Option<TxHash> {
        match self {
            Self::SettlementFailed { tx_hash, .. } => *tx_hash,
            Self::ConfirmationTimeout { tx_hash, .. } => Some(*tx_hash),
            _ => None,
        }
    }

    fn from_chain(error: ChainError, stage: SettleStage, network_id: &str) -> Self {
        match error {
            ChainError::Rejected { reason } => Self::SettlementFailed {
                reason: ChainError::revert_reason(&reason),
                tx_hash: None,
            },
            ChainError::ConfirmationTimeout {
                tx_hash,
                timeout_secs,
            } => Self::ConfirmationTimeout {
                tx_hash,
                timeout_secs,
            },
            ChainError::Transport(message) => Self::Transport { stage, message },
            ChainError::Unavailable(_) => Self::ChainUnavailable(network_id.to_owned()),
        }
    }
}

impl From<DirectoryError> for SettleError {
    fn from(error: DirectoryError) -> Self {
        match error {
            DirectoryError::NotFound(id) => Self::FacilitatorNotFound(id),
            DirectoryError::UnknownNetwork(e) => Self::UnknownNetwork(e),
            other => Self::Directory(other.to_string()),
        }
    }
}

/// How the caller identified the network, if at all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkHint {
    /// Network id.
    #[serde(default)]
    pub network: Option<String>,
    /// EIP-155 chain id.
    #[serde(default)]
    pub chain_id: Option<ChainId>,
}

/// Caller-supplied token contract, checked in field order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenHint {
    /// Explicit token contract.
    #[serde(default)]
    pub token_address: Option<Address>,
    /// Alternate field some clients send instead.
    #[serde(default)]
    pub asset: Option<Address>,
}

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Secret protecting the system copy of signing keys.
    pub master_secret: MasterSecret,
    /// Whether requests may name a token contract other than the registry's.
    pub allow_token_override: bool,
}

/// One confirmed transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementOutcome {
    /// Confirmed transaction.
    pub tx_hash: TxHash,
    /// Network it was mined on.
    pub network_id: String,
    /// Facilitator that paid the gas.
    pub facilitator_id: String,
    /// Including block.
    pub block_number: Option<u64>,
    /// Wei spent on gas, from the receipt.
    pub gas_spent: U256,
    /// Amount the token's `Transfer` event reported moving.
    pub transferred: Option<U256>,
    /// Whether the settlement counter was incremented.
    pub counter_updated: bool,
}

/// The leg that stopped a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    /// Zero-based position in the batch.
    pub index: usize,
    /// What went wrong.
    pub error: SettleError,
}

impl Serialize for BatchFailure {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("BatchFailure", 5)?;
        s.serialize_field("index", &self.index)?;
        s.serialize_field("error", &self.error.to_string())?;
        s.serialize_field("stage", &self.error.stage())?;
        s.serialize_field("disposition", &self.error.disposition())?;
        s.serialize_field("txHash", &self.error.tx_hash())?;
        s.end()
    }
}

/// Result of [`SettlementEngine::settle_batch`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    /// Legs confirmed before the batch stopped, in order.
    pub confirmed: Vec<SettlementOutcome>,
    /// The failing leg; later legs were never submitted.
    pub failure: Option<BatchFailure>,
    /// Gas spent across confirmed legs.
    pub total_gas_spent: U256,
}

impl BatchOutcome {
    /// Hashes of confirmed legs.
    #[must_use]
    pub fn tx_hashes(&self) -> Vec<TxHash> {
        self.confirmed.iter().map(|o| o.tx_hash).collect()
    }

    /// Whether every leg confirmed.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        self.failure.is_none()
    }
}

/// A facilitator ready to submit on one network.
struct Submitter<'a> {
    record: FacilitatorRecord,
    network: &'a NetworkDescriptor,
    chain: Arc<dyn ChainRpc>,
    signer: PrivateKeySigner,
}

/// Settles signed authorizations through facilitator wallets.
pub struct SettlementEngine {
    directory: Arc<Directory>,
    chains: ChainRegistry,
    cipher: Arc<dyn KeyCipher>,
    audit: Arc<dyn AuditSink>,
    config: EngineConfig,
}

impl fmt::Debug for SettlementEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SettlementEngine")
            .field("chains", &self.chains)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SettlementEngine {
    /// Creates an engine.
    #[must_use]
    pub fn new(
        directory: Arc<Directory>,
        chains: ChainRegistry,
        cipher: Arc<dyn KeyCipher>,
        audit: Arc<dyn AuditSink>,
        config: EngineConfig,
    ) -> Self {
        Self {
            directory,
            chains,
            cipher,
            audit,
            config,
        }
    }

    /// Settles one authorization through facilitator `facilitator_id`.
    ///
    /// The network is the hinted name if supported, else the hinted chain id
    /// if known, else the facilitator's own; a resolved network other than
    /// the facilitator's fails before any chain I/O.
    ///
    /// # Errors
    ///
    /// Returns [`SettleError`]; see [`SettleError::stage`] and
    /// [`SettleError::disposition`].
    pub async fn settle(
        &self,
        facilitator_id: &str,
        hint: &NetworkHint,
        token: TokenHint,
        signed: &SignedAuthorization,
    ) -> Result<SettlementOutcome, SettleError> {
        let mut resolved: Option<&NetworkDescriptor> = None;
        let result: Result<SettlementOutcome, SettleError> = async {
            let record = self.directory.require(facilitator_id).await?;
            let network = self.effective_network(&record, hint)?;
            resolved = Some(network);
            let submitter = self.prepare(record, network).await?;
            self.execute(&submitter, token, signed).await
        }
        .await;
        if let Err(e) = &result {
            self.record_failure(facilitator_id, resolved, e);
        }
        result
    }

    /// Settles through the least recently used `Active` facilitator on the
    /// hinted network.
    ///
    /// # Errors
    ///
    /// Returns [`SettleError::UnknownNetwork`] if the hint names no network,
    /// [`SettleError::NoEligibleFacilitator`] if none is funded, or any error
    /// of [`settle`](Self::settle).
    pub async fn settle_any(
        &self,
        hint: &NetworkHint,
        token: TokenHint,
        signed: &SignedAuthorization,
    ) -> Result<SettlementOutcome, SettleError> {
        let network = self
            .directory
            .registry()
            .resolve_hint(hint.network.as_deref(), hint.chain_id)
            .ok_or_else(|| {
                RegistryError::UnknownNetwork(
                    hint.network
                        .clone()
                        .or_else(|| hint.chain_id.map(|id| id.to_string()))
                        .unwrap_or_default(),
                )
            })?;
        let record = self
            .directory
            .select_eligible(&network.network_id)
            .await?
            .ok_or_else(|| SettleError::NoEligibleFacilitator(network.network_id.clone()))?;
        self.settle(&record.id, hint, token, signed).await
    }

    /// Settles `authorizations` in order through facilitator `facilitator_id`
    /// on `network_id`, stopping at the first failure.
    ///
    /// Legs confirmed before the failure stay confirmed and are returned
    /// alongside it.
    ///
    /// # Errors
    ///
    /// Fails without touching the chain if the batch is empty, the record is
    /// missing, the network is unknown or differs from the facilitator's, or
    /// the key cannot be decrypted. Per-leg failures are reported in
    /// [`BatchOutcome::failure`].
    pub async fn settle_batch(
        &self,
        facilitator_id: &str,
        network_id: &str,
        authorizations: &[SignedAuthorization],
        token: TokenHint,
    ) -> Result<BatchOutcome, SettleError> {
        let mut resolved: Option<&NetworkDescriptor> = None;
        let prepared: Result<Submitter<'_>, SettleError> = async {
            if authorizations.is_empty() {
                return Err(SettleError::EmptyBatch);
            }
            let record = self.directory.require(facilitator_id).await?;
            let network = self.directory.registry().resolve(network_id)?;
            resolved = Some(network);
            self.ensure_bound(&record, network)?;
            self.prepare(record, network).await
        }
        .await;
        let submitter = match prepared {
            Ok(submitter) => submitter,
            Err(e) => {
                self.record_failure(facilitator_id, resolved, &e);
                return Err(e);
            }
        };

        let mut outcome = BatchOutcome {
            confirmed: Vec::with_capacity(authorizations.len()),
            failure: None,
            total_gas_spent: U256::ZERO,
        };
        for (index, signed) in authorizations.iter().enumerate() {
            match self.execute(&submitter, token, signed).await {
                Ok(leg) => {
                    outcome.total_gas_spent =
                        outcome.total_gas_spent.saturating_add(leg.gas_spent);
                    outcome.confirmed.push(leg);
                }
                Err(error) => {
                    tracing::warn!(
                        facilitator = %facilitator_id,
                        index,
                        confirmed = outcome.confirmed.len(),
                        %error,
                        "Batch stopped"
                    );
                    self.record_failure(facilitator_id, Some(submitter.network), &error);
                    outcome.failure = Some(BatchFailure { index, error });
                    break;
                }
            }
        }
        Ok(outcome)
    }

    fn effective_network(
        &self,
        record: &FacilitatorRecord,
        hint: &NetworkHint,
    ) -> Result<&NetworkDescriptor, SettleError> {
        let registry = self.directory.registry();
        let network = match registry.resolve_hint(hint.network.as_deref(), hint.chain_id) {
            Some(network) => network,
            None => {
                if hint.network.is_some() || hint.chain_id.is_some() {
                    tracing::warn!(
                        facilitator = %record.id,
                        network = ?hint.network,
                        chain_id = ?hint.chain_id,
                        "Unrecognized network hint; using bound network"
                    );
                }
                registry.resolve(&record.network_id)?
            }
        };
        self.ensure_bound(record, network)?;
        Ok(network)
    }

    fn ensure_bound(
        &self,
        record: &FacilitatorRecord,
        network: &NetworkDescriptor,
    ) -> Result<(), SettleError> {
        if record.network_id == network.network_id {
            Ok(())
        } else {
            Err(SettleError::NetworkMismatch {
                facilitator_id: record.id.clone(),
                bound: record.network_id.clone(),
                requested: network.network_id.clone(),
            })
        }
    }

    async fn prepare<'a>(
        &self,
        record: FacilitatorRecord,
        network: &'a NetworkDescriptor,
    ) -> Result<Submitter<'a>, SettleError> {
        let chain = self
            .chains
            .get(&network.network_id)
            .ok_or_else(|| SettleError::ChainUnavailable(network.network_id.clone()))?;
        let plaintext = decrypt_off_runtime(
            Arc::clone(&self.cipher),
            record.encrypted_key_system.clone(),
            self.config.master_secret.expose().to_owned(),
        )
        .await
        .map_err(|e| {
            tracing::error!(
                facilitator = %record.id,
                error = %e,
                "Cannot decrypt facilitator key with the master secret"
            );
            SettleError::DecryptionFailed(record.id.clone())
        })?;
        let signer = std::str::from_utf8(&plaintext)
            .ok()
            .and_then(|key| PrivateKeySigner::from_str(key.trim()).ok())
            .ok_or_else(|| {
                tracing::error!(
                    facilitator = %record.id,
                    "Decrypted facilitator key is not a valid private key"
                );
                SettleError::InvalidSigningKey(record.id.clone())
            })?;
        Ok(Submitter {
            record,
            network,
            chain,
            signer,
        })
    }

    fn resolve_token(
        &self,
        network: &NetworkDescriptor,
        token: TokenHint,
    ) -> Result<Address, SettleError> {
        let expected = network.token_address;
        match token.token_address.or(token.asset) {
            None => Ok(expected),
            Some(requested) if requested == expected => Ok(expected),
            Some(requested) => {
                tracing::warn!(
                    network = %network.network_id,
                    %requested,
                    %expected,
                    "Request overrides the network token contract"
                );
                if self.config.allow_token_override {
                    Ok(requested)
                } else {
                    Err(SettleError::TokenOverrideRejected {
                        requested,
                        expected,
                    })
                }
            }
        }
    }

    async fn execute(
        &self,
        submitter: &Submitter<'_>,
        token: TokenHint,
        signed: &SignedAuthorization,
    ) -> Result<SettlementOutcome, SettleError> {
        let authorization = &signed.authorization;
        match authorization.window_at(UnixTimestamp::now()) {
            WindowCheck::Open => {}
            WindowCheck::Expired => {
                return Err(SettleError::AuthorizationExpired {
                    valid_before: authorization.valid_before,
                });
            }
            WindowCheck::NotYetValid => {
                return Err(SettleError::AuthorizationNotYetValid {
                    valid_after: authorization.valid_after,
                });
            }
        }
        let parts = SignatureParts::decompose(&signed.signature)?;
        let token_address = self.resolve_token(submitter.network, token)?;
        let network_id = submitter.network.network_id.as_str();
        let facilitator_id = submitter.record.id.as_str();

        let tx = MetaTransaction {
            to: token_address,
            calldata: Bytes::from(transfer_with_authorization_calldata(authorization, &parts)),
        };
        let tx_hash = submitter
            .chain
            .send_transaction(&submitter.signer, tx.clone())
            .await
            .map_err(|e| SettleError::from_chain(e, SettleStage::KeyDecrypted, network_id))?;
        tracing::info!(
            facilitator = %facilitator_id,
            network = %network_id,
            %tx_hash,
            "Settlement submitted"
        );

        let timeout = Duration::from_secs(submitter.network.confirmation_timeout_secs);
        let receipt = submitter
            .chain
            .wait_for_receipt(tx_hash, timeout)
            .await
            .map_err(|e| match SettleError::from_chain(e, SettleStage::Submitted, network_id) {
                SettleError::SettlementFailed { reason, .. } => SettleError::SettlementFailed {
                    reason,
                    tx_hash: Some(tx_hash),
                },
                other => other,
            })?;
        if !receipt.success {
            let replayed = submitter
                .chain
                .replay_revert_reason(submitter.signer.address(), &tx, receipt.block_number)
                .await;
            let reason = replayed.map_or_else(
                || "transaction reverted".to_owned(),
                |reason| format!("transaction reverted: {reason}"),
            );
            return Err(SettleError::SettlementFailed {
                reason,
                tx_hash: Some(receipt.tx_hash),
            });
        }

        let gas_spent = receipt.gas_spent();
        let transferred = receipt.transferred(token_address, authorization.from, authorization.to);
        let counter_updated = match self
            .directory
            .increment_settlement_count(facilitator_id, UnixTimestamp::now())
            .await
        {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(
                    facilitator = %facilitator_id,
                    %tx_hash,
                    error = %e,
                    "Settlement confirmed but counter update failed"
                );
                false
            }
        };
        tracing::info!(
            facilitator = %facilitator_id,
            network = %network_id,
            %tx_hash,
            %gas_spent,
            "Settlement confirmed"
        );
        self.audit.append(&AuditEvent::SettlementConfirmed {
            facilitator_id: facilitator_id.to_owned(),
            network: network_id.to_owned(),
            tx_hash,
            from: authorization.from,
            to: authorization.to,
            amount: authorization.value.inner(),
            transferred,
            gas_spent,
        });
        Ok(SettlementOutcome {
            tx_hash,
            network_id: network_id.to_owned(),
            facilitator_id: facilitator_id.to_owned(),
            block_number: receipt.block_number,
            gas_spent,
            transferred,
            counter_updated,
        })
    }

    fn record_failure(
        &self,
        facilitator_id: &str,
        network: Option<&NetworkDescriptor>,
        error: &SettleError,
    ) {
        if error.disposition() == Disposition::Terminal {
            tracing::warn!(
                facilitator = %facilitator_id,
                stage = %error.stage(),
                %error,
                "Settlement failed"
            );
        }
        self.audit.append(&AuditEvent::SettlementFailed {
            facilitator_id: facilitator_id.to_owned(),
            network: network.map(|n| n.network_id.clone()),
            tx_hash: error.tx_hash(),
            stage: error.stage().to_string(),
            reason: error.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::address;
    use settle402::authorization::TransferAuthorization;
    use settle402::networks::USDC_BASE_SEPOLIA;

    use super::*;
    use crate::testing::{ChainCall, Fixture, SHORT_BALANCE_REASON, USED_NONCE_REASON};

    const MERCHANT: Address = address!("000000000000000000000000000000000000c0de");

    fn base_sepolia() -> NetworkHint {
        NetworkHint {
            network: Some("base-sepolia".into()),
            chain_id: None,
        }
    }

    async fn counter(fx: &Fixture, id: &str) -> u64 {
        fx.directory.require(id).await.unwrap().total_settlements
    }

    #[tokio::test]
    async fn test_settles_two_and_a_half_usdc() {
        let fx = Fixture::new();
        let id = fx.activated("base-sepolia").await;
        let signed = fx.signed("base-sepolia", "2.50", MERCHANT).await;
        assert_eq!(signed.authorization.value.inner(), U256::from(2_500_000u64));

        let outcome = fx
            .engine(true)
            .settle(&id, &base_sepolia(), TokenHint::default(), &signed)
            .await
            .unwrap();
        assert_eq!(outcome.transferred, Some(U256::from(2_500_000u64)));
        assert_eq!(outcome.gas_spent, U256::from(60_000u64 * 25_000_000_000));
        assert!(outcome.counter_updated);
        assert_eq!(counter(&fx, &id).await, 1);
        assert!(fx.directory.require(&id).await.unwrap().last_used_at.is_some());

        let wallet = fx.directory.require(&id).await.unwrap().wallet_address;
        assert_eq!(
            fx.chain("base-sepolia").calls()[0],
            ChainCall::Send {
                sender: wallet,
                nonce: signed.authorization.nonce
            }
        );
        assert!(fx.audit.events().iter().any(|e| matches!(
            e,
            AuditEvent::SettlementConfirmed { tx_hash, amount, .. }
                if *tx_hash == outcome.tx_hash && *amount == U256::from(2_500_000u64)
        )));
    }

    #[tokio::test]
    async fn test_replayed_nonce_fails_and_keeps_counter() {
        let fx = Fixture::new();
        let id = fx.activated("base-sepolia").await;
        let engine = fx.engine(true);
        let signed = fx.signed("base-sepolia", "1", MERCHANT).await;
        engine
            .settle(&id, &base_sepolia(), TokenHint::default(), &signed)
            .await
            .unwrap();
        assert_eq!(counter(&fx, &id).await, 1);

        let err = engine
            .settle(&id, &base_sepolia(), TokenHint::default(), &signed)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SettleError::SettlementFailed {
                reason: USED_NONCE_REASON.into(),
                tx_hash: None
            }
        );
        assert_eq!(err.disposition(), Disposition::Terminal);
        assert_eq!(counter(&fx, &id).await, 1);
    }

    #[tokio::test]
    async fn test_mined_revert_reports_reason_and_keeps_counter() {
        let fx = Fixture::new();
        let id = fx.activated("base-sepolia").await;
        let signed = fx.signed("base-sepolia", "2.50", MERCHANT).await;
        fx.chain("base-sepolia")
            .revert_nonce(signed.authorization.nonce, SHORT_BALANCE_REASON);

        let err = fx
            .engine(true)
            .settle(&id, &base_sepolia(), TokenHint::default(), &signed)
            .await
            .unwrap_err();
        let SettleError::SettlementFailed { reason, tx_hash } = &err else {
            panic!("expected a settlement failure, got {err:?}");
        };
        assert!(reason.contains(SHORT_BALANCE_REASON), "{reason}");
        assert!(tx_hash.is_some());
        assert_eq!(err.stage(), SettleStage::Submitted);
        assert_eq!(err.disposition(), Disposition::Terminal);
        assert_eq!(counter(&fx, &id).await, 0);
        assert!(fx.directory.require(&id).await.unwrap().last_used_at.is_none());
        assert!(fx.audit.events().iter().any(|e| matches!(
            e,
            AuditEvent::SettlementFailed { network: Some(network), tx_hash: Some(_), .. }
                if network == "base-sepolia"
        )));
        assert!(!fx
            .audit
            .events()
            .iter()
            .any(|e| matches!(e, AuditEvent::SettlementConfirmed { .. })));
    }

    #[tokio::test]
    async fn test_batch_stops_at_first_failure() {
        let fx = Fixture::new();
        let id = fx.activated("base-sepolia").await;
        let a = fx.signed("base-sepolia", "1.00", MERCHANT).await;
        let b = fx.signed("base-sepolia", "0.10", MERCHANT).await;
        let c = fx.signed("base-sepolia", "0.05", MERCHANT).await;
        let chain = fx.chain("base-sepolia");
        chain.revert_nonce(b.authorization.nonce, SHORT_BALANCE_REASON);

        let legs = [a.clone(), b.clone(), c.clone()];
        let outcome = fx
            .engine(true)
            .settle_batch(&id, "base-sepolia", &legs, TokenHint::default())
            .await
            .unwrap();
        assert_eq!(outcome.confirmed.len(), 1);
        let failure = outcome.failure.as_ref().unwrap();
        assert_eq!(failure.index, 1);
        assert!(matches!(
            failure.error,
            SettleError::SettlementFailed { tx_hash: Some(_), .. }
        ));
        assert_eq!(failure.error.stage(), SettleStage::Submitted);
        assert_eq!(outcome.total_gas_spent, outcome.confirmed[0].gas_spent);
        assert_eq!(
            chain.submitted_nonces(),
            vec![a.authorization.nonce, b.authorization.nonce]
        );
        assert!(!chain.submitted_nonces().contains(&c.authorization.nonce));
        assert_eq!(counter(&fx, &id).await, 1);
    }

    #[tokio::test]
    async fn test_batch_waits_for_each_leg_before_the_next() {
        let fx = Fixture::new();
        let id = fx.activated("base-sepolia").await;
        let legs = vec![
            fx.signed("base-sepolia", "1", MERCHANT).await,
            fx.signed("base-sepolia", "2", MERCHANT).await,
            fx.signed("base-sepolia", "3", MERCHANT).await,
        ];
        let outcome = fx
            .engine(true)
            .settle_batch(&id, "base-sepolia", &legs, TokenHint::default())
            .await
            .unwrap();
        assert!(outcome.is_complete());
        assert_eq!(outcome.tx_hashes().len(), 3);
        assert_eq!(
            outcome.total_gas_spent,
            U256::from(3 * 60_000u64 * 25_000_000_000)
        );
        let calls = fx.chain("base-sepolia").calls();
        let kinds: Vec<_> = calls
            .iter()
            .map(|c| matches!(c, ChainCall::Send { .. }))
            .collect();
        assert_eq!(kinds, vec![true, false, true, false, true, false]);
        assert_eq!(counter(&fx, &id).await, 3);
    }

    #[tokio::test]
    async fn test_network_mismatch_before_chain_io() {
        let fx = Fixture::new();
        let id = fx.activated("base-sepolia").await;
        let signed = fx.signed("avalanche-fuji", "1", MERCHANT).await;
        let engine = fx.engine(true);

        let hint = NetworkHint {
            network: None,
            chain_id: Some(43113),
        };
        let err = engine
            .settle(&id, &hint, TokenHint::default(), &signed)
            .await
            .unwrap_err();
        assert!(matches!(err, SettleError::NetworkMismatch { .. }));

        let err = engine
            .settle_batch(&id, "avalanche-fuji", &[signed], TokenHint::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SettleError::NetworkMismatch { .. }));
        assert!(fx.chain("base-sepolia").calls().is_empty());
        assert!(fx.chain("avalanche-fuji").calls().is_empty());
    }

    #[tokio::test]
    async fn test_unrecognized_hint_falls_back_to_bound_network() {
        let fx = Fixture::new();
        let id = fx.activated("base-sepolia").await;
        let signed = fx.signed("base-sepolia", "1", MERCHANT).await;
        let hint = NetworkHint {
            network: Some("mystery-net".into()),
            chain_id: Some(999_999),
        };
        let outcome = fx
            .engine(true)
            .settle(&id, &hint, TokenHint::default(), &signed)
            .await
            .unwrap();
        assert_eq!(outcome.network_id, "base-sepolia");
    }

    #[tokio::test]
    async fn test_confirmation_timeout_is_ambiguous() {
        let fx = Fixture::new();
        let id = fx.activated("base-sepolia").await;
        let signed = fx.signed("base-sepolia", "1", MERCHANT).await;
        fx.chain("base-sepolia").stall_nonce(signed.authorization.nonce);

        let err = fx
            .engine(true)
            .settle(&id, &base_sepolia(), TokenHint::default(), &signed)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SettleError::ConfirmationTimeout {
                timeout_secs: 30,
                ..
            }
        ));
        assert_eq!(err.disposition(), Disposition::Ambiguous);
        assert_eq!(err.stage(), SettleStage::Submitted);
        assert!(err.tx_hash().is_some());
        assert_eq!(counter(&fx, &id).await, 0);
    }

    #[tokio::test]
    async fn test_wrong_master_secret_is_fatal() {
        let fx = Fixture::new();
        let id = fx.activated("base-sepolia").await;
        let signed = fx.signed("base-sepolia", "1", MERCHANT).await;
        let engine = SettlementEngine::new(
            fx.directory.clone(),
            fx.chains.clone(),
            fx.cipher.clone(),
            fx.audit.clone(),
            EngineConfig {
                master_secret: MasterSecret::new("rotated-without-migration".into()),
                allow_token_override: true,
            },
        );
        let err = engine
            .settle(&id, &base_sepolia(), TokenHint::default(), &signed)
            .await
            .unwrap_err();
        assert_eq!(err, SettleError::DecryptionFailed(id.clone()));
        assert_eq!(err.disposition(), Disposition::Fatal);
        assert_eq!(err.stage(), SettleStage::FacilitatorResolved);
        assert!(fx.chain("base-sepolia").calls().is_empty());
    }

    #[tokio::test]
    async fn test_token_override_policy() {
        let fx = Fixture::new();
        let id = fx.activated("base-sepolia").await;
        let other = address!("00000000000000000000000000000000000070c0");
        let signed = fx.signed("base-sepolia", "1", MERCHANT).await;
        let token = TokenHint {
            token_address: None,
            asset: Some(other),
        };

        let err = fx
            .engine(false)
            .settle(&id, &base_sepolia(), token, &signed)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SettleError::TokenOverrideRejected {
                requested: other,
                expected: USDC_BASE_SEPOLIA
            }
        );

        let same = TokenHint {
            token_address: Some(USDC_BASE_SEPOLIA),
            asset: Some(other),
        };
        let outcome = fx
            .engine(false)
            .settle(&id, &base_sepolia(), same, &signed)
            .await
            .unwrap();
        assert_eq!(outcome.transferred, Some(U256::from(1_000_000u64)));

        let fresh = fx.signed("base-sepolia", "1", MERCHANT).await;
        let outcome = fx
            .engine(true)
            .settle(&id, &base_sepolia(), token, &fresh)
            .await
            .unwrap();
        assert_eq!(outcome.transferred, Some(U256::from(1_000_000u64)));
    }

    #[tokio::test]
    async fn test_rejects_closed_window_and_bad_signature_without_chain_io() {
        let fx = Fixture::new();
        let id = fx.activated("base-sepolia").await;
        let engine = fx.engine(true);
        let signed = fx.signed("base-sepolia", "1", MERCHANT).await;

        let expired = SignedAuthorization {
            authorization: TransferAuthorization {
                valid_after: UnixTimestamp::from_secs(1),
                valid_before: UnixTimestamp::from_secs(2),
                ..signed.authorization
            },
            signature: signed.signature.clone(),
        };
        assert!(matches!(
            engine
                .settle(&id, &base_sepolia(), TokenHint::default(), &expired)
                .await,
            Err(SettleError::AuthorizationExpired { .. })
        ));

        let truncated = Fixture::with_signature(&signed, Bytes::from(vec![0u8; 64]));
        let err = engine
            .settle(&id, &base_sepolia(), TokenHint::default(), &truncated)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            SettleError::InvalidSignature(SignatureError::InvalidLength(64))
        );
        assert_eq!(err.stage(), SettleStage::KeyDecrypted);
        assert!(fx.chain("base-sepolia").calls().is_empty());
    }

    #[tokio::test]
    async fn test_settle_any_picks_active_facilitator() {
        let fx = Fixture::new();
        let engine = fx.engine(true);
        let signed = fx.signed("base-sepolia", "1", MERCHANT).await;
        assert_eq!(
            engine
                .settle_any(&base_sepolia(), TokenHint::default(), &signed)
                .await
                .unwrap_err(),
            SettleError::NoEligibleFacilitator("base-sepolia".into())
        );
        let id = fx.activated("base-sepolia").await;
        let outcome = engine
            .settle_any(&base_sepolia(), TokenHint::default(), &signed)
            .await
            .unwrap();
        assert_eq!(outcome.facilitator_id, id);
    }

    #[tokio::test]
    async fn test_empty_batch_and_missing_facilitator() {
        let fx = Fixture::new();
        let engine = fx.engine(true);
        assert_eq!(
            engine
                .settle_batch("fac_missing", "base", &[], TokenHint::default())
                .await
                .unwrap_err(),
            SettleError::EmptyBatch
        );
        let signed = fx.signed("base", "1", MERCHANT).await;
        assert_eq!(
            engine
                .settle("fac_missing", &NetworkHint::default(), TokenHint::default(), &signed)
                .await
                .unwrap_err(),
            SettleError::FacilitatorNotFound("fac_missing".into())
        );
    }
}
