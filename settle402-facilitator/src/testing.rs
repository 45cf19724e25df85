//! Scripted chain and fixture builders shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy_primitives::{Address, B256, Bytes, TxHash, U256, address, keccak256};
use alloy_signer_local::PrivateKeySigner;
use alloy_sol_types::SolCall;
use settle402::authorization::{AuthorizationCodec, CodecConfig, SignedAuthorization};
use settle402::chain::{
    ChainError, ChainRegistry, ChainRpc, IEIP3009, MetaTransaction, SettlementReceipt, TransferLog,
};
use settle402::networks::{KNOWN_NETWORKS, NetworkRegistry};
use settle402::signer::sign_authorization;

use crate::audit::MemoryAuditSink;
use crate::crypto::AesGcmCipher;
use crate::directory::{
    Directory, DirectoryConfig, FacilitatorStatus, MasterSecret, NewFacilitator,
};
use crate::engine::{EngineConfig, SettlementEngine};
use crate::monitor::{FundingMonitor, FundingPolicy};
use crate::store::MemoryStore;

pub(crate) const MASTER_SECRET: &str = "test-master-secret";
pub(crate) const OWNER_PASSWORD: &str = "correct horse battery staple";
pub(crate) const OWNER: Address = address!("00000000000000000000000000000000000000aa");
pub(crate) const PAYOUT: Address = address!("00000000000000000000000000000000000000bb");
pub(crate) const USED_NONCE_REASON: &str = "FiatTokenV2: authorization is used or canceled";
pub(crate) const SHORT_BALANCE_REASON: &str = "ERC20: transfer amount exceeds balance";

/// A chain interaction observed by [`MockChain`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChainCall {
    Balance(Address),
    Estimate(Address),
    Send { sender: Address, nonce: B256 },
    Wait(TxHash),
}

#[derive(Default)]
struct MockState {
    balances: HashMap<Address, U256>,
    balance_failure: Option<ChainError>,
    used: HashSet<(Address, B256)>,
    reverts: HashMap<B256, String>,
    timeouts: HashSet<B256>,
    mined: HashMap<TxHash, SettlementReceipt>,
    stalled: HashSet<TxHash>,
    calls: Vec<ChainCall>,
}

/// In-memory [`ChainRpc`] that executes `transferWithAuthorization` calls
/// the way an ERC-3009 token would, minus signature checks.
pub(crate) struct MockChain {
    network_id: String,
    state: Mutex<MockState>,
}

impl MockChain {
    pub(crate) fn new(network_id: &str) -> Arc<Self> {
        Arc::new(Self {
            network_id: network_id.to_owned(),
            state: Mutex::new(MockState::default()),
        })
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub(crate) fn set_balance(&self, address: Address, balance: U256) {
        self.with_state(|s| {
            s.balances.insert(address, balance);
        });
    }

    pub(crate) fn fail_balance_reads(&self, error: ChainError) {
        self.with_state(|s| s.balance_failure = Some(error));
    }

    /// The leg carrying `nonce` is mined but reverts with `reason`.
    pub(crate) fn revert_nonce(&self, nonce: B256, reason: &str) {
        self.with_state(|s| {
            s.reverts.insert(nonce, reason.to_owned());
        });
    }

    /// The leg carrying `nonce` is broadcast but never confirms in time.
    pub(crate) fn stall_nonce(&self, nonce: B256) {
        self.with_state(|s| {
            s.timeouts.insert(nonce);
        });
    }

    pub(crate) fn calls(&self) -> Vec<ChainCall> {
        self.with_state(|s| s.calls.clone())
    }

    pub(crate) fn submitted_nonces(&self) -> Vec<B256> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                ChainCall::Send { nonce, .. } => Some(nonce),
                _ => None,
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl ChainRpc for MockChain {
    fn network_id(&self) -> &str {
        &self.network_id
    }

    async fn get_balance(&self, address: Address) -> Result<U256, ChainError> {
        self.with_state(|s| {
            s.calls.push(ChainCall::Balance(address));
            if let Some(error) = &s.balance_failure {
                return Err(error.clone());
            }
            Ok(s.balances.get(&address).copied().unwrap_or_default())
        })
    }

    async fn estimate_gas(&self, from: Address, _tx: &MetaTransaction) -> Result<u64, ChainError> {
        self.with_state(|s| s.calls.push(ChainCall::Estimate(from)));
        Ok(60_000)
    }

    async fn send_transaction(
        &self,
        signer: &PrivateKeySigner,
        tx: MetaTransaction,
    ) -> Result<TxHash, ChainError> {
        let call = IEIP3009::transferWithAuthorization_1Call::abi_decode(&tx.calldata)
            .map_err(|e| ChainError::Rejected {
                reason: e.to_string(),
            })?;
        let tx_hash = keccak256(&tx.calldata);
        self.with_state(|s| {
            s.calls.push(ChainCall::Send {
                sender: signer.address(),
                nonce: call.nonce,
            });
            if s.used.contains(&(call.from, call.nonce)) {
                return Err(ChainError::Rejected {
                    reason: USED_NONCE_REASON.to_owned(),
                });
            }
            if s.timeouts.contains(&call.nonce) {
                s.stalled.insert(tx_hash);
                return Ok(tx_hash);
            }
            let success = !s.reverts.contains_key(&call.nonce);
            let transfers = if success {
                s.used.insert((call.from, call.nonce));
                vec![TransferLog {
                    token: tx.to,
                    from: call.from,
                    to: call.to,
                    value: call.value,
                }]
            } else {
                Vec::new()
            };
            s.mined.insert(
                tx_hash,
                SettlementReceipt {
                    tx_hash,
                    block_number: Some(100),
                    success,
                    gas_used: 60_000,
                    effective_gas_price: 25_000_000_000,
                    transfers,
                },
            );
            Ok(tx_hash)
        })
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: TxHash,
        timeout: Duration,
    ) -> Result<SettlementReceipt, ChainError> {
        self.with_state(|s| {
            s.calls.push(ChainCall::Wait(tx_hash));
            if s.stalled.contains(&tx_hash) {
                return Err(ChainError::ConfirmationTimeout {
                    tx_hash,
                    timeout_secs: timeout.as_secs(),
                });
            }
            s.mined
                .get(&tx_hash)
                .cloned()
                .ok_or_else(|| ChainError::Transport(format!("unknown transaction {tx_hash}")))
        })
    }

    async fn replay_revert_reason(
        &self,
        _from: Address,
        tx: &MetaTransaction,
        _block: Option<u64>,
    ) -> Option<String> {
        let call = IEIP3009::transferWithAuthorization_1Call::abi_decode(&tx.calldata).ok()?;
        self.with_state(|s| s.reverts.get(&call.nonce).cloned())
    }
}

pub(crate) fn new_facilitator(network_id: &str) -> NewFacilitator {
    NewFacilitator {
        name: "Test Facilitator".to_owned(),
        payout_address: PAYOUT.to_string(),
        owner: OWNER.to_string(),
        network_id: network_id.to_owned(),
        private_key: None,
        owner_password: OWNER_PASSWORD.to_owned(),
        payment_tx_hash: Some(TxHash::repeat_byte(0x42)),
    }
}

/// A directory over an in-memory store with a [`MockChain`] per known network.
pub(crate) struct Fixture {
    pub(crate) store: Arc<MemoryStore>,
    pub(crate) cipher: Arc<AesGcmCipher>,
    pub(crate) audit: Arc<MemoryAuditSink>,
    pub(crate) registry: Arc<NetworkRegistry>,
    pub(crate) codec: AuthorizationCodec,
    pub(crate) directory: Arc<Directory>,
    pub(crate) chains: ChainRegistry,
    mocks: HashMap<String, Arc<MockChain>>,
    pub(crate) payer: PrivateKeySigner,
}

impl Fixture {
    pub(crate) fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let cipher = Arc::new(AesGcmCipher::new(1_000));
        let audit = Arc::new(MemoryAuditSink::new());
        let registry = Arc::new(NetworkRegistry::known().unwrap());
        let directory = Arc::new(Directory::new(
            store.clone(),
            registry.clone(),
            cipher.clone(),
            audit.clone(),
            DirectoryConfig::new(MasterSecret::new(MASTER_SECRET.to_owned())),
        ));
        let mocks: HashMap<String, Arc<MockChain>> = KNOWN_NETWORKS
            .iter()
            .map(|n| (n.id.to_owned(), MockChain::new(n.id)))
            .collect();
        let chains = mocks
            .values()
            .map(|m| m.clone() as Arc<dyn ChainRpc>)
            .collect();
        Self {
            store,
            cipher,
            audit,
            codec: AuthorizationCodec::new(registry.clone(), CodecConfig::default()),
            registry,
            directory,
            chains,
            mocks,
            payer: PrivateKeySigner::random(),
        }
    }

    pub(crate) fn chain(&self, network_id: &str) -> Arc<MockChain> {
        self.mocks[network_id].clone()
    }

    pub(crate) fn monitor(&self, policy: FundingPolicy) -> FundingMonitor {
        FundingMonitor::new(
            self.directory.clone(),
            self.chains.clone(),
            self.audit.clone(),
            policy,
        )
    }

    pub(crate) fn engine(&self, allow_token_override: bool) -> SettlementEngine {
        SettlementEngine::new(
            self.directory.clone(),
            self.chains.clone(),
            self.cipher.clone(),
            self.audit.clone(),
            EngineConfig {
                master_secret: MasterSecret::new(MASTER_SECRET.to_owned()),
                allow_token_override,
            },
        )
    }

    /// Creates a facilitator and marks it funded.
    pub(crate) async fn activated(&self, network_id: &str) -> String {
        let id = self
            .directory
            .create(new_facilitator(network_id))
            .await
            .unwrap();
        self.directory
            .write_status(&id, FacilitatorStatus::Active)
            .await
            .unwrap();
        id
    }

    /// An authorization from the fixture payer, signed for `network_id`.
    pub(crate) async fn signed(
        &self,
        network_id: &str,
        amount: &str,
        to: Address,
    ) -> SignedAuthorization {
        let authorization = self
            .codec
            .build_authorization(self.payer.address(), to, amount, network_id)
            .unwrap();
        let typed = self.codec.typed_data_for(&authorization, network_id).unwrap();
        sign_authorization(&self.payer, &typed).await.unwrap()
    }

    /// Same as [`signed`](Self::signed) with a corrupted signature byte.
    pub(crate) fn with_signature(
        signed: &SignedAuthorization,
        signature: Bytes,
    ) -> SignedAuthorization {
        SignedAuthorization {
            authorization: signed.authorization,
            signature,
        }
    }
}
