//! Facilitator records: creation, lookup, listing and lifecycle.
//!
//! Records live in a [`KeyValueStore`] as camelCase JSON under
//! `facilitator:{id}`. Two sets index them: `facilitators:active` holds every
//! record eligible for routing (anything not paused by its owner), and
//! `facilitators:owner:{address}` holds each owner's records.
//!
//! Records written before facilitators were bound to a network carry no
//! `networkId`/`chainId`. Every read path assigns the configured default
//! network and persists it on first sight; later reads find the fields set
//! and write nothing.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};

use alloy_primitives::{Address, TxHash, hex};
use alloy_signer_local::PrivateKeySigner;
use rand::RngExt;
use rand::rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use settle402::networks::{ChainId, DEFAULT_NETWORK_ID, NetworkRegistry, RegistryError};
use settle402::timestamp::UnixTimestamp;

use crate::audit::{AuditEvent, AuditSink};
use crate::crypto::{CryptoError, KeyCipher, encrypt_off_runtime};
use crate::store::{KeyValueStore, StoreError};

static ADDRESS_FORMAT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("address pattern is valid"));

const ACTIVE_INDEX: &str = "facilitators:active";
const NAME_LEN: std::ops::RangeInclusive<usize> = 3..=50;
const ID_ATTEMPTS: usize = 4;

fn record_key(id: &str) -> String {
    format!("facilitator:{id}")
}

fn owner_index(owner: Address) -> String {
    format!("facilitators:owner:{}", owner.to_string().to_lowercase())
}

/// Errors raised by the [`Directory`].
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    /// Name length outside 3..=50 characters.
    #[error("name must be 3 to 50 characters, got {0}")]
    InvalidName(usize),
    /// An address field is not `0x` followed by 40 hex digits.
    #[error("invalid {field} address `{value}`")]
    InvalidAddress {
        /// Field name.
        field: &'static str,
        /// Rejected input.
        value: String,
    },
    /// The supplied signing key does not parse.
    #[error("invalid facilitator private key")]
    InvalidPrivateKey,
    /// The owner password is empty.
    #[error("owner password must not be empty")]
    EmptyPassword,
    /// The network is not supported.
    #[error(transparent)]
    UnknownNetwork(#[from] RegistryError),
    /// No record with this id.
    #[error("facilitator `{0}` not found")]
    NotFound(String),
    /// The caller does not own the record.
    #[error("caller {caller} does not own facilitator `{id}`")]
    Unauthorized {
        /// Record id.
        id: String,
        /// Rejected caller.
        caller: Address,
    },
    /// Status `Active` may only be set alongside a live balance check.
    #[error("facilitators become active only through a funding check")]
    ActivationRequiresBalanceCheck,
    /// Could not generate an unused id.
    #[error("could not allocate a unique facilitator id")]
    IdExhausted,
    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Key encryption failure.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// Operational state of a facilitator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FacilitatorStatus {
    /// Wallet balance is at or below the deactivation threshold.
    #[default]
    NeedsFunding,
    /// Funded and routable.
    Active,
    /// Paused by its owner.
    Inactive,
}

impl fmt::Display for FacilitatorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NeedsFunding => "needs_funding",
            Self::Active => "active",
            Self::Inactive => "inactive",
        })
    }
}

impl FromStr for FacilitatorStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "needs_funding" => Ok(Self::NeedsFunding),
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            other => Err(format!("unknown facilitator status `{other}`")),
        }
    }
}

/// A stored facilitator.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilitatorRecord {
    /// Opaque unique id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Address of the signing key; pays gas.
    pub wallet_address: Address,
    /// Where the facilitator's share is sent.
    pub payout_address: Address,
    /// Creator, the only principal allowed to delete the record.
    pub owner: Address,
    /// Bound network. Empty on records that predate network binding.
    #[serde(default)]
    pub network_id: String,
    /// Bound chain. Zero on records that predate network binding.
    #[serde(default)]
    pub chain_id: ChainId,
    /// Signing key encrypted under the owner's password.
    pub encrypted_key_user: String,
    /// Signing key encrypted under the system master secret.
    pub encrypted_key_system: String,
    /// Operational state.
    #[serde(default)]
    pub status: FacilitatorStatus,
    /// Confirmed settlements paid by this facilitator.
    #[serde(default)]
    pub total_settlements: u64,
    /// Time of the last confirmed settlement.
    #[serde(default)]
    pub last_used_at: Option<UnixTimestamp>,
    /// Creation time.
    pub created_at: UnixTimestamp,
    /// Transaction that paid the creation fee.
    #[serde(default)]
    pub payment_tx_hash: Option<TxHash>,
}

impl fmt::Debug for FacilitatorRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FacilitatorRecord")
            .field("id", &self.id)
            .field("wallet_address", &self.wallet_address)
            .field("network_id", &self.network_id)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl FacilitatorRecord {
    /// Non-sensitive projection.
    #[must_use]
    pub fn view(&self) -> FacilitatorView {
        FacilitatorView {
            id: self.id.clone(),
            name: self.name.clone(),
            wallet_address: self.wallet_address,
            payout_address: self.payout_address,
            owner: self.owner,
            network_id: self.network_id.clone(),
            chain_id: self.chain_id,
            status: self.status,
            total_settlements: self.total_settlements,
            last_used_at: self.last_used_at,
            created_at: self.created_at,
        }
    }

    fn predates_network_binding(&self) -> bool {
        self.network_id.is_empty() || self.chain_id == 0
    }
}

/// Public fields of a facilitator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilitatorView {
    /// Id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Gas-paying wallet.
    pub wallet_address: Address,
    /// Payout address.
    pub payout_address: Address,
    /// Owner.
    pub owner: Address,
    /// Bound network.
    pub network_id: String,
    /// Bound chain.
    pub chain_id: ChainId,
    /// Operational state.
    pub status: FacilitatorStatus,
    /// Confirmed settlements.
    pub total_settlements: u64,
    /// Last confirmed settlement.
    pub last_used_at: Option<UnixTimestamp>,
    /// Creation time.
    pub created_at: UnixTimestamp,
}

/// Input to [`Directory::create`].
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewFacilitator {
    /// Display name, 3 to 50 characters.
    pub name: String,
    /// Payout address as hex.
    pub payout_address: String,
    /// Owner address as hex.
    pub owner: String,
    /// Network to bind to.
    pub network_id: String,
    /// Existing signing key; a fresh one is generated when absent.
    #[serde(default)]
    pub private_key: Option<String>,
    /// Password protecting the owner's copy of the key.
    pub owner_password: String,
    /// Creation-fee payment, verified by the caller.
    #[serde(default)]
    pub payment_tx_hash: Option<TxHash>,
}

impl fmt::Debug for NewFacilitator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewFacilitator")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("network_id", &self.network_id)
            .finish_non_exhaustive()
    }
}

/// Network filter for [`Directory::list_active`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkFilter {
    /// By network id.
    Name(String),
    /// By EIP-155 chain id.
    ChainId(ChainId),
}

/// A secret that never appears in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct MasterSecret(String);

impl MasterSecret {
    /// Wraps a secret.
    #[must_use]
    pub const fn new(secret: String) -> Self {
        Self(secret)
    }

    /// Returns the secret.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for MasterSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MasterSecret(..)")
    }
}

/// Directory settings.
#[derive(Debug, Clone)]
pub struct DirectoryConfig {
    /// Network assigned to records that predate network binding.
    pub default_network: String,
    /// Secret protecting the system copy of every signing key.
    pub master_secret: MasterSecret,
}

impl DirectoryConfig {
    /// Settings with the built-in default network.
    #[must_use]
    pub fn new(master_secret: MasterSecret) -> Self {
        Self {
            default_network: DEFAULT_NETWORK_ID.to_owned(),
            master_secret,
        }
    }
}

/// CRUD and query layer over facilitator records.
pub struct Directory {
    store: Arc<dyn KeyValueStore>,
    registry: Arc<NetworkRegistry>,
    cipher: Arc<dyn KeyCipher>,
    audit: Arc<dyn AuditSink>,
    config: DirectoryConfig,
}

impl fmt::Debug for Directory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Directory")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn parse_address(field: &'static str, value: &str) -> Result<Address, DirectoryError> {
    let invalid = || DirectoryError::InvalidAddress {
        field,
        value: value.to_owned(),
    };
    if !ADDRESS_FORMAT.is_match(value) {
        return Err(invalid());
    }
    Address::from_str(value).map_err(|_| invalid())
}

impl Directory {
    /// Creates a directory.
    #[must_use]
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        registry: Arc<NetworkRegistry>,
        cipher: Arc<dyn KeyCipher>,
        audit: Arc<dyn AuditSink>,
        config: DirectoryConfig,
    ) -> Self {
        Self {
            store,
            registry,
            cipher,
            audit,
            config,
        }
    }

    /// Returns the network registry.
    #[must_use]
    pub fn registry(&self) -> &NetworkRegistry {
        &self.registry
    }

    /// Validates `input`, encrypts the signing key twice, persists the record
    /// and indexes it. Returns the new id.
    ///
    /// # Errors
    ///
    /// Returns a validation [`DirectoryError`] before any write, or a store or
    /// cipher failure.
    pub async fn create(&self, input: NewFacilitator) -> Result<String, DirectoryError> {
        let name = input.name.trim().to_owned();
        let name_len = name.chars().count();
        if !NAME_LEN.contains(&name_len) {
            return Err(DirectoryError::InvalidName(name_len));
        }
        let payout_address = parse_address("payout", input.payout_address.trim())?;
        let owner = parse_address("owner", input.owner.trim())?;
        let network = self.registry.resolve(input.network_id.trim())?;
        if input.owner_password.is_empty() {
            return Err(DirectoryError::EmptyPassword);
        }
        let signer = match input.private_key.as_deref().map(str::trim) {
            Some(key) => {
                PrivateKeySigner::from_str(key).map_err(|_| DirectoryError::InvalidPrivateKey)?
            }
            None => PrivateKeySigner::random(),
        };
        let key_hex = signer.to_bytes().to_string();
        let encrypted_key_user = encrypt_off_runtime(
            Arc::clone(&self.cipher),
            key_hex.clone().into_bytes(),
            input.owner_password,
        )
        .await?;
        let encrypted_key_system = encrypt_off_runtime(
            Arc::clone(&self.cipher),
            key_hex.into_bytes(),
            self.config.master_secret.expose().to_owned(),
        )
        .await?;

        let id = self.allocate_id().await?;
        let record = FacilitatorRecord {
            id: id.clone(),
            name,
            wallet_address: signer.address(),
            payout_address,
            owner,
            network_id: network.network_id.clone(),
            chain_id: network.chain_id,
            encrypted_key_user,
            encrypted_key_system,
            status: FacilitatorStatus::NeedsFunding,
            total_settlements: 0,
            last_used_at: None,
            created_at: UnixTimestamp::now(),
            payment_tx_hash: input.payment_tx_hash,
        };
        self.save(&record).await?;
        self.store.set_add(ACTIVE_INDEX, &id).await?;
        self.store.set_add(&owner_index(owner), &id).await?;

        tracing::info!(
            facilitator = %id,
            network = %record.network_id,
            wallet = %record.wallet_address,
            "Facilitator created"
        );
        self.audit.append(&AuditEvent::FacilitatorCreated {
            facilitator_id: id.clone(),
            owner,
            network: record.network_id.clone(),
        });
        Ok(id)
    }

    async fn allocate_id(&self) -> Result<String, DirectoryError> {
        for _ in 0..ID_ATTEMPTS {
            let bytes: [u8; 16] = rng().random();
            let id = format!("fac_{}", hex::encode(bytes));
            if self.store.get(&record_key(&id)).await?.is_none() {
                return Ok(id);
            }
        }
        Err(DirectoryError::IdExhausted)
    }

    async fn save(&self, record: &FacilitatorRecord) -> Result<(), DirectoryError> {
        let json = serde_json::to_string(record).map_err(|e| StoreError::Corrupt {
            key: record_key(&record.id),
            reason: e.to_string(),
        })?;
        self.store.set(&record_key(&record.id), json).await?;
        Ok(())
    }

    fn decode(key: &str, raw: &str) -> Result<FacilitatorRecord, StoreError> {
        serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
            key: key.to_owned(),
            reason: e.to_string(),
        })
    }

    /// Fills a missing network binding from a registered descriptor, so the
    /// result never predates network binding again. Returns `true` if the
    /// record changed.
    fn assign_default_network(&self, record: &mut FacilitatorRecord) -> bool {
        if !record.predates_network_binding() {
            return false;
        }
        let known = if record.network_id.is_empty() {
            self.registry.resolve_by_chain_id(record.chain_id)
        } else {
            self.registry.resolve(&record.network_id).ok()
        };
        let fallback = || self.registry.resolve(&self.config.default_network).ok();
        let Some(network) = known.or_else(fallback) else {
            tracing::warn!(
                facilitator = %record.id,
                default_network = %self.config.default_network,
                "Default network is not registered; leaving legacy facilitator unbound"
            );
            return false;
        };
        record.network_id = network.network_id.clone();
        record.chain_id = network.chain_id;
        true
    }

    /// Decodes a stored record and persists the default network if it was missing.
    async fn hydrate(&self, key: &str, raw: &str) -> Result<FacilitatorRecord, DirectoryError> {
        let mut record = Self::decode(key, raw)?;
        if self.assign_default_network(&mut record) {
            tracing::info!(
                facilitator = %record.id,
                network = %record.network_id,
                chain_id = record.chain_id,
                "Assigned default network to legacy facilitator"
            );
            self.save(&record).await?;
        }
        Ok(record)
    }

    /// Loads a record.
    ///
    /// # Errors
    ///
    /// Returns a store failure or a corrupt-record error.
    pub async fn get(&self, id: &str) -> Result<Option<FacilitatorRecord>, DirectoryError> {
        let key = record_key(id);
        match self.store.get(&key).await? {
            Some(raw) => Ok(Some(self.hydrate(&key, &raw).await?)),
            None => Ok(None),
        }
    }

    /// Loads a record, failing if absent.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::NotFound`] if absent.
    pub async fn require(&self, id: &str) -> Result<FacilitatorRecord, DirectoryError> {
        self.get(id)
            .await?
            .ok_or_else(|| DirectoryError::NotFound(id.to_owned()))
    }

    async fn load_many(&self, ids: Vec<String>) -> Result<Vec<FacilitatorRecord>, DirectoryError> {
        let keys: Vec<String> = ids.iter().map(|id| record_key(id)).collect();
        let values = self.store.multi_get(&keys).await?;
        let mut records = Vec::with_capacity(values.len());
        for (key, raw) in keys.iter().zip(values) {
            let Some(raw) = raw else { continue };
            match self.hydrate(key, &raw).await {
                Ok(record) => records.push(record),
                Err(DirectoryError::Store(StoreError::Corrupt { key, reason })) => {
                    tracing::warn!(%key, %reason, "Skipping unreadable facilitator record");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    async fn indexed(&self) -> Result<Vec<FacilitatorRecord>, DirectoryError> {
        let ids = self.store.set_members(ACTIVE_INDEX).await?;
        self.load_many(ids).await
    }

    /// Lists routable facilitators, optionally restricted to one network.
    ///
    /// A chain-id filter is resolved to its network before filtering, and
    /// records are matched on exact network id.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::UnknownNetwork`] if the filter names no
    /// supported network.
    pub async fn list_active(
        &self,
        filter: Option<&NetworkFilter>,
    ) -> Result<Vec<FacilitatorView>, DirectoryError> {
        let network = match filter {
            None => None,
            Some(NetworkFilter::Name(name)) => {
                Some(self.registry.resolve(name)?.network_id.clone())
            }
            Some(NetworkFilter::ChainId(chain_id)) => Some(
                self.registry
                    .resolve_by_chain_id(*chain_id)
                    .ok_or_else(|| RegistryError::UnknownNetwork(chain_id.to_string()))?
                    .network_id
                    .clone(),
            ),
        };
        Ok(self
            .indexed()
            .await?
            .iter()
            .filter(|r| r.status != FacilitatorStatus::Inactive)
            .filter(|r| network.as_ref().is_none_or(|n| &r.network_id == n))
            .map(FacilitatorRecord::view)
            .collect())
    }

    /// Lists every facilitator created by `owner`, including paused ones.
    ///
    /// # Errors
    ///
    /// Returns a store failure.
    pub async fn list_by_owner(
        &self,
        owner: Address,
    ) -> Result<Vec<FacilitatorView>, DirectoryError> {
        let ids = self.store.set_members(&owner_index(owner)).await?;
        Ok(self
            .load_many(ids)
            .await?
            .iter()
            .map(FacilitatorRecord::view)
            .collect())
    }

    /// Sets `NeedsFunding` or `Inactive`. Pausing removes the record from the
    /// routing index; un-pausing restores it.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::ActivationRequiresBalanceCheck`] for `Active`,
    /// or [`DirectoryError::NotFound`].
    pub async fn set_status(
        &self,
        id: &str,
        status: FacilitatorStatus,
    ) -> Result<FacilitatorRecord, DirectoryError> {
        if status == FacilitatorStatus::Active {
            return Err(DirectoryError::ActivationRequiresBalanceCheck);
        }
        self.write_status(id, status).await
    }

    /// Persists `status` without the activation guard. Only the funding
    /// monitor calls this, right after reading the live balance.
    ///
    /// The record is loaded afresh so that settlement counters written while
    /// the caller was waiting on the chain survive; only `status` changes.
    pub(crate) async fn write_status(
        &self,
        id: &str,
        status: FacilitatorStatus,
    ) -> Result<FacilitatorRecord, DirectoryError> {
        let mut record = self.require(id).await?;
        let previous = record.status;
        record.status = status;
        self.save(&record).await?;
        if status == FacilitatorStatus::Inactive {
            self.store.set_remove(ACTIVE_INDEX, &record.id).await?;
        } else if previous == FacilitatorStatus::Inactive {
            self.store.set_add(ACTIVE_INDEX, &record.id).await?;
        }
        tracing::info!(
            facilitator = %record.id,
            from = %previous,
            to = %status,
            "Facilitator status changed"
        );
        Ok(record)
    }

    /// Bumps `totalSettlements` and stamps `lastUsedAt`. Returns the new count.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::NotFound`] or a store failure.
    pub async fn increment_settlement_count(
        &self,
        id: &str,
        at: UnixTimestamp,
    ) -> Result<u64, DirectoryError> {
        let mut record = self.require(id).await?;
        record.total_settlements = record.total_settlements.saturating_add(1);
        record.last_used_at = Some(at);
        self.save(&record).await?;
        Ok(record.total_settlements)
    }

    /// Deletes a record on behalf of `caller`.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::Unauthorized`] unless `caller` is the owner,
    /// or [`DirectoryError::NotFound`].
    pub async fn delete(&self, id: &str, caller: Address) -> Result<(), DirectoryError> {
        let record = self.require(id).await?;
        if record.owner != caller {
            return Err(DirectoryError::Unauthorized {
                id: id.to_owned(),
                caller,
            });
        }
        self.store.del(&record_key(id)).await?;
        self.store.set_remove(ACTIVE_INDEX, id).await?;
        self.store.set_remove(&owner_index(record.owner), id).await?;
        tracing::info!(facilitator = %id, "Facilitator deleted");
        self.audit.append(&AuditEvent::FacilitatorDeleted {
            facilitator_id: id.to_owned(),
            owner: caller,
        });
        Ok(())
    }

    /// Picks the least recently used `Active` facilitator bound to `network_id`.
    ///
    /// # Errors
    ///
    /// Returns [`DirectoryError::UnknownNetwork`] or a store failure.
    pub async fn select_eligible(
        &self,
        network_id: &str,
    ) -> Result<Option<FacilitatorRecord>, DirectoryError> {
        self.registry.resolve(network_id)?;
        Ok(self
            .indexed()
            .await?
            .into_iter()
            .filter(|r| r.status == FacilitatorStatus::Active && r.network_id == network_id)
            .min_by(|a, b| {
                a.last_used_at
                    .cmp(&b.last_used_at)
                    .then_with(|| a.id.cmp(&b.id))
            }))
    }
}
