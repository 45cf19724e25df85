//! Supported EVM networks and their token deployments.
//!
//! Networks are data, not types: each one is a [`NetworkDescriptor`] keyed by
//! a human network id (`"avalanche-fuji"`), and everything downstream branches
//! on looked-up fields. The built-in table lives in [`KNOWN_NETWORKS`];
//! deployments override RPC endpoints and timeouts before handing the
//! descriptors to [`NetworkRegistry::new`].
//!
//! # Domain separation
//!
//! The EIP-712 domain of each token deployment is stored verbatim. Some
//! deployments of USDC sign under the name `"USDC"` rather than `"USD Coin"`;
//! the registry preserves that per network and never normalizes it, because a
//! single differing byte yields a signature the contract rejects.

use std::collections::HashMap;

use alloy_primitives::{Address, U256, address};
use alloy_sol_types::{Eip712Domain, eip712_domain};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::amount::TokenAmount;

/// An EIP-155 chain ID (e.g., 43113 for Avalanche Fuji).
pub type ChainId = u64;

/// Avalanche Fuji (testnet) chain ID.
pub const AVALANCHE_FUJI: ChainId = 43113;

/// Avalanche C-Chain chain ID.
pub const AVALANCHE_MAINNET: ChainId = 43114;

/// Base Sepolia (testnet) chain ID.
pub const BASE_SEPOLIA: ChainId = 84532;

/// Base Mainnet chain ID.
pub const BASE_MAINNET: ChainId = 8453;

/// Polygon Amoy (testnet) chain ID.
pub const POLYGON_AMOY: ChainId = 80002;

/// Polygon Mainnet chain ID.
pub const POLYGON_MAINNET: ChainId = 137;

/// Ethereum Mainnet chain ID.
pub const ETHEREUM_MAINNET: ChainId = 1;

/// USDC on Avalanche Fuji.
pub const USDC_AVALANCHE_FUJI: Address = address!("5425890298aed601595a70AB815c96711a31Bc65");

/// USDC on Avalanche C-Chain.
pub const USDC_AVALANCHE: Address = address!("B97EF9Ef8734C71904D8002F8b6Bc66Dd9c48a6E");

/// USDC on Base Sepolia.
pub const USDC_BASE_SEPOLIA: Address = address!("036CbD53842c5426634e7929541eC2318f3dCF7e");

/// USDC on Base Mainnet.
pub const USDC_BASE: Address = address!("833589fCD6eDb6E08f4c7C32D4f71b54bdA02913");

/// USDC on Polygon Amoy.
pub const USDC_POLYGON_AMOY: Address = address!("41E94Eb71Ef8C9fAE0235d1e472b21E21B5a4dbF");

/// USDC on Polygon Mainnet.
pub const USDC_POLYGON: Address = address!("3c499c542cEF5E3811e1192ce70d8cC03d5c3359");

/// USDC on Ethereum Mainnet.
pub const USDC_ETHEREUM: Address = address!("A0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48");

/// EIP-712 domain version shared by every USDC `FiatTokenV2` deployment.
pub const USDC_DOMAIN_VERSION: &str = "2";

/// Token decimals for USDC.
pub const USDC_DECIMALS: u8 = 6;

/// Network id assigned to facilitator records written before records carried a network.
pub const DEFAULT_NETWORK_ID: &str = "avalanche-fuji";

/// One row of the built-in network table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownNetwork {
    /// Network id (e.g., `"base-sepolia"`).
    pub id: &'static str,
    /// EIP-155 chain ID.
    pub chain_id: ChainId,
    /// Public HTTP RPC endpoint.
    pub rpc_endpoint: &'static str,
    /// Token contract address.
    pub token_address: Address,
    /// Token decimals.
    pub token_decimals: u8,
    /// EIP-712 domain `name` of the token contract, verbatim.
    pub domain_name: &'static str,
    /// EIP-712 domain `version` of the token contract.
    pub domain_version: &'static str,
    /// Native gas currency symbol.
    pub native_symbol: &'static str,
    /// Gas balance (wei) recommended to owners; informational only.
    pub recommended_balance_wei: u128,
    /// Whether the chain prices gas with EIP-1559.
    pub eip1559: bool,
    /// Upper bound on waiting for a receipt, scaled to the chain's block time.
    pub confirmation_timeout_secs: u64,
}

/// Built-in networks.
pub const KNOWN_NETWORKS: &[KnownNetwork] = &[
    KnownNetwork {
        id: "avalanche-fuji",
        chain_id: AVALANCHE_FUJI,
        rpc_endpoint: "https://api.avax-test.network/ext/bc/C/rpc",
        token_address: USDC_AVALANCHE_FUJI,
        token_decimals: USDC_DECIMALS,
        domain_name: "USD Coin",
        domain_version: USDC_DOMAIN_VERSION,
        native_symbol: "AVAX",
        recommended_balance_wei: 100_000_000_000_000_000,
        eip1559: true,
        confirmation_timeout_secs: 30,
    },
    KnownNetwork {
        id: "avalanche",
        chain_id: AVALANCHE_MAINNET,
        rpc_endpoint: "https://api.avax.network/ext/bc/C/rpc",
        token_address: USDC_AVALANCHE,
        token_decimals: USDC_DECIMALS,
        domain_name: "USD Coin",
        domain_version: USDC_DOMAIN_VERSION,
        native_symbol: "AVAX",
        recommended_balance_wei: 100_000_000_000_000_000,
        eip1559: true,
        confirmation_timeout_secs: 30,
    },
    KnownNetwork {
        id: "base-sepolia",
        chain_id: BASE_SEPOLIA,
        rpc_endpoint: "https://sepolia.base.org",
        token_address: USDC_BASE_SEPOLIA,
        token_decimals: USDC_DECIMALS,
        domain_name: "USDC",
        domain_version: USDC_DOMAIN_VERSION,
        native_symbol: "ETH",
        recommended_balance_wei: 10_000_000_000_000_000,
        eip1559: true,
        confirmation_timeout_secs: 30,
    },
    KnownNetwork {
        id: "base",
        chain_id: BASE_MAINNET,
        rpc_endpoint: "https://mainnet.base.org",
        token_address: USDC_BASE,
        token_decimals: USDC_DECIMALS,
        domain_name: "USD Coin",
        domain_version: USDC_DOMAIN_VERSION,
        native_symbol: "ETH",
        recommended_balance_wei: 5_000_000_000_000_000,
        eip1559: true,
        confirmation_timeout_secs: 30,
    },
    KnownNetwork {
        id: "polygon-amoy",
        chain_id: POLYGON_AMOY,
        rpc_endpoint: "https://rpc-amoy.polygon.technology",
        token_address: USDC_POLYGON_AMOY,
        token_decimals: USDC_DECIMALS,
        domain_name: "USDC",
        domain_version: USDC_DOMAIN_VERSION,
        native_symbol: "POL",
        recommended_balance_wei: 1_000_000_000_000_000_000,
        eip1559: true,
        confirmation_timeout_secs: 45,
    },
    KnownNetwork {
        id: "polygon",
        chain_id: POLYGON_MAINNET,
        rpc_endpoint: "https://polygon-rpc.com",
        token_address: USDC_POLYGON,
        token_decimals: USDC_DECIMALS,
        domain_name: "USD Coin",
        domain_version: USDC_DOMAIN_VERSION,
        native_symbol: "POL",
        recommended_balance_wei: 1_000_000_000_000_000_000,
        eip1559: true,
        confirmation_timeout_secs: 45,
    },
    KnownNetwork {
        id: "ethereum",
        chain_id: ETHEREUM_MAINNET,
        rpc_endpoint: "https://eth.llamarpc.com",
        token_address: USDC_ETHEREUM,
        token_decimals: USDC_DECIMALS,
        domain_name: "USD Coin",
        domain_version: USDC_DOMAIN_VERSION,
        native_symbol: "ETH",
        recommended_balance_wei: 50_000_000_000_000_000,
        eip1559: true,
        confirmation_timeout_secs: 90,
    },
];

/// Errors raised while building or querying a [`NetworkRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// No network is registered under this id.
    #[error("unknown network `{0}`")]
    UnknownNetwork(String),
    /// The RPC endpoint is not a valid URL.
    #[error("invalid RPC endpoint for `{network}`: {reason}")]
    InvalidRpcEndpoint {
        /// Network id.
        network: String,
        /// Parser message.
        reason: String,
    },
    /// `domain.chainId` differs from the descriptor's chain ID.
    #[error("domain chain id {domain} does not match chain id {chain} for `{network}`")]
    DomainChainIdMismatch {
        /// Network id.
        network: String,
        /// Chain ID declared by the descriptor.
        chain: ChainId,
        /// Chain ID inside the EIP-712 domain.
        domain: ChainId,
    },
    /// `domain.verifyingContract` differs from the token address.
    #[error("domain verifying contract does not match token address for `{0}`")]
    DomainContractMismatch(String),
    /// Two descriptors share a network id.
    #[error("network `{0}` registered twice")]
    DuplicateNetwork(String),
    /// Two descriptors share a chain ID.
    #[error("chain id {0} registered twice")]
    DuplicateChainId(ChainId),
}

/// EIP-712 domain tuple of a token deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainParams {
    /// Domain `name`, verbatim from the contract.
    pub name: String,
    /// Domain `version`.
    pub version: String,
    /// Domain `chainId`.
    pub chain_id: ChainId,
    /// Domain `verifyingContract`.
    pub verifying_contract: Address,
}

impl DomainParams {
    /// Builds the alloy [`Eip712Domain`] used for hashing.
    #[must_use]
    pub fn to_eip712(&self) -> Eip712Domain {
        eip712_domain! {
            name: self.name.clone(),
            version: self.version.clone(),
            chain_id: self.chain_id,
            verifying_contract: self.verifying_contract,
        }
    }
}

/// Static configuration of one supported network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkDescriptor {
    /// Network id.
    pub network_id: String,
    /// EIP-155 chain ID.
    pub chain_id: ChainId,
    /// HTTP RPC endpoint.
    pub rpc_endpoint: Url,
    /// Transferable asset contract.
    pub token_address: Address,
    /// Asset decimals.
    pub token_decimals: u8,
    /// Signing domain of the asset contract.
    pub domain: DomainParams,
    /// Native gas currency symbol.
    pub native_symbol: String,
    /// Gas balance (wei) recommended to facilitator owners.
    pub recommended_balance: TokenAmount,
    /// Whether the chain prices gas with EIP-1559.
    pub eip1559: bool,
    /// Receipt wait bound in seconds.
    pub confirmation_timeout_secs: u64,
}

impl NetworkDescriptor {
    /// Builds a descriptor from a row of the built-in table.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::InvalidRpcEndpoint`] if the endpoint does not parse.
    pub fn from_known(known: &KnownNetwork) -> Result<Self, RegistryError> {
        let rpc_endpoint =
            Url::parse(known.rpc_endpoint).map_err(|e| RegistryError::InvalidRpcEndpoint {
                network: known.id.to_owned(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            network_id: known.id.to_owned(),
            chain_id: known.chain_id,
            rpc_endpoint,
            token_address: known.token_address,
            token_decimals: known.token_decimals,
            domain: DomainParams {
                name: known.domain_name.to_owned(),
                version: known.domain_version.to_owned(),
                chain_id: known.chain_id,
                verifying_contract: known.token_address,
            },
            native_symbol: known.native_symbol.to_owned(),
            recommended_balance: TokenAmount(U256::from(known.recommended_balance_wei)),
            eip1559: known.eip1559,
            confirmation_timeout_secs: known.confirmation_timeout_secs,
        })
    }

    /// Checks `domain.chainId == chainId` and `domain.verifyingContract == tokenAddress`.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant.
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.domain.chain_id != self.chain_id {
            return Err(RegistryError::DomainChainIdMismatch {
                network: self.network_id.clone(),
                chain: self.chain_id,
                domain: self.domain.chain_id,
            });
        }
        if self.domain.verifying_contract != self.token_address {
            return Err(RegistryError::DomainContractMismatch(
                self.network_id.clone(),
            ));
        }
        Ok(())
    }
}

/// Returns descriptors for every row of [`KNOWN_NETWORKS`].
///
/// # Errors
///
/// Returns [`RegistryError::InvalidRpcEndpoint`] if a built-in endpoint does not parse.
pub fn known_descriptors() -> Result<Vec<NetworkDescriptor>, RegistryError> {
    KNOWN_NETWORKS
        .iter()
        .map(NetworkDescriptor::from_known)
        .collect()
}

/// Immutable lookup table of supported networks.
///
/// Built once at startup and shared behind an `Arc`; there is no mutation
/// after construction.
#[derive(Debug, Clone)]
pub struct NetworkRegistry {
    by_id: HashMap<String, NetworkDescriptor>,
    by_chain_id: HashMap<ChainId, String>,
}

impl NetworkRegistry {
    /// Builds a registry, validating every descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] on a domain invariant violation or a
    /// duplicated network id or chain ID.
    pub fn new(
        descriptors: impl IntoIterator<Item = NetworkDescriptor>,
    ) -> Result<Self, RegistryError> {
        let mut by_id = HashMap::new();
        let mut by_chain_id = HashMap::new();
        for descriptor in descriptors {
            descriptor.validate()?;
            if by_chain_id
                .insert(descriptor.chain_id, descriptor.network_id.clone())
                .is_some()
            {
                return Err(RegistryError::DuplicateChainId(descriptor.chain_id));
            }
            let id = descriptor.network_id.clone();
            if by_id.insert(id.clone(), descriptor).is_some() {
                return Err(RegistryError::DuplicateNetwork(id));
            }
        }
        Ok(Self { by_id, by_chain_id })
    }

    /// Builds a registry from the built-in table.
    ///
    /// # Errors
    ///
    /// See [`NetworkRegistry::new`].
    pub fn known() -> Result<Self, RegistryError> {
        Self::new(known_descriptors()?)
    }

    /// Looks up a network by id.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::UnknownNetwork`] if absent.
    pub fn resolve(&self, network_id: &str) -> Result<&NetworkDescriptor, RegistryError> {
        self.by_id
            .get(network_id)
            .ok_or_else(|| RegistryError::UnknownNetwork(network_id.to_owned()))
    }

    /// Looks up a network by chain ID.
    #[must_use]
    pub fn resolve_by_chain_id(&self, chain_id: ChainId) -> Option<&NetworkDescriptor> {
        self.by_chain_id
            .get(&chain_id)
            .and_then(|id| self.by_id.get(id))
    }

    /// Resolves a caller's hint: a supported network name wins, then a known
    /// chain ID. Returns `None` when neither identifies a network.
    #[must_use]
    pub fn resolve_hint(
        &self,
        network: Option<&str>,
        chain_id: Option<ChainId>,
    ) -> Option<&NetworkDescriptor> {
        network
            .and_then(|name| self.by_id.get(name))
            .or_else(|| chain_id.and_then(|id| self.resolve_by_chain_id(id)))
    }

    /// Returns `true` if `network_id` is registered.
    #[must_use]
    pub fn is_supported(&self, network_id: &str) -> bool {
        self.by_id.contains_key(network_id)
    }

    /// Returns all descriptors sorted by network id.
    #[must_use]
    pub fn list(&self) -> Vec<&NetworkDescriptor> {
        let mut all: Vec<_> = self.by_id.values().collect();
        all.sort_by(|a, b| a.network_id.cmp(&b.network_id));
        all
    }

    /// Returns the number of registered networks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    /// Returns `true` if no networks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}
