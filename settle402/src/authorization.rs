//! ERC-3009 transfer authorizations: construction, typed data and wire form.
//!
//! An authorization is built once per payment attempt by
//! [`AuthorizationCodec::build_authorization`], handed to a wallet as
//! [`TypedData`] for signing, and travels to the facilitator as JSON in which
//! every unsigned integer is a decimal string.

use std::collections::BTreeMap;
use std::sync::Arc;

use alloy_primitives::{Address, B256, Bytes};
use alloy_sol_types::{SolStruct, sol};
use rand::RngExt;
use rand::rng;
use serde::{Deserialize, Serialize};

use crate::amount::{AmountError, TokenAmount, parse_units};
use crate::networks::{DomainParams, NetworkRegistry, RegistryError};
use crate::signature::{self, SignatureError};
use crate::timestamp::UnixTimestamp;

/// Default authorization lifetime, counted from construction.
pub const DEFAULT_WINDOW_SECS: u64 = 300;

/// Backdating applied to `validAfter` to tolerate clock skew between payer and chain.
pub const DEFAULT_CLOCK_SKEW_SECS: u64 = 60;

/// Primary type name of the signed struct.
pub const PRIMARY_TYPE: &str = "TransferWithAuthorization";

sol!(
    /// Solidity layout of the ERC-3009 `TransferWithAuthorization` struct.
    ///
    /// Field order is part of the type hash and must never change.
    #[derive(Debug, PartialEq, Eq)]
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }
);

/// Errors raised by the [`AuthorizationCodec`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// The network is not registered.
    #[error(transparent)]
    UnknownNetwork(#[from] RegistryError),
    /// The decimal amount could not be converted at the token's precision.
    #[error("invalid amount: {0}")]
    InvalidAmount(#[from] AmountError),
    /// `validAfter` is not strictly before `validBefore`.
    #[error("validAfter {valid_after} is not before validBefore {valid_before}")]
    InvalidWindow {
        /// Start of the window.
        valid_after: UnixTimestamp,
        /// End of the window.
        valid_before: UnixTimestamp,
    },
    /// The wire form did not parse.
    #[error("malformed wire form: {0}")]
    Wire(String),
}

/// The message a payer signs: permission for one token transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferAuthorization {
    /// Payer.
    pub from: Address,
    /// Recipient.
    pub to: Address,
    /// Amount in atomic units.
    pub value: TokenAmount,
    /// Earliest second (exclusive) at which the transfer may execute.
    pub valid_after: UnixTimestamp,
    /// Second (exclusive) after which the transfer may no longer execute.
    pub valid_before: UnixTimestamp,
    /// Single-use 32-byte nonce, scoped to `from` and the token contract.
    pub nonce: B256,
}

/// Where `now` falls relative to an authorization's validity window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowCheck {
    /// The contract would accept the timing.
    Open,
    /// `now <= validAfter`.
    NotYetValid,
    /// `now >= validBefore`.
    Expired,
}

impl TransferAuthorization {
    /// Checks `validAfter < validBefore`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::InvalidWindow`] otherwise.
    pub fn validate_window(&self) -> Result<(), CodecError> {
        if self.valid_after < self.valid_before {
            Ok(())
        } else {
            Err(CodecError::InvalidWindow {
                valid_after: self.valid_after,
                valid_before: self.valid_before,
            })
        }
    }

    /// Classifies `now` against the window using the contract's strict bounds.
    #[must_use]
    pub fn window_at(&self, now: UnixTimestamp) -> WindowCheck {
        if now <= self.valid_after {
            WindowCheck::NotYetValid
        } else if now >= self.valid_before {
            WindowCheck::Expired
        } else {
            WindowCheck::Open
        }
    }

    /// Converts into the Solidity struct.
    #[must_use]
    pub fn to_sol(&self) -> TransferWithAuthorization {
        TransferWithAuthorization {
            from: self.from,
            to: self.to,
            value: self.value.into(),
            validAfter: self.valid_after.into(),
            validBefore: self.valid_before.into(),
            nonce: self.nonce,
        }
    }

    /// EIP-712 digest of this authorization under `domain`.
    #[must_use]
    pub fn signing_hash(&self, domain: &DomainParams) -> B256 {
        self.to_sol().eip712_signing_hash(&domain.to_eip712())
    }
}

/// An authorization paired with the payer's 65-byte signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedAuthorization {
    /// The signed message.
    pub authorization: TransferAuthorization,
    /// `r ‖ s ‖ v`, hex-encoded on the wire.
    pub signature: Bytes,
}

impl SignedAuthorization {
    /// Recovers the address that produced the signature under `domain`.
    ///
    /// # Errors
    ///
    /// Returns [`SignatureError`] if the signature is malformed.
    pub fn recover_signer(&self, domain: &DomainParams) -> Result<Address, SignatureError> {
        signature::recover(&self.signature, &self.authorization.signing_hash(domain))
    }
}

/// One `{name, type}` entry of an EIP-712 type schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypedField {
    /// Field name.
    pub name: String,
    /// Solidity type.
    #[serde(rename = "type")]
    pub kind: String,
}

impl TypedField {
    fn new(name: &str, kind: &str) -> Self {
        Self {
            name: name.to_owned(),
            kind: kind.to_owned(),
        }
    }
}

/// The exact structure an external signer hashes and signs
/// (`eth_signTypedData_v4` layout).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedData {
    /// Type schemas, including `EIP712Domain`.
    pub types: BTreeMap<String, Vec<TypedField>>,
    /// Signing domain.
    pub domain: DomainParams,
    /// Always [`PRIMARY_TYPE`].
    pub primary_type: String,
    /// Message body.
    pub message: TransferAuthorization,
}

impl TypedData {
    /// Assembles typed data for `authorization` under `domain`.
    #[must_use]
    pub fn new(authorization: TransferAuthorization, domain: DomainParams) -> Self {
        Self {
            types: schema(),
            domain,
            primary_type: PRIMARY_TYPE.to_owned(),
            message: authorization,
        }
    }

    /// EIP-712 digest the signer must sign.
    #[must_use]
    pub fn signing_hash(&self) -> B256 {
        self.message.signing_hash(&self.domain)
    }

    /// Returns `true` if the schema and primary type are the fixed ERC-3009 ones.
    #[must_use]
    pub fn has_canonical_schema(&self) -> bool {
        self.primary_type == PRIMARY_TYPE && self.types == schema()
    }
}

fn schema() -> BTreeMap<String, Vec<TypedField>> {
    let domain = vec![
        TypedField::new("name", "string"),
        TypedField::new("version", "string"),
        TypedField::new("chainId", "uint256"),
        TypedField::new("verifyingContract", "address"),
    ];
    let transfer = vec![
        TypedField::new("from", "address"),
        TypedField::new("to", "address"),
        TypedField::new("value", "uint256"),
        TypedField::new("validAfter", "uint256"),
        TypedField::new("validBefore", "uint256"),
        TypedField::new("nonce", "bytes32"),
    ];
    BTreeMap::from([
        ("EIP712Domain".to_owned(), domain),
        (PRIMARY_TYPE.to_owned(), transfer),
    ])
}

/// Timing parameters for new authorizations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecConfig {
    /// Seconds from now until `validBefore`.
    pub window_secs: u64,
    /// Seconds subtracted from now for `validAfter`.
    pub clock_skew_secs: u64,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            window_secs: DEFAULT_WINDOW_SECS,
            clock_skew_secs: DEFAULT_CLOCK_SKEW_SECS,
        }
    }
}

/// Builds authorizations and their signing payloads from registry data.
#[derive(Debug, Clone)]
pub struct AuthorizationCodec {
    registry: Arc<NetworkRegistry>,
    config: CodecConfig,
}

impl AuthorizationCodec {
    /// Creates a codec over `registry`.
    #[must_use]
    pub const fn new(registry: Arc<NetworkRegistry>, config: CodecConfig) -> Self {
        Self { registry, config }
    }

    /// Returns the timing configuration.
    #[must_use]
    pub const fn config(&self) -> &CodecConfig {
        &self.config
    }

    /// Builds an authorization for `amount` (a human decimal) on `network_id`,
    /// valid from `now - skew` to `now + window`, with a fresh random nonce.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownNetwork`] or [`CodecError::InvalidAmount`].
    pub fn build_authorization(
        &self,
        from: Address,
        to: Address,
        amount: &str,
        network_id: &str,
    ) -> Result<TransferAuthorization, CodecError> {
        let nonce: [u8; 32] = rng().random();
        self.build_authorization_at(
            from,
            to,
            amount,
            network_id,
            UnixTimestamp::now(),
            B256::from(nonce),
        )
    }

    /// Deterministic variant of [`build_authorization`](Self::build_authorization).
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownNetwork`] or [`CodecError::InvalidAmount`].
    pub fn build_authorization_at(
        &self,
        from: Address,
        to: Address,
        amount: &str,
        network_id: &str,
        now: UnixTimestamp,
        nonce: B256,
    ) -> Result<TransferAuthorization, CodecError> {
        let network = self.registry.resolve(network_id)?;
        let value = parse_units(amount, network.token_decimals)?;
        let authorization = TransferAuthorization {
            from,
            to,
            value: TokenAmount(value),
            valid_after: now.saturating_sub(self.config.clock_skew_secs),
            valid_before: now + self.config.window_secs,
            nonce,
        };
        authorization.validate_window()?;
        Ok(authorization)
    }

    /// Assembles the typed data a wallet must sign for `network_id`.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnknownNetwork`] if the network is not registered.
    pub fn typed_data_for(
        &self,
        authorization: &TransferAuthorization,
        network_id: &str,
    ) -> Result<TypedData, CodecError> {
        let network = self.registry.resolve(network_id)?;
        Ok(TypedData::new(*authorization, network.domain.clone()))
    }
}

/// Serializes a signed authorization into its JSON-safe wire form.
///
/// Integers become decimal strings; addresses, the nonce and the signature
/// stay fixed-length hex.
///
/// # Errors
///
/// Returns [`CodecError::Wire`] if serialization fails.
pub fn to_wire_form(signed: &SignedAuthorization) -> Result<serde_json::Value, CodecError> {
    serde_json::to_value(signed).map_err(|e| CodecError::Wire(e.to_string()))
}

/// Parses the wire form produced by [`to_wire_form`].
///
/// # Errors
///
/// Returns [`CodecError::Wire`] if the value does not have the expected shape,
/// or [`CodecError::InvalidWindow`] if the window is empty.
pub fn from_wire_form(value: serde_json::Value) -> Result<SignedAuthorization, CodecError> {
    let signed: SignedAuthorization =
        serde_json::from_value(value).map_err(|e| CodecError::Wire(e.to_string()))?;
    signed.authorization.validate_window()?;
    Ok(signed)
}
