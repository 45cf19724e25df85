#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Gasless ERC-3009 settlement primitives for the x402 payment pattern.
//!
//! A payer signs a `TransferWithAuthorization` message off-chain; a
//! facilitator submits it on-chain and pays the gas. This crate holds the
//! pieces both sides share:
//!
//! - [`networks`] - the [`NetworkRegistry`] of supported EVM networks, token
//!   deployments and their EIP-712 signing domains
//! - [`authorization`] - the [`AuthorizationCodec`]: building authorizations,
//!   typed data for wallets, and the string-encoded wire form
//! - [`amount`], [`timestamp`] - 256-bit-safe wire types
//! - [`signature`] - 65-byte signature decomposition into (v, r, s)
//! - [`signer`] - the wallet signing capability (`client` feature)
//! - [`chain`] - contract bindings, plus the chain RPC capability and the
//!   alloy-backed provider (`facilitator` feature)
//!
//! # Feature Flags
//!
//! - `client` - local private-key signing
//! - `facilitator` - JSON-RPC providers for settlement
//! - `telemetry` - tracing spans around RPC calls
//! - `full` - all of the above

pub mod amount;
pub mod authorization;
pub mod chain;
pub mod networks;
pub mod signature;
#[cfg(feature = "client")]
pub mod signer;
pub mod timestamp;

pub use amount::{AmountError, TokenAmount, parse_units};
pub use authorization::{
    AuthorizationCodec, CodecConfig, CodecError, SignedAuthorization, TransferAuthorization,
    TypedData, WindowCheck,
};
pub use networks::{ChainId, DomainParams, NetworkDescriptor, NetworkRegistry, RegistryError};
pub use signature::{SignatureError, SignatureParts};
#[cfg(feature = "client")]
pub use signer::{AuthorizationSigner, SignError, sign_authorization};
pub use timestamp::UnixTimestamp;
