//! EVM chain access for settlement.
//!
//! - [`contract`] - ERC-3009 ABI bindings and calldata encoding
//! - [`rpc`] - the per-network [`ChainRpc`] capability and receipt types
//! - [`provider`] - alloy-backed [`Eip155ChainProvider`]
//! - [`nonce`] - pending-aware account nonce tracking
//!
//! Only [`contract`] is available without the `facilitator` feature.

pub mod contract;

/// Pending nonce management for facilitator wallets.
#[cfg(feature = "facilitator")]
pub mod nonce;
/// Alloy-backed EVM chain provider.
#[cfg(feature = "facilitator")]
pub mod provider;
/// Chain RPC capability.
#[cfg(feature = "facilitator")]
pub mod rpc;

pub use contract::*;
#[cfg(feature = "facilitator")]
pub use nonce::*;
#[cfg(feature = "facilitator")]
pub use provider::*;
#[cfg(feature = "facilitator")]
pub use rpc::*;
