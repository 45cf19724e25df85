//! Facilitator service for gasless ERC-3009 settlement.
//!
//! A facilitator is a funded wallet that submits payer-signed
//! `transferWithAuthorization` calls and pays their gas. This crate keeps
//! facilitator records, tracks whether their wallets are funded, and runs
//! single and batch settlements against the chains described by
//! [`settle402::NetworkRegistry`].
//!
//! # Modules
//!
//! - [`store`]: key-value capability and its in-memory implementation
//! - [`crypto`]: encryption of facilitator signing keys
//! - [`audit`]: append-only audit trail
//! - [`directory`]: facilitator records
//! - [`monitor`]: funding reconciliation
//! - [`engine`]: the settlement state machine
//! - [`config`]: TOML configuration
//! - [`handlers`], [`error`]: the HTTP surface

pub mod audit;
pub mod config;
pub mod crypto;
pub mod directory;
pub mod engine;
pub mod error;
pub mod handlers;
pub mod monitor;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;

pub use directory::{Directory, FacilitatorRecord, FacilitatorStatus, FacilitatorView};
pub use engine::{
    BatchOutcome, Disposition, SettleError, SettleStage, SettlementEngine, SettlementOutcome,
};
pub use handlers::{AppContext, AppState, router};
pub use monitor::{FundingMonitor, FundingPolicy, FundingReport};
