//! Reconciles stored facilitator status with live wallet balances.

use std::fmt;
use std::sync::Arc;

use alloy_primitives::U256;
use futures_util::future::join_all;
use serde::Serialize;
use settle402::chain::{ChainError, ChainRegistry};
use settle402::networks::RegistryError;

use crate::audit::{AuditEvent, AuditSink};
use crate::directory::{Directory, DirectoryError, FacilitatorStatus, FacilitatorView};

/// Errors from a funding check.
#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    /// Record lookup or status write failed.
    #[error(transparent)]
    Directory(#[from] DirectoryError),
    /// The record is bound to a network that is no longer registered.
    #[error(transparent)]
    UnknownNetwork(#[from] RegistryError),
    /// No chain RPC is configured for the record's network.
    #[error("no chain provider for network `{0}`")]
    NoChain(String),
    /// The balance read failed.
    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Balance thresholds that drive status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FundingPolicy {
    /// Balances at or below this (wei) mean `NeedsFunding`.
    pub deactivation_threshold: U256,
}

impl FundingPolicy {
    /// Status implied by `balance`.
    #[must_use]
    pub fn status_for(&self, balance: U256) -> FacilitatorStatus {
        if balance <= self.deactivation_threshold {
            FacilitatorStatus::NeedsFunding
        } else {
            FacilitatorStatus::Active
        }
    }
}

/// Outcome of [`FundingMonitor::check_and_reconcile`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FundingReport {
    /// Facilitator id.
    pub facilitator_id: String,
    /// Network the balance was read on.
    pub network_id: String,
    /// Live balance in wei.
    pub balance: U256,
    /// Status after reconciliation.
    pub status: FacilitatorStatus,
    /// Whether the balance is above the deactivation threshold.
    pub is_funded: bool,
    /// Balance suggested to the owner; informational only.
    pub recommended_balance: U256,
    /// Whether the stored status was rewritten.
    pub status_changed: bool,
}

/// Reads live balances and keeps `status` in step with them.
pub struct FundingMonitor {
    directory: Arc<Directory>,
    chains: ChainRegistry,
    audit: Arc<dyn AuditSink>,
    policy: FundingPolicy,
}

impl fmt::Debug for FundingMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FundingMonitor")
            .field("chains", &self.chains)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl FundingMonitor {
    /// Creates a monitor.
    #[must_use]
    pub fn new(
        directory: Arc<Directory>,
        chains: ChainRegistry,
        audit: Arc<dyn AuditSink>,
        policy: FundingPolicy,
    ) -> Self {
        Self {
            directory,
            chains,
            audit,
            policy,
        }
    }

    /// Reads the wallet balance of facilitator `id` on its bound network and
    /// writes the implied status if it differs from the stored one.
    ///
    /// Records paused by their owner keep `Inactive` regardless of balance.
    ///
    /// # Errors
    ///
    /// Returns [`MonitorError`] if the record, network, chain or balance read
    /// is unavailable. Nothing is written on error.
    pub async fn check_and_reconcile(&self, id: &str) -> Result<FundingReport, MonitorError> {
        let record = self.directory.require(id).await?;
        let network = self.directory.registry().resolve(&record.network_id)?;
        let recommended_balance = network.recommended_balance.inner();
        let chain = self
            .chains
            .get(&record.network_id)
            .ok_or_else(|| MonitorError::NoChain(record.network_id.clone()))?;

        let balance = chain.get_balance(record.wallet_address).await?;
        let computed = self.policy.status_for(balance);
        let is_funded = computed == FacilitatorStatus::Active;
        // The owner may have paused the record while the balance was in flight.
        let stored = self.directory.require(id).await?.status;

        let status = if stored == FacilitatorStatus::Inactive || stored == computed {
            stored
        } else {
            let network_id = record.network_id;
            self.directory.write_status(id, computed).await?;
            if computed == FacilitatorStatus::Active {
                tracing::info!(
                    facilitator = %id,
                    network = %network_id,
                    %balance,
                    "Facilitator funded"
                );
                self.audit.append(&AuditEvent::FacilitatorFunded {
                    facilitator_id: id.to_owned(),
                    network: network_id,
                    balance,
                });
            } else {
                tracing::warn!(
                    facilitator = %id,
                    network = %network_id,
                    %balance,
                    "Facilitator needs funding"
                );
            }
            computed
        };

        Ok(FundingReport {
            facilitator_id: id.to_owned(),
            network_id: network.network_id.clone(),
            balance,
            status,
            is_funded,
            recommended_balance,
            status_changed: status != stored,
        })
    }

    /// Reconciles every view concurrently. A failed check leaves that view
    /// as it was and does not affect the others.
    pub async fn reconcile_all(&self, views: Vec<FacilitatorView>) -> Vec<FacilitatorView> {
        let checks = views.into_iter().map(|mut view| async move {
            match self.check_and_reconcile(&view.id).await {
                Ok(report) => view.status = report.status,
                Err(e) => {
                    tracing::warn!(
                        facilitator = %view.id,
                        error = %e,
                        "Funding check failed; keeping cached status"
                    );
                }
            }
            view
        });
        join_all(checks).await
    }
}
