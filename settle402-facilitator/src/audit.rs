//! Append-only audit trail.
//!
//! Audit events are separate from diagnostics: they record facts about money
//! movement and facilitator lifecycle. Appending is fire-and-forget and must
//! never fail a settlement.

use std::sync::Mutex;

use alloy_primitives::{Address, TxHash, U256};
use serde::Serialize;

/// A fact worth keeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A transfer was mined successfully.
    SettlementConfirmed {
        /// Facilitator that paid the gas.
        facilitator_id: String,
        /// Network id.
        network: String,
        /// Transaction hash.
        tx_hash: TxHash,
        /// Payer.
        from: Address,
        /// Recipient.
        to: Address,
        /// Authorized amount in atomic units.
        amount: U256,
        /// Amount the token reported moving, if a matching log was found.
        transferred: Option<U256>,
        /// Wei spent on gas, from the receipt.
        gas_spent: U256,
    },
    /// A settlement attempt ended without confirmation.
    SettlementFailed {
        /// Facilitator id.
        facilitator_id: String,
        /// Network id, when resolved.
        network: Option<String>,
        /// Broadcast transaction, if any.
        tx_hash: Option<TxHash>,
        /// Last stage reached.
        stage: String,
        /// Failure description.
        reason: String,
    },
    /// A facilitator's balance crossed into the funded state.
    FacilitatorFunded {
        /// Facilitator id.
        facilitator_id: String,
        /// Network id.
        network: String,
        /// Live balance in wei.
        balance: U256,
    },
    /// A facilitator record was created.
    FacilitatorCreated {
        /// Facilitator id.
        facilitator_id: String,
        /// Creator.
        owner: Address,
        /// Bound network.
        network: String,
    },
    /// A facilitator record was deleted by its owner.
    FacilitatorDeleted {
        /// Facilitator id.
        facilitator_id: String,
        /// Owner who deleted it.
        owner: Address,
    },
}

/// Destination for [`AuditEvent`]s.
pub trait AuditSink: Send + Sync {
    /// Records `event`. Must not block or fail the caller.
    fn append(&self, event: &AuditEvent);
}

/// Writes audit events as `tracing` events on the `audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn append(&self, event: &AuditEvent) {
        match serde_json::to_string(event) {
            Ok(json) => tracing::info!(target: "audit", event = %json),
            Err(e) => tracing::error!(target: "audit", error = %e, "unserializable audit event"),
        }
    }
}

/// Keeps audit events in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every event appended so far.
    #[must_use]
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, event: &AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
