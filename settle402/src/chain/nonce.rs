//! Account nonce tracking for facilitator wallets.

use std::sync::Arc;

use alloy_network::Network;
use alloy_primitives::Address;
use alloy_provider::Provider;
use alloy_provider::fillers::NonceManager;
use alloy_transport::TransportResult;
use dashmap::DashMap;
use tokio::sync::Mutex;

/// Last nonce handed out for one sender; `None` until the node has been asked.
type Slot = Arc<Mutex<Option<u64>>>;

/// Hands out account nonces for facilitator wallets.
///
/// A wallet with no known nonce asks the node for its `pending` transaction
/// count, which covers transactions still in the mempool from an earlier run.
/// After that, nonces are counted up locally. The per-wallet lock is held
/// across the node query so two submissions from one wallet never share a
/// nonce.
///
/// Clones share state, so one manager can back several providers for the
/// same chain.
#[derive(Clone, Debug, Default)]
pub struct PendingNonceManager {
    slots: Arc<DashMap<Address, Slot>>,
}

impl PendingNonceManager {
    fn slot(&self, address: Address) -> Slot {
        Arc::clone(self.slots.entry(address).or_default().value())
    }

    /// Makes the next nonce for `address` come from the node again.
    ///
    /// Used after a failed submission or a lost receipt, when it is unknown
    /// whether the transaction reached the mempool.
    pub async fn reset_nonce(&self, address: Address) {
        let slot = self.slots.get(&address).map(|e| Arc::clone(e.value()));
        if let Some(slot) = slot {
            slot.lock().await.take();
        }
    }
}

#[async_trait::async_trait]
impl NonceManager for PendingNonceManager {
    async fn get_next_nonce<P, N>(&self, provider: &P, address: Address) -> TransportResult<u64>
    where
        P: Provider<N>,
        N: Network,
    {
        let slot = self.slot(address);
        let mut last = slot.lock().await;
        let next = match *last {
            Some(previous) => previous + 1,
            None => provider.get_transaction_count(address).pending().await?,
        };
        *last = Some(next);
        Ok(next)
    }
}
