//! Alloy-backed [`ChainRpc`] for EVM networks.

use std::num::NonZeroUsize;
use std::time::Duration;

use alloy_network::{EthereumWallet, TransactionBuilder};
use alloy_primitives::{Address, TxHash, U256};
use alloy_provider::fillers::{
    BlobGasFiller, ChainIdFiller, FillProvider, GasFiller, JoinFill, NonceFiller, WalletFiller,
};
use alloy_provider::{
    Identity, PendingTransactionBuilder, PendingTransactionError, Provider, ProviderBuilder,
    RootProvider, WatchTxError,
};
use alloy_rpc_client::RpcClient;
use alloy_rpc_types_eth::{BlockId, TransactionReceipt, TransactionRequest};
use alloy_signer_local::PrivateKeySigner;
use alloy_transport::TransportError;
use alloy_transport::layers::{FallbackLayer, ThrottleLayer};
use alloy_transport_http::Http;
use dashmap::DashMap;
use tower::ServiceBuilder;
use url::Url;

use super::contract::IEIP3009;
use super::nonce::PendingNonceManager;
use super::rpc::{ChainError, ChainRpc, MetaTransaction, SettlementReceipt, TransferLog};
use crate::networks::{ChainId, NetworkDescriptor};

/// Gas, blob gas, nonce and chain ID fillers.
pub type InnerFiller = JoinFill<
    GasFiller,
    JoinFill<BlobGasFiller, JoinFill<NonceFiller<PendingNonceManager>, ChainIdFiller>>,
>;

/// Filler stack plus a wallet holding one facilitator key.
pub type InnerProvider = FillProvider<
    JoinFill<JoinFill<Identity, InnerFiller>, WalletFiller<EthereumWallet>>,
    RootProvider,
>;

impl From<TransportError> for ChainError {
    fn from(err: TransportError) -> Self {
        err.as_error_resp().map_or_else(
            || Self::Transport(err.to_string()),
            |payload| Self::Rejected {
                reason: Self::revert_reason(&payload.message),
            },
        )
    }
}

/// RPC endpoint with an optional requests-per-second cap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcEndpoint {
    /// HTTP(S) URL.
    pub url: Url,
    /// Requests per second; unlimited when `None`.
    pub rate_limit: Option<u32>,
}

impl From<Url> for RpcEndpoint {
    fn from(url: Url) -> Self {
        Self {
            url,
            rate_limit: None,
        }
    }
}

/// [`ChainRpc`] over JSON-RPC for one EVM network.
///
/// Facilitator keys are decrypted per settlement, so a wallet-bearing
/// provider is assembled for each send on top of a shared [`RpcClient`].
/// All of them share one [`PendingNonceManager`]; a failed submission or an
/// unconfirmed receipt resets the sender's nonce so the next send re-queries
/// the node.
#[derive(Debug)]
pub struct Eip155ChainProvider {
    network_id: String,
    chain_id: ChainId,
    eip1559: bool,
    client: RpcClient,
    reader: RootProvider,
    nonce_manager: PendingNonceManager,
    in_flight: DashMap<TxHash, Address>,
}

impl Eip155ChainProvider {
    /// Creates an RPC client over HTTP endpoints with per-endpoint rate limits.
    ///
    /// Non-HTTP(S) URLs are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Unavailable`] if no HTTP endpoint remains.
    pub fn rpc_client(
        chain_id: ChainId,
        endpoints: &[RpcEndpoint],
    ) -> Result<RpcClient, ChainError> {
        let transports = endpoints
            .iter()
            .filter(|endpoint| matches!(endpoint.url.scheme(), "http" | "https"))
            .map(|endpoint| {
                #[cfg(feature = "telemetry")]
                tracing::info!(
                    chain = chain_id,
                    rpc_url = %endpoint.url,
                    rate_limit = ?endpoint.rate_limit,
                    "Using HTTP transport"
                );
                ServiceBuilder::new()
                    .layer(ThrottleLayer::new(endpoint.rate_limit.unwrap_or(u32::MAX)))
                    .service(Http::new(endpoint.url.clone()))
            })
            .collect::<Vec<_>>();
        let count = NonZeroUsize::new(transports.len()).ok_or_else(|| {
            ChainError::Unavailable(format!("no HTTP RPC endpoint for chain {chain_id}"))
        })?;
        let fallback = ServiceBuilder::new()
            .layer(FallbackLayer::default().with_active_transport_count(count))
            .service(transports);
        Ok(RpcClient::new(fallback, false))
    }

    /// Creates a provider for `network` using its registry endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Unavailable`] if the endpoint is not HTTP(S).
    pub fn from_descriptor(network: &NetworkDescriptor) -> Result<Self, ChainError> {
        Self::new(network, &[RpcEndpoint::from(network.rpc_endpoint.clone())])
    }

    /// Creates a provider for `network` over explicit endpoints.
    ///
    /// # Errors
    ///
    /// Returns [`ChainError::Unavailable`] if no endpoint is HTTP(S).
    pub fn new(network: &NetworkDescriptor, endpoints: &[RpcEndpoint]) -> Result<Self, ChainError> {
        let client = Self::rpc_client(network.chain_id, endpoints)?;
        let reader = RootProvider::new(client.clone());

        #[cfg(feature = "telemetry")]
        tracing::info!(
            network = %network.network_id,
            chain = network.chain_id,
            "Using EVM provider"
        );

        Ok(Self {
            network_id: network.network_id.clone(),
            chain_id: network.chain_id,
            eip1559: network.eip1559,
            client,
            reader,
            nonce_manager: PendingNonceManager::default(),
            in_flight: DashMap::new(),
        })
    }

    /// Returns the EIP-155 chain ID.
    #[must_use]
    pub const fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    fn wallet_provider(&self, signer: &PrivateKeySigner) -> InnerProvider {
        let filler = JoinFill::new(
            GasFiller,
            JoinFill::new(
                BlobGasFiller::default(),
                JoinFill::new(
                    NonceFiller::new(self.nonce_manager.clone()),
                    ChainIdFiller::new(Some(self.chain_id)),
                ),
            ),
        );
        ProviderBuilder::default()
            .filler(filler)
            .wallet(EthereumWallet::from(signer.clone()))
            .connect_client(self.client.clone())
    }

    async fn forget_sender(&self, tx_hash: TxHash) {
        if let Some((_, sender)) = self.in_flight.remove(&tx_hash) {
            self.nonce_manager.reset_nonce(sender).await;
        }
    }
}

/// Awaits a future, optionally instrumenting it with a tracing span.
macro_rules! traced {
    ($fut:expr, $span:expr) => {{
        #[cfg(feature = "telemetry")]
        {
            use tracing::Instrument;
            $fut.instrument($span).await
        }
        #[cfg(not(feature = "telemetry"))]
        {
            $fut.await
        }
    }};
}

fn to_settlement_receipt(receipt: &TransactionReceipt) -> SettlementReceipt {
    let transfers = receipt
        .inner
        .logs()
        .iter()
        .filter_map(|log| log.log_decode::<IEIP3009::Transfer>().ok())
        .map(|log| TransferLog {
            token: log.inner.address,
            from: log.inner.data.from,
            to: log.inner.data.to,
            value: log.inner.data.value,
        })
        .collect();
    SettlementReceipt {
        tx_hash: receipt.transaction_hash,
        block_number: receipt.block_number,
        success: receipt.status(),
        gas_used: receipt.gas_used,
        effective_gas_price: receipt.effective_gas_price,
        transfers,
    }
}

#[async_trait::async_trait]
impl ChainRpc for Eip155ChainProvider {
    fn network_id(&self) -> &str {
        &self.network_id
    }

    async fn get_balance(&self, address: Address) -> Result<U256, ChainError> {
        let balance_fut = self.reader.get_balance(address).into_future();
        let balance = traced!(
            balance_fut,
            tracing::info_span!("get_balance", network = %self.network_id, address = %address)
        )?;
        Ok(balance)
    }

    async fn estimate_gas(&self, from: Address, tx: &MetaTransaction) -> Result<u64, ChainError> {
        let request = TransactionRequest::default()
            .with_from(from)
            .with_to(tx.to)
            .with_input(tx.calldata.clone());
        let gas_fut = self
            .reader
            .estimate_gas(request)
            .block(BlockId::pending())
            .into_future();
        let gas = traced!(
            gas_fut,
            tracing::info_span!("estimate_gas", network = %self.network_id, to = %tx.to)
        )?;
        Ok(gas)
    }

    async fn send_transaction(
        &self,
        signer: &PrivateKeySigner,
        tx: MetaTransaction,
    ) -> Result<TxHash, ChainError> {
        let from = signer.address();
        let mut request = TransactionRequest::default()
            .with_from(from)
            .with_to(tx.to)
            .with_input(tx.calldata.clone());

        if !self.eip1559 {
            let price_fut = self.reader.get_gas_price();
            let price = traced!(
                price_fut,
                tracing::info_span!("get_gas_price", network = %self.network_id)
            )?;
            request.set_gas_price(price);
        }
        let gas_limit = self.estimate_gas(from, &tx).await?;
        request.set_gas_limit(gas_limit);

        let provider = self.wallet_provider(signer);
        let send_fut = provider.send_transaction(request);
        let sent = traced!(
            send_fut,
            tracing::info_span!(
                "send_transaction",
                network = %self.network_id,
                from = %from,
                to = %tx.to
            )
        );
        match sent {
            Ok(pending) => {
                let tx_hash = *pending.tx_hash();
                self.in_flight.insert(tx_hash, from);
                Ok(tx_hash)
            }
            Err(e) => {
                self.nonce_manager.reset_nonce(from).await;
                Err(e.into())
            }
        }
    }

    async fn wait_for_receipt(
        &self,
        tx_hash: TxHash,
        timeout: Duration,
    ) -> Result<SettlementReceipt, ChainError> {
        let watcher = PendingTransactionBuilder::new(self.reader.clone(), tx_hash)
            .with_required_confirmations(1)
            .with_timeout(Some(timeout));
        let receipt_fut = watcher.get_receipt();
        let result = traced!(
            receipt_fut,
            tracing::info_span!("wait_for_receipt", network = %self.network_id, tx = %tx_hash)
        );
        match result {
            Ok(receipt) => {
                self.in_flight.remove(&tx_hash);
                Ok(to_settlement_receipt(&receipt))
            }
            Err(e) => {
                self.forget_sender(tx_hash).await;
                Err(match e {
                    PendingTransactionError::TxWatcher(WatchTxError::Timeout) => {
                        ChainError::ConfirmationTimeout {
                            tx_hash,
                            timeout_secs: timeout.as_secs(),
                        }
                    }
                    PendingTransactionError::TransportError(e) => e.into(),
                    other => ChainError::Transport(other.to_string()),
                })
            }
        }
    }

    async fn replay_revert_reason(
        &self,
        from: Address,
        tx: &MetaTransaction,
        block: Option<u64>,
    ) -> Option<String> {
        let request = TransactionRequest::default()
            .with_from(from)
            .with_to(tx.to)
            .with_input(tx.calldata.clone());
        let at = block.map_or_else(BlockId::latest, |n| BlockId::number(n.saturating_sub(1)));
        let call_fut = self.reader.call(request).block(at).into_future();
        let replayed = traced!(
            call_fut,
            tracing::info_span!("replay_call", network = %self.network_id, to = %tx.to)
        );
        match replayed.map_err(ChainError::from) {
            Err(ChainError::Rejected { reason }) => Some(reason),
            Ok(_) | Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    use super::*;
    use crate::networks::NetworkRegistry;

    /// Answers a JSON-RPC call, echoing the request id.
    struct JsonRpc(Result<Value, Value>);

    impl Respond for JsonRpc {
        fn respond(&self, request: &Request) -> ResponseTemplate {
            let body: Value = serde_json::from_slice(&request.body).unwrap_or_default();
            let mut response = json!({ "jsonrpc": "2.0", "id": body["id"].clone() });
            match &self.0 {
                Ok(result) => response["result"] = result.clone(),
                Err(error) => response["error"] = error.clone(),
            }
            ResponseTemplate::new(200).set_body_json(response)
        }
    }

    async fn provider_for(server: &MockServer) -> Eip155ChainProvider {
        let registry = NetworkRegistry::known().unwrap();
        let network = registry.resolve("avalanche-fuji").unwrap();
        let url = Url::parse(&server.uri()).unwrap();
        Eip155ChainProvider::new(network, &[RpcEndpoint::from(url)]).unwrap()
    }

    #[tokio::test]
    async fn test_get_balance_reads_node() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_getBalance" })))
            .respond_with(JsonRpc(Ok(json!("0xde0b6b3a7640000"))))
            .mount(&server)
            .await;
        let provider = provider_for(&server).await;
        let balance = provider.get_balance(Address::repeat_byte(1)).await.unwrap();
        assert_eq!(balance, U256::from(1_000_000_000_000_000_000u128));
    }

    #[tokio::test]
    async fn test_estimate_gas_revert_is_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_estimateGas" })))
            .respond_with(JsonRpc(Err(json!({
                "code": 3,
                "message": "execution reverted: FiatTokenV2: authorization is used or canceled",
            }))))
            .mount(&server)
            .await;
        let provider = provider_for(&server).await;
        let tx = MetaTransaction {
            to: Address::repeat_byte(2),
            calldata: vec![0u8; 4].into(),
        };
        let err = provider
            .estimate_gas(Address::repeat_byte(1), &tx)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ChainError::Rejected {
                reason: "FiatTokenV2: authorization is used or canceled".into()
            }
        );
    }

    #[tokio::test]
    async fn test_replay_reports_revert_reason() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_call" })))
            .respond_with(JsonRpc(Err(json!({
                "code": 3,
                "message": "execution reverted: ERC20: transfer amount exceeds balance",
            }))))
            .mount(&server)
            .await;
        let provider = provider_for(&server).await;
        let tx = MetaTransaction {
            to: Address::repeat_byte(2),
            calldata: vec![0u8; 4].into(),
        };
        let reason = provider
            .replay_revert_reason(Address::repeat_byte(1), &tx, Some(100))
            .await;
        assert_eq!(
            reason.as_deref(),
            Some("ERC20: transfer amount exceeds balance")
        );
    }

    #[tokio::test]
    async fn test_replay_without_revert_has_no_reason() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "eth_call" })))
            .respond_with(JsonRpc(Ok(json!("0x"))))
            .mount(&server)
            .await;
        let provider = provider_for(&server).await;
        let tx = MetaTransaction {
            to: Address::repeat_byte(2),
            calldata: vec![0u8; 4].into(),
        };
        assert_eq!(
            provider
                .replay_revert_reason(Address::repeat_byte(1), &tx, None)
                .await,
            None
        );
    }

    #[tokio::test]
    async fn test_unreachable_node_is_transport_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        let provider = provider_for(&server).await;
        let err = provider
            .get_balance(Address::repeat_byte(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ChainError::Transport(_)));
    }

    #[test]
    fn test_rpc_client_requires_http_endpoint() {
        let ws = RpcEndpoint::from(Url::parse("wss://example.invalid").unwrap());
        assert!(matches!(
            Eip155ChainProvider::rpc_client(1, &[ws]),
            Err(ChainError::Unavailable(_))
        ));
    }
}
