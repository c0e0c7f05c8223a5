//! Relayer client for gasless Safe transactions.
//!
//! One call posts one signed meta-transaction to one endpoint. The client
//! never retries; escalation belongs to the redemption manager.

use std::time::Duration;

use alloy::primitives::Address;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::error::RelayError;
use crate::signing::{ApiCredentials, SignedMetaTransaction};

/// Longest response body kept in a rejection.
const MAX_ERROR_BODY: usize = 300;

/// Normalized relayer answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct RelayResponse {
    /// Relayer transaction id.
    #[serde(default, alias = "transactionID", alias = "transactionId", alias = "id")]
    pub transaction_id: Option<String>,
    /// On-chain hash, when already known.
    #[serde(default, alias = "transactionHash", alias = "hash")]
    pub transaction_hash: Option<String>,
    /// Relayer state string.
    #[serde(default)]
    pub state: Option<String>,
}

impl RelayResponse {
    /// Best reference for the submitted transaction.
    pub fn reference(&self) -> Option<&str> {
        [self.transaction_hash.as_deref(), self.transaction_id.as_deref()]
            .into_iter()
            .flatten()
            .find(|r| !r.is_empty())
    }
}

/// Transport for posting signed meta-transactions.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Post `tx` to `endpoint` exactly once.
    async fn post(
        &self,
        endpoint: &Url,
        tx: &SignedMetaTransaction,
    ) -> Result<RelayResponse, RelayError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SignatureParams {
    gas_price: String,
    operation: String,
    safe_txn_gas: String,
    base_gas: String,
    gas_token: Address,
    refund_receiver: Address,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RelayRequest<'a> {
    from: Address,
    to: Address,
    proxy_wallet: Address,
    data: String,
    nonce: String,
    signature: String,
    signature_params: SignatureParams,
    #[serde(rename = "type")]
    kind: &'a str,
    metadata: &'a str,
}

impl<'a> RelayRequest<'a> {
    fn from_signed(tx: &'a SignedMetaTransaction) -> Self {
        Self {
            from: tx.from,
            to: tx.to,
            proxy_wallet: tx.safe,
            data: format!("0x{}", hex::encode(&tx.data)),
            nonce: tx.nonce.to_string(),
            signature: format!("0x{}", hex::encode(&tx.signature)),
            signature_params: SignatureParams {
                gas_price: tx.gas_price.to_string(),
                operation: tx.operation.to_string(),
                safe_txn_gas: tx.safe_tx_gas.to_string(),
                base_gas: tx.base_gas.to_string(),
                gas_token: tx.gas_token,
                refund_receiver: tx.refund_receiver,
            },
            kind: "SAFE",
            metadata: "redeem",
        }
    }
}

/// HTTP relay client.
#[derive(Debug, Clone)]
pub struct RelayClient {
    http: reqwest::Client,
    builder: Option<ApiCredentials>,
}

impl RelayClient {
    /// Create a client with fail-fast timeouts.
    pub fn new(
        connect_timeout: Duration,
        request_timeout: Duration,
        builder: Option<ApiCredentials>,
    ) -> Result<Self, RelayError> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout.min(Duration::from_secs(5)))
            .timeout(request_timeout)
            .tcp_nodelay(true)
            .build()
            .map_err(|e| RelayError::Request(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { http, builder })
    }
}

fn classify_send_error(endpoint: &Url, e: reqwest::Error) -> RelayError {
    if e.is_connect() {
        RelayError::Unreachable(format!("{}: {}", endpoint, e))
    } else if e.is_builder() {
        RelayError::Request(e.to_string())
    } else {
        // Anything after the connection may have delivered the body.
        RelayError::Timeout(format!("{}: {}", endpoint, e))
    }
}

#[async_trait]
impl RelayTransport for RelayClient {
    #[instrument(skip(self, tx), fields(endpoint = %endpoint, nonce = %tx.nonce))]
    async fn post(
        &self,
        endpoint: &Url,
        tx: &SignedMetaTransaction,
    ) -> Result<RelayResponse, RelayError> {
        let body = serde_json::to_string(&RelayRequest::from_signed(tx))
            .map_err(|e| RelayError::Request(e.to_string()))?;

        let mut request = self
            .http
            .post(endpoint.clone())
            .header(CONTENT_TYPE, "application/json");

        if let Some(creds) = &self.builder {
            let headers = creds
                .headers("POLY_BUILDER", "POST", endpoint.path(), &body)
                .map_err(|e| RelayError::Request(e.to_string()))?;
            for (key, value) in headers {
                request = request.header(key, value);
            }
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| classify_send_error(endpoint, e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| RelayError::Timeout(format!("{}: reading body: {}", endpoint, e)))?;

        if !status.is_success() {
            let body: String = text.chars().take(MAX_ERROR_BODY).collect();
            warn!(status = status.as_u16(), body = %body, "Relay rejected request");
            return Err(RelayError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: RelayResponse = serde_json::from_str(&text)
            .map_err(|e| RelayError::InvalidResponse(format!("{}: {}", e, text)))?;

        debug!(
            transaction_id = ?parsed.transaction_id,
            transaction_hash = ?parsed.transaction_hash,
            state = ?parsed.state,
            "Relay accepted request"
        );

        Ok(parsed)
    }
}
