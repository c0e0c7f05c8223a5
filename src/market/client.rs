//! Polymarket CLOB client.

use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::{Address, U256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::Signer;
use alloy::sol_types::{Eip712Domain, SolStruct};
use async_trait::async_trait;
use polymarket_client_sdk::clob::types::SignatureType;
use reqwest::Method;
use rust_decimal::Decimal;
use tracing::{debug, instrument};

use super::types::{
    order_amounts, order_type, side_code, side_name, CancelOrderBody, ClobOrder, PostOrderBody,
    SignedOrderBody, CTF_EXCHANGE, NEG_RISK_CTF_EXCHANGE,
};
use crate::config::Config;
use crate::error::{ConfigError, EngineError, OrderError};
use crate::signing::{self, ApiCredentials};
use crate::trading::execution::{ExchangeApi, SubmitResult};
use crate::trading::order::{OrderRequest, OrderState, OrderStatus};

/// Polymarket CLOB API client.
pub struct ClobClient {
    http: reqwest::Client,
    clob_url: String,
    signer: PrivateKeySigner,
    credentials: ApiCredentials,
    signature_type: u8,
    maker: Address,
    domain: Eip712Domain,
}

impl std::fmt::Debug for ClobClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClobClient")
            .field("clob_url", &self.clob_url)
            .field("signer", &self.signer.address())
            .field("maker", &self.maker)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

impl ClobClient {
    /// Create a client from config. L2 API credentials are required.
    pub fn new(config: &Config) -> Result<Self, EngineError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.http_timeout_ms))
            .connect_timeout(Duration::from_millis(500))
            .tcp_nodelay(true)
            .tcp_keepalive(Duration::from_secs(30))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        let signer = signing::create_signer(&config.polymarket_private_key)?;
        let credentials = config.clob_credentials().ok_or_else(|| {
            ConfigError::Invalid(
                "POLYMARKET_API_KEY, POLYMARKET_API_SECRET and POLYMARKET_API_PASSPHRASE are required"
                    .to_string(),
            )
        })?;

        // Proxy and Safe wallets fund orders from the funder address.
        let proxied = !matches!(
            signing::signature_type_from_u8(config.polymarket_signature_type),
            SignatureType::Eoa
        );
        let maker = match (&config.polymarket_funder, proxied) {
            (Some(funder), true) => funder
                .parse()
                .map_err(|e| ConfigError::Invalid(format!("POLYMARKET_FUNDER: {}", e)))?,
            _ => signer.address(),
        };

        let exchange = if config.polymarket_neg_risk {
            NEG_RISK_CTF_EXCHANGE
        } else {
            CTF_EXCHANGE
        };
        let domain = Eip712Domain::new(
            Some("Polymarket CTF Exchange".into()),
            Some("1".into()),
            Some(U256::from(config.chain_id)),
            Some(exchange),
            None,
        );

        Ok(Self {
            http,
            clob_url: config.polymarket_clob_url.trim_end_matches('/').to_string(),
            signer,
            credentials,
            signature_type: config.polymarket_signature_type,
            maker,
            domain,
        })
    }

    /// Address that funds orders.
    pub fn maker(&self) -> Address {
        self.maker
    }

    async fn sign_order(&self, request: &OrderRequest) -> Result<SignedOrderBody, OrderError> {
        let _timer = crate::metrics::timer_signing();
        let token_id = U256::from_str(&request.market_token_id)
            .map_err(|e| OrderError::Validation(format!("token id: {}", e)))?;
        let (maker_amount, taker_amount) =
            order_amounts(request.side, request.limit_price, request.size).ok_or_else(|| {
                OrderError::Validation("order amounts out of range".to_string())
            })?;
        let salt = chrono::Utc::now().timestamp_millis().unsigned_abs();

        let order = ClobOrder {
            salt: U256::from(salt),
            maker: self.maker,
            signer: self.signer.address(),
            taker: Address::ZERO,
            tokenId: token_id,
            makerAmount: maker_amount,
            takerAmount: taker_amount,
            expiration: U256::ZERO,
            nonce: U256::ZERO,
            feeRateBps: U256::ZERO,
            side: side_code(request.side),
            signatureType: self.signature_type,
        };

        let hash = order.eip712_signing_hash(&self.domain);
        let signature = self
            .signer
            .sign_hash(&hash)
            .await
            .map_err(|e| OrderError::Signing(e.to_string()))?;

        Ok(SignedOrderBody {
            salt,
            maker: self.maker.to_checksum(None),
            signer: self.signer.address().to_checksum(None),
            taker: Address::ZERO.to_checksum(None),
            token_id: request.market_token_id.clone(),
            maker_amount: maker_amount.to_string(),
            taker_amount: taker_amount.to_string(),
            expiration: "0".to_string(),
            nonce: "0".to_string(),
            fee_rate_bps: "0".to_string(),
            side: side_name(request.side).to_string(),
            signature_type: self.signature_type,
            signature: format!("0x{}", hex::encode(signature.as_bytes())),
        })
    }

    /// Authenticated request with L2 headers.
    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<String>,
    ) -> Result<reqwest::Response, OrderError> {
        let body = body.unwrap_or_default();
        let headers = self
            .credentials
            .headers("POLY", method.as_str(), path, &body)
            .map_err(|e| OrderError::Signing(e.to_string()))?;

        let mut request = self
            .http
            .request(method, format!("{}{}", self.clob_url, path))
            .header("POLY_ADDRESS", self.signer.address().to_checksum(None));
        for (key, value) in headers {
            request = request.header(key, value);
        }
        if !body.is_empty() {
            request = request
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        request
            .send()
            .await
            .map_err(|e| OrderError::Transport(e.to_string()))
    }
}

#[async_trait]
impl ExchangeApi for ClobClient {
    #[instrument(skip(self, request), fields(token = %request.market_token_id))]
    async fn place_order(&self, request: &OrderRequest) -> Result<SubmitResult, OrderError> {
        let body = PostOrderBody {
            order: self.sign_order(request).await?,
            owner: self.credentials.key.clone(),
            order_type: order_type(request.tif).to_string(),
        };
        let body = serde_json::to_string(&body)
            .map_err(|e| OrderError::Validation(format!("order body: {}", e)))?;

        let response = self.send(Method::POST, "/order", Some(body)).await?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| OrderError::Transport(e.to_string()))?;

        if status.is_server_error() {
            return Err(OrderError::Transport(format!("HTTP {} - {}", status, text)));
        }
        if !status.is_success() {
            return Err(OrderError::ExchangeRejected {
                reason: format!("HTTP {} - {}", status, text),
            });
        }

        let json: serde_json::Value = serde_json::from_str(&text).map_err(|e| {
            OrderError::ExchangeRejected {
                reason: format!("unreadable response: {}", e),
            }
        })?;
        debug!(response = %json, "Order response");

        Ok(SubmitResult {
            order_id: extract_order_id(&json),
            error: json
                .get("errorMsg")
                .or_else(|| json.get("error"))
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            success: json.get("success").and_then(|v| v.as_bool()),
        })
    }

    #[instrument(skip(self))]
    async fn order_status(&self, order_id: &str) -> Result<OrderState, OrderError> {
        let status_failed = |reason: String| OrderError::StatusFailed {
            order_id: order_id.to_string(),
            reason,
        };

        let path = format!("/data/order/{}", order_id);
        let response = self.send(Method::GET, &path, None).await?;
        if !response.status().is_success() {
            return Err(status_failed(format!("HTTP {}", response.status())));
        }
        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| status_failed(format!("Failed to parse response: {}", e)))?;

        Ok(parse_order_state(order_id, &json))
    }

    #[instrument(skip(self))]
    async fn cancel_order(&self, order_id: &str) -> Result<(), OrderError> {
        let cancel_failed = |reason: String| OrderError::CancelFailed {
            order_id: order_id.to_string(),
            reason,
        };

        let body = serde_json::to_string(&CancelOrderBody {
            order_id: order_id.to_string(),
        })
        .map_err(|e| cancel_failed(e.to_string()))?;

        let response = self
            .send(Method::DELETE, "/order", Some(body))
            .await
            .map_err(|e| cancel_failed(e.to_string()))?;
        if !response.status().is_success() {
            return Err(cancel_failed(format!("HTTP {}", response.status())));
        }
        Ok(())
    }
}

/// Read status and matched size, accepting the field spellings seen in practice.
fn parse_order_state(order_id: &str, json: &serde_json::Value) -> OrderState {
    let json = json.get("order").unwrap_or(json);
    let status = json
        .get("status")
        .or_else(|| json.get("orderStatus"))
        .or_else(|| json.get("order_status"))
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse::<OrderStatus>().ok());

    let filled_size = parse_decimal_field(
        json,
        &["size_matched", "sizeMatched", "filled", "filledSize", "filled_size"],
    );

    OrderState {
        order_id: order_id.to_string(),
        status,
        filled_size,
    }
}

/// Parse a decimal field from JSON, trying multiple field names.
fn parse_decimal_field(json: &serde_json::Value, keys: &[&str]) -> Option<Decimal> {
    for key in keys {
        if let Some(value) = json.get(*key) {
            if let Some(s) = value.as_str() {
                if let Ok(d) = s.parse::<Decimal>() {
                    return Some(d);
                }
            }
            if let Some(n) = value.as_f64() {
                if let Ok(d) = Decimal::try_from(n) {
                    return Some(d);
                }
            }
        }
    }
    None
}

/// Extract order ID from API response.
fn extract_order_id(result: &serde_json::Value) -> Option<String> {
    for key in ["orderID", "orderId", "order_id", "id"] {
        if let Some(id) = result.get(key).and_then(|v| v.as_str()) {
            if !id.is_empty() {
                return Some(id.to_string());
            }
        }
    }

    for key in ["order", "data", "result"] {
        if let Some(nested) = result.get(key) {
            if let Some(id) = extract_order_id(nested) {
                return Some(id);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trading::position::Direction;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn config() -> Config {
        let mut config = crate::config::test_config();
        config.polymarket_api_key = Some("clob-key-1234".to_string());
        config.polymarket_api_secret = Some("c2VjcmV0".to_string());
        config.polymarket_api_passphrase = Some("pass".to_string());
        config
    }

    #[test]
    fn requires_api_credentials() {
        let mut config = config();
        config.polymarket_api_secret = None;
        assert!(matches!(
            ClobClient::new(&config),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn safe_wallet_orders_are_funded_by_the_safe() {
        let client = ClobClient::new(&config()).unwrap();
        let funder: Address = "0x00000000000000000000000000000000000000aa".parse().unwrap();
        assert_eq!(client.maker(), funder);

        let mut eoa = config();
        eoa.polymarket_signature_type = 0;
        let client = ClobClient::new(&eoa).unwrap();
        assert_ne!(client.maker(), funder);
    }

    #[tokio::test]
    async fn signed_order_carries_amounts_and_signature() {
        let client = ClobClient::new(&config()).unwrap();
        let request =
            OrderRequest::buy("1234567890123", "0xabc", Direction::Up, dec!(0.45), dec!(10));
        let body = client.sign_order(&request).await.unwrap();

        assert_eq!(body.maker_amount, "4500000");
        assert_eq!(body.taker_amount, "10000000");
        assert_eq!(body.side, "BUY");
        assert_eq!(body.signature_type, 2);
        assert_eq!(body.signature.len(), 2 + 130);
    }

    #[test]
    fn extract_order_id_various_formats() {
        assert_eq!(extract_order_id(&json!({"orderID": "abc123"})), Some("abc123".to_string()));
        assert_eq!(extract_order_id(&json!({"data": {"id": "def456"}})), Some("def456".to_string()));
        assert_eq!(extract_order_id(&json!({"orderID": "", "success": false})), None);
    }

    #[test]
    fn order_state_reads_exchange_spellings() {
        let state = parse_order_state(
            "0x1",
            &json!({"status": "MATCHED", "size_matched": "10", "original_size": "10"}),
        );
        assert_eq!(state.status, Some(OrderStatus::Filled));
        assert_eq!(state.filled_size, Some(dec!(10)));

        let state = parse_order_state("0x2", &json!({"order": {"status": "live", "size_matched": 2.5}}));
        assert_eq!(state.status, Some(OrderStatus::Open));
        assert_eq!(state.filled_size, Some(dec!(2.5)));
    }
}
