//! Chain data providers
//!
//! `ChainDataProvider` is the seam between the balance oracle and whatever
//! actually knows the on-chain balance. Implementations report failures as
//! `ProviderError`; the oracle decides how to degrade.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::{MayaError, ProviderError, Result};

/// Decimal places between wei and ether
const WEI_SCALE: u32 = 18;

/// Source of on-chain balances
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainDataProvider: Send + Sync {
    /// Native-unit balance of `address`, bounded by `timeout`
    async fn get_balance(&self, address: &str, timeout: Duration)
        -> std::result::Result<Decimal, ProviderError>;
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// Ethereum JSON-RPC provider (`eth_getBalance`)
pub struct JsonRpcProvider {
    client: reqwest::Client,
    rpc_url: Url,
}

impl JsonRpcProvider {
    pub fn new(rpc_url: &str) -> Result<Self> {
        let rpc_url = Url::parse(rpc_url)
            .map_err(|e| MayaError::Validation(format!("Invalid RPC URL {}: {}", rpc_url, e)))?;
        let client = reqwest::Client::builder().build()?;
        Ok(Self { client, rpc_url })
    }
}

#[async_trait]
impl ChainDataProvider for JsonRpcProvider {
    async fn get_balance(
        &self,
        address: &str,
        timeout: Duration,
    ) -> std::result::Result<Decimal, ProviderError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_getBalance",
            "params": [address, "latest"],
        });

        let response = self
            .client
            .post(self.rpc_url.clone())
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProviderError::Connection(format!("HTTP {}", status)));
        }

        let rpc: RpcResponse = response
            .json()
            .await
            .map_err(|e| map_transport_error(e, timeout))?;

        if let Some(err) = rpc.error {
            return Err(ProviderError::Rpc {
                code: err.code,
                message: err.message,
            });
        }

        let raw = rpc
            .result
            .ok_or_else(|| ProviderError::Malformed("missing result".to_string()))?;
        let balance = wei_hex_to_native(&raw)?;
        debug!("eth_getBalance({}) = {} ({})", address, balance, raw);
        Ok(balance)
    }
}

fn map_transport_error(err: reqwest::Error, timeout: Duration) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout {
            elapsed_ms: timeout.as_millis() as u64,
        }
    } else if err.is_decode() {
        ProviderError::Malformed(err.to_string())
    } else {
        ProviderError::Connection(err.to_string())
    }
}

/// Convert a hex wei quantity (`0x...`) to the native unit
pub fn wei_hex_to_native(raw: &str) -> std::result::Result<Decimal, ProviderError> {
    let digits = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .ok_or_else(|| ProviderError::Malformed(format!("not a hex quantity: {}", raw)))?;

    if digits.is_empty() {
        return Err(ProviderError::Malformed("empty hex quantity".to_string()));
    }

    let wei = u128::from_str_radix(digits, 16)
        .map_err(|e| ProviderError::Malformed(format!("bad hex quantity {}: {}", raw, e)))?;
    let wei = i128::try_from(wei)
        .map_err(|_| ProviderError::Malformed(format!("quantity out of range: {}", raw)))?;

    Decimal::try_from_i128_with_scale(wei, WEI_SCALE)
        .map(|d| d.normalize())
        .map_err(|e| ProviderError::Malformed(format!("quantity out of range {}: {}", raw, e)))
}

/// Provider used when no chain endpoint is configured; always unavailable
#[derive(Debug, Default)]
pub struct OfflineProvider;

#[async_trait]
impl ChainDataProvider for OfflineProvider {
    async fn get_balance(
        &self,
        _address: &str,
        _timeout: Duration,
    ) -> std::result::Result<Decimal, ProviderError> {
        Err(ProviderError::Connection(
            "no chain provider configured".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_wei_conversion() {
        assert_eq!(wei_hex_to_native("0x0").unwrap(), dec!(0));
        assert_eq!(wei_hex_to_native("0xde0b6b3a7640000").unwrap(), dec!(1));
        // 0.0012 ETH
        assert_eq!(wei_hex_to_native("0x44364c5bb0000").unwrap(), dec!(0.0012));
    }

    #[test]
    fn test_wei_conversion_rejects_garbage() {
        assert!(matches!(
            wei_hex_to_native("1234"),
            Err(ProviderError::Malformed(_))
        ));
        assert!(matches!(
            wei_hex_to_native("0x"),
            Err(ProviderError::Malformed(_))
        ));
        assert!(matches!(
            wei_hex_to_native("0xzz"),
            Err(ProviderError::Malformed(_))
        ));
        assert!(matches!(
            wei_hex_to_native("0xffffffffffffffffffffffffffffffff"),
            Err(ProviderError::Malformed(_))
        ));
    }

    #[test]
    fn test_invalid_rpc_url() {
        assert!(JsonRpcProvider::new("not a url").is_err());
        assert!(JsonRpcProvider::new("https://mainnet.example.org/v3/key").is_ok());
    }

    #[tokio::test]
    async fn test_offline_provider_is_unavailable() {
        let provider = OfflineProvider;
        let result = provider
            .get_balance("0xabc", Duration::from_millis(10))
            .await;
        assert!(matches!(result, Err(ProviderError::Connection(_))));
    }
}
