//! # Ethereum JSON-RPC Backend
//!
//! [`ChainClient`] over HTTP JSON-RPC 2.0, speaking the standard `eth_`
//! namespace that every EVM node and hosted provider exposes.
//!
//! | Trait method    | RPC method                                   |
//! |-----------------|----------------------------------------------|
//! | `pending_nonce` | `eth_getTransactionCount(addr, "pending")`   |
//! | `latest_nonce`  | `eth_getTransactionCount(addr, "latest")`    |
//! | `submit_signed` | `eth_sendRawTransaction(raw)`                |
//! | `get_receipt`   | `eth_getTransactionReceipt(hash)`            |
//! | `block_height`  | `eth_blockNumber()`                          |
//! | `gas_price`     | `eth_gasPrice()`                             |
//!
//! Transport failures are mapped onto [`TransientKind`] so the relayer can
//! tell "never delivered" (connect refused) from "delivered, answer lost"
//! (timeout mid-request).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use credmint_contracts::{Address, Log};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{
    is_already_known, ChainClient, ChainError, Receipt, ReceiptStatus, TransientKind, TxHash,
};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RpcReceipt {
    transaction_hash: String,
    block_number: Option<String>,
    status: Option<String>,
    #[serde(default)]
    logs: Vec<RpcLog>,
}

#[derive(Debug, Deserialize)]
struct RpcLog {
    address: String,
    topics: Vec<String>,
    data: String,
}

// ---------------------------------------------------------------------------
// JsonRpcChainClient
// ---------------------------------------------------------------------------

/// Chain client backed by a JSON-RPC endpoint.
#[derive(Debug)]
pub struct JsonRpcChainClient {
    http: reqwest::Client,
    url: String,
    next_id: AtomicU64,
}

impl JsonRpcChainClient {
    /// Builds a client for `url`. `timeout` bounds every request.
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, ChainError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChainError::permanent(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            http,
            url: url.into(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Performs one call and returns the raw `result`, or the node's error.
    async fn call_raw(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Result<Value, RpcError>, ChainError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(ChainError::transient(
                TransientKind::Unavailable,
                format!("{method}: HTTP {status}"),
            ));
        }

        let body: RpcResponse = response.json().await.map_err(|e| {
            ChainError::transient(TransientKind::Network, format!("{method}: bad response: {e}"))
        })?;

        match (body.error, body.result) {
            (Some(error), _) => Ok(Err(error)),
            (None, Some(result)) => Ok(Ok(result)),
            (None, None) => Ok(Ok(Value::Null)),
        }
    }

    async fn call<R: DeserializeOwned>(&self, method: &str, params: Value) -> Result<R, ChainError> {
        match self.call_raw(method, params).await? {
            Ok(value) => serde_json::from_value(value).map_err(|e| {
                ChainError::transient(TransientKind::Unavailable, format!("{method}: {e}"))
            }),
            Err(error) => {
                debug!(method, code = error.code, message = %error.message, "rpc error");
                Err(read_error(method, &error))
            }
        }
    }

    async fn transaction_count(&self, address: &Address, block: &str) -> Result<u64, ChainError> {
        let hex: String = self
            .call("eth_getTransactionCount", json!([address.to_string(), block]))
            .await?;
        parse_quantity(&hex).and_then(|n| {
            u64::try_from(n).map_err(|_| ChainError::permanent(format!("nonce {n} out of range")))
        })
    }
}

/// Node errors from read-only calls. These say nothing about a transaction,
/// so they never count as a rejection.
fn read_error(method: &str, error: &RpcError) -> ChainError {
    ChainError::transient(
        TransientKind::Unavailable,
        format!("{method}: {} (code {})", error.message, error.code),
    )
}

fn transport_error(e: reqwest::Error) -> ChainError {
    if e.is_timeout() {
        ChainError::transient(TransientKind::Timeout, e.to_string())
    } else if e.is_connect() {
        // Never reached the node; nothing can have been accepted.
        ChainError::transient(TransientKind::Unavailable, e.to_string())
    } else {
        ChainError::transient(TransientKind::Network, e.to_string())
    }
}

#[async_trait]
impl ChainClient for JsonRpcChainClient {
    async fn pending_nonce(&self, address: &Address) -> Result<u64, ChainError> {
        self.transaction_count(address, "pending").await
    }

    async fn latest_nonce(&self, address: &Address) -> Result<u64, ChainError> {
        self.transaction_count(address, "latest").await
    }

    async fn submit_signed(&self, raw_tx: &[u8]) -> Result<TxHash, ChainError> {
        let local = TxHash::of_raw(raw_tx);
        let params = json!([format!("0x{}", hex::encode(raw_tx))]);

        match self.call_raw("eth_sendRawTransaction", params).await? {
            Ok(value) => {
                let reported: Option<TxHash> = value.as_str().and_then(|s| s.parse().ok());
                if let Some(reported) = reported {
                    if reported != local {
                        warn!(%reported, %local, "node reported a different transaction hash");
                    }
                }
                Ok(local)
            }
            Err(error) if is_already_known(&error.message) => {
                debug!(hash = %local, "transaction already known to node");
                Ok(local)
            }
            Err(error) => Err(ChainError::classify_rpc_message(&error.message)),
        }
    }

    async fn get_receipt(&self, hash: &TxHash) -> Result<Option<Receipt>, ChainError> {
        let receipt: Option<RpcReceipt> = self
            .call("eth_getTransactionReceipt", json!([hash.to_string()]))
            .await?;
        match receipt {
            Some(raw) => convert_receipt(raw),
            None => Ok(None),
        }
    }

    async fn block_height(&self) -> Result<u64, ChainError> {
        let hex: String = self.call("eth_blockNumber", json!([])).await?;
        let height = parse_quantity(&hex)?;
        u64::try_from(height).map_err(|_| ChainError::permanent("block height out of range"))
    }

    async fn gas_price(&self) -> Result<u128, ChainError> {
        let hex: String = self.call("eth_gasPrice", json!([])).await?;
        parse_quantity(&hex)
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// Parses a JSON-RPC `QUANTITY` (`0x`-prefixed, no leading zeros).
fn parse_quantity(s: &str) -> Result<u128, ChainError> {
    let body = s
        .strip_prefix("0x")
        .ok_or_else(|| ChainError::permanent(format!("quantity '{s}' is not 0x-prefixed")))?;
    if body.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(body, 16)
        .map_err(|e| ChainError::permanent(format!("quantity '{s}': {e}")))
}

fn parse_data(s: &str) -> Result<Vec<u8>, ChainError> {
    let body = s.strip_prefix("0x").unwrap_or(s);
    hex::decode(body).map_err(|e| ChainError::permanent(format!("data '{s}': {e}")))
}

fn parse_word(s: &str) -> Result<[u8; 32], ChainError> {
    parse_data(s)?
        .try_into()
        .map_err(|_| ChainError::permanent(format!("topic '{s}' is not 32 bytes")))
}

/// Converts a node receipt. A receipt without a block number is still
/// pending and reported as absent.
fn convert_receipt(raw: RpcReceipt) -> Result<Option<Receipt>, ChainError> {
    let block_number = match raw.block_number.as_deref() {
        Some(n) => u64::try_from(parse_quantity(n)?)
            .map_err(|_| ChainError::permanent("block number out of range"))?,
        None => return Ok(None),
    };
    let status = match raw.status.as_deref() {
        Some("0x1") => ReceiptStatus::Success,
        Some("0x0") => ReceiptStatus::Reverted,
        other => {
            return Err(ChainError::permanent(format!(
                "unsupported receipt status {other:?}"
            )))
        }
    };
    let tx_hash = raw
        .transaction_hash
        .parse::<TxHash>()
        .map_err(ChainError::permanent)?;

    let logs = raw
        .logs
        .into_iter()
        .map(|log| -> Result<Log, ChainError> {
            Ok(Log {
                address: log
                    .address
                    .to_ascii_lowercase()
                    .parse()
                    .map_err(|e| ChainError::permanent(format!("log address: {e}")))?,
                topics: log
                    .topics
                    .iter()
                    .map(|t| parse_word(t))
                    .collect::<Result<_, _>>()?,
                data: parse_data(&log.data)?,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Some(Receipt {
        tx_hash,
        block_number,
        status,
        logs,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn receipt_json(status: &str, block: Option<&str>) -> RpcReceipt {
        let value = json!({
            "transactionHash": format!("0x{}", "ab".repeat(32)),
            "blockNumber": block,
            "status": status,
            "logs": [{
                "address": "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed",
                "topics": [format!("0x{}", "01".repeat(32)), format!("0x{}", "00".repeat(31) + "2a")],
                "data": "0x"
            }]
        });
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn quantities_parse() {
        assert_eq!(parse_quantity("0x0").unwrap(), 0);
        assert_eq!(parse_quantity("0x").unwrap(), 0);
        assert_eq!(parse_quantity("0x3b9aca00").unwrap(), 1_000_000_000);
        assert!(parse_quantity("12").is_err());
        assert!(parse_quantity("0xzz").is_err());
    }

    #[test]
    fn successful_receipt_converts() {
        let receipt = convert_receipt(receipt_json("0x1", Some("0x10"))).unwrap().unwrap();
        assert_eq!(receipt.block_number, 16);
        assert_eq!(receipt.status, ReceiptStatus::Success);
        assert_eq!(receipt.logs.len(), 1);
        assert_eq!(receipt.logs[0].topics[1][31], 0x2a);
        assert_eq!(
            receipt.logs[0].address.to_checksum(),
            "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed"
        );
    }

    #[test]
    fn reverted_receipt_converts() {
        let receipt = convert_receipt(receipt_json("0x0", Some("0x1"))).unwrap().unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Reverted);
    }

    #[test]
    fn unmined_receipt_is_absent() {
        assert!(convert_receipt(receipt_json("0x1", None)).unwrap().is_none());
    }

    #[test]
    fn response_envelope_parses_errors() {
        let body: RpcResponse = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": -32000, "message": "nonce too low" }
        }))
        .unwrap();
        let error = body.error.unwrap();
        assert_eq!(error.code, -32000);
        assert!(ChainError::classify_rpc_message(&error.message).is_nonce_conflict());
    }

    #[test]
    fn read_call_errors_are_never_permanent() {
        for message in ["invalid project id", "invalid api key", "execution reverted"] {
            let error = RpcError {
                code: -32000,
                message: message.to_string(),
            };
            let err = read_error("eth_gasPrice", &error);
            assert!(err.is_transient(), "{message} should be transient");
            assert!(!err.is_ambiguous());
            assert!(!err.is_nonce_conflict());
        }
    }

    #[test]
    fn request_serializes_as_jsonrpc_2() {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: 7,
            method: "eth_blockNumber",
            params: json!([]),
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "eth_blockNumber");
        assert_eq!(value["id"], 7);
    }

    #[tokio::test]
    async fn unreachable_node_is_transient_and_unambiguous() {
        // Port 9 (discard) is closed on any sane test host.
        let client =
            JsonRpcChainClient::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = client.block_height().await.unwrap_err();
        assert!(err.is_transient());
        assert!(!err.is_ambiguous());
    }
}
