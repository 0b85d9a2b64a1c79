//! XenAPI over JSON-RPC 2.0 (`POST <host>/jsonrpc`).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};

use super::{ApiError, Connector, XenApi};
use crate::config::normalize_endpoint;

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct RpcError {
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

impl RpcError {
    /// XenAPI puts the error code in `message` and its parameters in `data`.
    fn into_api_error(self) -> ApiError {
        let mut description = vec![self.message];
        match self.data {
            Some(Value::Array(items)) => description.extend(items.into_iter().map(|v| match v {
                Value::String(s) => s,
                other => other.to_string(),
            })),
            Some(Value::String(s)) => description.push(s),
            _ => {}
        }
        ApiError::remote(description)
    }
}

/// JSON-RPC transport to one host.
pub struct JsonRpcTransport {
    url: String,
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl JsonRpcTransport {
    pub fn new(host: &str, insecure_tls: bool) -> Result<Self, ApiError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(insecure_tls)
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| ApiError::transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            url: format!("{}/jsonrpc", normalize_endpoint(host)),
            client,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl XenApi for JsonRpcTransport {
    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, ApiError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": id,
        });

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| ApiError::transport(format!("{}: {}", method, e)))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(ApiError::transport(format!("{}: HTTP {}", method, status)));
        }
        if !status.is_success() {
            return Err(ApiError::Malformed(format!("{}: HTTP {}", method, status)));
        }

        let decoded: RpcResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Malformed(format!("{}: {}", method, e)))?;

        decode_response(decoded)
    }
}

fn decode_response(response: RpcResponse) -> Result<Value, ApiError> {
    match (response.error, response.result) {
        (Some(error), _) => Err(error.into_api_error()),
        (None, Some(result)) => Ok(result),
        (None, None) => Ok(Value::Null),
    }
}

/// Opens [`JsonRpcTransport`]s to arbitrary hosts.
pub struct HttpConnector {
    insecure_tls: bool,
}

impl HttpConnector {
    pub fn new(insecure_tls: bool) -> Self {
        Self { insecure_tls }
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn XenApi>, ApiError> {
        let transport = JsonRpcTransport::new(address, self.insecure_tls)?;
        Ok(Arc::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_is_normalized() {
        let transport = JsonRpcTransport::new("10.0.0.1/", false).unwrap();
        assert_eq!(transport.url(), "https://10.0.0.1/jsonrpc");
    }

    #[test]
    fn test_decode_error_description() {
        let response: RpcResponse = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": {
                "code": 1,
                "message": "SESSION_AUTHENTICATION_FAILED",
                "data": ["root", "Authentication failure"]
            }
        }))
        .unwrap();

        match decode_response(response) {
            Err(ApiError::Remote { code, params }) => {
                assert_eq!(code, "SESSION_AUTHENTICATION_FAILED");
                assert_eq!(params, vec!["root", "Authentication failure"]);
            }
            other => panic!("Unexpected response: {:?}", other),
        }
    }

    #[test]
    fn test_decode_result() {
        let response: RpcResponse =
            serde_json::from_value(json!({"jsonrpc": "2.0", "id": 2, "result": "OpaqueRef:1"}))
                .unwrap();
        assert_eq!(decode_response(response).unwrap(), json!("OpaqueRef:1"));
    }
}
