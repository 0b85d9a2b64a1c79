//! API client adapter.
//!
//! [`XenApi`] is the raw transport: a method name and positional parameters in,
//! a JSON value or an [`ApiError`] out. [`ApiClient`] layers session handling,
//! bounded retries and typed record decoding on top of it.

pub mod jsonrpc;
pub mod records;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::backoff::BackoffPolicy;
use crate::error::{Error, Result};
use crate::session::SessionManager;

pub use records::*;

/// Error categories every transport must distinguish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Auth,
    NotFound,
    Conflict,
    TransientNetwork,
    RemoteInternal,
}

/// XenAPI error codes that mean "the remote state precludes this right now".
const CONFLICT_CODES: &[&str] = &[
    "VDI_IN_USE",
    "SR_HAS_PBD",
    "SR_NOT_EMPTY",
    "OTHER_OPERATION_IN_PROGRESS",
    "VM_BAD_POWER_STATE",
    "VM_IS_TEMPLATE",
    "HOST_IS_SLAVE",
    "HOST_IN_USE",
    "NETWORK_CONTAINS_VIF",
    "NETWORK_CONTAINS_PIF",
    "PIF_VLAN_EXISTS",
    "DEVICE_ALREADY_ATTACHED",
    "DEVICE_ALREADY_DETACHED",
    "POOL_JOINING_HOST_MUST_HAVE_SAME_PRODUCT_VERSION",
    "POOL_JOINING_HOST_CANNOT_BE_MASTER_OF_OTHER_HOSTS",
    "POOL_JOINING_HOST_CANNOT_CONTAIN_SHARED_SRS",
    "POOL_JOINING_HOST_CANNOT_HAVE_RUNNING_VMS",
    "HA_IS_ENABLED",
    "HA_NOT_ENABLED",
    "LICENCE_RESTRICTION",
];

/// Failure reported by a transport.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApiError {
    /// XenAPI `ErrorDescription`: a code followed by parameters.
    #[error("{code}{}", format_params(.params))]
    Remote { code: String, params: Vec<String> },

    /// The request never produced a XenAPI response.
    #[error("transport error: {0}")]
    Transport(String),

    /// A response arrived but could not be decoded.
    #[error("malformed response: {0}")]
    Malformed(String),
}

fn format_params(params: &[String]) -> String {
    if params.is_empty() {
        String::new()
    } else {
        format!(" [{}]", params.join(", "))
    }
}

impl ApiError {
    /// Build from a XenAPI error description array.
    pub fn remote(description: Vec<String>) -> Self {
        let mut parts = description.into_iter();
        let code = parts.next().unwrap_or_else(|| "UNKNOWN_ERROR".to_string());
        ApiError::Remote {
            code,
            params: parts.collect(),
        }
    }

    pub fn code(code: &str, params: &[&str]) -> Self {
        ApiError::Remote {
            code: code.to_string(),
            params: params.iter().map(|p| p.to_string()).collect(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        ApiError::Transport(message.into())
    }

    pub fn error_code(&self) -> Option<&str> {
        match self {
            ApiError::Remote { code, .. } => Some(code),
            _ => None,
        }
    }

    pub fn params(&self) -> &[String] {
        match self {
            ApiError::Remote { params, .. } => params,
            _ => &[],
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ApiError::Transport(_) => ErrorCategory::TransientNetwork,
            ApiError::Malformed(_) => ErrorCategory::RemoteInternal,
            ApiError::Remote { code, .. } => match code.as_str() {
                "SESSION_INVALID" | "SESSION_AUTHENTICATION_FAILED" | "SESSION_NOT_REGISTERED" => {
                    ErrorCategory::Auth
                }
                "HANDLE_INVALID" | "UUID_INVALID" | "OBJECT_NOLONGER_EXISTS" => {
                    ErrorCategory::NotFound
                }
                code if CONFLICT_CODES.contains(&code) => ErrorCategory::Conflict,
                _ => ErrorCategory::RemoteInternal,
            },
        }
    }
}

/// Raw XenAPI transport.
#[async_trait]
pub trait XenApi: Send + Sync {
    /// Invoke `method` with positional `params`. Session arguments are part of `params`.
    async fn call(&self, method: &str, params: Vec<Value>) -> std::result::Result<Value, ApiError>;
}

/// Opens transports to other hosts, used to reach pool supporters.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &str) -> std::result::Result<Arc<dyn XenApi>, ApiError>;
}

/// A remote call, synchronous or submitted as a task.
#[derive(Debug, Clone)]
pub struct RemoteCall {
    pub method: String,
    pub params: Vec<Value>,
    pub asynchronous: bool,
}

impl RemoteCall {
    pub fn sync(method: &str, params: Vec<Value>) -> Self {
        Self {
            method: method.to_string(),
            params,
            asynchronous: false,
        }
    }

    pub fn task(method: &str, params: Vec<Value>) -> Self {
        Self {
            method: method.to_string(),
            params,
            asynchronous: true,
        }
    }

    /// Method name as sent on the wire.
    pub fn wire_method(&self) -> String {
        if self.asynchronous {
            format!("Async.{}", self.method)
        } else {
            self.method.clone()
        }
    }
}

/// Result of [`ApiClient::invoke`].
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome {
    Value(Value),
    Task(OpaqueRef),
}

/// Reads and setters are safe to repeat after a transport failure.
fn is_retry_safe(method: &str) -> bool {
    let name = method.rsplit('.').next().unwrap_or(method);
    !method.starts_with("Async.")
        && (name.starts_with("get_")
            || name.starts_with("set_")
            || name == "add_to_other_config"
            || name == "remove_from_other_config")
}

/// Session-aware, typed client over a [`XenApi`] transport.
#[derive(Clone)]
pub struct ApiClient {
    transport: Arc<dyn XenApi>,
    sessions: Arc<SessionManager>,
    retry: BackoffPolicy,
}

impl ApiClient {
    pub fn new(transport: Arc<dyn XenApi>, sessions: Arc<SessionManager>, retry: BackoffPolicy) -> Self {
        Self {
            transport,
            sessions,
            retry,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Call with session injection, one re-authentication on `SESSION_INVALID`,
    /// and bounded retries of transient failures for repeatable methods.
    pub async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        self.call_inner(method, params, is_retry_safe(method)).await
    }

    /// Like [`ApiClient::call`] but never retries transient failures.
    pub async fn call_once(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        self.call_inner(method, params, false).await
    }

    async fn call_inner(&self, method: &str, params: Vec<Value>, retry_transient: bool) -> Result<Value> {
        let mut delays = self.retry.delays();
        let mut renewed = false;
        let mut session = self.sessions.acquire().await?;

        loop {
            let mut full = Vec::with_capacity(params.len() + 1);
            full.push(Value::String(session.token().to_string()));
            full.extend(params.iter().cloned());

            debug!(method, "XenAPI call");
            let err = match self.transport.call(method, full).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match err.category() {
                ErrorCategory::Auth if !renewed => {
                    debug!(method, "Session rejected, renewing");
                    renewed = true;
                    session = self.sessions.renew(&session).await?;
                }
                ErrorCategory::Auth => return Err(Error::Auth(err.to_string())),
                ErrorCategory::TransientNetwork if retry_transient => match delays.next() {
                    Some(delay) => {
                        warn!(method, attempt = delays.attempts(), "Transient failure, retrying in {:?}: {}", delay, err);
                        tokio::time::sleep(delay).await;
                        session = self.sessions.acquire().await?;
                    }
                    None => {
                        return Err(Error::TransientNetwork {
                            attempts: delays.attempts() + 1,
                            message: format!("{}: {}", method, err),
                        });
                    }
                },
                _ => return Err(err.into()),
            }
        }
    }

    /// Run a call, as a task when `call.asynchronous` is set.
    pub async fn invoke(&self, call: &RemoteCall) -> Result<CallOutcome> {
        let value = self.call(&call.wire_method(), call.params.clone()).await?;
        if call.asynchronous {
            match value {
                Value::String(task) => Ok(CallOutcome::Task(task)),
                other => Err(Error::RemoteInternal(format!(
                    "{} returned {} instead of a task reference",
                    call.wire_method(),
                    other
                ))),
            }
        } else {
            Ok(CallOutcome::Value(value))
        }
    }

    /// Call and decode a string result (typically an object reference).
    pub async fn call_ref(&self, method: &str, params: Vec<Value>) -> Result<OpaqueRef> {
        match self.call(method, params).await? {
            Value::String(s) => Ok(s),
            other => Err(Error::RemoteInternal(format!(
                "{} returned {} instead of a reference",
                method, other
            ))),
        }
    }

    pub async fn get_record<R: XenRecord>(&self, opaque_ref: &str) -> Result<R> {
        let value = self
            .call(&format!("{}.get_record", R::CLASS), vec![json!(opaque_ref)])
            .await?;
        decode::<R>(value)
    }

    pub async fn get_all_records<R: XenRecord>(&self) -> Result<Vec<(OpaqueRef, R)>> {
        let value = self
            .call(&format!("{}.get_all_records", R::CLASS), vec![])
            .await?;
        let map = match value {
            Value::Object(map) => map,
            other => {
                return Err(Error::RemoteInternal(format!(
                    "{}.get_all_records returned {}",
                    R::CLASS,
                    other
                )));
            }
        };
        map.into_iter()
            .map(|(opaque_ref, record)| Ok((opaque_ref, decode::<R>(record)?)))
            .collect()
    }

    pub async fn get_by_uuid<R: XenRecord>(&self, uuid: &str) -> Result<OpaqueRef> {
        self.call_ref(&format!("{}.get_by_uuid", R::CLASS), vec![json!(uuid)])
            .await
    }

    /// Raw attribute map of one object of `class`.
    pub async fn get_entity(&self, class: &str, opaque_ref: &str) -> Result<BTreeMap<String, Value>> {
        let value = self
            .call(&format!("{}.get_record", class), vec![json!(opaque_ref)])
            .await?;
        as_attribute_map(class, value)
    }

    /// Raw attribute maps of every object of `class`, keyed by reference.
    pub async fn list_entities(&self, class: &str) -> Result<Vec<(OpaqueRef, BTreeMap<String, Value>)>> {
        let value = self
            .call(&format!("{}.get_all_records", class), vec![])
            .await?;
        match value {
            Value::Object(map) => map
                .into_iter()
                .map(|(opaque_ref, record)| Ok((opaque_ref, as_attribute_map(class, record)?)))
                .collect(),
            other => Err(Error::RemoteInternal(format!(
                "{}.get_all_records returned {}",
                class, other
            ))),
        }
    }
}

fn decode<R: XenRecord>(value: Value) -> Result<R> {
    serde_json::from_value(value)
        .map_err(|e| Error::RemoteInternal(format!("malformed {} record: {}", R::CLASS, e)))
}

fn as_attribute_map(class: &str, value: Value) -> Result<BTreeMap<String, Value>> {
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        other => Err(Error::RemoteInternal(format!(
            "malformed {} record: expected object, got {}",
            class, other
        ))),
    }
}
