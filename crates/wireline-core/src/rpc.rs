//! JSON-RPC wire envelope
//!
//! The daemon speaks JSON-RPC 2.0 over newline-delimited frames. The daemon
//! does not correlate response ids, so callers keep a single request in
//! flight per connection and rely on strict response ordering.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ProtocolError, Result};

pub const JSONRPC_VERSION: &str = "2.0";

// ----------------------------------------------------------------------------
// Request
// ----------------------------------------------------------------------------

/// One outbound request frame.
#[derive(Debug, Serialize)]
pub struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

impl<'a> RpcRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }

    /// Encode as one newline-terminated frame.
    pub fn to_frame(&self) -> Result<String> {
        let mut frame = serde_json::to_string(self)?;
        frame.push('\n');
        Ok(frame)
    }
}

// ----------------------------------------------------------------------------
// Response
// ----------------------------------------------------------------------------

/// The error object inside a failed response.
#[derive(Debug, Clone, Deserialize)]
pub struct RpcErrorObject {
    pub code: i64,
    pub message: String,
}

/// One inbound response frame.
#[derive(Debug, Deserialize)]
pub struct RpcResponse {
    pub id: Option<Value>,
    pub result: Option<Value>,
    pub error: Option<RpcErrorObject>,
}

impl RpcResponse {
    pub fn parse(frame: &str) -> Result<Self> {
        serde_json::from_str(frame).map_err(|e| {
            ProtocolError::MalformedResponse {
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Convert into the result payload, mapping a daemon error object to
    /// [`ProtocolError::Daemon`]. A missing or null result with no error is
    /// an empty success, which some methods legitimately return.
    pub fn into_result(self) -> Result<Value> {
        if let Some(error) = self.error {
            return Err(ProtocolError::Daemon {
                code: error.code,
                message: error.message,
            }
            .into());
        }
        Ok(self.result.unwrap_or(Value::Null))
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
