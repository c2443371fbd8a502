//! DxHub pub/sub JSON-RPC wire types, request builders, and decode helpers.

use std::collections::HashMap;

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::types::{Error, Headers};

pub const JSONRPC_VERSION: &str = "2.0";

pub mod method {
    pub const CONSUME: &str = "consume";
    pub const PUBLISH: &str = "publish";
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub method: String,
    /// Correlation ID, echoed back in the matching [`Response`].
    pub id: String,
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeParams {
    pub subscription_id: String,
    /// Continuation token from the previous consume response; empty on the
    /// first request of a subscription.
    #[serde(default)]
    pub consume_context: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishParams {
    pub stream: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: Headers,
    /// Base64-encoded payload.
    pub payload: String,
}

impl PublishParams {
    pub fn decode_payload(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD.decode(&self.payload)
    }
}

impl Request {
    fn new(method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            id: uuid::Uuid::new_v4().to_string(),
            params,
        }
    }

    pub fn consume(subscription_id: &str, consume_context: &str) -> Result<Self, Error> {
        let params = ConsumeParams {
            subscription_id: subscription_id.to_string(),
            consume_context: consume_context.to_string(),
        };
        Ok(Self::new(method::CONSUME, serde_json::to_value(params)?))
    }

    pub fn publish(stream: &str, headers: &Headers, payload: &[u8]) -> Result<Self, Error> {
        let params = PublishParams {
            stream: stream.to_string(),
            headers: headers.clone(),
            payload: base64::engine::general_purpose::STANDARD.encode(payload),
        };
        Ok(Self::new(method::PUBLISH, serde_json::to_value(params)?))
    }
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Response {
    pub jsonrpc: String,
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConsumeResult {
    pub consume_context: String,
    /// Messages keyed by stream name, in broker order within each stream.
    pub messages: HashMap<String, Vec<ConsumeMessage>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConsumeMessage {
    pub msg_id: String,
    pub headers: Headers,
    /// Base64-encoded payload.
    pub payload: String,
}

impl ConsumeMessage {
    pub fn decode_payload(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD.decode(&self.payload)
    }
}

impl Response {
    pub fn success(id: impl Into<String>, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: impl Into<String>, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
            }),
        }
    }

    /// The broker-reported error, if any. A zero code means success.
    pub fn remote_error(&self) -> Option<&RpcError> {
        self.error.as_ref().filter(|e| e.code != 0)
    }

    pub fn consume_result(&self) -> Result<ConsumeResult, Error> {
        let result = self.result.clone().ok_or_else(|| Error::Decode {
            id: self.id.clone(),
            message: "consume response carries no result".to_string(),
        })?;
        serde_json::from_value(result).map_err(|e| Error::Decode {
            id: self.id.clone(),
            message: e.to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Frame encode / decode
// ---------------------------------------------------------------------------

pub fn encode_request(request: &Request) -> Result<String, Error> {
    Ok(serde_json::to_string(request)?)
}

pub fn decode_request(text: &str) -> Result<Request, Error> {
    Ok(serde_json::from_str(text)?)
}

pub fn encode_response(response: &Response) -> Result<String, Error> {
    Ok(serde_json::to_string(response)?)
}

pub fn decode_response(text: &str) -> Result<Response, Error> {
    Ok(serde_json::from_str(text)?)
}
