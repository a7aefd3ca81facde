//! Payloads exchanged with the platform
//!
//! Field names follow the platform's camelCase wire format.

use crate::error::ParseError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status value of a successful provisioning response
pub const PROVISION_STATUS_SUCCESS: &str = "SUCCESS";
/// The only credentials type this client accepts
pub const CREDENTIALS_TYPE_ACCESS_TOKEN: &str = "ACCESS_TOKEN";

/// Published to `/provision/request`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    pub device_name: String,
    pub provision_device_key: String,
    pub provision_device_secret: String,
}

/// Received on `/provision/response`
///
/// Every field is optional on the wire; [`ProvisionResponse::outcome`]
/// decides whether the response is usable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionResponse {
    pub status: Option<String>,
    pub credentials_type: Option<String>,
    pub credentials_value: Option<String>,
    /// Error text the platform attaches to failed requests
    pub error_msg: Option<String>,
}

/// Outcome of a provisioning response
#[derive(Debug, Clone, PartialEq)]
pub enum ProvisionOutcome {
    /// Access token issued
    Issued(String),
    /// Platform reported a failure status
    Rejected { status: String, reason: Option<String> },
    /// Success status but credentials of another type
    UnsupportedCredentials(String),
}

impl ProvisionResponse {
    pub fn parse(payload: &[u8]) -> Result<Self, ParseError> {
        let value: Value = serde_json::from_slice(payload)?;
        if !value.is_object() {
            return Err(ParseError::NotAnObject);
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Classify the response; a success without a string token is a parse error
    pub fn outcome(&self) -> Result<ProvisionOutcome, ParseError> {
        match self.status.as_deref() {
            Some(PROVISION_STATUS_SUCCESS) => {}
            other => {
                return Ok(ProvisionOutcome::Rejected {
                    status: other.unwrap_or("<missing>").to_string(),
                    reason: self.error_msg.clone(),
                })
            }
        }

        match self.credentials_type.as_deref() {
            Some(CREDENTIALS_TYPE_ACCESS_TOKEN) => self
                .credentials_value
                .clone()
                .map(ProvisionOutcome::Issued)
                .ok_or(ParseError::MissingField("credentialsValue")),
            Some(other) => Ok(ProvisionOutcome::UnsupportedCredentials(other.to_string())),
            None => Err(ParseError::MissingField("credentialsType")),
        }
    }
}

/// Published to `v1/devices/me/claim`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimRequest {
    pub secret_key: String,
    pub duration_ms: u64,
}

/// Server-side RPC call, parsed from a request topic and its payload
#[derive(Debug, Clone, PartialEq)]
pub struct RpcRequest {
    pub request_id: String,
    pub method: String,
    pub params: Value,
}

/// Serialize a payload for publishing
pub fn to_payload<T: Serialize + ?Sized>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(message)
}
