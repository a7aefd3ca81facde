//! Server-side RPC dispatch
//!
//! Requests arrive on `v1/devices/me/rpc/request/{id}` with a payload of the
//! form `{"method": "...", "params": ...}`. The router looks the method up in
//! a registry of handlers; a handler may answer with a JSON value, which is
//! published on `v1/devices/me/rpc/response/{id}`.
//!
//! Unregistered methods get no response at all, not an error response.
//! Devices in the field rely on that behaviour.

use crate::error::ParseError;
use crate::protocol::messages::RpcRequest;
use crate::protocol::topics::{last_segment, rpc_response_topic, topic_has_prefix, RPC_REQUEST_PREFIX};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Handler for one RPC method
#[async_trait]
pub trait RpcHandler: Send + Sync {
    /// Handle a call. `None` means the call gets no response.
    async fn handle(&self, params: Value) -> Option<Value>;
}

#[async_trait]
impl<F> RpcHandler for F
where
    F: Fn(Value) -> Option<Value> + Send + Sync,
{
    async fn handle(&self, params: Value) -> Option<Value> {
        self(params)
    }
}

/// Correlated response ready to publish
#[derive(Debug, Clone, PartialEq)]
pub struct RpcResponse {
    pub request_id: String,
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Registry of RPC handlers keyed by exact method name
#[derive(Clone, Default)]
pub struct RpcRouter {
    handlers: HashMap<String, Arc<dyn RpcHandler>>,
}

impl RpcRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous handler for `method`
    pub fn register(&mut self, method: impl Into<String>, handler: impl RpcHandler + 'static) {
        let method = method.into();
        if self
            .handlers
            .insert(method.clone(), Arc::new(handler))
            .is_some()
        {
            info!(method = %method, "Replaced RPC handler");
        } else {
            debug!(method = %method, "Registered RPC handler");
        }
    }

    pub fn is_registered(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    pub fn methods(&self) -> Vec<String> {
        let mut methods: Vec<String> = self.handlers.keys().cloned().collect();
        methods.sort();
        methods
    }

    /// True for topics this router should see
    pub fn is_rpc_topic(topic: &str) -> bool {
        topic_has_prefix(topic, RPC_REQUEST_PREFIX)
    }

    /// Parse a request: id from the last topic segment, method and params
    /// from the payload. `params` defaults to `null`.
    pub fn parse_request(topic: &str, payload: &[u8]) -> Result<RpcRequest, ParseError> {
        let request_id = last_segment(topic.as_bytes())
            .ok_or_else(|| ParseError::MalformedTopic(topic.to_string()))?;

        let mut body = match serde_json::from_slice::<Value>(payload)? {
            Value::Object(body) => body,
            _ => return Err(ParseError::NotAnObject),
        };

        let method = match body.remove("method") {
            Some(Value::String(method)) => method,
            _ => return Err(ParseError::MissingField("method")),
        };
        let params = body.remove("params").unwrap_or(Value::Null);

        Ok(RpcRequest {
            request_id,
            method,
            params,
        })
    }

    /// Run the handler for `request`, if one is registered
    pub async fn dispatch(&self, request: RpcRequest) -> Option<RpcResponse> {
        let Some(handler) = self.handlers.get(&request.method).cloned() else {
            debug!(
                method = %request.method,
                request_id = %request.request_id,
                "No handler registered, not responding"
            );
            return None;
        };

        let reply = handler.handle(request.params).await?;
        Some(RpcResponse {
            topic: rpc_response_topic(&request.request_id),
            request_id: request.request_id,
            payload: reply.to_string().into_bytes(),
        })
    }
}

impl std::fmt::Debug for RpcRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcRouter")
            .field("methods", &self.methods())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_request() {
        let request = RpcRouter::parse_request(
            "v1/devices/me/rpc/request/42",
            br#"{"method":"setLightState","params":{"power":true}}"#,
        )
        .unwrap();

        assert_eq!(request.request_id, "42");
        assert_eq!(request.method, "setLightState");
        assert_eq!(request.params, json!({"power": true}));
    }

    #[test]
    fn test_parse_request_without_params() {
        let request =
            RpcRouter::parse_request("v1/devices/me/rpc/request/1", br#"{"method":"ping"}"#)
                .unwrap();
        assert_eq!(request.params, Value::Null);
    }

    #[test]
    fn test_parse_request_failures() {
        assert!(matches!(
            RpcRouter::parse_request("v1/devices/me/rpc/request/", br#"{"method":"m"}"#),
            Err(ParseError::MalformedTopic(_))
        ));
        assert!(matches!(
            RpcRouter::parse_request(
                "v1/devices/me/rpc/request/1234567890123456",
                br#"{"method":"m"}"#
            ),
            Err(ParseError::MalformedTopic(_))
        ));
        assert!(matches!(
            RpcRouter::parse_request("v1/devices/me/rpc/request/1", b"garbage"),
            Err(ParseError::InvalidJson(_))
        ));
        assert!(matches!(
            RpcRouter::parse_request("v1/devices/me/rpc/request/1", b"\"str\""),
            Err(ParseError::NotAnObject)
        ));
        assert!(matches!(
            RpcRouter::parse_request("v1/devices/me/rpc/request/1", br#"{"method":7}"#),
            Err(ParseError::MissingField("method"))
        ));
    }

    #[test]
    fn test_is_rpc_topic() {
        assert!(RpcRouter::is_rpc_topic("v1/devices/me/rpc/request/5"));
        assert!(!RpcRouter::is_rpc_topic("v1/devices/me/rpc/response/5"));
        assert!(!RpcRouter::is_rpc_topic("/provision/response"));
    }

    #[tokio::test]
    async fn test_dispatch_registered_method() {
        let mut router = RpcRouter::new();
        router.register("getState", |_params: Value| Some(json!({"on": true})));

        let request = RpcRouter::parse_request(
            "v1/devices/me/rpc/request/9",
            br#"{"method":"getState"}"#,
        )
        .unwrap();
        let response = router.dispatch(request).await.unwrap();

        assert_eq!(response.topic, "v1/devices/me/rpc/response/9");
        assert_eq!(response.request_id, "9");
        let body: Value = serde_json::from_slice(&response.payload).unwrap();
        assert_eq!(body, json!({"on": true}));
    }

    #[tokio::test]
    async fn test_handler_receives_params() {
        let mut router = RpcRouter::new();
        router.register("echo", |params: Value| Some(json!({ "echo": params })));

        let request = RpcRequest {
            request_id: "3".to_string(),
            method: "echo".to_string(),
            params: json!([1, 2]),
        };
        let response = router.dispatch(request).await.unwrap();
        let body: Value = serde_json::from_slice(&response.payload).unwrap();
        assert_eq!(body, json!({"echo": [1, 2]}));
    }

    #[tokio::test]
    async fn test_unknown_method_gets_no_response() {
        let router = RpcRouter::new();
        let request = RpcRequest {
            request_id: "42".to_string(),
            method: "unknownMethod".to_string(),
            params: Value::Null,
        };
        assert!(router.dispatch(request).await.is_none());
    }

    #[tokio::test]
    async fn test_handler_may_decline_to_respond() {
        let mut router = RpcRouter::new();
        router.register("fireAndForget", |_params: Value| -> Option<Value> { None });

        let request = RpcRequest {
            request_id: "1".to_string(),
            method: "fireAndForget".to_string(),
            params: Value::Null,
        };
        assert!(router.dispatch(request).await.is_none());
    }

    #[test]
    fn test_register_replaces_handler() {
        let mut router = RpcRouter::new();
        router.register("m", |_params: Value| -> Option<Value> { None });
        router.register("m", |_params: Value| Some(Value::Null));
        router.register("a", |_params: Value| -> Option<Value> { None });

        assert_eq!(router.methods(), vec!["a", "m"]);
        assert!(router.is_registered("m"));
        assert!(!router.is_registered("x"));
    }
}
