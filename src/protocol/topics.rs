//! Wire topics and topic matching
//!
//! Topic names are fixed by the platform. Matching is byte-oriented so that
//! every function is total over arbitrary input, including empty and
//! non-UTF-8 topics.

/// Provisioning request, published with the `provision` identity
pub const PROVISION_REQUEST_TOPIC: &str = "/provision/request";
/// Provisioning response, the only subscription of an unprovisioned session
pub const PROVISION_RESPONSE_TOPIC: &str = "/provision/response";
/// One-time claim announcement
pub const CLAIM_REQUEST_TOPIC: &str = "v1/devices/me/claim";
/// Device telemetry
pub const TELEMETRY_TOPIC: &str = "v1/devices/me/telemetry";
/// Server-side RPC requests; the last segment is the request id
pub const RPC_REQUEST_PREFIX: &str = "v1/devices/me/rpc/request/";
pub const RPC_REQUEST_SUBSCRIPTION: &str = "v1/devices/me/rpc/request/+";
pub const RPC_RESPONSE_PREFIX: &str = "v1/devices/me/rpc/response/";
pub const ATTRIBUTES_SUBSCRIPTION: &str = "v1/devices/me/attributes/+";
pub const ATTRIBUTES_RESPONSE_SUBSCRIPTION: &str = "v1/devices/me/attributes/response/+";
pub const FIRMWARE_RESPONSE_SUBSCRIPTION: &str = "v2/fw/response/+";

/// Longest request id accepted from an RPC topic
pub const REQUEST_ID_CAPACITY: usize = 15;

/// Subscriptions of a provisioned session
pub fn device_subscriptions() -> Vec<String> {
    vec![
        RPC_REQUEST_SUBSCRIPTION.to_string(),
        ATTRIBUTES_RESPONSE_SUBSCRIPTION.to_string(),
        ATTRIBUTES_SUBSCRIPTION.to_string(),
        FIRMWARE_RESPONSE_SUBSCRIPTION.to_string(),
    ]
}

/// Subscriptions of an unprovisioned session
pub fn provisioning_subscriptions() -> Vec<String> {
    vec![PROVISION_RESPONSE_TOPIC.to_string()]
}

/// Response topic correlated with an RPC request id: `v1/devices/me/rpc/response/{id}`
pub fn rpc_response_topic(request_id: &str) -> String {
    format!("{RPC_RESPONSE_PREFIX}{request_id}")
}

/// Exact-length, exact-byte match
pub fn topic_equals(topic: impl AsRef<[u8]>, literal: impl AsRef<[u8]>) -> bool {
    topic.as_ref() == literal.as_ref()
}

/// True iff `topic` is at least as long as `prefix` and byte-equal on that span
pub fn topic_has_prefix(topic: impl AsRef<[u8]>, prefix: impl AsRef<[u8]>) -> bool {
    topic.as_ref().starts_with(prefix.as_ref())
}

/// Bytes after the final `/` (the whole topic when it has none).
///
/// Returns `None` when the segment is empty, longer than
/// [`REQUEST_ID_CAPACITY`], or not valid UTF-8. Callers drop the message.
/// Topics arrive as `String`, and a segment cut at `/` is always valid
/// UTF-8, so for them the last case never triggers.
pub fn last_segment(topic: &[u8]) -> Option<String> {
    let start = topic
        .iter()
        .rposition(|&b| b == b'/')
        .map_or(0, |slash| slash + 1);
    let segment = &topic[start..];

    if segment.is_empty() || segment.len() > REQUEST_ID_CAPACITY {
        return None;
    }

    std::str::from_utf8(segment).ok().map(str::to_string)
}
