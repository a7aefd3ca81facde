//! ThingsBoard-style device client over MQTT
//!
//! Onboards an IoT device to the platform and keeps it connected:
//! - Provisioning: exchange the device profile's provisioning key and secret
//!   for a per-device access token, persisted across restarts
//! - Claiming: a one-time announcement binding the device to an owner
//! - Telemetry publish and server-side RPC dispatch once provisioned
//!
//! The transport and storage collaborators are injected, so the lifecycle
//! runs unchanged against [`transport::MqttTransport`] and [`storage::FileStore`]
//! in production and against the fakes in [`testing`] in tests.
//!
//! # Quick Start
//!
//! ```rust
//! use tb_device_client::protocol::{last_segment, rpc_response_topic, topic_has_prefix, RPC_REQUEST_PREFIX};
//!
//! let topic = "v1/devices/me/rpc/request/42";
//! assert!(topic_has_prefix(topic, RPC_REQUEST_PREFIX));
//!
//! let request_id = last_segment(topic.as_bytes()).unwrap();
//! assert_eq!(rpc_response_topic(&request_id), "v1/devices/me/rpc/response/42");
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod observability;
pub mod protocol;
pub mod rpc;
pub mod session;
pub mod storage;
pub mod testing;
pub mod transport;

pub use client::DeviceClient;
pub use config::{ConfigError, DeviceConfig};
pub use error::{ClientError, ClientResult, ParseError, StoreError, TransportError};
pub use rpc::{RpcHandler, RpcRouter};
pub use session::{DeviceToken, LifecycleState};
pub use storage::{FileStore, KeyValueStore};
pub use transport::MqttTransport;
