//! MQTT 3.1.1 transport built on rumqttc
//!
//! Split the same way as the rest of the transport code: pure functions
//! separate from I/O.
//!
//! - [`connection`] - broker option construction from [`crate::session::SessionOptions`]
//! - [`message_handler`] - pure routing of rumqttc events to transport events
//! - [`client`] - the event loop task and the connection handle
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use tb_device_client::session::SessionOptions;
//! use tb_device_client::transport::{MqttTransport, QoS, Transport, TransportEvent, TransportHandle};
//! use tokio::sync::mpsc;
//!
//! # tokio_test::block_on(async {
//! let options = SessionOptions {
//!     broker_url: "mqtt://localhost:1883".to_string(),
//!     client_name: "ESP32_DEVICE_004".to_string(),
//!     username: "provision".to_string(),
//!     keep_alive: Duration::from_secs(60),
//!     reconnect_interval: Duration::from_secs(2),
//!     subscriptions: vec!["/provision/response".to_string()],
//! };
//!
//! let (events_tx, mut events_rx) = mpsc::channel(64);
//! let mut handle = MqttTransport::new().connect(&options, events_tx).await?;
//! if let Some(TransportEvent::Connected) = events_rx.recv().await {
//!     handle.subscribe("/provision/response", QoS::AtLeastOnce).await?;
//! }
//! handle.stop().await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message_handler;

pub use client::{MqttHandle, MqttTransport};
pub use connection::configure_mqtt_options;
pub use message_handler::{EventRoute, MessageHandler};
