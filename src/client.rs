//! Application-facing device client
//!
//! ```no_run
//! use std::sync::Arc;
//! use tb_device_client::{DeviceClient, DeviceConfig, FileStore, MqttTransport};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = DeviceConfig::load_from_file("device.toml".as_ref())?;
//! let store = Arc::new(FileStore::new(config.storage.path.clone()));
//! let mut client = DeviceClient::init(config, MqttTransport::new(), store)?;
//! client.start().await?;
//!
//! if client.is_connected().await {
//!     client.send_telemetry(&serde_json::json!({"temperature": 21.5})).await?;
//! }
//! client.destroy().await;
//! # Ok(())
//! # }
//! ```

use crate::config::{ConfigError, DeviceConfig, STORED_DEVICE_NAME_CAPACITY};
use crate::error::{ClientError, ClientResult};
use crate::lifecycle::Lifecycle;
use crate::protocol::messages::to_payload;
use crate::rpc::{RpcHandler, RpcRouter};
use crate::session::LifecycleState;
use crate::storage::{CredentialStore, KeyValueStore};
use crate::transport::{Transport, TransportEvent};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Buffer between the transport and the lifecycle
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// One device's connection to the platform
pub struct DeviceClient<T: Transport> {
    config: DeviceConfig,
    transport: Option<T>,
    store: CredentialStore,
    router: Arc<RwLock<RpcRouter>>,
    lifecycle: Option<Lifecycle<T>>,
    event_pump: Option<JoinHandle<()>>,
}

impl<T: Transport> DeviceClient<T> {
    /// Validate the configuration and wire up the collaborators.
    /// Nothing is read or connected until [`DeviceClient::start`].
    pub fn init(
        config: DeviceConfig,
        transport: T,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            transport: Some(transport),
            store: CredentialStore::new(store),
            router: Arc::new(RwLock::new(RpcRouter::new())),
            lifecycle: None,
            event_pump: None,
        })
    }

    /// Register a handler for server-side RPC `method`. Can be called before
    /// or after `start`.
    pub async fn register_rpc(&self, method: impl Into<String>, handler: impl RpcHandler + 'static) {
        self.router.write().await.register(method, handler);
    }

    /// Load stored credentials and open the first connection
    pub async fn start(&mut self) -> ClientResult<()> {
        if self.lifecycle.is_some() {
            return Err(ClientError::AlreadyStarted);
        }
        let transport = self.transport.take().ok_or(ClientError::AlreadyStarted)?;

        // Storage trouble must not keep the device offline: without readable
        // credentials it provisions again
        if let Err(e) = self.store.init() {
            warn!(error = %e, "Credential store unavailable, starting unprovisioned");
        }
        let device_name = resolve_device_name(&self.config, &self.store)?;
        let state = LifecycleState::from_stored(self.store.load_token(), self.store.load_claimed());
        info!(device = %device_name, state = state.name(), "Starting device client");

        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let lifecycle = Lifecycle::new(
            self.config.clone(),
            device_name,
            transport,
            self.store.clone(),
            self.router.clone(),
            state,
            events_tx,
        );

        self.event_pump = Some(tokio::spawn(run_event_pump(lifecycle.clone(), events_rx)));
        self.lifecycle = Some(lifecycle.clone());

        lifecycle.connect().await?;
        Ok(())
    }

    /// Serialize `payload` and publish it as telemetry
    ///
    /// Returns `NotReady` without waiting when the device is not provisioned
    /// and connected. The sample is never queued.
    pub async fn send_telemetry<P: Serialize + ?Sized>(&self, payload: &P) -> ClientResult<()> {
        let lifecycle = self.lifecycle.as_ref().ok_or(ClientError::NotStarted)?;
        lifecycle.send_telemetry(to_payload(payload)?).await
    }

    /// Connected under the device's own token
    pub async fn is_connected(&self) -> bool {
        self.lifecycle
            .as_ref()
            .is_some_and(|lifecycle| lifecycle.is_ready())
    }

    pub async fn state(&self) -> Option<LifecycleState> {
        match &self.lifecycle {
            Some(lifecycle) => Some(lifecycle.state().await),
            None => None,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Stop the connection and the event pump
    pub async fn destroy(&mut self) {
        if let Some(lifecycle) = self.lifecycle.take() {
            lifecycle.shutdown().await;
        }
        if let Some(pump) = self.event_pump.take() {
            pump.abort();
        }
        info!("Device client destroyed");
    }
}

impl<T: Transport> Drop for DeviceClient<T> {
    fn drop(&mut self) {
        if let Some(pump) = self.event_pump.take() {
            pump.abort();
        }
    }
}

/// Configured name, else the name stored by network onboarding
fn resolve_device_name(
    config: &DeviceConfig,
    store: &CredentialStore,
) -> Result<String, ConfigError> {
    if let Some(name) = &config.device.name {
        return Ok(name.clone());
    }
    store
        .load_device_name(STORED_DEVICE_NAME_CAPACITY)
        .ok_or(ConfigError::MissingDeviceName)
}

async fn run_event_pump<T: Transport>(
    lifecycle: Lifecycle<T>,
    mut events: mpsc::Receiver<TransportEvent>,
) {
    while let Some(event) = events.recv().await {
        lifecycle.handle_event(event).await;
    }
    debug!("Transport event channel closed");
}
