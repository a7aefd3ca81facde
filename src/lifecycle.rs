//! Device onboarding state machine
//!
//! Every transport event goes through [`Lifecycle::handle_event`]. Connects
//! drive provisioning or claiming depending on the stored credentials, the
//! provisioning response persists the issued token and schedules a restart,
//! and RPC requests are handed to the [`RpcRouter`].
//!
//! The session and the live transport handle sit behind one async mutex.
//! Event handling and the restart worker wait on it without bound; telemetry
//! waits at most `telemetry_lock_timeout_ms` and gives up. Readiness is
//! mirrored into an atomic on every session change so a session that is not
//! ready is refused without touching the lock.

use crate::config::DeviceConfig;
use crate::error::{sanitize_for_log, ClientError, ClientResult, TransportError};
use crate::lifecycle_span;
use crate::protocol::messages::{
    to_payload, ClaimRequest, ProvisionOutcome, ProvisionRequest, ProvisionResponse,
};
use crate::protocol::topics::{
    topic_equals, CLAIM_REQUEST_TOPIC, PROVISION_REQUEST_TOPIC, PROVISION_RESPONSE_TOPIC,
    TELEMETRY_TOPIC,
};
use crate::rpc::RpcRouter;
use crate::session::{DeviceToken, LifecycleState, Session, SessionOptions};
use crate::storage::CredentialStore;
use crate::transport::{QoS, Transport, TransportEvent, TransportHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, error, info, warn, Instrument};

/// Lifecycle state machine for one device
///
/// Cheap to clone; clones share the same session.
pub struct Lifecycle<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for Lifecycle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T: Transport> {
    config: DeviceConfig,
    device_name: String,
    transport: T,
    store: CredentialStore,
    router: Arc<RwLock<RpcRouter>>,
    events_tx: mpsc::Sender<TransportEvent>,
    ready: AtomicBool,
    core: Mutex<Core<T::Handle>>,
}

/// Everything guarded by the session lock
struct Core<H> {
    session: Session,
    connection: Option<Connection<H>>,
    shut_down: bool,
}

struct Connection<H> {
    handle: H,
    options: SessionOptions,
}

impl<T: Transport> Lifecycle<T> {
    pub fn new(
        config: DeviceConfig,
        device_name: String,
        transport: T,
        store: CredentialStore,
        router: Arc<RwLock<RpcRouter>>,
        initial_state: LifecycleState,
        events_tx: mpsc::Sender<TransportEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                device_name,
                transport,
                store,
                router,
                events_tx,
                ready: AtomicBool::new(false),
                core: Mutex::new(Core {
                    session: Session::new(initial_state),
                    connection: None,
                    shut_down: false,
                }),
            }),
        }
    }

    pub fn device_name(&self) -> &str {
        &self.inner.device_name
    }

    /// Open the first connection, with the identity the session holds now
    pub async fn connect(&self) -> Result<(), TransportError> {
        let mut core = self.inner.core.lock().await;
        self.open_connection(&mut core).await
    }

    /// Single entry point for transport events
    pub async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                self.on_connected()
                    .instrument(lifecycle_span!(event = "connected", device = %self.inner.device_name))
                    .await
            }
            TransportEvent::Disconnected => {
                let mut core = self.inner.core.lock().await;
                self.set_connected(&mut core, false);
                info!(state = core.session.state().name(), "Transport disconnected");
            }
            TransportEvent::Message { topic, payload } => {
                self.on_message(&topic, &payload)
                    .instrument(lifecycle_span!(event = "message", topic = %topic))
                    .await
            }
        }
    }

    async fn on_connected(&self) {
        let mut core = self.inner.core.lock().await;
        self.set_connected(&mut core, true);
        info!(state = core.session.state().name(), "Transport connected");

        match core.session.state().clone() {
            LifecycleState::Unprovisioned | LifecycleState::AwaitingProvisionResponse => {
                subscribe_all(&*core).await;
                self.request_provisioning(&mut core).await;
            }
            LifecycleState::Unclaimed { token } => {
                subscribe_all(&*core).await;
                self.announce_claim(&mut core, token).await;
            }
            LifecycleState::Claimed { .. } => {
                subscribe_all(&*core).await;
            }
            LifecycleState::PendingRestart { .. } => {
                debug!("Connected while a restart is pending, waiting for the restart");
            }
        }
    }

    async fn request_provisioning(&self, core: &mut Core<T::Handle>) {
        let request = ProvisionRequest {
            device_name: self.inner.device_name.clone(),
            provision_device_key: self.inner.config.device.provision_key.clone(),
            provision_device_secret: self.inner.config.device.provision_secret.clone(),
        };

        let payload = match to_payload(&request) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize provisioning request: {}", e);
                return;
            }
        };

        // Fire-and-forget per connection; a lost request is retried on the
        // next connect
        match publish(&*core, PROVISION_REQUEST_TOPIC, payload).await {
            Ok(()) => {
                info!(device = %self.inner.device_name, "Provisioning request sent");
                self.set_state(core, LifecycleState::AwaitingProvisionResponse);
            }
            Err(e) => warn!("Failed to publish provisioning request: {}", e),
        }
    }

    /// Publish the claim, persist the flag, then trust it
    async fn announce_claim(&self, core: &mut Core<T::Handle>, token: DeviceToken) {
        let Some(claim) = &self.inner.config.claim else {
            debug!("Claiming disabled, not announcing");
            return;
        };

        let request = ClaimRequest {
            secret_key: claim.secret_key.clone(),
            duration_ms: claim.duration_ms,
        };
        let payload = match to_payload(&request) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize claim request: {}", e);
                return;
            }
        };

        if let Err(e) = publish(&*core, CLAIM_REQUEST_TOPIC, payload).await {
            warn!("Failed to publish claim request, will retry on next connect: {}", e);
            return;
        }

        if let Err(e) = self.inner.store.mark_claimed() {
            error!("Failed to persist claim flag, will announce again: {}", e);
            return;
        }

        self.set_state(core, LifecycleState::Claimed { token });
        info!("Device claimed");
    }

    async fn on_message(&self, topic: &str, payload: &[u8]) {
        if RpcRouter::is_rpc_topic(topic) {
            self.handle_rpc(topic, payload).await;
        } else if topic_equals(topic, PROVISION_RESPONSE_TOPIC) {
            self.handle_provision_response(payload).await;
        } else {
            debug!(
                topic,
                payload = %sanitize_for_log(&String::from_utf8_lossy(payload)),
                "Ignoring message"
            );
        }
    }

    async fn handle_rpc(&self, topic: &str, payload: &[u8]) {
        let request = match RpcRouter::parse_request(topic, payload) {
            Ok(request) => request,
            Err(e) => {
                warn!(topic, "Dropping malformed RPC request: {}", e);
                return;
            }
        };
        debug!(request_id = %request.request_id, method = %request.method, "RPC request");

        // The handler runs without the session lock
        let response = self.inner.router.read().await.dispatch(request).await;
        let Some(response) = response else {
            return;
        };

        let core = self.inner.core.lock().await;
        if let Err(e) = publish(&*core, &response.topic, response.payload).await {
            warn!(request_id = %response.request_id, "Failed to publish RPC response: {}", e);
        }
    }

    async fn handle_provision_response(&self, payload: &[u8]) {
        let mut core = self.inner.core.lock().await;
        if *core.session.state() != LifecycleState::AwaitingProvisionResponse {
            info!(
                state = core.session.state().name(),
                "Ignoring provisioning response outside of provisioning"
            );
            return;
        }

        let token = match parse_issued_token(payload) {
            Ok(token) => token,
            Err(reason) => {
                warn!(
                    payload = %sanitize_for_log(&String::from_utf8_lossy(payload)),
                    "Provisioning failed: {}",
                    reason
                );
                return;
            }
        };

        if let Err(e) = self.inner.store.save_token(&token) {
            error!("Failed to persist device token, staying unprovisioned: {}", e);
            return;
        }

        self.set_state(&mut core, LifecycleState::PendingRestart { token });
        info!(
            delay_ms = self.inner.config.mqtt.restart_delay_ms,
            "Device provisioned, restarting session with the new token"
        );

        let lifecycle = self.clone();
        tokio::spawn(async move { lifecycle.restart().await });
    }

    /// Tear down the provisioning connection and reconnect as the device
    ///
    /// Runs on its own task. Once started it always completes unless the
    /// client was shut down in the meantime.
    pub async fn restart(&self) {
        tokio::time::sleep(self.inner.config.restart_delay()).await;

        let mut core = self.inner.core.lock().await;
        if core.shut_down {
            debug!("Client shut down, skipping restart");
            return;
        }

        let token = match core.session.state() {
            LifecycleState::PendingRestart { token } => token.clone(),
            other => {
                warn!(state = other.name(), "No restart pending");
                return;
            }
        };

        if let Some(mut connection) = core.connection.take() {
            if let Err(e) = connection.handle.stop().await {
                warn!("Failed to stop previous connection: {}", e);
            }
        }
        // Not ready until the new connection reports in
        self.set_connected(&mut core, false);

        self.set_state(&mut core, LifecycleState::Unclaimed { token });
        match self.open_connection(&mut core).await {
            Ok(()) => info!("Session restarted with device credentials"),
            Err(e) => error!("Failed to reconnect with device credentials: {}", e),
        }
    }

    async fn open_connection(&self, core: &mut Core<T::Handle>) -> Result<(), TransportError> {
        let options = core
            .session
            .connect_options(&self.inner.config, &self.inner.device_name);
        debug!(?options, "Opening connection");

        let handle = self
            .inner
            .transport
            .connect(&options, self.inner.events_tx.clone())
            .await?;
        core.connection = Some(Connection { handle, options });
        Ok(())
    }

    /// Publish a telemetry payload at QoS 1
    ///
    /// Never queues: a session that is not ready, or a lock that cannot be
    /// taken in time, means the sample is dropped.
    pub async fn send_telemetry(&self, payload: Vec<u8>) -> ClientResult<()> {
        if !self.is_ready() {
            return Err(ClientError::NotReady);
        }

        let timeout = self.inner.config.telemetry_lock_timeout();
        let core = tokio::time::timeout(timeout, self.inner.core.lock())
            .await
            .map_err(|_| ClientError::LockTimeout {
                timeout_ms: self.inner.config.mqtt.telemetry_lock_timeout_ms,
            })?;

        // Readiness may have changed while waiting
        if !core.session.is_ready_for_telemetry() {
            return Err(ClientError::NotReady);
        }

        publish(&*core, TELEMETRY_TOPIC, payload).await
    }

    /// Connected under the device token. Never waits for the session lock.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::Acquire)
    }

    fn set_state(&self, core: &mut Core<T::Handle>, state: LifecycleState) {
        core.session.set_state(state);
        self.sync_ready(core);
    }

    fn set_connected(&self, core: &mut Core<T::Handle>, connected: bool) {
        core.session.set_connected(connected);
        self.sync_ready(core);
    }

    fn sync_ready(&self, core: &Core<T::Handle>) {
        self.inner
            .ready
            .store(core.session.is_ready_for_telemetry(), Ordering::Release);
    }

    pub async fn state(&self) -> LifecycleState {
        self.inner.core.lock().await.session.state().clone()
    }

    pub async fn session(&self) -> Session {
        self.inner.core.lock().await.session.clone()
    }

    /// Stop the live connection. A pending restart will not reconnect.
    pub async fn shutdown(&self) {
        let mut core = self.inner.core.lock().await;
        core.shut_down = true;
        if let Some(mut connection) = core.connection.take() {
            if let Err(e) = connection.handle.stop().await {
                warn!("Failed to stop connection: {}", e);
            }
        }
        self.set_connected(&mut core, false);
    }
}

/// Subscribe to the topic set of the live connection
async fn subscribe_all<H: TransportHandle>(core: &Core<H>) {
    let Some(connection) = &core.connection else {
        warn!("Connected event without a live connection");
        return;
    };
    for topic in &connection.options.subscriptions {
        match connection.handle.subscribe(topic, QoS::AtLeastOnce).await {
            Ok(()) => debug!(topic = %topic, "Subscribed"),
            Err(e) => warn!(topic = %topic, "Subscribe failed: {}", e),
        }
    }
}

async fn publish<H: TransportHandle>(
    core: &Core<H>,
    topic: &str,
    payload: Vec<u8>,
) -> ClientResult<()> {
    let connection = core.connection.as_ref().ok_or(ClientError::NotStarted)?;
    connection
        .handle
        .publish(topic, payload, QoS::AtLeastOnce, false)
        .await?;
    Ok(())
}

/// Token issued by a provisioning response, or why there is none
fn parse_issued_token(payload: &[u8]) -> Result<DeviceToken, String> {
    let response = ProvisionResponse::parse(payload).map_err(|e| e.to_string())?;
    match response.outcome().map_err(|e| e.to_string())? {
        ProvisionOutcome::Issued(value) => DeviceToken::new(value).map_err(|e| e.to_string()),
        ProvisionOutcome::Rejected { status, reason } => Err(format!(
            "platform returned status {status}{}",
            reason.map(|r| format!(": {r}")).unwrap_or_default()
        )),
        ProvisionOutcome::UnsupportedCredentials(kind) => {
            Err(format!("unsupported credentials type {kind}"))
        }
    }
}
