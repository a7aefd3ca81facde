//! Mock implementations for testing
//!
//! Provides a recording [`MockTransport`] and an in-memory [`MemoryStore`] so
//! the lifecycle can be driven without a broker or a filesystem.

use crate::error::{StoreError, TransportError};
use crate::session::SessionOptions;
use crate::storage::KeyValueStore;
use crate::transport::{QoS, Transport, TransportEvent, TransportHandle};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// One recorded publish
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    /// Index of the connection it went out on, starting at 0
    pub connection: usize,
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Default)]
struct MockState {
    connections: Vec<SessionOptions>,
    published: Vec<PublishedMessage>,
    subscriptions: Vec<(usize, String)>,
    events: Option<mpsc::Sender<TransportEvent>>,
    connected: bool,
    stopped: usize,
    fail_connects: bool,
    fail_publishes: bool,
    fail_subscribes: bool,
}

/// Mock transport for testing
///
/// Clones share their recordings, so a test keeps one clone and hands the
/// other to the client.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn fail_connects(&self, fail: bool) {
        self.lock().fail_connects = fail;
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.lock().fail_publishes = fail;
    }

    pub fn fail_subscribes(&self, fail: bool) {
        self.lock().fail_subscribes = fail;
    }

    /// Options of every connection opened so far
    pub fn connections(&self) -> Vec<SessionOptions> {
        self.lock().connections.clone()
    }

    pub fn connection_count(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn last_connection(&self) -> Option<SessionOptions> {
        self.lock().connections.last().cloned()
    }

    /// Number of handles stopped
    pub fn stop_count(&self) -> usize {
        self.lock().stopped
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock().published.clone()
    }

    /// Payloads published to `topic`, oldest first
    pub fn published_to(&self, topic: &str) -> Vec<Vec<u8>> {
        self.lock()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .map(|m| m.payload.clone())
            .collect()
    }

    /// Topics subscribed on the latest connection
    pub fn subscriptions(&self) -> Vec<String> {
        let state = self.lock();
        let latest = state.connections.len().saturating_sub(1);
        state
            .subscriptions
            .iter()
            .filter(|(connection, _)| *connection == latest)
            .map(|(_, topic)| topic.clone())
            .collect()
    }

    pub fn clear_history(&self) {
        let mut state = self.lock();
        state.published.clear();
        state.subscriptions.clear();
    }

    /// Deliver an event as if the latest connection produced it.
    /// Returns false when no connection is open or the receiver is gone.
    pub async fn inject(&self, event: TransportEvent) -> bool {
        let events = {
            let mut state = self.lock();
            match &event {
                TransportEvent::Connected => state.connected = true,
                TransportEvent::Disconnected => state.connected = false,
                TransportEvent::Message { .. } => {}
            }
            state.events.clone()
        };
        match events {
            Some(events) => events.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Deliver an inbound message on `topic`
    pub async fn inject_message(&self, topic: &str, payload: &[u8]) -> bool {
        self.inject(TransportEvent::Message {
            topic: topic.to_string(),
            payload: bytes::Bytes::copy_from_slice(payload),
        })
        .await
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Handle = MockHandle;

    async fn connect(
        &self,
        options: &SessionOptions,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Self::Handle, TransportError> {
        let mut state = self.lock();
        if state.fail_connects {
            return Err(TransportError::ConnectionFailed(
                "Mock connection failure".into(),
            ));
        }

        state.connections.push(options.clone());
        state.events = Some(events.clone());
        state.connected = false;

        Ok(MockHandle {
            index: state.connections.len() - 1,
            state: self.state.clone(),
            events,
            stopped: false,
        })
    }
}

/// Handle returned by [`MockTransport`]
#[derive(Debug)]
pub struct MockHandle {
    index: usize,
    state: Arc<Mutex<MockState>>,
    events: mpsc::Sender<TransportEvent>,
    stopped: bool,
}

impl MockHandle {
    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TransportHandle for MockHandle {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        if self.stopped {
            return Err(TransportError::Stopped);
        }
        let mut state = self.lock();
        if state.fail_publishes {
            return Err(TransportError::PublishFailed {
                topic: topic.to_string(),
                source: "Mock publish failure".into(),
            });
        }
        state.published.push(PublishedMessage {
            connection: self.index,
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str, _qos: QoS) -> Result<(), TransportError> {
        if self.stopped {
            return Err(TransportError::Stopped);
        }
        let mut state = self.lock();
        if state.fail_subscribes {
            return Err(TransportError::SubscriptionFailed {
                topic: topic.to_string(),
                source: "Mock subscribe failure".into(),
            });
        }
        state.subscriptions.push((self.index, topic.to_string()));
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), TransportError> {
        if self.stopped {
            return Err(TransportError::Stopped);
        }
        self.stopped = true;

        let was_connected = {
            let mut state = self.lock();
            state.stopped += 1;
            std::mem::replace(&mut state.connected, false)
        };
        if was_connected {
            let _ = self.events.try_send(TransportEvent::Disconnected);
        }
        Ok(())
    }
}

/// In-memory key/value store
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
    initialized: AtomicBool,
    fail_init: AtomicBool,
    fail_loads: AtomicBool,
    fail_saves: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with `entries`, as if written by an earlier run
    pub fn with_entries(entries: &[(&str, &str)]) -> Self {
        let store = Self::new();
        {
            let mut map = store.lock();
            for (key, value) in entries {
                map.insert(key.to_string(), value.to_string());
            }
        }
        store
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Raw stored value, bypassing initialization and capacity checks
    pub fn get(&self, key: &str) -> Option<String> {
        self.lock().get(key).cloned()
    }

    /// Make `init` fail with an I/O error, leaving the store unusable
    pub fn fail_init(&self, fail: bool) {
        self.fail_init.store(fail, Ordering::SeqCst);
    }

    /// Make every load fail with an I/O error
    pub fn fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Make every save fail with an I/O error
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    fn ensure_initialized(&self) -> Result<(), StoreError> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::NotInitialized)
        }
    }
}

impl KeyValueStore for MemoryStore {
    fn init(&self) -> Result<(), StoreError> {
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(StoreError::IoFailure("Mock init failure".to_string()));
        }
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn save(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.ensure_initialized()?;
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::IoFailure("Mock save failure".to_string()));
        }
        self.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn load(&self, key: &str, capacity: usize) -> Result<String, StoreError> {
        self.ensure_initialized()?;
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StoreError::IoFailure("Mock load failure".to_string()));
        }
        let value = self
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if value.len() > capacity {
            return Err(StoreError::BufferTooSmall {
                key: key.to_string(),
                len: value.len(),
                capacity,
            });
        }
        Ok(value)
    }
}
