//! I/O side of the MQTT transport
//!
//! Each connection owns a spawned task polling the rumqttc event loop. The
//! task reports connection edges and inbound messages on the lifecycle's
//! event channel and applies the fixed reconnect interval after failures;
//! rumqttc itself reconnects on the next poll.
//!
//! Publishes and subscribes only enqueue. The lifecycle calls them while
//! holding its session lock, and the event loop may be waiting for that same
//! lifecycle to take its next event, so a full request queue fails the call
//! instead of waiting for room.

use super::connection::configure_mqtt_options;
use super::message_handler::{EventRoute, MessageHandler};
use crate::error::TransportError;
use crate::mqtt_span;
use crate::session::SessionOptions;
use crate::transport::{QoS, Transport, TransportEvent, TransportHandle};
use async_trait::async_trait;
use rumqttc::{AsyncClient, EventLoop};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

/// Capacity of the rumqttc request channel
const REQUEST_CHANNEL_CAPACITY: usize = 10;
/// Time given to a DISCONNECT to go out before the task is told to stop
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);
/// Time given to the task to stop before it is aborted
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Opens rumqttc connections
#[derive(Debug, Default, Clone)]
pub struct MqttTransport;

impl MqttTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for MqttTransport {
    type Handle = MqttHandle;

    async fn connect(
        &self,
        options: &SessionOptions,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Self::Handle, TransportError> {
        let mqtt_options = configure_mqtt_options(options)?;
        let (host, port) = mqtt_options.broker_address();
        let (client, event_loop) = AsyncClient::new(mqtt_options, REQUEST_CHANNEL_CAPACITY);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let connected = Arc::new(AtomicBool::new(false));

        info!(
            host = %host,
            port,
            provisioning = options.is_provisioning(),
            "Starting MQTT connection"
        );

        let task = tokio::spawn(
            run_event_loop(
                event_loop,
                events.clone(),
                shutdown_rx,
                connected.clone(),
                options.reconnect_interval,
            )
            .instrument(mqtt_span!(client = %options.client_name, host = %host)),
        );

        Ok(MqttHandle {
            client,
            events,
            shutdown_tx,
            connected,
            task: Some(task),
        })
    }
}

/// One running rumqttc connection
pub struct MqttHandle {
    client: AsyncClient,
    events: mpsc::Sender<TransportEvent>,
    shutdown_tx: watch::Sender<bool>,
    connected: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl MqttHandle {
    fn ensure_running(&self) -> Result<(), TransportError> {
        if self.task.is_none() {
            return Err(TransportError::Stopped);
        }
        Ok(())
    }
}

#[async_trait]
impl TransportHandle for MqttHandle {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), TransportError> {
        self.ensure_running()?;
        self.client
            .try_publish(topic, qos, retain, payload)
            .map_err(|e| TransportError::PublishFailed {
                topic: topic.to_string(),
                source: Box::new(e),
            })
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), TransportError> {
        self.ensure_running()?;
        self.client
            .try_subscribe(topic, qos)
            .map_err(|e| TransportError::SubscriptionFailed {
                topic: topic.to_string(),
                source: Box::new(e),
            })
    }

    async fn stop(&mut self) -> Result<(), TransportError> {
        let mut task = self.task.take().ok_or(TransportError::Stopped)?;

        let mut finished = false;
        if self.connected.load(Ordering::SeqCst) && self.client.try_disconnect().is_ok() {
            finished = tokio::time::timeout(DISCONNECT_GRACE, &mut task)
                .await
                .is_ok();
        }

        if !finished {
            let _ = self.shutdown_tx.send(true);
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                warn!("MQTT event loop did not stop in time, aborting");
                task.abort();
            }
        }

        if self.connected.swap(false, Ordering::SeqCst) {
            // try_send: the receiver may be waiting on a lock held by our caller
            if let Err(e) = self.events.try_send(TransportEvent::Disconnected) {
                error!("Failed to report disconnect after stop: {}", e);
            }
        }

        info!("MQTT connection stopped");
        Ok(())
    }
}

impl Drop for MqttHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Poll the event loop until shutdown or our own DISCONNECT goes out
async fn run_event_loop(
    mut event_loop: EventLoop,
    events: mpsc::Sender<TransportEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
    connected: Arc<AtomicBool>,
    reconnect_interval: Duration,
) {
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    debug!(target: "mqtt_transport", "Shutdown signal received, stopping event loop");
                    break;
                }
            }
            result = event_loop.poll() => {
                match result {
                    Ok(event) => {
                        let route = MessageHandler::route_mqtt_event(&event);
                        if !handle_route(route, &events, &connected).await {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!("MQTT connection error: {}", e);
                        let (event, _) =
                            MessageHandler::connection_lost(connected.swap(false, Ordering::SeqCst));
                        if let Some(event) = event {
                            if events.send(event).await.is_err() {
                                break;
                            }
                        }
                        if !interruptible_sleep(shutdown_rx.clone(), reconnect_interval).await {
                            break;
                        }
                        debug!(target: "mqtt_transport", "Reconnecting after {:?}", reconnect_interval);
                    }
                }
            }
        }
    }
    debug!(target: "mqtt_transport", "MQTT event loop stopped");
}

/// Returns false when the loop should stop
async fn handle_route(
    route: EventRoute,
    events: &mpsc::Sender<TransportEvent>,
    connected: &AtomicBool,
) -> bool {
    match &route {
        EventRoute::DisconnectSent => return false,
        EventRoute::SubscriptionConfirmed {
            packet_id,
            failures,
        } if *failures > 0 => {
            warn!(packet_id, failures, "Broker rejected subscription");
        }
        EventRoute::InfrastructureEvent(event) => {
            debug!(target: "mqtt_transport", "MQTT event: {}", event);
        }
        _ => {}
    }

    let was_connected = connected.load(Ordering::SeqCst);
    let (event, now_connected) = MessageHandler::transport_event(route, was_connected);
    connected.store(now_connected, Ordering::SeqCst);

    match event {
        Some(event) => events.send(event).await.is_ok(),
        None => true,
    }
}

/// Sleep unless shutdown is requested first. Returns false on shutdown.
async fn interruptible_sleep(mut shutdown_rx: watch::Receiver<bool>, delay: Duration) -> bool {
    if *shutdown_rx.borrow() {
        return false;
    }
    tokio::select! {
        changed = shutdown_rx.changed() => {
            changed.is_ok() && !*shutdown_rx.borrow()
        }
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn test_interruptible_sleep_completes() {
        let (_tx, rx) = watch::channel(false);
        assert!(interruptible_sleep(rx, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_interruptible_sleep_interrupted() {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = tx.send(true);
        });
        assert!(!interruptible_sleep(rx, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_handle_route_tracks_connection_edges() {
        let (tx, mut rx) = mpsc::channel(8);
        let connected = AtomicBool::new(false);

        assert!(handle_route(EventRoute::ConnectionAcknowledged, &tx, &connected).await);
        assert!(connected.load(Ordering::SeqCst));
        assert_eq!(rx.recv().await, Some(TransportEvent::Connected));

        assert!(
            handle_route(
                EventRoute::MessageReceived {
                    topic: "t".to_string(),
                    payload: Bytes::from_static(b"p"),
                },
                &tx,
                &connected
            )
            .await
        );
        assert!(matches!(
            rx.recv().await,
            Some(TransportEvent::Message { .. })
        ));

        assert!(handle_route(EventRoute::Disconnected, &tx, &connected).await);
        assert_eq!(rx.recv().await, Some(TransportEvent::Disconnected));
        assert!(!connected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_handle_route_stops_after_disconnect_sent() {
        let (tx, _rx) = mpsc::channel(8);
        let connected = AtomicBool::new(true);
        assert!(!handle_route(EventRoute::DisconnectSent, &tx, &connected).await);
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_url() {
        let (tx, _rx) = mpsc::channel(8);
        let options = SessionOptions {
            broker_url: "not-a-url".to_string(),
            client_name: "dev".to_string(),
            username: "provision".to_string(),
            keep_alive: Duration::from_secs(60),
            reconnect_interval: Duration::from_millis(100),
            subscriptions: vec![],
        };

        let result = MqttTransport::new().connect(&options, tx).await;
        assert!(matches!(result, Err(TransportError::InvalidBrokerUrl(_))));
    }

    #[tokio::test]
    async fn test_full_request_queue_fails_instead_of_waiting() {
        // Nobody reads events and no broker answers, so the request queue
        // is never drained
        let (tx, _rx) = mpsc::channel(1);
        let options = SessionOptions {
            broker_url: "mqtt://127.0.0.1:1".to_string(),
            client_name: "dev".to_string(),
            username: "tok".to_string(),
            keep_alive: Duration::from_secs(60),
            reconnect_interval: Duration::from_secs(5),
            subscriptions: vec![],
        };
        let mut handle = MqttTransport::new().connect(&options, tx).await.unwrap();

        let results = tokio::time::timeout(Duration::from_secs(1), async {
            let mut results = Vec::new();
            for i in 0..(REQUEST_CHANNEL_CAPACITY * 2) {
                let topic = format!("v1/devices/me/rpc/response/{i}");
                results.push(
                    handle
                        .publish(&topic, b"{}".to_vec(), QoS::AtLeastOnce, false)
                        .await,
                );
            }
            results
        })
        .await
        .expect("publishing must never wait for queue space");

        assert!(results
            .iter()
            .any(|r| matches!(r, Err(TransportError::PublishFailed { .. }))));
        handle.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_without_broker() {
        let (tx, _rx) = mpsc::channel(8);
        let options = SessionOptions {
            broker_url: "mqtt://127.0.0.1:1".to_string(),
            client_name: "dev".to_string(),
            username: "provision".to_string(),
            keep_alive: Duration::from_secs(60),
            reconnect_interval: Duration::from_millis(50),
            subscriptions: vec![],
        };

        let mut handle = MqttTransport::new().connect(&options, tx).await.unwrap();
        assert!(handle.stop().await.is_ok());
        assert!(matches!(handle.stop().await, Err(TransportError::Stopped)));
        assert!(matches!(
            handle.publish("t", vec![], QoS::AtLeastOnce, false).await,
            Err(TransportError::Stopped)
        ));
    }
}
