//! Message bus abstraction and the MQTT implementation.
//!
//! The bridge only needs five things from a bus: connect, subscribe,
//! publish, in-order delivery of inbound messages, and disconnect.
//! [`PosePublisher`] is the narrow half the relay depends on; [`BusClient`]
//! adds subscription management for the bridge itself.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::BusConfig;

/// Requests buffered between the client handle and the event loop.
const REQUEST_CAPACITY: usize = 64;

/// Pause between polls after a connection error; rumqttc reconnects on the next poll.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// How long disconnect waits for the DISCONNECT packet to go out.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to connect to {host}:{port}: {reason}")]
    Connect {
        host: String,
        port: u16,
        reason: String,
    },

    #[error("broker refused connection: {0}")]
    Refused(String),

    #[error("timed out connecting to {host}:{port}")]
    ConnectTimeout { host: String, port: u16 },

    #[error("bus request failed: {0}")]
    Client(#[from] rumqttc::ClientError),

    #[error("bus is closed")]
    Closed,
}

/// A message received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Publish side of the bus, as seen by the output relay.
#[async_trait]
pub trait PosePublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;
}

/// Full client capability used by the bridge.
///
/// Inbound messages are delivered through the receiver returned when the
/// client is connected, in broker delivery order.
#[async_trait]
pub trait BusClient: PosePublisher {
    async fn subscribe(&self, topic: &str) -> Result<(), BusError>;

    async fn disconnect(&self) -> Result<(), BusError>;
}

/// MQTT client backed by rumqttc.
///
/// The rumqttc event loop runs on its own task; inbound publishes are
/// forwarded over an unbounded channel so a slow consumer never stalls
/// keepalives or outgoing pose publishes.
pub struct MqttBus {
    client: AsyncClient,
    stop: CancellationToken,
    event_task: Mutex<Option<JoinHandle<()>>>,
}

impl MqttBus {
    /// Connect to the broker and wait for CONNACK.
    pub async fn connect(
        config: &BusConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<InboundMessage>), BusError> {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(config.keep_alive);

        let (client, mut eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);

        tracing::info!(
            host = %config.host,
            port = config.port,
            client_id = %config.client_id,
            "Connecting to MQTT broker"
        );
        match tokio::time::timeout(config.connect_timeout, wait_for_connack(&mut eventloop, config))
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(BusError::ConnectTimeout {
                    host: config.host.clone(),
                    port: config.port,
                });
            }
        }
        tracing::info!("Connected to MQTT broker");

        let (tx, rx) = mpsc::unbounded_channel();
        let stop = CancellationToken::new();
        let event_task = tokio::spawn(run_event_loop(eventloop, tx, stop.clone()));

        Ok((
            Self {
                client,
                stop,
                event_task: Mutex::new(Some(event_task)),
            },
            rx,
        ))
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop, config: &BusConfig) -> Result<(), BusError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(BusError::Refused(format!("{:?}", ack.code)))
                };
            }
            Ok(_) => {}
            Err(e) => {
                return Err(BusError::Connect {
                    host: config.host.clone(),
                    port: config.port,
                    reason: e.to_string(),
                });
            }
        }
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    tx: mpsc::UnboundedSender<InboundMessage>,
    stop: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;

            _ = stop.cancelled() => break,

            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    tracing::trace!(topic = %publish.topic, bytes = publish.payload.len(), "Inbound publish");
                    let message = InboundMessage {
                        topic: publish.topic,
                        payload: publish.payload,
                    };
                    if tx.send(message).is_err() {
                        tracing::debug!("Inbound receiver dropped");
                        break;
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    tracing::debug!("Disconnect sent");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "MQTT connection error");
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }
    }
    tracing::debug!("MQTT event loop exiting");
}

#[async_trait]
impl PosePublisher for MqttBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl BusClient for MqttBus {
    async fn subscribe(&self, topic: &str) -> Result<(), BusError> {
        self.client.subscribe(topic, QoS::AtMostOnce).await?;
        tracing::info!(%topic, "Subscribed");
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BusError> {
        let Some(mut event_task) = self.event_task.lock().await.take() else {
            return Ok(());
        };

        let result = self.client.disconnect().await.map_err(BusError::from);
        if result.is_ok()
            && tokio::time::timeout(DISCONNECT_TIMEOUT, &mut event_task)
                .await
                .is_ok()
        {
            tracing::info!("Disconnected from MQTT broker");
            return Ok(());
        }

        self.stop.cancel();
        if tokio::time::timeout(DISCONNECT_TIMEOUT, &mut event_task)
            .await
            .is_err()
        {
            event_task.abort();
        }
        tracing::info!("MQTT event loop stopped");
        result
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use tokio::sync::Notify;

    use super::*;

    /// In-memory bus recording every publish and subscription.
    #[derive(Default)]
    pub struct RecordingBus {
        published: StdMutex<Vec<(String, Vec<u8>)>>,
        subscriptions: StdMutex<Vec<String>>,
        disconnects: AtomicUsize,
        fail_publish: AtomicBool,
        notify: Notify,
    }

    impl RecordingBus {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing() -> Self {
            let bus = Self::default();
            bus.fail_publish.store(true, Ordering::SeqCst);
            bus
        }

        pub fn published(&self) -> Vec<(String, Vec<u8>)> {
            self.published.lock().unwrap().clone()
        }

        pub fn payloads(&self) -> Vec<serde_json::Value> {
            self.published()
                .into_iter()
                .map(|(_, p)| serde_json::from_slice(&p).unwrap())
                .collect()
        }

        pub fn subscriptions(&self) -> Vec<String> {
            self.subscriptions.lock().unwrap().clone()
        }

        pub fn disconnects(&self) -> usize {
            self.disconnects.load(Ordering::SeqCst)
        }

        /// Wait until at least `count` messages were published.
        pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
            tokio::time::timeout(timeout, async {
                loop {
                    let notified = self.notify.notified();
                    if self.published.lock().unwrap().len() >= count {
                        return;
                    }
                    notified.await;
                }
            })
            .await
            .is_ok()
        }
    }

    #[async_trait]
    impl PosePublisher for RecordingBus {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
            if self.fail_publish.load(Ordering::SeqCst) {
                return Err(BusError::Closed);
            }
            self.published
                .lock()
                .unwrap()
                .push((topic.to_string(), payload));
            self.notify.notify_waiters();
            Ok(())
        }
    }

    #[async_trait]
    impl BusClient for RecordingBus {
        async fn subscribe(&self, topic: &str) -> Result<(), BusError> {
            self.subscriptions.lock().unwrap().push(topic.to_string());
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), BusError> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingBus;
    use super::*;

    #[test]
    fn inbound_message_from_static_payload() {
        let msg = InboundMessage::new("/commands/jetson_01", &b"{}"[..]);
        assert_eq!(msg.topic, "/commands/jetson_01");
        assert_eq!(msg.payload, Bytes::from_static(b"{}"));
    }

    #[tokio::test]
    async fn recording_bus_waits_for_publishes() {
        let bus = std::sync::Arc::new(RecordingBus::new());
        let publisher = std::sync::Arc::clone(&bus);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("/pose/a", b"{}".to_vec()).await.unwrap();
        });
        assert!(bus.wait_for(1, Duration::from_secs(2)).await);
        assert_eq!(bus.published()[0].0, "/pose/a");
    }

    #[tokio::test]
    async fn connect_to_unreachable_broker_fails() {
        let config = BusConfig::default()
            .with_host("127.0.0.1")
            .with_port(1);
        let result = MqttBus::connect(&config).await;
        assert!(matches!(
            result,
            Err(BusError::Connect { .. }) | Err(BusError::ConnectTimeout { .. })
        ));
    }
}
