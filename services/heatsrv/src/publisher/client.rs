//! Message transport
//!
//! The publish queue only needs connect, disconnect, publish and a liveness
//! flag. `RumqttcTransport` provides them on top of a rumqttc event loop.

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::MqttConfig;
use crate::error::{HeatSrvError, Result};

const DEFAULT_MQTT_PORT: u16 = 1883;
const DISCONNECT_GRACE: Duration = Duration::from_millis(500);

/// Broker-side interface of the publish queue
#[async_trait]
pub trait MessageTransport: Send + Sync {
    /// Establish a session; returns once the broker accepted it
    async fn connect(&self) -> Result<()>;

    /// Close the session, best effort
    async fn disconnect(&self) -> Result<()>;

    /// Publish one message with at-least-once intent
    async fn publish(&self, topic: &str, payload: &str) -> Result<()>;

    /// Whether the session is currently usable
    fn is_connected(&self) -> bool;
}

/// Broker address split out of `mqtt://host:port`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl BrokerAddress {
    pub fn parse(server_uri: &str) -> Result<Self> {
        let url = Url::parse(server_uri)
            .map_err(|e| HeatSrvError::Config(format!("Invalid server_uri '{server_uri}': {e}")))?;

        match url.scheme() {
            "mqtt" | "tcp" => {},
            other => {
                return Err(HeatSrvError::Config(format!(
                    "Unsupported MQTT scheme '{other}', expected mqtt:// or tcp://"
                )));
            },
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| HeatSrvError::Config(format!("server_uri '{server_uri}' has no host")))?;

        Ok(Self {
            host: host.to_string(),
            port: url.port().unwrap_or(DEFAULT_MQTT_PORT),
        })
    }
}

struct Session {
    client: AsyncClient,
    event_loop: JoinHandle<()>,
}

/// rumqttc-backed MQTT session
pub struct RumqttcTransport {
    config: MqttConfig,
    broker: BrokerAddress,
    session: Mutex<Option<Session>>,
    connected: Arc<AtomicBool>,
}

impl RumqttcTransport {
    pub fn new(config: MqttConfig) -> Result<Self> {
        let broker = BrokerAddress::parse(&config.server_uri)?;
        Ok(Self {
            config,
            broker,
            session: Mutex::new(None),
            connected: Arc::new(AtomicBool::new(false)),
        })
    }

    fn options(&self) -> MqttOptions {
        let mut mqtt_options =
            MqttOptions::new(&self.config.client_id, &self.broker.host, self.broker.port);

        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            mqtt_options.set_credentials(username, password);
        }

        mqtt_options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs.max(5)));
        mqtt_options.set_clean_session(true);
        mqtt_options
    }
}

/// Drive the rumqttc event loop until the connection ends
///
/// The first ConnAck (or the first error) is reported through `ready`. The
/// loop never reconnects on its own; that is left to the publish queue.
async fn run_event_loop(
    mut eventloop: rumqttc::EventLoop,
    connected: Arc<AtomicBool>,
    ready: oneshot::Sender<std::result::Result<(), String>>,
) {
    let mut ready = Some(ready);
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    connected.store(true, Ordering::Release);
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Ok(()));
                    }
                } else {
                    let reason = format!("broker refused connection: {:?}", ack.code);
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(Err(reason));
                    }
                    break;
                }
            },
            Ok(Event::Incoming(Packet::Disconnect)) => {
                info!("Broker closed the session");
                break;
            },
            Ok(notification) => {
                debug!("MQTT Event: {:?}", notification);
            },
            Err(e) => {
                match ready.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(e.to_string()));
                    },
                    None => error!("MQTT Connection error: {}", e),
                }
                break;
            },
        }
    }
    connected.store(false, Ordering::Release);
}

#[async_trait]
impl MessageTransport for RumqttcTransport {
    async fn connect(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if let Some(old) = session.take() {
            old.event_loop.abort();
        }
        self.connected.store(false, Ordering::Release);

        let (client, eventloop) = AsyncClient::new(self.options(), self.config.channel_capacity);
        let (ready_tx, ready_rx) = oneshot::channel();
        let event_loop = tokio::spawn(run_event_loop(
            eventloop,
            Arc::clone(&self.connected),
            ready_tx,
        ));

        let timeout = self.config.connect_timeout();
        let outcome = match tokio::time::timeout(timeout, ready_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err("event loop ended before ConnAck".to_string()),
            Err(_) => Err(format!("no ConnAck within {:?}", timeout)),
        };

        match outcome {
            Ok(()) => {
                *session = Some(Session { client, event_loop });
                info!(
                    "Connected to MQTT broker {}:{}",
                    self.broker.host, self.broker.port
                );
                Ok(())
            },
            Err(reason) => {
                event_loop.abort();
                Err(HeatSrvError::Connect(format!(
                    "{}:{}: {}",
                    self.broker.host, self.broker.port, reason
                )))
            },
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(mut session) = self.session.lock().await.take() else {
            return Ok(());
        };

        if let Err(e) = session.client.disconnect().await {
            warn!("Error disconnecting from MQTT broker: {}", e);
        }
        // give the event loop a moment to flush the DISCONNECT packet
        if tokio::time::timeout(DISCONNECT_GRACE, &mut session.event_loop)
            .await
            .is_err()
        {
            session.event_loop.abort();
        }
        self.connected.store(false, Ordering::Release);
        info!("Disconnected from MQTT broker");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        if !self.is_connected() {
            return Err(HeatSrvError::NotConnected);
        }

        let session = self.session.lock().await;
        let Some(session) = session.as_ref() else {
            return Err(HeatSrvError::NotConnected);
        };

        session
            .client
            .publish(topic, QoS::AtLeastOnce, false, payload.as_bytes().to_vec())
            .await?;
        debug!("Published message to topic: {}", topic);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_broker_address() {
        assert_eq!(
            BrokerAddress::parse("mqtt://broker.local:1884").unwrap(),
            BrokerAddress {
                host: "broker.local".to_string(),
                port: 1884
            }
        );
        assert_eq!(BrokerAddress::parse("tcp://10.0.0.2").unwrap().port, 1883);
        assert!(BrokerAddress::parse("http://broker").is_err());
        assert!(BrokerAddress::parse("not a url").is_err());
    }

    #[tokio::test]
    async fn test_publish_requires_connection() {
        let transport = RumqttcTransport::new(MqttConfig::default()).unwrap();
        assert!(!transport.is_connected());
        let err = transport.publish("heating/x", "1").await.unwrap_err();
        assert!(matches!(err, HeatSrvError::NotConnected));
        // nothing to tear down
        transport.disconnect().await.unwrap();
    }
}
