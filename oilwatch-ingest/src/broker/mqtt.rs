use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::Outgoing;
use rumqttc::Transport as WireTransport;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::mqttbytes::v5::{Packet, Publish};
use rumqttc::v5::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{
    Acknowledge, BrokerError, Delivery, Handle, InboundMessage, LinkSettings, PropertyValue,
    Receiver, TOPIC_PROPERTY, Transport,
};
use crate::credentials::Credentials;

#[derive(Debug, Clone)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
}

/// MQTT v5 server-side subscription.
///
/// The prefetch credit maps to the v5 receive-maximum, acknowledgements are
/// manual, and user properties on each PUBLISH become application properties.
#[derive(Debug, Clone)]
pub struct MqttTransport {
    endpoint: MqttEndpoint,
}

impl MqttTransport {
    pub fn new(endpoint: MqttEndpoint) -> Self {
        Self { endpoint }
    }

    fn options(&self, credentials: &Credentials, link: &LinkSettings) -> MqttOptions {
        let mut options = MqttOptions::new(
            credentials.client_id.clone(),
            self.endpoint.host.clone(),
            self.endpoint.port,
        );
        options.set_credentials(credentials.username.clone(), credentials.password.clone());
        options.set_keep_alive(self.endpoint.keep_alive);
        options.set_clean_start(false);
        options.set_manual_acks(true);
        options.set_receive_maximum(Some(link.prefetch));
        if self.endpoint.use_tls {
            options.set_transport(WireTransport::tls_with_default_config());
        }
        options
    }
}

type Inbound = mpsc::Receiver<Result<Publish, String>>;

struct Shared {
    client: AsyncClient,
    inbound: Mutex<Option<Inbound>>,
    driver: tokio::sync::Mutex<JoinHandle<()>>,
}

impl Shared {
    fn new(client: AsyncClient, inbound: Inbound, driver: JoinHandle<()>) -> Arc<Self> {
        Arc::new(Self {
            client,
            inbound: Mutex::new(Some(inbound)),
            driver: tokio::sync::Mutex::new(driver),
        })
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.driver.get_mut().abort();
    }
}

pub struct MqttConnection {
    shared: Arc<Shared>,
}

/// MQTT has no session layer; this handle keeps teardown order uniform.
pub struct MqttSession {
    shared: Arc<Shared>,
}

pub struct MqttReceiver {
    shared: Arc<Shared>,
    queue: String,
    inbound: tokio::sync::Mutex<Inbound>,
}

struct MqttAck {
    client: AsyncClient,
    publish: Publish,
}

#[async_trait]
impl Transport for MqttTransport {
    type Connection = MqttConnection;
    type Session = MqttSession;
    type Receiver = MqttReceiver;

    async fn dial(
        &self,
        credentials: &Credentials,
        link: &LinkSettings,
    ) -> Result<Self::Connection, BrokerError> {
        let capacity = usize::from(link.prefetch.max(1));
        let (client, mut eventloop) = AsyncClient::new(self.options(credentials, link), capacity);

        info!(
            host = %self.endpoint.host,
            port = self.endpoint.port,
            username = %credentials.username,
            "connecting to broker"
        );

        match tokio::time::timeout(self.endpoint.connect_timeout, wait_for_connack(&mut eventloop))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(BrokerError::Timeout),
        }

        let (tx, rx) = mpsc::channel(capacity);
        let driver = tokio::spawn(drive(eventloop, tx));

        Ok(MqttConnection {
            shared: Shared::new(client, rx, driver),
        })
    }

    async fn open_session(
        &self,
        connection: &Self::Connection,
    ) -> Result<Self::Session, BrokerError> {
        Ok(MqttSession {
            shared: Arc::clone(&connection.shared),
        })
    }

    async fn open_receiver(
        &self,
        session: &Self::Session,
        link: &LinkSettings,
    ) -> Result<Self::Receiver, BrokerError> {
        let inbound = session
            .shared
            .inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| BrokerError::Transport("connection already has a receiver".into()))?;

        session
            .shared
            .client
            .subscribe(link.queue.clone(), QoS::AtLeastOnce)
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        debug!(queue = %link.queue, prefetch = link.prefetch, "receiver attached");

        Ok(MqttReceiver {
            shared: Arc::clone(&session.shared),
            queue: link.queue.clone(),
            inbound: tokio::sync::Mutex::new(inbound),
        })
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), BrokerError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(BrokerError::Auth(format!("{code:?}")));
            }
            Err(e) => return Err(BrokerError::Transport(e.to_string())),
        }
    }
}

/// Polls the event loop until it fails or our DISCONNECT is written,
/// forwarding publishes.
///
/// rumqttc reconnects on the next poll after an error; stopping here leaves
/// reconnection to the receive loop, which re-signs the credentials.
async fn drive(mut eventloop: EventLoop, tx: mpsc::Sender<Result<Publish, String>>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if tx.send(Ok(publish)).await.is_err() {
                    debug!("receiver dropped, stopping event loop");
                    return;
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("disconnect sent, stopping event loop");
                return;
            }
            Ok(Event::Incoming(Packet::Disconnect(disconnect))) => {
                warn!(reason = ?disconnect.reason_code, "broker sent disconnect");
                let _ = tx.send(Err("broker sent disconnect".into())).await;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                let _ = tx.send(Err(e.to_string())).await;
                return;
            }
        }
    }
}

fn to_message(publish: &Publish) -> InboundMessage {
    let mut message = InboundMessage::new(publish.payload.clone());

    if let Some(properties) = &publish.properties {
        for (key, value) in &properties.user_properties {
            message
                .properties
                .insert(key.clone(), PropertyValue::String(value.clone()));
        }
    }

    message
        .properties
        .entry(TOPIC_PROPERTY.to_string())
        .or_insert_with(|| {
            PropertyValue::String(String::from_utf8_lossy(&publish.topic).into_owned())
        });

    message
}

#[async_trait]
impl Handle for MqttConnection {
    /// Queues DISCONNECT, then waits for the event loop to write it and exit.
    async fn close(&self) -> Result<(), BrokerError> {
        self.shared
            .client
            .disconnect()
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))?;

        let mut driver = self.shared.driver.lock().await;
        // A finished driver may already have been awaited; polling it again panics.
        if !driver.is_finished() {
            let _ = (&mut *driver).await;
        }
        Ok(())
    }
}

#[async_trait]
impl Handle for MqttSession {
    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

#[async_trait]
impl Handle for MqttReceiver {
    async fn close(&self) -> Result<(), BrokerError> {
        self.shared
            .client
            .unsubscribe(self.queue.clone())
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }
}

#[async_trait]
impl Receiver for MqttReceiver {
    async fn receive(&self) -> Result<Delivery, BrokerError> {
        let mut inbound = self.inbound.lock().await;

        match inbound.recv().await {
            Some(Ok(publish)) => {
                let message = to_message(&publish);
                let ack = MqttAck {
                    client: self.shared.client.clone(),
                    publish,
                };
                Ok(Delivery::new(message, Box::new(ack)))
            }
            Some(Err(reason)) => Err(BrokerError::Receive(reason)),
            None => Err(BrokerError::Receive("event loop stopped".into())),
        }
    }
}

#[async_trait]
impl Acknowledge for MqttAck {
    async fn accept(&self) -> Result<(), BrokerError> {
        self.client
            .ack(&self.publish)
            .await
            .map_err(|e| BrokerError::Transport(e.to_string()))
    }
}
