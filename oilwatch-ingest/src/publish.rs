//! Downlink commands to devices.

use std::time::Duration;

use async_trait::async_trait;
use oilwatch_core::AlertConfig;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::mqtt::MqttEndpoint;
use crate::credentials::{CredentialError, CredentialSigner};

const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("credential signing failed: {0}")]
    Credentials(#[from] CredentialError),
    #[error("failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("connect timed out")]
    Timeout,
}

#[async_trait]
pub trait CommandPublisher: Send + Sync {
    async fn publish(
        &self,
        product_key: &str,
        device_name: &str,
        payload: &Value,
    ) -> Result<(), PublishError>;
}

/// Per-device downlink topic.
pub fn command_topic(product_key: &str, device_name: &str) -> String {
    format!("/{product_key}/{device_name}/user/get")
}

/// Devices expect the command under a top-level `config` key.
pub fn encode_command(payload: &Value) -> Result<Vec<u8>, PublishError> {
    Ok(serde_json::to_vec(&json!({ "config": payload }))?)
}

/// Settings a device accepts over the downlink. Unset fields go out as zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeviceConfig {
    pub tank_height: f64,
    pub sensor_offset: f64,
    pub sample_interval: u32,
    pub sample_count: u32,
    pub window_size: u32,
    pub std_threshold: f64,
    pub low_level_alert: f64,
    pub high_level_alert: f64,
}

impl DeviceConfig {
    pub fn alerts(&self) -> AlertConfig {
        AlertConfig {
            low_level_alert: self.low_level_alert,
            high_level_alert: self.high_level_alert,
            tank_height: self.tank_height,
        }
    }
}

/// Publishes commands over an MQTT 3.1.1 device session.
pub struct MqttCommandPublisher {
    client: AsyncClient,
    driver: Option<JoinHandle<()>>,
}

impl MqttCommandPublisher {
    pub async fn connect(
        endpoint: &MqttEndpoint,
        signer: &CredentialSigner,
        product_key: &str,
    ) -> Result<Self, PublishError> {
        let credentials = signer.sign_device(product_key, jiff::Timestamp::now().as_millisecond())?;

        let mut options = MqttOptions::new(
            credentials.client_id.clone(),
            endpoint.host.clone(),
            endpoint.port,
        );
        options.set_credentials(credentials.username.clone(), credentials.password.clone());
        options.set_keep_alive(endpoint.keep_alive);
        options.set_clean_session(false);
        if endpoint.use_tls {
            options.set_transport(rumqttc::Transport::tls_with_default_config());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 10);

        match tokio::time::timeout(endpoint.connect_timeout, wait_for_connack(&mut eventloop)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(PublishError::Timeout),
        }

        info!(client_id = %credentials.client_id, host = %endpoint.host, "command publisher connected");

        let driver = tokio::spawn(drive(eventloop));
        Ok(Self {
            client,
            driver: Some(driver),
        })
    }

    /// Flushes queued commands, then disconnects.
    pub async fn disconnect(mut self) {
        if let Err(e) = self.client.disconnect().await {
            warn!(error = %e, "command publisher disconnect failed");
        }
        if let Some(mut driver) = self.driver.take() {
            if tokio::time::timeout(DISCONNECT_TIMEOUT, &mut driver).await.is_err() {
                warn!("command publisher did not disconnect in time");
                driver.abort();
            }
        }
    }
}

impl Drop for MqttCommandPublisher {
    fn drop(&mut self) {
        if let Some(driver) = &self.driver {
            driver.abort();
        }
    }
}

#[async_trait]
impl CommandPublisher for MqttCommandPublisher {
    async fn publish(
        &self,
        product_key: &str,
        device_name: &str,
        payload: &Value,
    ) -> Result<(), PublishError> {
        let topic = command_topic(product_key, device_name);
        let body = encode_command(payload)?;

        self.client
            .publish(topic.clone(), QoS::AtLeastOnce, false, body)
            .await
            .map_err(|e| PublishError::Publish(e.to_string()))?;

        info!(%topic, "command published");
        Ok(())
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), PublishError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => {}
            Err(ConnectionError::ConnectionRefused(code)) => {
                return Err(PublishError::Connect(format!("{code:?}")));
            }
            Err(e) => return Err(PublishError::Connect(e.to_string())),
        }
    }
}

// rumqttc reconnects on the next poll; back off so a dead broker does not spin.
async fn drive(mut eventloop: EventLoop) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("command publisher disconnected");
                return;
            }
            Ok(event) => debug!(?event, "publisher event"),
            Err(e) => {
                warn!(error = %e, "publisher connection error");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_targets_device_downlink() {
        assert_eq!(
            command_topic("k277nFFa4zB", "868488079671754"),
            "/k277nFFa4zB/868488079671754/user/get"
        );
    }

    #[test]
    fn command_is_wrapped_in_config() {
        let body = encode_command(&json!({"tankHeight": 120.0})).unwrap();
        let decoded: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(decoded, json!({"config": {"tankHeight": 120.0}}));
    }

    #[test]
    fn device_config_uses_device_field_names() {
        let config = DeviceConfig {
            tank_height: 150.0,
            low_level_alert: 10.0,
            high_level_alert: 90.0,
            ..Default::default()
        };
        let value = serde_json::to_value(&config).unwrap();

        assert_eq!(value["tankHeight"], json!(150.0));
        assert_eq!(value["lowLevelAlert"], json!(10.0));
        assert_eq!(value["sampleInterval"], json!(0));
        assert_eq!(config.alerts().tank_height, 150.0);
    }

    #[test]
    fn partial_device_config_defaults_the_rest() {
        let config: DeviceConfig = serde_json::from_str(r#"{"highLevelAlert": 80}"#).unwrap();
        assert_eq!(config.high_level_alert, 80.0);
        assert_eq!(config.tank_height, 0.0);
    }
}
