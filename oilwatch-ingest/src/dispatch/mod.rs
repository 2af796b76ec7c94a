pub mod payload;

use oilwatch_core::{DeviceId, DeviceState, LevelReading, LocationReading, ReadingId};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::broker::InboundMessage;
use crate::storage::DeviceStorage;

use payload::{Position, StatusMessage, Telemetry};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("unrecognized message: {payload}")]
    Unrecognized { payload: String },
    #[error("storage error: {0}")]
    Storage(String),
}

/// What a message turned out to be.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatched {
    Location(DeviceId),
    Status(DeviceId),
}

/// Device id is the third `/`-separated topic segment.
///
/// `/k277nFFa4zB/868488079671754/user/update` -> `868488079671754`
pub fn device_id_from_topic(topic: &str) -> Result<DeviceId, DispatchError> {
    topic
        .split('/')
        .nth(2)
        .map(DeviceId::new)
        .ok_or_else(|| DispatchError::Malformed(format!("invalid topic: {topic}")))
}

/// Routes classified telemetry into storage.
pub struct Dispatcher<S: DeviceStorage> {
    storage: S,
}

impl<S: DeviceStorage> Dispatcher<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub async fn dispatch(&self, message: &InboundMessage) -> Result<Dispatched, DispatchError> {
        let topic = message
            .topic()
            .ok_or_else(|| DispatchError::Malformed("missing topic property".into()))?;
        let device_id = device_id_from_topic(topic)?;

        let timestamp = match message.generate_time_ms() {
            Some(ms) => jiff::Timestamp::from_millisecond(ms).map_err(|_| {
                DispatchError::Malformed(format!("generate time out of range: {ms}"))
            })?,
            None => jiff::Timestamp::now(),
        };

        debug!(%device_id, %timestamp, bytes = message.payload.len(), "dispatching message");

        let raw = || String::from_utf8_lossy(&message.payload).into_owned();
        let value: serde_json::Value = serde_json::from_slice(&message.payload)
            .map_err(|_| DispatchError::Unrecognized { payload: raw() })?;

        match payload::classify(&value) {
            Some((_, Ok(Telemetry::Location(position)))) => {
                self.handle_location(device_id, position, timestamp).await
            }
            Some((_, Ok(Telemetry::Status(status)))) => {
                self.handle_status(device_id, status, timestamp).await
            }
            Some((kind, Err(e))) => {
                debug!(%kind, "payload matched but was rejected");
                Err(e)
            }
            None => Err(DispatchError::Unrecognized { payload: raw() }),
        }
    }

    async fn handle_location(
        &self,
        device_id: DeviceId,
        position: Position,
        timestamp: jiff::Timestamp,
    ) -> Result<Dispatched, DispatchError> {
        info!(
            %device_id,
            source = %position.source,
            longitude = position.longitude,
            latitude = position.latitude,
            "location reading"
        );

        let reading = LocationReading {
            id: ReadingId::generate(),
            device_id: device_id.clone(),
            longitude: position.longitude,
            latitude: position.latitude,
            source: position.source,
            timestamp,
        };

        self.storage
            .save_location(reading)
            .await
            .map_err(|e| DispatchError::Storage(e.to_string()))?;

        self.mark_online(&device_id).await;
        Ok(Dispatched::Location(device_id))
    }

    async fn handle_status(
        &self,
        device_id: DeviceId,
        status: StatusMessage,
        timestamp: jiff::Timestamp,
    ) -> Result<Dispatched, DispatchError> {
        info!(
            %device_id,
            level = status.oil_level,
            distance = status.distance,
            confidence = status.confidence,
            tank_height = status.tank_height,
            "status reading"
        );

        let reading = LevelReading {
            id: ReadingId::generate(),
            device_id: device_id.clone(),
            level: status.oil_level,
            distance: status.distance,
            confidence: status.confidence,
            timestamp,
        };

        self.storage
            .save_level(reading)
            .await
            .map_err(|e| DispatchError::Storage(e.to_string()))?;

        // The record must exist before the configuration can land on it.
        self.ensure_device(&device_id).await;
        if let Err(e) = self
            .storage
            .update_alert_config(&device_id, status.alerts())
            .await
        {
            warn!(%device_id, error = %e, "failed to update alert config");
        }
        self.set_online(&device_id).await;

        Ok(Dispatched::Status(device_id))
    }

    async fn mark_online(&self, device_id: &DeviceId) {
        self.ensure_device(device_id).await;
        self.set_online(device_id).await;
    }

    async fn ensure_device(&self, device_id: &DeviceId) {
        if let Err(e) = self.storage.create_device_if_absent(device_id).await {
            warn!(%device_id, error = %e, "failed to create device record");
        }
    }

    async fn set_online(&self, device_id: &DeviceId) {
        if let Err(e) = self.storage.set_state(device_id, DeviceState::Online).await {
            warn!(%device_id, error = %e, "failed to mark device online");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_id_is_third_segment() {
        let id = device_id_from_topic("/k277nFFa4zB/868488079671754/user/update").unwrap();
        assert_eq!(id.as_str(), "868488079671754");

        let id = device_id_from_topic("a/b/c").unwrap();
        assert_eq!(id.as_str(), "c");
    }

    #[test]
    fn short_topics_are_malformed() {
        for topic in ["", "/", "/pk", "pk/dev"] {
            assert!(
                matches!(
                    device_id_from_topic(topic),
                    Err(DispatchError::Malformed(_))
                ),
                "{topic:?} should be rejected"
            );
        }
    }

    #[test]
    fn empty_segment_still_counts() {
        let id = device_id_from_topic("//").unwrap();
        assert_eq!(id.as_str(), "");
    }
}
