use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use oilwatch_core::{
    AlertConfig, DeviceId, DeviceRecord, DeviceState, LevelReading, LocationReading,
    LocationSource,
};

use crate::storage::{DeviceStorage, HistoryQuery};

#[derive(Debug, thiserror::Error)]
pub enum MemoryStorageError {
    #[error("internal error: {0}")]
    Internal(String),
}

/// In memory storage implementation.
/// This is primarily intended for testing and as a reference
/// implementation of the DeviceStorage trait.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    devices: Arc<Mutex<HashMap<DeviceId, DeviceRecord>>>,
    locations: Arc<Mutex<Vec<LocationReading>>>,
    levels: Arc<Mutex<Vec<LevelReading>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a record as-is.
    pub fn put_device(&self, record: DeviceRecord) -> Result<(), MemoryStorageError> {
        let mut devices = self
            .devices
            .lock()
            .map_err(|_| MemoryStorageError::Internal("devices mutex poisoned".into()))?;
        devices.insert(record.id.clone(), record);
        Ok(())
    }

    pub fn locations(&self) -> Result<Vec<LocationReading>, MemoryStorageError> {
        let locations = self
            .locations
            .lock()
            .map_err(|_| MemoryStorageError::Internal("locations mutex poisoned".into()))?;
        Ok(locations.clone())
    }

    pub fn levels(&self) -> Result<Vec<LevelReading>, MemoryStorageError> {
        let levels = self
            .levels
            .lock()
            .map_err(|_| MemoryStorageError::Internal("levels mutex poisoned".into()))?;
        Ok(levels.clone())
    }
}

#[async_trait]
impl DeviceStorage for MemoryStorage {
    type Error = MemoryStorageError;

    async fn create_device_if_absent(&self, id: &DeviceId) -> Result<(), Self::Error> {
        let mut devices = self
            .devices
            .lock()
            .map_err(|_| MemoryStorageError::Internal("devices mutex poisoned".into()))?;

        devices
            .entry(id.clone())
            .or_insert_with(|| DeviceRecord::new(id.clone(), jiff::Timestamp::now()));

        Ok(())
    }

    async fn set_state(&self, id: &DeviceId, state: DeviceState) -> Result<(), Self::Error> {
        let mut devices = self
            .devices
            .lock()
            .map_err(|_| MemoryStorageError::Internal("devices mutex poisoned".into()))?;

        // Unknown devices are ignored, matching an UPDATE that touches no rows.
        if let Some(record) = devices.get_mut(id) {
            record.state = state;
            record.updated_at = jiff::Timestamp::now();
        }

        Ok(())
    }

    async fn save_location(&self, reading: LocationReading) -> Result<(), Self::Error> {
        let mut locations = self
            .locations
            .lock()
            .map_err(|_| MemoryStorageError::Internal("locations mutex poisoned".into()))?;
        locations.push(reading);
        Ok(())
    }

    async fn save_level(&self, reading: LevelReading) -> Result<(), Self::Error> {
        let mut levels = self
            .levels
            .lock()
            .map_err(|_| MemoryStorageError::Internal("levels mutex poisoned".into()))?;
        levels.push(reading);
        Ok(())
    }

    async fn update_alert_config(
        &self,
        id: &DeviceId,
        config: AlertConfig,
    ) -> Result<(), Self::Error> {
        let mut devices = self
            .devices
            .lock()
            .map_err(|_| MemoryStorageError::Internal("devices mutex poisoned".into()))?;

        if let Some(record) = devices.get_mut(id) {
            record.alerts = config;
            record.updated_at = jiff::Timestamp::now();
        }

        Ok(())
    }

    async fn list_online_devices(&self) -> Result<Vec<DeviceRecord>, Self::Error> {
        let devices = self
            .devices
            .lock()
            .map_err(|_| MemoryStorageError::Internal("devices mutex poisoned".into()))?;

        Ok(devices
            .values()
            .filter(|d| d.state == DeviceState::Online)
            .cloned()
            .collect())
    }

    async fn list_devices(&self) -> Result<Vec<DeviceRecord>, Self::Error> {
        let devices = self
            .devices
            .lock()
            .map_err(|_| MemoryStorageError::Internal("devices mutex poisoned".into()))?;

        let mut all: Vec<_> = devices.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    async fn latest_reading_timestamp(
        &self,
        id: &DeviceId,
    ) -> Result<Option<jiff::Timestamp>, Self::Error> {
        let location = self
            .latest_location_any(id)?
            .map(|reading| reading.timestamp);
        let level = self.latest_level(id).await?.map(|reading| reading.timestamp);

        Ok(location.max(level))
    }

    async fn get_device(&self, id: &DeviceId) -> Result<Option<DeviceRecord>, Self::Error> {
        let devices = self
            .devices
            .lock()
            .map_err(|_| MemoryStorageError::Internal("devices mutex poisoned".into()))?;
        Ok(devices.get(id).cloned())
    }

    async fn latest_location(
        &self,
        id: &DeviceId,
    ) -> Result<Option<LocationReading>, Self::Error> {
        let locations = self
            .locations
            .lock()
            .map_err(|_| MemoryStorageError::Internal("locations mutex poisoned".into()))?;

        let latest_of = |gps: bool| {
            locations
                .iter()
                .filter(|r| &r.device_id == id && (r.source == LocationSource::Gps) == gps)
                .max_by_key(|r| r.timestamp)
                .cloned()
        };

        Ok(latest_of(true).or_else(|| latest_of(false)))
    }

    async fn latest_level(&self, id: &DeviceId) -> Result<Option<LevelReading>, Self::Error> {
        let levels = self
            .levels
            .lock()
            .map_err(|_| MemoryStorageError::Internal("levels mutex poisoned".into()))?;

        Ok(levels
            .iter()
            .filter(|r| &r.device_id == id)
            .max_by_key(|r| r.timestamp)
            .cloned())
    }

    async fn level_history(
        &self,
        id: &DeviceId,
        query: &HistoryQuery,
    ) -> Result<Vec<LevelReading>, Self::Error> {
        let levels = self
            .levels
            .lock()
            .map_err(|_| MemoryStorageError::Internal("levels mutex poisoned".into()))?;

        let mut history: Vec<_> = levels
            .iter()
            .filter(|r| &r.device_id == id && query.contains(r.timestamp))
            .cloned()
            .collect();
        history.sort_by_key(|r| r.timestamp);
        history.truncate(query.limit);
        Ok(history)
    }

    async fn location_history(
        &self,
        id: &DeviceId,
        query: &HistoryQuery,
    ) -> Result<Vec<LocationReading>, Self::Error> {
        let locations = self
            .locations
            .lock()
            .map_err(|_| MemoryStorageError::Internal("locations mutex poisoned".into()))?;

        let mut history: Vec<_> = locations
            .iter()
            .filter(|r| &r.device_id == id && query.contains(r.timestamp))
            .cloned()
            .collect();
        history.sort_by_key(|r| r.timestamp);
        history.truncate(query.limit);
        Ok(history)
    }
}

impl MemoryStorage {
    fn latest_location_any(
        &self,
        id: &DeviceId,
    ) -> Result<Option<LocationReading>, MemoryStorageError> {
        let locations = self
            .locations
            .lock()
            .map_err(|_| MemoryStorageError::Internal("locations mutex poisoned".into()))?;

        Ok(locations
            .iter()
            .filter(|r| &r.device_id == id)
            .max_by_key(|r| r.timestamp)
            .cloned())
    }
}
