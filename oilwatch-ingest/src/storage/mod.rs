pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use jiff::Timestamp;
use oilwatch_core::{
    AlertConfig, DeviceId, DeviceRecord, DeviceState, LevelReading, LocationReading,
};

/// Window over a device's readings. Both bounds are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryQuery {
    pub limit: usize,
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
}

impl HistoryQuery {
    pub const DEFAULT_LIMIT: usize = 100;

    pub fn contains(&self, timestamp: Timestamp) -> bool {
        self.start.is_none_or(|start| timestamp >= start)
            && self.end.is_none_or(|end| timestamp <= end)
    }
}

impl Default for HistoryQuery {
    fn default() -> Self {
        Self {
            limit: Self::DEFAULT_LIMIT,
            start: None,
            end: None,
        }
    }
}

/// Persistence for device records and their timestamped readings.
///
/// Writes for one device may arrive out of timestamp order; "latest" always
/// means the greatest timestamp, never the last write.
#[async_trait]
pub trait DeviceStorage: Clone + Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Creates an offline record with an empty configuration. Existing
    /// records are left untouched.
    async fn create_device_if_absent(&self, id: &DeviceId) -> Result<(), Self::Error>;

    async fn set_state(&self, id: &DeviceId, state: DeviceState) -> Result<(), Self::Error>;

    async fn save_location(&self, reading: LocationReading) -> Result<(), Self::Error>;

    async fn save_level(&self, reading: LevelReading) -> Result<(), Self::Error>;

    async fn update_alert_config(
        &self,
        id: &DeviceId,
        config: AlertConfig,
    ) -> Result<(), Self::Error>;

    async fn list_online_devices(&self) -> Result<Vec<DeviceRecord>, Self::Error>;

    /// Every known device, ordered by id.
    async fn list_devices(&self) -> Result<Vec<DeviceRecord>, Self::Error>;

    /// Most recent reading time across location and level readings.
    async fn latest_reading_timestamp(
        &self,
        id: &DeviceId,
    ) -> Result<Option<jiff::Timestamp>, Self::Error>;

    async fn get_device(&self, id: &DeviceId) -> Result<Option<DeviceRecord>, Self::Error>;

    /// Latest position fix, preferring GPS over any other source.
    async fn latest_location(&self, id: &DeviceId)
    -> Result<Option<LocationReading>, Self::Error>;

    async fn latest_level(&self, id: &DeviceId) -> Result<Option<LevelReading>, Self::Error>;

    /// Level readings inside the query window, oldest first, at most
    /// `query.limit` of them.
    async fn level_history(
        &self,
        id: &DeviceId,
        query: &HistoryQuery,
    ) -> Result<Vec<LevelReading>, Self::Error>;

    /// Position fixes of any source inside the query window, oldest first,
    /// at most `query.limit` of them.
    async fn location_history(
        &self,
        id: &DeviceId,
        query: &HistoryQuery,
    ) -> Result<Vec<LocationReading>, Self::Error>;
}
