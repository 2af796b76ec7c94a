use std::time::Duration;

use jiff::{SignedDuration, Timestamp};
use oilwatch_core::DeviceState;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::storage::DeviceStorage;

pub const DEFAULT_OFFLINE_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);
/// `tokio::time::interval` rejects a zero period.
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(1);

/// Outcome of one scan over the online devices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub checked: usize,
    pub demoted: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Demotes online devices that have not reported within the timeout.
#[derive(Clone)]
pub struct OfflineDetector<S: DeviceStorage> {
    storage: S,
    timeout: SignedDuration,
    interval: Duration,
}

impl<S: DeviceStorage> OfflineDetector<S> {
    pub fn new(storage: S, timeout: Duration, interval: Duration) -> Self {
        Self {
            storage,
            timeout: SignedDuration::try_from(timeout).unwrap_or(SignedDuration::MAX),
            interval: interval.max(MIN_CHECK_INTERVAL),
        }
    }

    pub async fn scan(&self, now: Timestamp) -> Result<ScanReport, S::Error> {
        let devices = self.storage.list_online_devices().await?;
        let mut report = ScanReport {
            checked: devices.len(),
            ..Default::default()
        };

        for device in devices {
            let last_seen = match self.storage.latest_reading_timestamp(&device.id).await {
                Ok(Some(ts)) => ts,
                Ok(None) => {
                    report.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(device_id = %device.id, error = %e, "failed to read last seen time");
                    report.failed += 1;
                    continue;
                }
            };

            if now.duration_since(last_seen) <= self.timeout {
                continue;
            }

            match self
                .storage
                .set_state(&device.id, DeviceState::Offline)
                .await
            {
                Ok(()) => {
                    info!(device_id = %device.id, %last_seen, "device went offline");
                    report.demoted += 1;
                }
                Err(e) => {
                    warn!(device_id = %device.id, error = %e, "failed to mark device offline");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }

    /// Scans every interval until either token fires. The first scan happens
    /// one interval after start.
    pub async fn run(self, cancel: CancellationToken, stop: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            timeout_secs = self.timeout.as_secs(),
            interval_secs = self.interval.as_secs(),
            "offline detector started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    match self.scan(Timestamp::now()).await {
                        Ok(report) => debug!(?report, "offline scan finished"),
                        Err(e) => warn!(error = %e, "failed to list online devices"),
                    }
                }
            }
        }

        info!("offline detector stopped");
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use oilwatch_core::{
        AlertConfig, DeviceId, DeviceRecord, LevelReading, LocationReading, LocationSource,
        ReadingId,
    };

    use super::*;
    use crate::storage::HistoryQuery;
    use crate::storage::memory::{MemoryStorage, MemoryStorageError};

    /// Refuses every state change for one device.
    #[derive(Clone)]
    struct StuckDevice {
        inner: MemoryStorage,
        stuck: DeviceId,
    }

    #[async_trait]
    impl DeviceStorage for StuckDevice {
        type Error = MemoryStorageError;

        async fn create_device_if_absent(&self, id: &DeviceId) -> Result<(), Self::Error> {
            self.inner.create_device_if_absent(id).await
        }

        async fn set_state(&self, id: &DeviceId, state: DeviceState) -> Result<(), Self::Error> {
            if *id == self.stuck {
                return Err(MemoryStorageError::Internal("row locked".into()));
            }
            self.inner.set_state(id, state).await
        }

        async fn save_location(&self, reading: LocationReading) -> Result<(), Self::Error> {
            self.inner.save_location(reading).await
        }

        async fn save_level(&self, reading: LevelReading) -> Result<(), Self::Error> {
            self.inner.save_level(reading).await
        }

        async fn update_alert_config(
            &self,
            id: &DeviceId,
            config: AlertConfig,
        ) -> Result<(), Self::Error> {
            self.inner.update_alert_config(id, config).await
        }

        async fn list_online_devices(&self) -> Result<Vec<DeviceRecord>, Self::Error> {
            self.inner.list_online_devices().await
        }

        async fn list_devices(&self) -> Result<Vec<DeviceRecord>, Self::Error> {
            self.inner.list_devices().await
        }

        async fn latest_reading_timestamp(
            &self,
            id: &DeviceId,
        ) -> Result<Option<Timestamp>, Self::Error> {
            self.inner.latest_reading_timestamp(id).await
        }

        async fn get_device(&self, id: &DeviceId) -> Result<Option<DeviceRecord>, Self::Error> {
            self.inner.get_device(id).await
        }

        async fn latest_location(
            &self,
            id: &DeviceId,
        ) -> Result<Option<LocationReading>, Self::Error> {
            self.inner.latest_location(id).await
        }

        async fn latest_level(&self, id: &DeviceId) -> Result<Option<LevelReading>, Self::Error> {
            self.inner.latest_level(id).await
        }

        async fn level_history(
            &self,
            id: &DeviceId,
            query: &HistoryQuery,
        ) -> Result<Vec<LevelReading>, Self::Error> {
            self.inner.level_history(id, query).await
        }

        async fn location_history(
            &self,
            id: &DeviceId,
            query: &HistoryQuery,
        ) -> Result<Vec<LocationReading>, Self::Error> {
            self.inner.location_history(id, query).await
        }
    }

    fn online(storage: &MemoryStorage, id: &str, now: Timestamp) -> DeviceId {
        let id = DeviceId::new(id);
        let mut record = DeviceRecord::new(id.clone(), now);
        record.state = DeviceState::Online;
        storage.put_device(record).unwrap();
        id
    }

    fn level_at(id: &DeviceId, timestamp: Timestamp) -> LevelReading {
        LevelReading {
            id: ReadingId::generate(),
            device_id: id.clone(),
            level: 40.0,
            distance: 60.0,
            confidence: 0.9,
            timestamp,
        }
    }

    fn detector(storage: &MemoryStorage) -> OfflineDetector<MemoryStorage> {
        OfflineDetector::new(
            storage.clone(),
            DEFAULT_OFFLINE_TIMEOUT,
            DEFAULT_CHECK_INTERVAL,
        )
    }

    #[tokio::test]
    async fn stale_device_goes_offline() {
        let storage = MemoryStorage::new();
        let now = Timestamp::now();
        let id = online(&storage, "stale", now);
        storage
            .save_level(level_at(&id, now - SignedDuration::from_mins(6)))
            .await
            .unwrap();

        let report = detector(&storage).scan(now).await.unwrap();

        assert_eq!(report.demoted, 1);
        let record = storage.get_device(&id).await.unwrap().unwrap();
        assert_eq!(record.state, DeviceState::Offline);
    }

    #[tokio::test]
    async fn recent_device_stays_online() {
        let storage = MemoryStorage::new();
        let now = Timestamp::now();
        let id = online(&storage, "fresh", now);
        storage
            .save_level(level_at(&id, now - SignedDuration::from_mins(4)))
            .await
            .unwrap();

        let report = detector(&storage).scan(now).await.unwrap();

        assert_eq!(report.demoted, 0);
        let record = storage.get_device(&id).await.unwrap().unwrap();
        assert_eq!(record.state, DeviceState::Online);
    }

    #[tokio::test]
    async fn later_of_both_reading_kinds_counts() {
        let storage = MemoryStorage::new();
        let now = Timestamp::now();
        let id = online(&storage, "mixed", now);
        storage
            .save_level(level_at(&id, now - SignedDuration::from_mins(30)))
            .await
            .unwrap();
        storage
            .save_location(LocationReading {
                id: ReadingId::generate(),
                device_id: id.clone(),
                longitude: 1.0,
                latitude: 2.0,
                source: LocationSource::Lbs,
                timestamp: now - SignedDuration::from_mins(1),
            })
            .await
            .unwrap();

        let report = detector(&storage).scan(now).await.unwrap();

        assert_eq!(report.demoted, 0);
        assert_eq!(report.checked, 1);
    }

    #[tokio::test]
    async fn device_without_readings_is_skipped() {
        let storage = MemoryStorage::new();
        let now = Timestamp::now();
        let id = online(&storage, "silent", now);

        let report = detector(&storage).scan(now).await.unwrap();

        assert_eq!(report.skipped, 1);
        let record = storage.get_device(&id).await.unwrap().unwrap();
        assert_eq!(record.state, DeviceState::Online);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let storage = MemoryStorage::new();
        let cancel = CancellationToken::new();
        let stop = CancellationToken::new();

        let handle = tokio::spawn(detector(&storage).run(cancel.clone(), stop));
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn failed_demotion_does_not_stop_the_scan() {
        let storage = MemoryStorage::new();
        let now = Timestamp::now();
        let stuck = online(&storage, "a-stuck", now);
        let stale = online(&storage, "b-stale", now);
        for id in [&stuck, &stale] {
            storage
                .save_level(level_at(id, now - SignedDuration::from_mins(10)))
                .await
                .unwrap();
        }

        let wrapped = StuckDevice {
            inner: storage.clone(),
            stuck: stuck.clone(),
        };
        let report = OfflineDetector::new(wrapped, DEFAULT_OFFLINE_TIMEOUT, DEFAULT_CHECK_INTERVAL)
            .scan(now)
            .await
            .unwrap();

        assert_eq!(report.checked, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.demoted, 1);
        let record = storage.get_device(&stale).await.unwrap().unwrap();
        assert_eq!(record.state, DeviceState::Offline);
        let record = storage.get_device(&stuck).await.unwrap().unwrap();
        assert_eq!(record.state, DeviceState::Online);
    }

    #[tokio::test]
    async fn zero_interval_is_clamped() {
        let storage = MemoryStorage::new();
        let cancel = CancellationToken::new();
        let stop = CancellationToken::new();
        let detector = OfflineDetector::new(storage.clone(), DEFAULT_OFFLINE_TIMEOUT, Duration::ZERO);
        assert_eq!(detector.interval, MIN_CHECK_INTERVAL);

        let handle = tokio::spawn(detector.run(cancel.clone(), stop));
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
