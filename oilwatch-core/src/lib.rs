use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

type BoxStr = Box<str>;

/// Device identifier as it appears in the broker topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub BoxStr);

impl DeviceId {
    pub fn new(id: impl Into<BoxStr>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReadingId(pub Ulid);

impl ReadingId {
    pub fn generate() -> Self {
        Self(Ulid::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    Online,
    Offline,
}

impl DeviceState {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceState::Online => "online",
            DeviceState::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "online" => Some(DeviceState::Online),
            "offline" => Some(DeviceState::Offline),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a position fix was obtained.
///
/// Devices report `gps` or `lbs`; any other non-empty tag, including a
/// differently cased one, is kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LocationSource {
    Gps,
    Lbs,
    Other(BoxStr),
}

impl LocationSource {
    pub fn parse(tag: &str) -> Option<Self> {
        if tag.is_empty() {
            return None;
        }

        let source = match tag {
            "gps" => LocationSource::Gps,
            "lbs" => LocationSource::Lbs,
            other => LocationSource::Other(other.into()),
        };

        Some(source)
    }

    pub fn as_str(&self) -> &str {
        match self {
            LocationSource::Gps => "gps",
            LocationSource::Lbs => "lbs",
            LocationSource::Other(tag) => tag,
        }
    }
}

impl fmt::Display for LocationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationReading {
    pub id: ReadingId,
    pub device_id: DeviceId,
    pub longitude: f64,
    pub latitude: f64,
    pub source: LocationSource,
    pub timestamp: jiff::Timestamp,
}

/// Fuel level measurement reported by the ultrasonic sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelReading {
    pub id: ReadingId,
    pub device_id: DeviceId,
    pub level: f64,
    pub distance: f64,
    pub confidence: f64,
    pub timestamp: jiff::Timestamp,
}

/// Alert thresholds and tank geometry a device reports alongside its level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertConfig {
    pub low_level_alert: f64,
    pub high_level_alert: f64,
    pub tank_height: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub state: DeviceState,
    pub alerts: AlertConfig,
    pub created_at: jiff::Timestamp,
    pub updated_at: jiff::Timestamp,
}

impl DeviceRecord {
    /// A freshly seen device starts offline with an empty configuration.
    pub fn new(id: DeviceId, now: jiff::Timestamp) -> Self {
        Self {
            id,
            state: DeviceState::Offline,
            alerts: AlertConfig::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Remaining fuel as a percentage of tank height, rounded to one decimal.
    pub fn remaining_percent(&self, level: f64) -> Option<f64> {
        if self.alerts.tank_height <= 0.0 {
            return None;
        }
        let percent = level / self.alerts.tank_height * 100.0;
        Some((percent * 10.0).round() / 10.0)
    }
}
