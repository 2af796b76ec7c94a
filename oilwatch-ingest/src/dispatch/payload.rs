//! Payload shapes sharing the telemetry subscription.
//!
//! Payloads carry no explicit kind tag, so classification keys off shape:
//! a non-empty `type` marks a location fix, a non-zero `oilLevel` marks a
//! status report. This is best effort by nature.

use oilwatch_core::{AlertConfig, LocationSource};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use super::DispatchError;

/// Firmware sends `null` for fields it has no value for; treat those like
/// absent fields.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct LocationMessage {
    #[serde(deserialize_with = "null_as_default")]
    pub longitude: String,
    #[serde(deserialize_with = "null_as_default")]
    pub latitude: String,
    #[serde(rename = "type", deserialize_with = "null_as_default")]
    pub kind: String,
    #[serde(deserialize_with = "null_as_default")]
    pub timestamp: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StatusMessage {
    #[serde(deserialize_with = "null_as_default")]
    pub oil_level: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub distance: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub confidence: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub timestamp: i64,
    #[serde(deserialize_with = "null_as_default")]
    pub low_level_alert: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub high_level_alert: f64,
    #[serde(deserialize_with = "null_as_default")]
    pub tank_height: f64,
}

impl StatusMessage {
    pub fn alerts(&self) -> AlertConfig {
        AlertConfig {
            low_level_alert: self.low_level_alert,
            high_level_alert: self.high_level_alert,
            tank_height: self.tank_height,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub longitude: f64,
    pub latitude: f64,
    pub source: LocationSource,
}

#[derive(Debug)]
pub enum Telemetry {
    Location(Position),
    Status(StatusMessage),
}

/// Returns `None` when the payload is not this kind, `Some(Err)` when it is
/// but cannot be accepted.
pub type Classifier = fn(&Value) -> Option<Result<Telemetry, DispatchError>>;

/// Tried in order; the first match wins.
pub const CLASSIFIERS: &[(&str, Classifier)] = &[
    ("location", classify_location),
    ("status", classify_status),
];

fn classify_location(value: &Value) -> Option<Result<Telemetry, DispatchError>> {
    let message = LocationMessage::deserialize(value).ok()?;
    let source = LocationSource::parse(&message.kind)?;

    let position = parse_coordinate("longitude", &message.longitude).and_then(|longitude| {
        let latitude = parse_coordinate("latitude", &message.latitude)?;
        Ok(Position {
            longitude,
            latitude,
            source,
        })
    });

    Some(position.map(Telemetry::Location))
}

fn classify_status(value: &Value) -> Option<Result<Telemetry, DispatchError>> {
    let message = StatusMessage::deserialize(value).ok()?;
    if message.oil_level == 0.0 {
        return None;
    }
    Some(Ok(Telemetry::Status(message)))
}

fn parse_coordinate(name: &str, raw: &str) -> Result<f64, DispatchError> {
    match raw.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(DispatchError::Malformed(format!(
            "{name} is not a finite number: {raw:?}"
        ))),
    }
}

pub fn classify(value: &Value) -> Option<(&'static str, Result<Telemetry, DispatchError>)> {
    // serde reads arrays as positional structs, so only objects have a shape.
    if !value.is_object() {
        return None;
    }
    CLASSIFIERS
        .iter()
        .find_map(|(name, classifier)| classifier(value).map(|outcome| (*name, outcome)))
}
