//! The values that flow from the collectors into the
//! [`SignalRegistry`](crate::registry::SignalRegistry).

use crate::Point;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// Signal strength in dBm. More negative is weaker.
pub type Dbm = i32;

/// Which radio a [`DeviceObservation`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    /// An access point seen by the Wi-Fi interface
    Wifi,
    /// A peer seen by the host Bluetooth adapter
    Bluetooth,
    /// A device reported by an attached Flipper Zero
    Flipper,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SignalKind::Wifi => "wifi",
            SignalKind::Bluetooth => "bluetooth",
            SignalKind::Flipper => "flipper",
        };
        f.write_str(s)
    }
}

/// A kind name that is not `wifi`, `bluetooth` or `flipper`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown signal type {0:?}")]
pub struct UnknownKind(pub String);

impl FromStr for SignalKind {
    type Err = UnknownKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wifi" => Ok(SignalKind::Wifi),
            "bluetooth" => Ok(SignalKind::Bluetooth),
            "flipper" => Ok(SignalKind::Flipper),
            _ => Err(UnknownKind(s.to_owned())),
        }
    }
}

/// A stable hardware identity, normalised so that `aa:bb` and `AA:BB` are
/// the same device.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(String);

impl DeviceId {
    /// Normalise a raw address or name into an identity.
    pub fn new(raw: &str) -> Self {
        Self(raw.trim().to_ascii_uppercase())
    }

    /// The normalised identity.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when nothing but whitespace was given.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// One sighting of one device by one collector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceObservation {
    /// Hardware address, or the name when the source prints no address
    pub id: DeviceId,
    /// Radio the device was seen on
    pub kind: SignalKind,
    /// Received strength
    pub rssi: Dbm,
    /// Best effort human readable name
    pub name: Option<String>,
    /// When the collector saw it
    pub seen_at: Instant,
}

impl DeviceObservation {
    /// A nameless observation stamped with the current time.
    pub fn new(kind: SignalKind, id: &str, rssi: Dbm) -> Self {
        Self {
            id: DeviceId::new(id),
            kind,
            rssi,
            name: None,
            seen_at: Instant::now(),
        }
    }

    /// Attach a display name. Blank names are ignored.
    pub fn with_name(mut self, name: &str) -> Self {
        let name = name.trim();
        if !name.is_empty() {
            self.name = Some(name.to_owned());
        }
        self
    }

    /// Override the observation time.
    pub fn seen_at(mut self, at: Instant) -> Self {
        self.seen_at = at;
        self
    }

    /// The name if one was advertised, otherwise the identity.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }
}

/// A device at a surveyed position, used as an anchor for triangulation.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferencePoint {
    /// Identity the anchor broadcasts
    pub id: DeviceId,
    /// Restrict matching to one radio. `None` matches any kind.
    pub kind: Option<SignalKind>,
    /// Fixed position in the room frame
    pub position: Point,
}

impl ReferencePoint {
    /// Whether `obs` is a sighting of this anchor.
    pub fn matches(&self, obs: &DeviceObservation) -> bool {
        self.id == obs.id && self.kind.map_or(true, |k| k == obs.kind)
    }
}
