//! Static configuration, read once at startup from a [ron] file.
//!
//! Every section has defaults, so a file only needs the parts that differ,
//! except for `reference_points`: at least three are required, otherwise
//! triangulation could never produce an estimate and the process refuses
//! to start.
//!
//! ```text
//! (
//!     wifi: (interface: "wlan0", scan_interval_secs: 10.0),
//!     signal_update_interval_secs: 2.0,
//!     reference_points: [
//!         (id: "AA:BB:CC:00:00:01", x: 0.0, y: 0.0),
//!         (id: "AA:BB:CC:00:00:02", x: 8.0, y: 0.0),
//!         (id: "AA:BB:CC:00:00:03", x: 0.0, y: 6.0, kind: Some(wifi)),
//!     ],
//! )
//! ```

use crate::error::ConfigError;
use crate::localizer::PathLossModel;
use crate::logging::parse_level;
use crate::observation::{DeviceId, ReferencePoint, SignalKind};
use crate::Point;

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Where network interfaces are listed on Linux.
pub const SYS_CLASS_NET: &str = "/sys/class/net";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Flipper Zero on a serial port
    pub flipper: FlipperConfig,
    /// Wi-Fi scanning
    pub wifi: WifiConfig,
    /// Bluetooth discovery
    pub bluetooth: BluetoothConfig,
    /// Camera capture parameters handed to the video command
    pub camera: CameraConfig,
    /// Viewer server and video stream
    pub stream: StreamConfig,
    /// Cadence of the publisher and of expiry plus triangulation
    pub signal_update_interval_secs: f64,
    /// Entries unseen for this many update intervals are expired
    pub staleness_multiplier: u32,
    /// A scan running this many times longer than its bound is abandoned
    pub stall_multiplier: u32,
    /// Object detection hook
    pub detection: DetectionConfig,
    /// RSSI to distance conversion
    pub triangulation: PathLossModel,
    /// Surveyed anchors
    pub reference_points: Vec<ReferencePointConfig>,
    /// Log level and destination
    pub logging: LoggingConfig,
    /// Terminal HUD or network stream
    pub display_mode: DisplayMode,
}

/// Flipper Zero collector settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct FlipperConfig {
    /// Run this collector
    pub enabled: bool,
    /// Device path, or `auto` to pick the first USB serial port
    pub port: String,
    /// Serial speed
    pub baud_rate: u32,
    /// CLI command that starts a scan
    pub scan_command: String,
    /// Pause between scans
    pub scan_interval_secs: f64,
    /// How long to collect response lines
    pub response_timeout_secs: f64,
}

/// Wi-Fi collector settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct WifiConfig {
    /// Run this collector
    pub enabled: bool,
    /// Wireless interface to scan with
    pub interface: String,
    /// Pause between scans
    pub scan_interval_secs: f64,
}

/// Bluetooth collector settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Run this collector
    pub enabled: bool,
    /// Length of each discovery window
    pub scan_duration_secs: f64,
}

/// Camera settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CameraConfig {
    /// Frame width in pixels
    pub width: u32,
    /// Frame height in pixels
    pub height: u32,
    /// Frames per second
    pub framerate: u32,
}

/// Viewer server and video settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// Address the viewer server listens on
    pub bind_address: String,
    /// Events buffered per viewer before it starts missing updates
    pub viewer_queue_depth: usize,
    /// HLS playlist length, for video commands that also write HLS
    pub hls_segment_count: u32,
    /// HLS segment length, for video commands that also write HLS
    pub hls_segment_secs: f64,
    /// Program and arguments that write Motion JPEG to stdout, split into
    /// one frame per image. Empty disables video. `{width}`, `{height}`,
    /// `{framerate}`, `{hls_segments}` and `{hls_segment_secs}` are
    /// substituted.
    pub video_command: Vec<String>,
}

/// Object detection settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct DetectionConfig {
    /// Run the detector on every n-th frame
    pub frame_skip: u32,
}

/// One surveyed anchor as written in the file.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct ReferencePointConfig {
    /// Hardware address (or Flipper name) of the anchor
    pub id: String,
    /// X coordinate in metres
    pub x: f64,
    /// Y coordinate in metres
    pub y: f64,
    /// Only match sightings of this kind
    #[serde(default)]
    pub kind: Option<SignalKind>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log output (stdout, stderr, or file path)
    pub destination: String,
}

/// How the feed is presented.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
pub enum DisplayMode {
    /// Draw the HUD in this terminal, no viewer server
    Local,
    /// Serve viewers over the network
    #[default]
    Stream,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            flipper: FlipperConfig::default(),
            wifi: WifiConfig::default(),
            bluetooth: BluetoothConfig::default(),
            camera: CameraConfig::default(),
            stream: StreamConfig::default(),
            signal_update_interval_secs: 5.0,
            staleness_multiplier: 6,
            stall_multiplier: 4,
            detection: DetectionConfig::default(),
            triangulation: PathLossModel::default(),
            reference_points: Vec::new(),
            logging: LoggingConfig::default(),
            display_mode: DisplayMode::default(),
        }
    }
}

impl Default for FlipperConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: "auto".to_owned(),
            baud_rate: 115200,
            scan_command: "ble scan".to_owned(),
            scan_interval_secs: 10.0,
            response_timeout_secs: 5.0,
        }
    }
}

impl Default for WifiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interface: "wlan0".to_owned(),
            scan_interval_secs: 10.0,
        }
    }
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_duration_secs: 5.0,
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
            framerate: 24,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:5000".to_owned(),
            viewer_queue_depth: 8,
            hls_segment_count: 5,
            hls_segment_secs: 2.0,
            video_command: [
                "libcamera-vid",
                "--nopreview",
                "-t",
                "0",
                "--width",
                "{width}",
                "--height",
                "{height}",
                "--framerate",
                "{framerate}",
                "--codec",
                "mjpeg",
                "-o",
                "-",
            ]
            .map(str::to_owned)
            .to_vec(),
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self { frame_skip: 5 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            destination: "stderr".to_owned(),
        }
    }
}

fn secs(value: f64) -> Duration {
    Duration::from_secs_f64(value)
}

fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field,
            reason: "must be a positive number",
        })
    }
}

fn at_least_one(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value >= 1 {
        Ok(())
    } else {
        Err(ConfigError::InvalidValue {
            field,
            reason: "must be at least 1",
        })
    }
}

/// Interface names are at most 15 bytes and cannot contain `/` or spaces.
fn check_interface_name(name: &str) -> Result<(), ConfigError> {
    let bad = |reason| ConfigError::BadInterface {
        name: name.to_owned(),
        reason,
    };
    if name.is_empty() {
        return Err(bad("empty name"));
    }
    if name.len() > 15 {
        return Err(bad("longer than 15 characters"));
    }
    if name.contains(|c: char| c == '/' || c.is_whitespace() || c.is_control()) {
        return Err(bad("contains '/' or whitespace"));
    }
    Ok(())
}

impl Config {
    /// Read, parse and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        Self::from_ron(&text)
    }

    /// Parse and validate configuration text.
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        let config: Config = ron::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every value that does not depend on the host.
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("signal_update_interval_secs", self.signal_update_interval_secs)?;
        at_least_one("staleness_multiplier", self.staleness_multiplier.into())?;
        at_least_one("stall_multiplier", self.stall_multiplier.into())?;

        if self.wifi.enabled {
            check_interface_name(&self.wifi.interface)?;
            positive("wifi.scan_interval_secs", self.wifi.scan_interval_secs)?;
        }
        if self.bluetooth.enabled {
            positive("bluetooth.scan_duration_secs", self.bluetooth.scan_duration_secs)?;
        }
        if self.flipper.enabled {
            at_least_one("flipper.baud_rate", self.flipper.baud_rate.into())?;
            positive("flipper.scan_interval_secs", self.flipper.scan_interval_secs)?;
            positive("flipper.response_timeout_secs", self.flipper.response_timeout_secs)?;
            if self.flipper.scan_command.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "flipper.scan_command",
                    reason: "must not be empty",
                });
            }
            if self.flipper.port.trim().is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "flipper.port",
                    reason: "must be a device path or \"auto\"",
                });
            }
        }

        at_least_one("camera.framerate", self.camera.framerate.into())?;
        at_least_one("camera.width", self.camera.width.into())?;
        at_least_one("camera.height", self.camera.height.into())?;
        at_least_one("stream.viewer_queue_depth", self.stream.viewer_queue_depth as u64)?;
        at_least_one("stream.hls_segment_count", self.stream.hls_segment_count.into())?;
        positive("stream.hls_segment_secs", self.stream.hls_segment_secs)?;
        if self.stream.bind_address.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::InvalidValue {
                field: "stream.bind_address",
                reason: "must be an ip:port socket address",
            });
        }
        at_least_one("detection.frame_skip", self.detection.frame_skip.into())?;
        parse_level("logging.level", &self.logging.level)?;

        positive(
            "triangulation.path_loss_exponent",
            self.triangulation.path_loss_exponent,
        )?;
        if !self.triangulation.tx_power_dbm.is_finite() {
            return Err(ConfigError::InvalidValue {
                field: "triangulation.tx_power_dbm",
                reason: "must be a finite number",
            });
        }

        self.check_references()
    }

    fn check_references(&self) -> Result<(), ConfigError> {
        if self.reference_points.len() < 3 {
            return Err(ConfigError::NotEnoughReferences {
                have: self.reference_points.len(),
            });
        }
        let mut seen = HashSet::new();
        for r in &self.reference_points {
            let id = DeviceId::new(&r.id);
            if id.is_empty() {
                return Err(ConfigError::InvalidReference {
                    id: r.id.clone(),
                    reason: "identity is empty",
                });
            }
            if !r.x.is_finite() || !r.y.is_finite() {
                return Err(ConfigError::InvalidReference {
                    id: r.id.clone(),
                    reason: "coordinates must be finite",
                });
            }
            if !seen.insert(id) {
                return Err(ConfigError::DuplicateReference(r.id.clone()));
            }
        }
        Ok(())
    }

    /// Checks that need the running host. `sys_net` is normally
    /// [`SYS_CLASS_NET`].
    pub fn check_host(&self, sys_net: &Path) -> Result<(), ConfigError> {
        if self.wifi.enabled && !sys_net.join(&self.wifi.interface).exists() {
            return Err(ConfigError::BadInterface {
                name: self.wifi.interface.clone(),
                reason: "no such interface on this host",
            });
        }
        Ok(())
    }

    /// The anchors in their runtime form.
    pub fn references(&self) -> Vec<ReferencePoint> {
        self.reference_points
            .iter()
            .map(|r| ReferencePoint {
                id: DeviceId::new(&r.id),
                kind: r.kind,
                position: Point { x: r.x, y: r.y },
            })
            .collect()
    }

    /// Publisher cadence.
    pub fn signal_update_interval(&self) -> Duration {
        secs(self.signal_update_interval_secs)
    }

    /// Age after which an entry is expired from the registry.
    pub fn staleness_ttl(&self) -> Duration {
        self.signal_update_interval() * self.staleness_multiplier
    }

    /// The video command with placeholders filled in, or `None` when video
    /// is disabled.
    pub fn video_command(&self) -> Option<Vec<String>> {
        if self.stream.video_command.is_empty() {
            return None;
        }
        Some(
            self.stream
                .video_command
                .iter()
                .map(|arg| {
                    arg.replace("{width}", &self.camera.width.to_string())
                        .replace("{height}", &self.camera.height.to_string())
                        .replace("{framerate}", &self.camera.framerate.to_string())
                        .replace("{hls_segments}", &self.stream.hls_segment_count.to_string())
                        .replace("{hls_segment_secs}", &self.stream.hls_segment_secs.to_string())
                })
                .collect(),
        )
    }
}

impl WifiConfig {
    /// Pause between scans.
    pub fn scan_interval(&self) -> Duration {
        secs(self.scan_interval_secs)
    }
}

impl BluetoothConfig {
    /// Length of each discovery window.
    pub fn scan_duration(&self) -> Duration {
        secs(self.scan_duration_secs)
    }
}

impl FlipperConfig {
    /// Pause between scans.
    pub fn scan_interval(&self) -> Duration {
        secs(self.scan_interval_secs)
    }

    /// How long to collect response lines.
    pub fn response_timeout(&self) -> Duration {
        secs(self.response_timeout_secs)
    }
}
