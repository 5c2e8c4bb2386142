use super::Collector;
use crate::config::FlipperConfig;
use crate::decoder::parse_flipper_line;
use crate::error::ScanError;
use crate::observation::{DeviceObservation, SignalKind};

use log::{debug, info, warn};
use serial2::SerialPort;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::str;
use std::time::{Duration, Instant};

const READ_SLICE: Duration = Duration::from_millis(200);
const CTRL_C: u8 = 0x03;

/// Sends the scan command to a Flipper Zero over its USB serial console and
/// collects the devices it reports.
pub struct FlipperCollector {
    port_setting: String,
    baud_rate: u32,
    command: String,
    interval: Duration,
    response_timeout: Duration,
    port: Option<SerialPort>,
}

impl FlipperCollector {
    /// A collector for the configured port. Nothing is opened until the
    /// first scan.
    pub fn new(config: &FlipperConfig) -> Self {
        Self {
            port_setting: config.port.clone(),
            baud_rate: config.baud_rate,
            command: config.scan_command.trim().to_owned(),
            interval: config.scan_interval(),
            response_timeout: config.response_timeout(),
            port: None,
        }
    }

    fn resolve_port(&self) -> Result<PathBuf, ScanError> {
        if self.port_setting != "auto" {
            return Ok(PathBuf::from(&self.port_setting));
        }
        let ports = SerialPort::available_ports()?;
        pick_port(ports).ok_or_else(|| ScanError::NoDevice("no USB serial port found".to_owned()))
    }

    fn open(&mut self) -> Result<&mut SerialPort, ScanError> {
        if self.port.is_none() {
            let path = self.resolve_port()?;
            let mut port = SerialPort::open(&path, self.baud_rate).map_err(|e| {
                ScanError::NoDevice(format!("cannot open {}: {e}", path.display()))
            })?;
            port.set_read_timeout(READ_SLICE)?;
            info!("flipper: opened {} at {} baud", path.display(), self.baud_rate);
            self.port = Some(port);
        }
        self.port
            .as_mut()
            .ok_or_else(|| ScanError::NoDevice("port closed".to_owned()))
    }

    fn exchange(&mut self) -> Result<Vec<DeviceObservation>, ScanError> {
        let command = format!("{}\r\n", self.command);
        let timeout = self.response_timeout;
        let port = self.open()?;

        // Whatever the CLI printed since the last cycle is stale.
        port.discard_input_buffer()?;
        port.write_all(command.as_bytes())?;
        let found = read_devices(port, timeout)?;
        // Stop the scan so the console is idle for the next cycle.
        port.write_all(&[CTRL_C])?;
        Ok(found)
    }
}

/// Prefer the Flipper's CDC-ACM console, then any USB serial adapter.
fn pick_port(mut ports: Vec<PathBuf>) -> Option<PathBuf> {
    ports.sort();
    let named = |prefix: &str| {
        ports
            .iter()
            .find(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map_or(false, |n| n.starts_with(prefix))
            })
            .cloned()
    };
    named("ttyACM").or_else(|| named("ttyUSB"))
}

/// Read lines from `port` until `timeout` has passed, keeping every line
/// that reports a device.
fn read_devices(
    port: &mut impl Read,
    timeout: Duration,
) -> Result<Vec<DeviceObservation>, ScanError> {
    let deadline = Instant::now() + timeout;
    let mut buffer = [0; 256];
    let mut read_buf = Vec::new();
    let mut found = Vec::new();

    while Instant::now() < deadline {
        let read_len = match port.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                continue
            }
            Err(e) => return Err(e.into()),
        };

        for &c in buffer.iter().take(read_len) {
            read_buf.push(c);
            if c == b'\n' {
                match str::from_utf8(&read_buf) {
                    Ok(line) => {
                        if let Some(obs) = parse_flipper_line(line) {
                            debug!("flipper: {} {}", obs.id, obs.rssi);
                            found.push(obs);
                        }
                    }
                    // Usually leftovers from a previous command.
                    Err(e) => warn!("flipper: failed to decode utf-8: {e:?}"),
                }
                read_buf.clear();
            }
        }
    }
    Ok(found)
}

impl Collector for FlipperCollector {
    fn name(&self) -> &str {
        "flipper"
    }

    fn kind(&self) -> SignalKind {
        SignalKind::Flipper
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn scan_bound(&self) -> Duration {
        self.response_timeout + READ_SLICE * 2
    }

    fn scan(&mut self) -> Result<Vec<DeviceObservation>, ScanError> {
        let result = self.exchange();
        if result.is_err() {
            // Reopen next cycle, the device may have been replugged.
            self.port = None;
        }
        result
    }
}
