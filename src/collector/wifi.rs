use super::{run_with_deadline, Collector};
use crate::config::WifiConfig;
use crate::decoder::parse_iwlist_output;
use crate::error::ScanError;
use crate::observation::{DeviceObservation, SignalKind};

use std::time::Duration;

// A full sweep of 2.4 and 5 GHz takes a few seconds on most chipsets.
const SCAN_DEADLINE: Duration = Duration::from_secs(15);

/// Runs `iwlist <interface> scan` and reports every access point heard.
pub struct WifiCollector {
    program: String,
    interface: String,
    interval: Duration,
}

impl WifiCollector {
    /// A collector for the configured interface.
    pub fn new(config: &WifiConfig) -> Self {
        Self {
            program: "iwlist".to_owned(),
            interface: config.interface.clone(),
            interval: config.scan_interval(),
        }
    }

    /// Use a different scan program taking the same arguments.
    pub fn with_program(mut self, program: &str) -> Self {
        self.program = program.to_owned();
        self
    }
}

impl Collector for WifiCollector {
    fn name(&self) -> &str {
        "wifi"
    }

    fn kind(&self) -> SignalKind {
        SignalKind::Wifi
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn scan_bound(&self) -> Duration {
        SCAN_DEADLINE
    }

    fn scan(&mut self) -> Result<Vec<DeviceObservation>, ScanError> {
        let output = run_with_deadline(&self.program, &[&self.interface, "scan"], SCAN_DEADLINE)?;
        Ok(parse_iwlist_output(&output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn missing_tool_is_a_scan_error() {
        let mut collector =
            WifiCollector::new(&WifiConfig::default()).with_program("no-such-iwlist-here");
        assert!(matches!(collector.scan(), Err(ScanError::Spawn { .. })));
    }

    #[test]
    fn scans_through_the_tool() {
        // Runs `sh <script> scan`, so the script stands in for the interface.
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("iwlist.sh");
        fs::write(
            &script,
            "echo \"wlan0     Scan completed :\"\n\
             echo '          Cell 01 - Address: 02:00:00:00:00:01'\n\
             echo '                    Quality=70/70  Signal level=-48 dBm'\n\
             echo '                    ESSID:\"Lab\"'\n",
        )
        .unwrap();

        let config = WifiConfig {
            interface: script.to_str().unwrap().to_owned(),
            ..WifiConfig::default()
        };
        let mut collector = WifiCollector::new(&config).with_program("sh");
        let found = collector.scan().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id.as_str(), "02:00:00:00:00:01");
        assert_eq!(found[0].rssi, -48);
        assert_eq!(found[0].display_name(), "Lab");
    }
}
