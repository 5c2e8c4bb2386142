use super::{run_with_deadline, Collector};
use crate::config::BluetoothConfig;
use crate::decoder::BluetoothEvent;
use crate::error::ScanError;
use crate::observation::{Dbm, DeviceObservation, SignalKind};

use log::trace;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

// bluetoothctl sometimes lingers after its own timeout while the adapter
// powers the radio down.
const GRACE: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Sighting {
    name: Option<String>,
    rssi: Option<Dbm>,
}

/// Runs a `bluetoothctl` discovery window and reports the devices that
/// announced a signal strength during it.
pub struct BluetoothCollector {
    window: Duration,
}

impl BluetoothCollector {
    /// A collector scanning for the configured duration each cycle.
    pub fn new(config: &BluetoothConfig) -> Self {
        Self {
            window: config.scan_duration(),
        }
    }
}

/// Fold a discovery transcript into observations. Devices that never
/// reported an RSSI cannot be ranged and are left out.
pub(crate) fn collect_sightings(transcript: &str, at: Instant) -> Vec<DeviceObservation> {
    let mut devices: BTreeMap<String, Sighting> = BTreeMap::new();
    for line in transcript.lines() {
        let Ok(event) = line.parse::<BluetoothEvent>() else {
            continue;
        };
        trace!("bluetooth: {event:?}");
        match event {
            BluetoothEvent::Discovered { address, name } => {
                let entry = devices.entry(address).or_default();
                if name.is_some() {
                    entry.name = name;
                }
            }
            BluetoothEvent::Rssi { address, rssi } => {
                devices.entry(address).or_default().rssi = Some(rssi);
            }
            BluetoothEvent::Renamed { address, name } => {
                devices.entry(address).or_default().name = Some(name);
            }
        }
    }

    devices
        .into_iter()
        .filter_map(|(address, s)| {
            let obs = DeviceObservation::new(SignalKind::Bluetooth, &address, s.rssi?).seen_at(at);
            Some(match s.name {
                Some(name) => obs.with_name(&name),
                None => obs,
            })
        })
        .collect()
}

impl Collector for BluetoothCollector {
    fn name(&self) -> &str {
        "bluetooth"
    }

    fn kind(&self) -> SignalKind {
        SignalKind::Bluetooth
    }

    fn interval(&self) -> Duration {
        // Discovery windows run back to back.
        Duration::from_secs(1)
    }

    fn scan_bound(&self) -> Duration {
        self.window + GRACE
    }

    fn scan(&mut self) -> Result<Vec<DeviceObservation>, ScanError> {
        let timeout = self.window.as_secs().max(1).to_string();
        let transcript = run_with_deadline(
            "bluetoothctl",
            &["--timeout", &timeout, "scan", "on"],
            self.scan_bound(),
        )?;
        Ok(collect_sightings(&transcript, Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRANSCRIPT: &str = "\
Discovery started
[CHG] Controller 00:1A:7D:DA:71:13 Discovering: yes
[\u{1b}[0;92mNEW\u{1b}[0m] Device 4C:87:5D:12:34:56 4C-87-5D-12-34-56
[NEW] Device F0:99:B6:AA:BB:CC Pixel Buds
[CHG] Device 4C:87:5D:12:34:56 RSSI: -71
[CHG] Device 4C:87:5D:12:34:56 Name: Kitchen Speaker
[CHG] Device 4C:87:5D:12:34:56 RSSI: 0xffffffbd (-67)
[NEW] Device 11:22:33:44:55:66 Silent
";

    #[test]
    fn only_ranged_devices_are_reported() {
        let found = collect_sightings(TRANSCRIPT, Instant::now());
        assert_eq!(found.len(), 1);
        let speaker = &found[0];
        assert_eq!(speaker.id.as_str(), "4C:87:5D:12:34:56");
        assert_eq!(speaker.kind, SignalKind::Bluetooth);
        assert_eq!(speaker.rssi, -67);
        assert_eq!(speaker.display_name(), "Kitchen Speaker");
    }

    #[test]
    fn bound_covers_the_window() {
        let collector = BluetoothCollector::new(&BluetoothConfig::default());
        assert!(collector.scan_bound() > BluetoothConfig::default().scan_duration());
    }
}
