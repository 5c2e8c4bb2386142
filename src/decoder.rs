//! Parsers for the text printed by the scanning tools: `iwlist` for Wi-Fi,
//! `bluetoothctl` for Bluetooth discovery, and the Flipper Zero CLI.

use crate::observation::{Dbm, DeviceObservation, SignalKind};

use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, tag_no_case, take_until, take_while_m_n},
    character::complete::{alpha1, char, digit1, hex_digit1, i32, one_of, space0, space1},
    combinator::{all_consuming, map, opt, recognize, rest},
    error::Error,
    multi::count,
    sequence::{delimited, preceded, separated_pair, terminated, tuple},
    Finish, IResult,
};

use std::str::FromStr;
use std::time::Instant;

fn hex_pair(s: &str) -> IResult<&str, &str> {
    take_while_m_n(2, 2, |c: char| c.is_ascii_hexdigit())(s)
}

/// `aa:bb:cc:dd:ee:ff` or `AA-BB-...`, normalised to upper case with colons.
fn mac_address(s: &str) -> IResult<&str, String> {
    map(
        recognize(tuple((hex_pair, count(preceded(one_of(":-"), hex_pair), 5)))),
        |m: &str| m.replace('-', ":").to_ascii_uppercase(),
    )(s)
}

/// `-67dBm` or `-67 dBm`
fn dbm(s: &str) -> IResult<&str, Dbm> {
    terminated(i32, preceded(space0, tag_no_case("dbm")))(s)
}

/// Older drivers report `Signal level=60/100` instead of dBm. The
/// percentage is clamped to 0..=100 and mapped onto -100..=-50 dBm.
fn quality_fraction(s: &str) -> IResult<&str, Dbm> {
    map(separated_pair(i32, char('/'), i32), |(n, d)| {
        if d > 0 {
            let percent = (i64::from(n) * 100 / i64::from(d)).clamp(0, 100);
            percent as Dbm / 2 - 100
        } else {
            -100
        }
    })(s)
}

// ---------------------------------------------------------------- iwlist

fn cell_header(s: &str) -> IResult<&str, String> {
    preceded(
        tuple((
            tag("Cell"),
            space1,
            digit1,
            space1,
            char('-'),
            space1,
            tag("Address:"),
            space0,
        )),
        mac_address,
    )(s)
}

fn essid(s: &str) -> IResult<&str, String> {
    map(
        preceded(
            tag("ESSID:"),
            delimited(char('"'), opt(is_not("\"")), char('"')),
        ),
        |e: Option<&str>| e.unwrap_or_default().to_owned(),
    )(s)
}

fn signal_level(line: &str) -> Option<Dbm> {
    let start = line.find("Signal level")?;
    preceded(
        tuple((tag("Signal level"), one_of("=:"))),
        alt((dbm, quality_fraction)),
    )(&line[start..])
    .ok()
    .map(|(_, level)| level)
}

#[derive(Debug)]
struct WifiCell {
    address: String,
    essid: Option<String>,
    signal: Option<Dbm>,
}

impl WifiCell {
    fn flush(self, at: Instant) -> Option<DeviceObservation> {
        let rssi = self.signal?;
        let obs = DeviceObservation::new(SignalKind::Wifi, &self.address, rssi).seen_at(at);
        Some(match self.essid {
            Some(essid) => obs.with_name(&essid),
            None => obs,
        })
    }
}

/// Turn the output of `iwlist <iface> scan` into one observation per cell.
/// Cells that report no signal level are skipped.
pub fn parse_iwlist_output(output: &str) -> Vec<DeviceObservation> {
    let now = Instant::now();
    let mut found = Vec::new();
    let mut current: Option<WifiCell> = None;

    for line in output.lines().map(str::trim) {
        if let Ok((_, address)) = cell_header(line) {
            if let Some(obs) = current.take().and_then(|c| c.flush(now)) {
                found.push(obs);
            }
            current = Some(WifiCell {
                address,
                essid: None,
                signal: None,
            });
            continue;
        }

        let Some(cell) = current.as_mut() else {
            continue;
        };
        if let Ok((_, name)) = essid(line) {
            cell.essid = Some(name);
        } else if let Some(level) = signal_level(line) {
            cell.signal = Some(level);
        }
    }

    if let Some(obs) = current.and_then(|c| c.flush(now)) {
        found.push(obs);
    }
    found
}

// ---------------------------------------------------------- bluetoothctl

/// One interesting line of `bluetoothctl scan on` output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BluetoothEvent {
    /// `[NEW] Device <addr> <name>`
    Discovered {
        /// Hardware address
        address: String,
        /// Advertised name, absent when bluetoothctl only echoes the address
        name: Option<String>,
    },
    /// `[CHG] Device <addr> RSSI: -67`
    Rssi {
        /// Hardware address
        address: String,
        /// Reported strength
        rssi: Dbm,
    },
    /// `[CHG] Device <addr> Name: <name>`
    Renamed {
        /// Hardware address
        address: String,
        /// New name
        name: String,
    },
}

/// `-67` or `0xffffffbd (-67)`
fn bluetooth_rssi(s: &str) -> IResult<&str, Dbm> {
    alt((
        preceded(
            tuple((tag("0x"), hex_digit1, space1)),
            delimited(char('('), i32, char(')')),
        ),
        i32,
    ))(s)
}

fn bluetooth_change(s: &str) -> IResult<&str, BluetoothChange> {
    alt((
        map(
            preceded(tuple((space1, tag("RSSI:"), space0)), bluetooth_rssi),
            BluetoothChange::Rssi,
        ),
        map(
            preceded(
                tuple((space1, alt((tag("Name:"), tag("Alias:"))), space0)),
                rest,
            ),
            |name: &str| BluetoothChange::Name(name.trim().to_owned()),
        ),
    ))(s)
}

enum BluetoothChange {
    Rssi(Dbm),
    Name(String),
}

fn parse_bluetooth_event(s: &str) -> IResult<&str, BluetoothEvent> {
    let (s, (kind, _, _, _, address)) = tuple((
        delimited(char('['), alpha1, char(']')),
        space1,
        tag("Device"),
        space1,
        mac_address,
    ))(s)?;

    match kind {
        "NEW" => map(rest, |name: &str| {
            let name = name.trim();
            // Unnamed devices are announced with their address in dash form.
            let echoed = name.replace('-', ":").eq_ignore_ascii_case(&address);
            BluetoothEvent::Discovered {
                address: address.clone(),
                name: (!name.is_empty() && !echoed).then(|| name.to_owned()),
            }
        })(s),
        "CHG" => map(bluetooth_change, |change| match change {
            BluetoothChange::Rssi(rssi) => BluetoothEvent::Rssi {
                address: address.clone(),
                rssi,
            },
            BluetoothChange::Name(name) => BluetoothEvent::Renamed {
                address: address.clone(),
                name,
            },
        })(s),
        _ => Err(nom::Err::Error(Error::new(s, nom::error::ErrorKind::Tag))),
    }
}

fn strip_ansi(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\x1b' {
            // CSI sequences end at the first letter.
            for c in chars.by_ref() {
                if c.is_ascii_alphabetic() {
                    break;
                }
            }
        } else if c != '\r' {
            out.push(c);
        }
    }
    out
}

impl FromStr for BluetoothEvent {
    type Err = Error<String>;

    /// Accepts a raw line, including colour codes and a leading
    /// `[bluetooth]#` prompt.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let clean = strip_ansi(s);
        let mut last_err = Error {
            input: clean.clone(),
            code: nom::error::ErrorKind::Tag,
        };
        for (start, _) in clean.match_indices('[') {
            match parse_bluetooth_event(clean[start..].trim_end()).finish() {
                Ok((_remaining, event)) => return Ok(event),
                Err(Error { input, code }) => {
                    last_err = Error {
                        input: input.to_string(),
                        code,
                    }
                }
            }
        }
        Err(last_err)
    }
}

// --------------------------------------------------------------- Flipper

/// Parse one line of a Flipper Zero scan response:
/// `Device <name> [<address>] <rssi>dBm`. Lines that are not device reports
/// give `None`. Without an address the name doubles as the identity.
pub fn parse_flipper_line(line: &str) -> Option<DeviceObservation> {
    let parsed: IResult<&str, &str> = preceded(
        tuple((take_until("Device"), tag("Device"), space1)),
        rest,
    )(line.trim_end());
    let (_, body) = parsed.ok()?;

    let mut words: Vec<&str> = body.split_whitespace().collect();
    let last = words.pop()?;
    let rssi = if last.eq_ignore_ascii_case("dbm") {
        let number = words.pop()?;
        all_consuming(i32::<&str, Error<&str>>)(number).ok()?.1
    } else {
        all_consuming(dbm)(last).ok()?.1
    };

    let address = words
        .last()
        .and_then(|w| all_consuming(mac_address)(w).ok())
        .map(|(_, mac)| mac);
    if address.is_some() {
        words.pop();
    }

    let name = words.join(" ");
    let id = address.as_deref().unwrap_or(&name);
    if id.is_empty() {
        return None;
    }
    Some(DeviceObservation::new(SignalKind::Flipper, id, rssi).with_name(&name))
}

#[cfg(test)]
mod tests {
    use super::*;

    const IWLIST: &str = r#"wlan0     Scan completed :
          Cell 01 - Address: aa:bb:cc:dd:ee:01
                    Channel:6
                    Frequency:2.437 GHz (Channel 6)
                    Quality=70/70  Signal level=-40 dBm
                    Encryption key:on
                    ESSID:"HomeNet"
          Cell 02 - Address: AA:BB:CC:DD:EE:02
                    Quality=42/100  Signal level=60/100
                    ESSID:""
          Cell 03 - Address: AA:BB:CC:DD:EE:03
                    ESSID:"NoSignal"
"#;

    #[test]
    fn iwlist_cells() {
        let cells = parse_iwlist_output(IWLIST);
        assert_eq!(cells.len(), 2);

        assert_eq!(cells[0].id.as_str(), "AA:BB:CC:DD:EE:01");
        assert_eq!(cells[0].kind, SignalKind::Wifi);
        assert_eq!(cells[0].rssi, -40);
        assert_eq!(cells[0].name.as_deref(), Some("HomeNet"));

        // Hidden network, quality style level.
        assert_eq!(cells[1].rssi, -70);
        assert_eq!(cells[1].name, None);
    }

    #[test]
    fn quality_out_of_range() {
        assert_eq!(quality_fraction("2147483647/1"), Ok(("", -50)));
        assert_eq!(quality_fraction("-5/100"), Ok(("", -100)));
        assert_eq!(quality_fraction("30/0"), Ok(("", -100)));
    }

    #[test]
    fn iwlist_empty_output() {
        assert!(parse_iwlist_output("wlan0     No scan results").is_empty());
    }

    #[test]
    fn bluetooth_new_device() {
        let e: BluetoothEvent = "[NEW] Device 11:22:33:44:55:66 Pixel Buds".parse().unwrap();
        assert_eq!(
            e,
            BluetoothEvent::Discovered {
                address: "11:22:33:44:55:66".to_owned(),
                name: Some("Pixel Buds".to_owned()),
            }
        );
    }

    #[test]
    fn bluetooth_unnamed_device() {
        let e: BluetoothEvent = "[NEW] Device 7A:0B:11:22:33:44 7A-0B-11-22-33-44"
            .parse()
            .unwrap();
        assert_eq!(
            e,
            BluetoothEvent::Discovered {
                address: "7A:0B:11:22:33:44".to_owned(),
                name: None,
            }
        );
    }

    #[test]
    fn bluetooth_rssi_forms() {
        let plain: BluetoothEvent = "[CHG] Device 11:22:33:44:55:66 RSSI: -67".parse().unwrap();
        let hex: BluetoothEvent =
            "\x1b[0;93m[CHG]\x1b[0m Device 11:22:33:44:55:66 RSSI: 0xffffffbd (-67)"
                .parse()
                .unwrap();
        let expected = BluetoothEvent::Rssi {
            address: "11:22:33:44:55:66".to_owned(),
            rssi: -67,
        };
        assert_eq!(plain, expected);
        assert_eq!(hex, expected);
    }

    #[test]
    fn bluetooth_prompt_prefix_and_rename() {
        let e: BluetoothEvent = "[bluetooth]# [CHG] Device 11:22:33:44:55:66 Name: Watch"
            .parse()
            .unwrap();
        assert_eq!(
            e,
            BluetoothEvent::Renamed {
                address: "11:22:33:44:55:66".to_owned(),
                name: "Watch".to_owned(),
            }
        );
    }

    #[test]
    fn bluetooth_noise_is_rejected() {
        assert!("Discovery started".parse::<BluetoothEvent>().is_err());
        assert!("[DEL] Device 11:22:33:44:55:66 Watch".parse::<BluetoothEvent>().is_err());
        assert!("[CHG] Device 11:22:33:44:55:66 TxPower: 4".parse::<BluetoothEvent>().is_err());
    }

    #[test]
    fn flipper_with_address() {
        let obs = parse_flipper_line("Device Tile 12:34:56:78:9a:bc -61dBm").unwrap();
        assert_eq!(obs.kind, SignalKind::Flipper);
        assert_eq!(obs.id.as_str(), "12:34:56:78:9A:BC");
        assert_eq!(obs.name.as_deref(), Some("Tile"));
        assert_eq!(obs.rssi, -61);
    }

    #[test]
    fn flipper_without_address() {
        let obs = parse_flipper_line(">: Device Galaxy Watch -72 dBm\r").unwrap();
        assert_eq!(obs.id.as_str(), "GALAXY WATCH");
        assert_eq!(obs.display_name(), "Galaxy Watch");
        assert_eq!(obs.rssi, -72);
    }

    #[test]
    fn flipper_noise() {
        assert!(parse_flipper_line("Scanning...").is_none());
        assert!(parse_flipper_line("Device Tile").is_none());
        assert!(parse_flipper_line("Device -40dBm").is_none());
    }
}
