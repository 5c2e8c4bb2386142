//! The live feed: what viewers receive and how it reaches them.
//!
//! Every viewer owns a small bounded queue. The [`Broadcaster`] offers each
//! event to every queue without waiting; a full queue means that viewer
//! misses the event, a closed queue means the viewer is gone for good.
//!
//! On the wire every event is one line of JSON. Frame events are followed
//! by exactly `len` raw bytes, one whole JPEG:
//!
//! ```text
//! {"event":"signals","signals":[{"id":"AA:..","rssi":-48,..}],"position":{"x":1.0,"y":2.0}}
//! {"event":"frame","seq":17,"len":4096}
//! <4096 bytes>
//! ```
//!
//! Viewers talk back with one command per line: `clear`, `track <type>
//! <id>` and `untrack`.

use crate::localizer::{PathLossModel, PositionEstimate};
use crate::observation::{Dbm, DeviceId, DeviceObservation, SignalKind};
use crate::registry::SignalRegistry;
use crate::video::{Detection, StreamFrame};
use crate::Point;

use log::{debug, info, trace};
use serde::{Deserialize, Serialize};
use spin_sleep::LoopHelper;
use std::io::{self, BufRead, Read};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// One row of the signal table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEntry {
    /// Hardware address, or name for address-less Flipper reports
    pub id: String,
    /// Best known name, falling back to the id
    pub name: String,
    /// Received strength
    pub rssi: Dbm,
    /// Which radio heard it
    #[serde(rename = "type")]
    pub kind: SignalKind,
}

impl From<&DeviceObservation> for SignalEntry {
    fn from(obs: &DeviceObservation) -> Self {
        Self {
            id: obs.id.to_string(),
            name: obs.display_name().to_owned(),
            rssi: obs.rssi,
            kind: obs.kind,
        }
    }
}

/// Everything a viewer is told once per cycle.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SignalUpdate {
    /// Current registry contents
    pub signals: Vec<SignalEntry>,
    /// Latest estimate, `null` when unknown
    pub position: Option<Point>,
    /// Latest detections from the video, left out when there are none
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub objects: Vec<Detection>,
    /// The followed device, left out when nothing is followed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<SelectedSignal>,
}

/// The followed device as of one update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedSignal {
    /// Identity as given in the `track` command
    pub id: String,
    /// Which radio to look for it on
    #[serde(rename = "type")]
    pub kind: SignalKind,
    /// Best known name, the id while it has not been heard
    pub name: String,
    /// Current strength, `null` while not heard
    pub rssi: Option<Dbm>,
    /// Path-loss distance in metres, `null` while not heard
    pub distance: Option<f64>,
}

/// The JSON header of every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum WireEvent {
    /// A signal update
    Signals(SignalUpdate),
    /// A video frame of `len` bytes follows this line
    Frame {
        /// Frame sequence number
        seq: u64,
        /// Number of bytes that follow
        len: usize,
    },
}

// Borrowing twin of `WireEvent` so encoding never copies the update.
#[derive(Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum WireEventRef<'a> {
    Signals(&'a SignalUpdate),
    Frame { seq: u64, len: usize },
}

/// What travels through a viewer queue. Payloads are shared between all
/// viewers.
#[derive(Debug, Clone)]
pub enum FeedEvent {
    /// Signal update
    Signals(Arc<SignalUpdate>),
    /// Video frame
    Frame(Arc<StreamFrame>),
}

impl FeedEvent {
    /// Append the wire form of this event to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) -> Result<(), serde_json::Error> {
        match self {
            FeedEvent::Signals(update) => {
                serde_json::to_writer(&mut *out, &WireEventRef::Signals(update))?;
                out.push(b'\n');
            }
            FeedEvent::Frame(frame) => {
                let header = WireEventRef::Frame {
                    seq: frame.seq,
                    len: frame.bytes.len(),
                };
                serde_json::to_writer(&mut *out, &header)?;
                out.push(b'\n');
                out.extend_from_slice(&frame.bytes);
            }
        }
        Ok(())
    }

    /// Read one event in wire form. `Ok(None)` at a clean end of stream.
    pub fn decode(reader: &mut impl BufRead) -> io::Result<Option<Self>> {
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            if !line.trim().is_empty() {
                break;
            }
        }

        let event: WireEvent = serde_json::from_str(line.trim())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(match event {
            WireEvent::Signals(update) => FeedEvent::Signals(Arc::new(update)),
            WireEvent::Frame { seq, len } => {
                let mut bytes = vec![0; len];
                reader.read_exact(&mut bytes)?;
                FeedEvent::Frame(Arc::new(StreamFrame { seq, bytes }))
            }
        }))
    }
}

/// A viewer's link state. Disconnected is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewerState {
    /// Receiving events
    Connected,
    /// Gone, will never receive again
    Disconnected,
}

struct ViewerSlot {
    id: u64,
    tx: SyncSender<FeedEvent>,
    skipped: u64,
}

/// Outcome of one [`Broadcaster::broadcast`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Delivery {
    /// Viewers that got the event
    pub sent: usize,
    /// Viewers whose queue was full
    pub skipped: usize,
    /// Viewers found disconnected and removed
    pub removed: usize,
}

/// Fans events out to every subscribed [`Viewer`].
pub struct Broadcaster {
    viewers: Mutex<Vec<ViewerSlot>>,
    depth: usize,
    next_id: AtomicU64,
}

impl Broadcaster {
    /// Every viewer will get a queue of `depth` events.
    pub fn new(depth: usize) -> Self {
        Self {
            viewers: Mutex::new(Vec::new()),
            depth: depth.max(1),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a new viewer.
    pub fn subscribe(&self) -> Viewer {
        let (tx, rx) = mpsc::sync_channel(self.depth);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.viewers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ViewerSlot { id, tx, skipped: 0 });
        debug!("viewer {id} subscribed");
        Viewer {
            id,
            rx,
            state: ViewerState::Connected,
        }
    }

    /// Number of viewers still registered.
    pub fn viewer_count(&self) -> usize {
        self.viewers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Offer `event` to every viewer. Never blocks.
    pub fn broadcast(&self, event: FeedEvent) -> Delivery {
        let mut delivery = Delivery::default();
        let mut viewers = self.viewers.lock().unwrap_or_else(PoisonError::into_inner);
        viewers.retain_mut(|v| match v.tx.try_send(event.clone()) {
            Ok(()) => {
                delivery.sent += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                delivery.skipped += 1;
                v.skipped += 1;
                trace!("viewer {} is behind, skipped {} events so far", v.id, v.skipped);
                true
            }
            Err(TrySendError::Disconnected(_)) => {
                delivery.removed += 1;
                info!("viewer {} disconnected", v.id);
                false
            }
        });
        delivery
    }
}

/// The receiving end of one viewer's queue. Dropping it disconnects the
/// viewer.
pub struct Viewer {
    id: u64,
    rx: Receiver<FeedEvent>,
    state: ViewerState,
}

impl Viewer {
    /// Identifier used in logs.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current link state.
    pub fn state(&self) -> ViewerState {
        self.state
    }

    /// Wait up to `timeout` for the next event. `None` on timeout or once
    /// disconnected.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Option<FeedEvent> {
        if self.state == ViewerState::Disconnected {
            return None;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                self.state = ViewerState::Disconnected;
                None
            }
        }
    }

    /// Everything currently queued.
    pub fn drain(&self) -> Vec<FeedEvent> {
        self.rx.try_iter().collect()
    }
}

/// A command sent back by a viewer or the local operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Forget every signal seen so far
    Clear,
    /// Follow one device
    Track {
        /// Radio it is heard on
        kind: SignalKind,
        /// Its identity
        id: DeviceId,
    },
    /// Stop following
    Untrack,
}

impl Command {
    /// Parse one line. Case and surrounding whitespace are ignored.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        let (verb, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        match verb.to_ascii_lowercase().as_str() {
            "clear" if rest.is_empty() => Some(Command::Clear),
            "untrack" if rest.is_empty() => Some(Command::Untrack),
            "track" => {
                let (kind, id) = rest.split_once(char::is_whitespace)?;
                let kind = kind.parse().ok()?;
                let id = DeviceId::new(id);
                (!id.is_empty()).then_some(Command::Track { kind, id })
            }
            _ => None,
        }
    }

    /// The command as a viewer sends it, newline included.
    pub fn to_line(&self) -> String {
        match self {
            Command::Clear => "clear\n".to_owned(),
            Command::Track { kind, id } => format!("track {kind} {id}\n"),
            Command::Untrack => "untrack\n".to_owned(),
        }
    }
}

/// The device viewers asked to follow. One for the whole system.
#[derive(Debug, Default)]
pub struct Tracker {
    target: Mutex<Option<(SignalKind, DeviceId)>>,
}

impl Tracker {
    /// Nothing followed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Follow `id` on `kind`, replacing any earlier choice.
    pub fn track(&self, kind: SignalKind, id: DeviceId) {
        *self.target.lock().unwrap_or_else(PoisonError::into_inner) = Some((kind, id));
    }

    /// Follow nothing.
    pub fn untrack(&self) {
        *self.target.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// The current choice.
    pub fn target(&self) -> Option<(SignalKind, DeviceId)> {
        self.target.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// The shared state updates are composed from and commands act on.
#[derive(Debug, Clone)]
pub struct FeedState {
    /// Every device currently heard
    pub registry: Arc<SignalRegistry>,
    /// Latest solver output
    pub position: Arc<Mutex<PositionEstimate>>,
    /// Latest detector output
    pub detections: Arc<Mutex<Vec<Detection>>>,
    /// The followed device
    pub tracker: Arc<Tracker>,
    /// Turns the followed device's strength into a distance
    pub model: PathLossModel,
}

impl FeedState {
    /// Fresh, empty state.
    pub fn new(model: PathLossModel) -> Self {
        Self {
            registry: Arc::new(SignalRegistry::new()),
            position: Arc::new(Mutex::new(PositionEstimate::Unknown)),
            detections: Arc::new(Mutex::new(Vec::new())),
            tracker: Arc::new(Tracker::new()),
            model,
        }
    }

    /// Snapshot everything into an update. Each lock is taken on its own
    /// and released before the next.
    pub fn compose(&self) -> SignalUpdate {
        let snapshot = self.registry.snapshot();
        let position = self
            .position
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .position();
        let objects = self
            .detections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let selected = self.tracker.target().map(|(kind, id)| {
            let heard = snapshot.iter().find(|o| o.kind == kind && o.id == id);
            SelectedSignal {
                id: id.to_string(),
                kind,
                name: heard.map_or_else(|| id.to_string(), |o| o.display_name().to_owned()),
                rssi: heard.map(|o| o.rssi),
                distance: heard.map(|o| self.model.distance(o.rssi)),
            }
        });
        SignalUpdate {
            signals: snapshot.iter().map(SignalEntry::from).collect(),
            position,
            objects,
            selected,
        }
    }

    /// Carry out `command`.
    pub fn apply(&self, command: Command) {
        match command {
            Command::Clear => {
                info!("clearing all signals");
                self.registry.clear();
            }
            Command::Track { kind, id } => {
                info!("tracking {kind} {id}");
                self.tracker.track(kind, id);
            }
            Command::Untrack => {
                info!("no longer tracking a signal");
                self.tracker.untrack();
            }
        }
    }
}

/// Composes and broadcasts a [`SignalUpdate`] every cycle.
pub struct Publisher {
    feed: FeedState,
    broadcaster: Arc<Broadcaster>,
    interval: Duration,
    running: Arc<AtomicBool>,
}

impl Publisher {
    /// A publisher reading `feed` every `interval`.
    pub fn new(
        feed: FeedState,
        broadcaster: Arc<Broadcaster>,
        interval: Duration,
        running: Arc<AtomicBool>,
    ) -> Self {
        Self {
            feed,
            broadcaster,
            interval,
            running,
        }
    }

    /// Build the update for the current state.
    pub fn compose(&self) -> SignalUpdate {
        self.feed.compose()
    }

    /// Compose and broadcast one update.
    pub fn publish_once(&self) -> Delivery {
        let update = Arc::new(self.compose());
        let delivery = self.broadcaster.broadcast(FeedEvent::Signals(update));
        trace!("published: {delivery:?}");
        delivery
    }

    /// Publish every interval until shutdown.
    pub fn run(self) {
        let mut loop_helper =
            LoopHelper::builder().build_with_target_rate(1.0 / self.interval.as_secs_f64());
        info!("publisher running every {:?}", self.interval);
        while self.running.load(Ordering::Relaxed) {
            loop_helper.loop_start();
            self.publish_once();
            loop_helper.loop_sleep();
        }
        info!("publisher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::thread;
    use std::time::Instant;

    fn publisher(feed: FeedState, broadcaster: Arc<Broadcaster>) -> Publisher {
        *feed.position.lock().unwrap() = PositionEstimate::Position(Point { x: 1.5, y: -2.0 });
        Publisher::new(
            feed,
            broadcaster,
            Duration::from_millis(20),
            Arc::new(AtomicBool::new(true)),
        )
    }

    #[test]
    fn payload_shape() {
        let update = SignalUpdate {
            signals: vec![SignalEntry {
                id: "AA:BB:CC:DD:EE:01".to_owned(),
                name: "Lab".to_owned(),
                rssi: -48,
                kind: SignalKind::Wifi,
            }],
            position: None,
            objects: Vec::new(),
            selected: None,
        };
        let mut out = Vec::new();
        FeedEvent::Signals(Arc::new(update)).encode(&mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "{\"event\":\"signals\",\"signals\":[{\"id\":\"AA:BB:CC:DD:EE:01\",\"name\":\"Lab\",\
             \"rssi\":-48,\"type\":\"wifi\"}],\"position\":null}\n"
        );
    }

    #[test]
    fn wire_form_reads_back() {
        let mut out = Vec::new();
        FeedEvent::Frame(Arc::new(StreamFrame {
            seq: 3,
            bytes: b"\n{not json".to_vec(),
        }))
        .encode(&mut out)
        .unwrap();
        let update = SignalUpdate {
            position: Some(Point { x: 1.0, y: 2.0 }),
            objects: vec![Detection {
                label: "person".to_owned(),
                confidence: 0.5,
                bbox: [1, 2, 3, 4],
            }],
            ..SignalUpdate::default()
        };
        FeedEvent::Signals(Arc::new(update.clone())).encode(&mut out).unwrap();

        let mut reader = Cursor::new(out);
        match FeedEvent::decode(&mut reader).unwrap() {
            Some(FeedEvent::Frame(f)) => {
                assert_eq!(f.seq, 3);
                assert_eq!(f.bytes, b"\n{not json");
            }
            other => panic!("unexpected {other:?}"),
        }
        match FeedEvent::decode(&mut reader).unwrap() {
            Some(FeedEvent::Signals(u)) => assert_eq!(*u, update),
            other => panic!("unexpected {other:?}"),
        }
        assert!(FeedEvent::decode(&mut reader).unwrap().is_none());
    }

    #[test]
    fn full_queue_skips_and_closed_queue_removes() {
        let broadcaster = Broadcaster::new(1);
        let slow = broadcaster.subscribe();
        let gone = broadcaster.subscribe();
        drop(gone);

        let event = FeedEvent::Signals(Arc::new(SignalUpdate::default()));
        let first = broadcaster.broadcast(event.clone());
        assert_eq!(first, Delivery { sent: 1, skipped: 0, removed: 1 });
        let second = broadcaster.broadcast(event);
        assert_eq!(second, Delivery { sent: 0, skipped: 1, removed: 0 });
        assert_eq!(broadcaster.viewer_count(), 1);
        assert_eq!(slow.drain().len(), 1);
    }

    #[test]
    fn viewer_sees_disconnect() {
        let broadcaster = Broadcaster::new(2);
        let mut viewer = broadcaster.subscribe();
        drop(broadcaster);
        assert!(viewer.recv_timeout(Duration::from_millis(10)).is_none());
        assert_eq!(viewer.state(), ViewerState::Disconnected);
    }

    #[test]
    fn compose_reflects_registry_and_position() {
        let feed = FeedState::new(PathLossModel::default());
        let registry = Arc::clone(&feed.registry);
        let buds = DeviceObservation::new(SignalKind::Bluetooth, "11:22:33:44:55:66", -70);
        registry.upsert(buds.with_name("Buds"));
        let publisher = publisher(feed, Arc::new(Broadcaster::new(4)));
        let update = publisher.compose();
        assert_eq!(update.signals.len(), 1);
        assert_eq!(update.signals[0].name, "Buds");
        assert_eq!(update.position, Some(Point { x: 1.5, y: -2.0 }));
        assert_eq!(update.selected, None);

        registry.clear();
        assert!(publisher.compose().signals.is_empty());
    }

    #[test]
    fn commands_parse_and_print() {
        assert_eq!(Command::parse(" CLEAR\r"), Some(Command::Clear));
        assert_eq!(Command::parse("untrack"), Some(Command::Untrack));
        let track = Command::parse("Track WIFI  aa:bb:cc:dd:ee:ff \n").unwrap();
        assert_eq!(
            track,
            Command::Track {
                kind: SignalKind::Wifi,
                id: DeviceId::new("AA:BB:CC:DD:EE:FF"),
            }
        );
        assert_eq!(Command::parse(&track.to_line()), Some(track));
        // Flipper names may contain spaces.
        assert_eq!(
            Command::parse("track flipper Tile Mate"),
            Some(Command::Track {
                kind: SignalKind::Flipper,
                id: DeviceId::new("tile mate"),
            })
        );

        assert_eq!(Command::parse("reboot"), None);
        assert_eq!(Command::parse("clear now"), None);
        assert_eq!(Command::parse("track wifi"), None);
        assert_eq!(Command::parse("track zigbee 00:11"), None);
    }

    #[test]
    fn tracked_device_carries_strength_and_distance() {
        let feed = FeedState::new(PathLossModel::default());
        let lab = DeviceObservation::new(SignalKind::Wifi, "aa:bb:cc:dd:ee:01", -60);
        feed.registry.upsert(lab.with_name("Lab"));
        let phone = DeviceObservation::new(SignalKind::Bluetooth, "aa:bb:cc:dd:ee:01", -80);
        feed.registry.upsert(phone);

        feed.apply(Command::parse("track wifi aa:bb:cc:dd:ee:01").unwrap());
        let selected = feed.compose().selected.unwrap();
        assert_eq!(selected.kind, SignalKind::Wifi);
        assert_eq!(selected.name, "Lab");
        assert_eq!(selected.rssi, Some(-60));
        // -40 dBm at 1 m, exponent 2: 20 dB further is 10 m.
        assert!((selected.distance.unwrap() - 10.0).abs() < 1e-9);

        let mut out = Vec::new();
        FeedEvent::Signals(Arc::new(feed.compose())).encode(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("\"selected\":{\"id\":\"AA:BB:CC:DD:EE:01\",\"type\":\"wifi\""));

        feed.registry.clear();
        let selected = feed.compose().selected.unwrap();
        assert_eq!(selected.name, "AA:BB:CC:DD:EE:01");
        assert_eq!((selected.rssi, selected.distance), (None, None));

        feed.apply(Command::Untrack);
        assert_eq!(feed.compose().selected, None);
    }

    #[test]
    fn slow_viewer_does_not_delay_fast_viewer() {
        let broadcaster = Arc::new(Broadcaster::new(2));
        let mut fast = broadcaster.subscribe();
        // Never reads.
        let _slow = broadcaster.subscribe();

        let feed = FeedState::new(PathLossModel::default());
        let publisher = publisher(feed, Arc::clone(&broadcaster));
        let running = Arc::clone(&publisher.running);
        let handle = thread::spawn(move || publisher.run());

        let started = Instant::now();
        let mut received = 0;
        while received < 10 && started.elapsed() < Duration::from_secs(5) {
            if fast.recv_timeout(Duration::from_millis(100)).is_some() {
                received += 1;
            }
        }
        running.store(false, Ordering::Relaxed);
        handle.join().unwrap();

        assert_eq!(received, 10);
        // Ten cycles of 20ms, with generous slack for a loaded machine.
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(broadcaster.viewer_count(), 2);
    }
}
