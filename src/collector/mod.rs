//! Scan collectors and the supervisor that keeps them running.
//!
//! Every collector runs on its own thread, scanning, depositing the whole
//! cycle into the [`SignalRegistry`] in one batch, then sleeping until its
//! next cycle. A failed cycle is logged and retried. A cycle that hangs for
//! far longer than it should is abandoned by the [`Supervisor`], which
//! starts a fresh collector in its place.

mod bluetooth;
mod flipper;
mod process;
mod simulated;
mod wifi;

pub use bluetooth::BluetoothCollector;
pub use flipper::FlipperCollector;
pub use process::run_with_deadline;
pub use simulated::{SimulatedCollector, SimulatedCollectorBuilder};
pub use wifi::WifiCollector;

use crate::error::ScanError;
use crate::observation::{DeviceObservation, SignalKind};
use crate::registry::SignalRegistry;

use log::{debug, info, warn};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Something that can look for devices.
pub trait Collector: Send {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Kind of every observation this collector produces.
    fn kind(&self) -> SignalKind;

    /// Pause between the end of one scan and the start of the next.
    fn interval(&self) -> Duration;

    /// How long a single [`Collector::scan`] is expected to take at most.
    fn scan_bound(&self) -> Duration;

    /// Run one scan cycle. Blocking.
    fn scan(&mut self) -> Result<Vec<DeviceObservation>, ScanError>;
}

/// Builds a fresh collector, used again whenever a stalled one is replaced.
pub type CollectorFactory = Box<dyn Fn() -> Box<dyn Collector> + Send>;

/// Which worker generation owns a slot and when its current scan began.
/// Both live under one lock so a worker finishing a scan and the supervisor
/// abandoning it cannot both win.
#[derive(Debug, Default)]
struct ScanState {
    generation: u64,
    started: Option<Instant>,
}

type ScanClock = Arc<Mutex<ScanState>>;

fn lock(clock: &Mutex<ScanState>) -> MutexGuard<'_, ScanState> {
    clock.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hand the slot to a new generation if its scan has run longer than
/// `limit`. Returns the new generation and how long the scan had run.
fn abandon_if_stalled(
    clock: &Mutex<ScanState>,
    now: Instant,
    limit: Duration,
) -> Option<(u64, Duration)> {
    let mut state = lock(clock);
    let ran = now.saturating_duration_since(state.started?);
    if ran <= limit {
        return None;
    }
    state.generation += 1;
    state.started = None;
    Some((state.generation, ran))
}

/// Sleep for `duration` in short steps, returning early once `keep_going`
/// says stop. Returns whether to continue.
pub(crate) fn pause(duration: Duration, keep_going: impl Fn() -> bool) -> bool {
    const STEP: Duration = Duration::from_millis(100);
    let until = Instant::now() + duration;
    loop {
        if !keep_going() {
            return false;
        }
        let now = Instant::now();
        if now >= until {
            return true;
        }
        thread::sleep(STEP.min(until - now));
    }
}

struct Worker {
    collector: Box<dyn Collector>,
    generation: u64,
    clock: ScanClock,
    registry: Arc<SignalRegistry>,
    running: Arc<AtomicBool>,
}

impl Worker {
    fn is_current(&self) -> bool {
        self.running.load(Ordering::Relaxed) && lock(&self.clock).generation == self.generation
    }

    /// Start or stop the stall clock. False once this worker has been
    /// replaced, in which case nothing is touched.
    fn stamp(&self, started: Option<Instant>) -> bool {
        let mut state = lock(&self.clock);
        if state.generation != self.generation {
            return false;
        }
        state.started = started;
        true
    }

    fn run(mut self) {
        let name = self.collector.name().to_owned();
        info!("{name}: collector started (generation {})", self.generation);

        while self.is_current() {
            let ticket = self.registry.begin_cycle();
            if !self.stamp(Some(Instant::now())) {
                break;
            }
            let result = self.collector.scan();

            if !self.stamp(None) {
                warn!("{name}: stalled scan finished after being replaced, discarding it");
                return;
            }

            match result {
                Ok(batch) => {
                    let seen = batch.len();
                    let applied = self.registry.upsert_batch(ticket, batch);
                    if applied < seen {
                        debug!("{name}: registry cleared mid-scan, dropped {seen} observations");
                    } else {
                        debug!("{name}: {seen} devices");
                    }
                }
                Err(e) => warn!("{name}: scan failed, retrying next cycle: {e}"),
            }

            let interval = self.collector.interval();
            if !pause(interval, || self.is_current()) {
                break;
            }
        }
        info!("{name}: collector stopped");
    }
}

struct Slot {
    name: String,
    factory: CollectorFactory,
    stall_limit: Duration,
    clock: ScanClock,
    handle: Option<JoinHandle<()>>,
}

/// Owns the collector threads and replaces any that stall.
pub struct Supervisor {
    slots: Vec<Slot>,
    registry: Arc<SignalRegistry>,
    running: Arc<AtomicBool>,
    stall_multiplier: u32,
}

impl Supervisor {
    /// A supervisor with no collectors yet.
    pub fn new(
        registry: Arc<SignalRegistry>,
        running: Arc<AtomicBool>,
        stall_multiplier: u32,
    ) -> Self {
        Self {
            slots: Vec::new(),
            registry,
            running,
            stall_multiplier: stall_multiplier.max(1),
        }
    }

    /// Number of supervised collectors.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when nothing is supervised.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Start a collector and keep it supervised.
    pub fn add(&mut self, factory: CollectorFactory) -> io::Result<()> {
        let collector = factory();
        let name = collector.name().to_owned();
        let stall_limit = collector.interval().max(collector.scan_bound()) * self.stall_multiplier;
        let mut slot = Slot {
            name,
            factory,
            stall_limit,
            clock: Arc::new(Mutex::new(ScanState::default())),
            handle: None,
        };
        slot.handle = Some(self.spawn(&slot, 0, collector)?);
        self.slots.push(slot);
        Ok(())
    }

    fn spawn(
        &self,
        slot: &Slot,
        generation: u64,
        collector: Box<dyn Collector>,
    ) -> io::Result<JoinHandle<()>> {
        let worker = Worker {
            collector,
            generation,
            clock: Arc::clone(&slot.clock),
            registry: Arc::clone(&self.registry),
            running: Arc::clone(&self.running),
        };
        thread::Builder::new()
            .name(format!("collector-{}", slot.name))
            .spawn(move || worker.run())
    }

    /// Replace every collector whose current scan started more than its
    /// stall limit before `now`. Returns how many were replaced.
    pub fn check(&mut self, now: Instant) -> usize {
        let mut restarted = 0;
        for i in 0..self.slots.len() {
            let slot = &mut self.slots[i];
            let Some((generation, ran)) = abandon_if_stalled(&slot.clock, now, slot.stall_limit)
            else {
                continue;
            };
            warn!(
                "{}: scan running for {ran:?}, abandoning it and starting a new collector",
                slot.name
            );
            // Detach: the old thread may never return, and when it does it
            // sees the new generation and leaves the registry alone.
            drop(slot.handle.take());

            let collector = (slot.factory)();
            let slot = &self.slots[i];
            match self.spawn(slot, generation, collector) {
                Ok(handle) => {
                    self.slots[i].handle = Some(handle);
                    restarted += 1;
                }
                Err(e) => warn!("{}: could not restart collector: {e}", self.slots[i].name),
            }
        }
        restarted
    }

    /// Check for stalls every `poll` until shutdown, then wait for the
    /// collectors that are not stuck to finish.
    pub fn run(mut self, poll: Duration) {
        let running = Arc::clone(&self.running);
        while pause(poll, || running.load(Ordering::Relaxed)) {
            self.check(Instant::now());
        }
        for slot in &mut self.slots {
            if let Some(handle) = slot.handle.take() {
                if handle.is_finished() || lock(&slot.clock).started.is_none() {
                    let _ = handle.join();
                }
            }
        }
        info!("supervisor stopped");
    }
}
