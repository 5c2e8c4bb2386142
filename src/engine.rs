//! Wires the collectors, the registry, the solver, the publisher, the video
//! pump and the viewer server together and owns their threads.

use crate::collector::{
    BluetoothCollector, Collector, CollectorFactory, FlipperCollector, SimulatedCollectorBuilder,
    Supervisor, WifiCollector,
};
use crate::config::{Config, DisplayMode};
use crate::error::Result;
use crate::feed::{Broadcaster, Command, FeedState, Publisher};
use crate::gui::{CommandHandler, HudState, UpdateSource};
use crate::localizer::{Localizer, PositionEstimate};
use crate::observation::SignalKind;
use crate::registry::SignalRegistry;
use crate::server::ViewerServer;
use crate::video::{Detector, ProcessFrameSource, VideoPump};
use crate::Point;

use log::{debug, info, warn};
use spin_sleep::LoopHelper;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const SUPERVISOR_POLL: Duration = Duration::from_millis(500);

/// The running system.
pub struct Engine {
    config: Config,
    simulate: bool,
    feed: FeedState,
    localizer: Localizer,
    broadcaster: Arc<Broadcaster>,
    detector: Option<Box<dyn Detector>>,
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl Engine {
    /// Build everything from a validated configuration. Nothing runs until
    /// [`Engine::start`]. Clearing `running` stops it all.
    pub fn new(config: Config, running: Arc<AtomicBool>) -> Self {
        let localizer = Localizer::new(config.references(), config.triangulation);
        let broadcaster = Arc::new(Broadcaster::new(config.stream.viewer_queue_depth));
        Self {
            feed: FeedState::new(config.triangulation),
            config,
            simulate: false,
            localizer,
            broadcaster,
            detector: None,
            running,
            threads: Vec::new(),
        }
    }

    /// Replace the real scanners with simulated ones.
    pub fn simulate(mut self, on: bool) -> Self {
        self.simulate = on;
        self
    }

    /// Look for objects in the video with `detector`.
    pub fn with_detector(mut self, detector: Box<dyn Detector>) -> Self {
        self.detector = Some(detector);
        self
    }

    /// The shared registry.
    pub fn registry(&self) -> Arc<SignalRegistry> {
        Arc::clone(&self.feed.registry)
    }

    /// Everything updates are composed from.
    pub fn feed(&self) -> FeedState {
        self.feed.clone()
    }

    /// The feed every viewer subscribes to.
    pub fn broadcaster(&self) -> Arc<Broadcaster> {
        Arc::clone(&self.broadcaster)
    }

    /// The most recent position estimate.
    pub fn position(&self) -> PositionEstimate {
        *self.feed.position.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// One collector factory per enabled scanner.
    pub fn collector_factories(&self) -> Vec<CollectorFactory> {
        if self.simulate {
            return self.simulated_factories();
        }

        let mut factories: Vec<CollectorFactory> = Vec::new();
        if self.config.wifi.enabled {
            let wifi = self.config.wifi.clone();
            factories.push(Box::new(move || {
                Box::new(WifiCollector::new(&wifi)) as Box<dyn Collector>
            }));
        }
        if self.config.bluetooth.enabled {
            let bluetooth = self.config.bluetooth.clone();
            factories.push(Box::new(move || {
                Box::new(BluetoothCollector::new(&bluetooth)) as Box<dyn Collector>
            }));
        }
        if self.config.flipper.enabled {
            let flipper = self.config.flipper.clone();
            factories.push(Box::new(move || {
                Box::new(FlipperCollector::new(&flipper)) as Box<dyn Collector>
            }));
        }
        factories
    }

    /// A simulated host orbiting inside the anchors, heard through one
    /// simulated radio per kind the anchors use.
    fn simulated_factories(&self) -> Vec<CollectorFactory> {
        let references = self.config.references();
        let n = references.len().max(1) as f64;
        let center = Point {
            x: references.iter().map(|r| r.position.x).sum::<f64>() / n,
            y: references.iter().map(|r| r.position.y).sum::<f64>() / n,
        };
        let spread = references
            .iter()
            .map(|r| r.position.abs_dist(&center))
            .fold(0.0, f64::max);
        let radius = (spread * 0.3).max(1.0);

        let mut kinds = vec![SignalKind::Wifi];
        for r in &references {
            if let Some(kind) = r.kind {
                if !kinds.contains(&kind) {
                    kinds.push(kind);
                }
            }
        }

        let model = self.config.triangulation;
        let interval = self.config.signal_update_interval();
        kinds
            .into_iter()
            .map(|kind| {
                let references = references.clone();
                Box::new(move || {
                    Box::new(
                        SimulatedCollectorBuilder::new(kind)
                            .anchors(&references)
                            .model(model)
                            .noise(2.0)
                            .orbit(center, radius, PI / 16.0)
                            .bystanders(3)
                            .interval(interval)
                            .build(),
                    ) as Box<dyn Collector>
                }) as CollectorFactory
            })
            .collect()
    }

    /// Drop stale entries, then solve for the position and publish it to
    /// the shared estimate.
    pub fn maintain_once(&self, now: Instant) -> PositionEstimate {
        self.maintenance().tick(now)
    }

    fn maintenance(&self) -> Maintenance {
        Maintenance {
            registry: self.registry(),
            localizer: self.localizer.clone(),
            position: Arc::clone(&self.feed.position),
            ttl: self.config.staleness_ttl(),
            interval: self.config.signal_update_interval(),
            running: Arc::clone(&self.running),
        }
    }

    /// Start every background thread the configured mode needs.
    pub fn start(&mut self) -> Result<()> {
        let mut supervisor = Supervisor::new(
            self.registry(),
            Arc::clone(&self.running),
            self.config.stall_multiplier,
        );
        for factory in self.collector_factories() {
            supervisor.add(factory)?;
        }
        if supervisor.is_empty() {
            warn!("every scanner is disabled, the registry will stay empty");
        }
        info!("{} collectors running", supervisor.len());
        self.spawn("supervisor", move || supervisor.run(SUPERVISOR_POLL))?;

        let maintenance = self.maintenance();
        self.spawn("maintenance", move || maintenance.run())?;

        if self.config.display_mode == DisplayMode::Stream {
            self.start_streaming()?;
        }
        Ok(())
    }

    fn start_streaming(&mut self) -> Result<()> {
        let server = ViewerServer::bind(
            &self.config.stream.bind_address,
            self.broadcaster(),
            self.feed(),
            Arc::clone(&self.running),
        )?;
        self.spawn("viewer-server", move || server.run())?;

        let publisher = Publisher::new(
            self.feed(),
            self.broadcaster(),
            self.config.signal_update_interval(),
            Arc::clone(&self.running),
        );
        self.spawn("publisher", move || publisher.run())?;

        if let Some(command) = self.config.video_command() {
            match ProcessFrameSource::spawn(&command) {
                Ok(source) => {
                    let mut pump = VideoPump::new(
                        Box::new(source),
                        self.broadcaster(),
                        Arc::clone(&self.feed.detections),
                        Arc::clone(&self.running),
                    );
                    if let Some(detector) = self.detector.take() {
                        pump = pump.with_detector(detector, self.config.detection.frame_skip);
                    }
                    // Blocks on the camera, so it is left running at shutdown.
                    thread::Builder::new()
                        .name("video".to_owned())
                        .spawn(move || {
                            pump.run();
                        })?;
                }
                Err(e) => warn!("video disabled, could not start `{}`: {e}", command.join(" ")),
            }
        }
        Ok(())
    }

    fn spawn(&mut self, name: &str, f: impl FnOnce() + Send + 'static) -> Result<()> {
        let handle = thread::Builder::new().name(name.to_owned()).spawn(f)?;
        self.threads.push(handle);
        Ok(())
    }

    /// Initial HUD contents, showing the configured anchors.
    pub fn hud_state(&self) -> HudState {
        HudState::new(self.localizer.references())
    }

    /// Feeds the local HUD straight from the shared state.
    pub fn hud_source(&self) -> UpdateSource {
        let feed = self.feed();
        Box::new(move || Ok(Some(feed.compose())))
    }

    /// Carries out what the operator asks the local HUD for.
    pub fn command_handler(&self) -> CommandHandler {
        let feed = self.feed();
        Box::new(move |command: Command| {
            feed.apply(command);
            Ok(())
        })
    }

    /// Stop and wait for every thread that is not stuck in I/O.
    pub fn shutdown(self) {
        self.running.store(false, Ordering::Relaxed);
        for handle in self.threads {
            let name = handle.thread().name().unwrap_or("worker").to_owned();
            if handle.join().is_err() {
                warn!("{name} thread panicked");
            }
        }
        info!("shut down");
    }
}

struct Maintenance {
    registry: Arc<SignalRegistry>,
    localizer: Localizer,
    position: Arc<Mutex<PositionEstimate>>,
    ttl: Duration,
    interval: Duration,
    running: Arc<AtomicBool>,
}

impl Maintenance {
    fn tick(&self, now: Instant) -> PositionEstimate {
        let expired = self.registry.expire(now, self.ttl);
        if expired > 0 {
            debug!("expired {expired} stale signals");
        }
        let estimate = self.localizer.localize(&self.registry.snapshot());
        let mut position = self.position.lock().unwrap_or_else(PoisonError::into_inner);
        if *position != estimate {
            match estimate {
                PositionEstimate::Position(p) => debug!("position {p}"),
                PositionEstimate::Unknown => debug!("position unknown"),
            }
        }
        *position = estimate;
        estimate
    }

    fn run(self) {
        let mut loop_helper =
            LoopHelper::builder().build_with_target_rate(1.0 / self.interval.as_secs_f64());
        while self.running.load(Ordering::Relaxed) {
            loop_helper.loop_start();
            self.tick(Instant::now());
            loop_helper.loop_sleep();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReferencePointConfig;
    use crate::feed::FeedEvent;
    use crate::observation::DeviceObservation;

    fn config() -> Config {
        let mut config = Config::default();
        config.reference_points = [("A", 0.0, 0.0), ("B", 10.0, 0.0), ("C", 0.0, 10.0)]
            .iter()
            .map(|&(id, x, y)| ReferencePointConfig {
                id: id.to_owned(),
                x,
                y,
                kind: None,
            })
            .collect();
        config.signal_update_interval_secs = 0.05;
        config.stream.bind_address = "127.0.0.1:0".to_owned();
        config.stream.video_command = Vec::new();
        config
    }

    #[test]
    fn factories_follow_enabled_scanners() {
        let running = Arc::new(AtomicBool::new(true));
        let mut cfg = config();
        cfg.wifi.enabled = true;
        cfg.bluetooth.enabled = false;
        cfg.flipper.enabled = true;
        let engine = Engine::new(cfg, Arc::clone(&running));
        let names: Vec<String> = engine
            .collector_factories()
            .iter()
            .map(|f| f().name().to_owned())
            .collect();
        assert_eq!(names, ["wifi", "flipper"]);

        let mut cfg = config();
        cfg.reference_points[0].kind = Some(SignalKind::Bluetooth);
        let engine = Engine::new(cfg, running).simulate(true);
        let names: Vec<String> = engine
            .collector_factories()
            .iter()
            .map(|f| f().name().to_owned())
            .collect();
        assert_eq!(names, ["simulated-wifi", "simulated-bluetooth"]);
    }

    #[test]
    fn maintenance_expires_and_solves() {
        let engine = Engine::new(config(), Arc::new(AtomicBool::new(true)));
        let registry = engine.registry();
        let start = Instant::now();
        for id in ["A", "B", "C"] {
            registry.upsert(DeviceObservation::new(SignalKind::Wifi, id, -55).seen_at(start));
        }
        assert!(engine.maintain_once(start).position().is_some());
        assert_eq!(engine.position(), engine.maintain_once(start));

        // The staleness threshold is 0.05s * 6.
        let later = start + Duration::from_secs(1);
        assert_eq!(engine.maintain_once(later), PositionEstimate::Unknown);
        assert!(registry.is_empty());
    }

    #[test]
    fn simulated_pipeline_reaches_viewers() {
        let running = Arc::new(AtomicBool::new(true));
        let mut engine = Engine::new(config(), Arc::clone(&running)).simulate(true);
        let mut viewer = engine.broadcaster().subscribe();
        engine.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        let mut located = false;
        while !located && Instant::now() < deadline {
            let event = viewer.recv_timeout(Duration::from_millis(100));
            if let Some(FeedEvent::Signals(update)) = event {
                located = update.position.is_some() && update.signals.len() >= 3;
            }
        }
        engine.shutdown();
        assert!(located);
    }

    #[test]
    fn local_hud_commands() {
        let engine = Engine::new(config(), Arc::new(AtomicBool::new(true)));
        engine
            .registry()
            .upsert(DeviceObservation::new(SignalKind::Flipper, "tag", -70));
        let mut source = engine.hud_source();
        let update = source().unwrap().unwrap();
        assert_eq!(update.signals.len(), 1);

        let mut handle = engine.command_handler();
        handle(Command::Track {
            kind: SignalKind::Flipper,
            id: "TAG".into(),
        })
        .unwrap();
        assert_eq!(source().unwrap().unwrap().selected.unwrap().rssi, Some(-70));

        handle(Command::Clear).unwrap();
        let update = source().unwrap().unwrap();
        assert!(update.signals.is_empty());
        assert_eq!(update.selected.unwrap().rssi, None);
    }
}
