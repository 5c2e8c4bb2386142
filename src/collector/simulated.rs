//! A collector that makes up plausible observations, for running the whole
//! pipeline on a machine without radios.

use super::Collector;
use crate::error::ScanError;
use crate::localizer::PathLossModel;
use crate::observation::{DeviceObservation, ReferencePoint, SignalKind};
use crate::Point;

use rand::prelude::*;
use std::f64::consts::PI;
use std::time::{Duration, Instant};

/// Reports the configured anchors at the strengths they would have as seen
/// from a host walking in a circle, plus a ring of unrelated bystanders.
pub struct SimulatedCollector {
    kind: SignalKind,
    anchors: Vec<ReferencePoint>,
    model: PathLossModel,
    noise_db: f64,
    orbit_center: Point,
    orbit_radius: f64,
    step: f64,
    bystanders: usize,
    interval: Duration,
    scans: u64,
}

/// Builder for [`SimulatedCollector`].
pub struct SimulatedCollectorBuilder {
    inner: SimulatedCollector,
}

impl SimulatedCollectorBuilder {
    /// Simulate `kind` signals. Anchors of another kind are ignored, anchors
    /// without a kind are reported as `kind`.
    pub fn new(kind: SignalKind) -> Self {
        Self {
            inner: SimulatedCollector {
                kind,
                anchors: Vec::new(),
                model: PathLossModel::default(),
                noise_db: 0.0,
                orbit_center: Point::default(),
                orbit_radius: 1.0,
                step: PI / 16.0,
                bystanders: 0,
                interval: Duration::from_secs(1),
                scans: 0,
            },
        }
    }

    /// Anchors to report.
    pub fn anchors(mut self, anchors: &[ReferencePoint]) -> Self {
        let kind = self.inner.kind;
        self.inner.anchors = anchors
            .iter()
            .filter(|a| a.kind.map_or(true, |k| k == kind))
            .cloned()
            .collect();
        self
    }

    /// Model used to turn distance into strength.
    pub fn model(mut self, model: PathLossModel) -> Self {
        self.inner.model = model;
        self
    }

    /// Uniform noise of up to `db` added to every strength.
    pub fn noise(mut self, db: f64) -> Self {
        self.inner.noise_db = db.abs();
        self
    }

    /// The circle the simulated host walks along, and how far it moves
    /// around it per scan, in radians.
    pub fn orbit(mut self, center: Point, radius: f64, step: f64) -> Self {
        self.inner.orbit_center = center;
        self.inner.orbit_radius = radius;
        self.inner.step = step;
        self
    }

    /// Number of unrelated devices to report as well.
    pub fn bystanders(mut self, count: usize) -> Self {
        self.inner.bystanders = count;
        self
    }

    /// Pause between scans.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.inner.interval = interval;
        self
    }

    /// Finish.
    pub fn build(self) -> SimulatedCollector {
        self.inner
    }
}

fn generate_circular_points(num_points: usize, center: Point, range: f64) -> Vec<Point> {
    (0..num_points)
        .map(|v| (v as f64 / num_points as f64) * 2.0 * PI)
        .map(|angle| Point {
            x: center.x + angle.cos() * range,
            y: center.y + angle.sin() * range,
        })
        .collect()
}

impl SimulatedCollector {
    /// Where the simulated host is after `scans` scans.
    pub fn host_position(&self, scans: u64) -> Point {
        let angle = scans as f64 * self.step;
        Point {
            x: self.orbit_center.x + angle.cos() * self.orbit_radius,
            y: self.orbit_center.y + angle.sin() * self.orbit_radius,
        }
    }

    fn strength_at(&self, rng: &mut impl Rng, from: Point, to: Point) -> i32 {
        let jitter = if self.noise_db > 0.0 {
            rng.gen_range(-self.noise_db..self.noise_db)
        } else {
            0.0
        };
        self.model.rssi_at(from.abs_dist(&to)) + jitter.round() as i32
    }
}

impl Collector for SimulatedCollector {
    fn name(&self) -> &str {
        match self.kind {
            SignalKind::Wifi => "simulated-wifi",
            SignalKind::Bluetooth => "simulated-bluetooth",
            SignalKind::Flipper => "simulated-flipper",
        }
    }

    fn kind(&self) -> SignalKind {
        self.kind
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    fn scan_bound(&self) -> Duration {
        Duration::from_millis(100)
    }

    fn scan(&mut self) -> Result<Vec<DeviceObservation>, ScanError> {
        let mut rng = thread_rng();
        let host = self.host_position(self.scans);
        self.scans += 1;
        let now = Instant::now();

        let mut found: Vec<DeviceObservation> = self
            .anchors
            .iter()
            .map(|a| {
                let rssi = self.strength_at(&mut rng, host, a.position);
                DeviceObservation::new(self.kind, a.id.as_str(), rssi).seen_at(now)
            })
            .collect();

        let ring = generate_circular_points(
            self.bystanders,
            self.orbit_center,
            self.orbit_radius * 3.0,
        );
        for (i, p) in ring.into_iter().enumerate() {
            let id = format!("02:5E:00:00:{:02X}:{:02X}", self.kind as u8, i);
            found.push(
                DeviceObservation::new(self.kind, &id, self.strength_at(&mut rng, host, p))
                    .with_name(&format!("{} bystander {}", self.kind, i + 1))
                    .seen_at(now),
            );
        }
        Ok(found)
    }
}
