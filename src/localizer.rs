use crate::observation::{Dbm, DeviceObservation, ReferencePoint};
use crate::Point;
use serde::{Deserialize, Serialize};

// det(AᵀA) / trace(AᵀA)² is at most 1/4 for a well spread set of anchors
// and zero when they are collinear.
const MIN_CONDITION: f64 = 1e-6;

/// Log-distance path loss: `d = 10 ^ ((tx_power - rssi) / (10 * n))`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PathLossModel {
    /// Expected RSSI at one metre
    pub tx_power_dbm: f64,
    /// 2.0 in free space, larger indoors
    pub path_loss_exponent: f64,
}

impl Default for PathLossModel {
    fn default() -> Self {
        Self {
            tx_power_dbm: -40.0,
            path_loss_exponent: 2.0,
        }
    }
}

impl PathLossModel {
    /// Estimated distance in metres for a received strength.
    pub fn distance(&self, rssi: Dbm) -> f64 {
        10f64.powf((self.tx_power_dbm - rssi as f64) / (10.0 * self.path_loss_exponent))
    }

    /// The strength a radio would report at `distance` metres, rounded to
    /// whole dBm.
    pub fn rssi_at(&self, distance: f64) -> Dbm {
        (self.tx_power_dbm - 10.0 * self.path_loss_exponent * distance.max(1e-3).log10()).round()
            as Dbm
    }
}

/// Output of a triangulation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum PositionEstimate {
    /// A solution was found
    Position(Point),
    /// Too few anchors, or the anchors cannot pin down a point
    #[default]
    Unknown,
}

impl PositionEstimate {
    /// The point, if there is one.
    pub fn position(&self) -> Option<Point> {
        match self {
            PositionEstimate::Position(p) => Some(*p),
            PositionEstimate::Unknown => None,
        }
    }
}

/// Turns registry snapshots into a [`PositionEstimate`] using a fixed set
/// of [`ReferencePoint`]s.
#[derive(Debug, Clone)]
pub struct Localizer {
    references: Vec<ReferencePoint>,
    model: PathLossModel,
}

impl Localizer {
    /// A localizer over `references`, converting strengths with `model`.
    pub fn new(references: Vec<ReferencePoint>, model: PathLossModel) -> Self {
        Self { references, model }
    }

    /// The anchors this localizer was built with.
    pub fn references(&self) -> &[ReferencePoint] {
        &self.references
    }

    /** localize()
     * @brief   Estimate a position from the anchors that appear in `snapshot`
     * @param   Snapshot of the registry
     * @returns The least squares position, or Unknown
     *
     * Each anchor uses its freshest matching observation.
     */
    pub fn localize(&self, snapshot: &[DeviceObservation]) -> PositionEstimate {
        let ranges: Vec<(Point, f64)> = self
            .references
            .iter()
            .filter_map(|anchor| {
                snapshot
                    .iter()
                    .filter(|obs| anchor.matches(obs))
                    .max_by_key(|obs| obs.seen_at)
                    .map(|obs| (anchor.position, self.model.distance(obs.rssi)))
            })
            .collect();

        trilaterate(&ranges)
    }
}

/// Solve for the point whose distances to the given anchors best match the
/// given ranges.
///
/// Every circle equation is subtracted from the first one, which leaves a
/// linear system `A [x y]ᵀ = b` with one row per extra anchor. That system
/// is solved through its normal equations, which for three anchors is the
/// exact solution and for more minimises the sum of squared residuals.
pub fn trilaterate(ranges: &[(Point, f64)]) -> PositionEstimate {
    if ranges.len() < 3 {
        return PositionEstimate::Unknown;
    }

    let (p0, d0) = ranges[0];
    // Normal matrix [[a, b], [b, c]] and right hand side [u, v].
    let (mut a, mut b, mut c, mut u, mut v) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for &(pi, di) in &ranges[1..] {
        let rx = 2.0 * (pi.x - p0.x);
        let ry = 2.0 * (pi.y - p0.y);
        let rhs = d0 * d0 - di * di - p0.x * p0.x - p0.y * p0.y + pi.x * pi.x + pi.y * pi.y;
        a += rx * rx;
        b += rx * ry;
        c += ry * ry;
        u += rx * rhs;
        v += ry * rhs;
    }

    let det = a * c - b * b;
    let trace = a + c;
    if trace <= 0.0 || det / (trace * trace) < MIN_CONDITION {
        return PositionEstimate::Unknown;
    }

    let x = (c * u - b * v) / det;
    let y = (a * v - b * u) / det;
    if !x.is_finite() || !y.is_finite() {
        return PositionEstimate::Unknown;
    }

    // The target lies within range of every anchor, so a solution outside
    // the anchors' box grown by the longest range is an inconsistent fit.
    let reach = ranges.iter().map(|&(_, d)| d).fold(0.0, f64::max);
    let in_bounds = |coord: f64, pick: fn(&Point) -> f64| {
        let lo = ranges.iter().map(|(p, _)| pick(p)).fold(f64::INFINITY, f64::min);
        let hi = ranges.iter().map(|(p, _)| pick(p)).fold(f64::NEG_INFINITY, f64::max);
        coord >= lo - reach && coord <= hi + reach
    };
    if !in_bounds(x, |p| p.x) || !in_bounds(y, |p| p.y) {
        return PositionEstimate::Unknown;
    }

    PositionEstimate::Position(Point { x, y })
}
