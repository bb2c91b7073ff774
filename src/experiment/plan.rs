//! Sweep matrix, scope limits and progress accounting.
//!
//! A run visits every output level in [`OUTPUT_LEVELS`], both input nodes, and the
//! four-point polarity mask `[0, -1, +1, 0]`. Levels whose nominal input current or
//! voltage falls outside the calibrated scope are skipped as a whole block.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Default readings per channel per calibration point.
pub const NREADS: usize = 20;

/// Nominal DUC output levels in volts, in visitation order.
pub const OUTPUT_LEVELS: [f64; 3] = [0.1, 1.0, 10.0];

/// Input nodes in visitation order.
pub const NODES: [Node; 2] = [Node::V1, Node::V2];

/// Polarity mask applied within each (level, node) block.
pub const MASKS: [Polarity; 4] = [
    Polarity::Zero,
    Polarity::Negative,
    Polarity::Positive,
    Polarity::Zero,
];

/// Smallest nominal input current (A) that is calibrated.
pub const I_MIN: f64 = 1e-11;
/// Largest nominal input current (A) that is calibrated.
pub const I_MAX: f64 = 1e-2;
/// Smallest nominal input voltage (V) that is calibrated.
pub const V1_MIN: f64 = 0.01;
/// Largest nominal input voltage (V) that is calibrated.
pub const V1_MAX: f64 = 10.0;

/// Points per output level.
pub const POINTS_PER_LEVEL: usize = NODES.len() * MASKS.len();

/// Input measurement node selected by the switch box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Node {
    /// Source side of the series resistor.
    V1,
    /// DUC input (virtual earth).
    V2,
}

impl Node {
    /// Node name as persisted.
    pub fn as_str(&self) -> &'static str {
        match self {
            Node::V1 => "V1",
            Node::V2 => "V2",
        }
    }

    /// Command that makes the switch box select this node.
    pub fn switch_command(&self) -> &'static str {
        match self {
            Node::V1 => "1",
            Node::V2 => "2",
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One element of the polarity mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Polarity {
    /// 0 V output
    Zero,
    /// Negative output
    Negative,
    /// Positive output
    Positive,
}

impl Polarity {
    /// Multiplier applied to the output level.
    pub fn factor(&self) -> f64 {
        match self {
            Polarity::Zero => 0.0,
            Polarity::Negative => -1.0,
            Polarity::Positive => 1.0,
        }
    }
}

/// Why an output level was left out of the sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SkipReason {
    /// Nominal input current outside `(I_MIN, I_MAX)`.
    CurrentOutOfScope {
        /// Nominal current in amps
        i_nom: f64,
    },
    /// Nominal input voltage outside `[V1_MIN, V1_MAX]`.
    VoltageOutOfScope {
        /// Nominal voltage in volts
        v1_nom: f64,
    },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::CurrentOutOfScope { i_nom } => {
                write!(f, "Nominal I/P current ({:e} A) out of scope! Skipping", i_nom)
            }
            SkipReason::VoltageOutOfScope { v1_nom } => {
                write!(f, "Nominal I/P voltage ({:e} V) out of scope! Skipping", v1_nom)
            }
        }
    }
}

/// Nominal input quantities for one output level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LevelPlan {
    /// Nominal DUC output (V)
    pub level: f64,
    /// Nominal input voltage `Rs * level / gain`
    pub v1_nom: f64,
    /// Nominal input current `v1_nom / Rs`
    pub i_nom: f64,
    /// Set when the level falls outside the calibrated scope.
    pub skip: Option<SkipReason>,
}

impl LevelPlan {
    /// Derive nominal values for a level and check them against scope limits.
    ///
    /// The current limits are exclusive, the voltage limits inclusive.
    pub fn new(rs: f64, gain: f64, level: f64) -> Self {
        let v1_nom = rs * level / gain;
        let i_nom = v1_nom / rs;
        let skip = if i_nom.abs() <= I_MIN || i_nom.abs() >= I_MAX {
            Some(SkipReason::CurrentOutOfScope { i_nom })
        } else if v1_nom.abs() < V1_MIN || v1_nom.abs() > V1_MAX {
            Some(SkipReason::VoltageOutOfScope { v1_nom })
        } else {
            None
        };
        Self {
            level,
            v1_nom,
            i_nom,
            skip,
        }
    }

    /// True if the level is measured.
    pub fn is_executed(&self) -> bool {
        self.skip.is_none()
    }
}

/// One (level, node, mask) combination.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CalibrationPoint {
    /// Nominal DUC output (V)
    pub output_level: f64,
    /// Input node measured by DVM12
    pub node: Node,
    /// Polarity applied to the output level
    pub polarity: Polarity,
    /// Position within the (level, node) block, `0..4`
    pub mask_index: usize,
}

impl CalibrationPoint {
    /// Target DUC output voltage.
    pub fn v_out(&self) -> f64 {
        positive_zero(self.output_level * self.polarity.factor())
    }

    /// Source setting that produces [`CalibrationPoint::v_out`] on an inverting DUC.
    pub fn v_in(&self, rs: f64, gain: f64) -> f64 {
        positive_zero(-self.v_out() * rs / gain)
    }
}

// -0.0 would otherwise reach the source as "-0"
fn positive_zero(v: f64) -> f64 {
    if v == 0.0 {
        0.0
    } else {
        v
    }
}

/// The full sweep for one DUC.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    levels: Vec<LevelPlan>,
}

impl SweepPlan {
    /// Plan the sweep for a DUC with series resistance `rs` and gain `gain`.
    pub fn new(rs: f64, gain: f64) -> Self {
        Self {
            levels: OUTPUT_LEVELS
                .iter()
                .map(|level| LevelPlan::new(rs, gain, *level))
                .collect(),
        }
    }

    /// Levels in visitation order, including skipped ones.
    pub fn levels(&self) -> &[LevelPlan] {
        &self.levels
    }

    /// Points measured for one level, in visitation order.
    pub fn points(level: f64) -> impl Iterator<Item = CalibrationPoint> {
        NODES.into_iter().flat_map(move |node| {
            MASKS
                .into_iter()
                .enumerate()
                .map(move |(mask_index, polarity)| CalibrationPoint {
                    output_level: level,
                    node,
                    polarity,
                    mask_index,
                })
        })
    }

    /// Number of rows a completed run will hold.
    pub fn executed_points(&self) -> usize {
        self.levels.iter().filter(|l| l.is_executed()).count() * POINTS_PER_LEVEL
    }
}

/// Monotonic read counter normalised to a percentage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Progress {
    count: usize,
    max: usize,
    nreads: usize,
}

impl Progress {
    /// Counter for a run taking `nreads` readings per point.
    pub fn new(nreads: usize) -> Self {
        Self {
            count: 0,
            max: nreads * OUTPUT_LEVELS.len() * POINTS_PER_LEVEL,
            nreads,
        }
    }

    /// Count of one read pair.
    pub fn tick(&mut self) {
        self.count = (self.count + 1).min(self.max);
    }

    /// Advance by the reads a full level would have taken.
    pub fn skip_level(&mut self) {
        self.count = (self.count + self.nreads * POINTS_PER_LEVEL).min(self.max);
    }

    /// Jump to the end.
    pub fn complete(&mut self) {
        self.count = self.max;
    }

    /// Reads counted so far.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Reads in a full run.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Percentage in `[0, 100]`.
    pub fn percent(&self) -> f64 {
        if self.max == 0 {
            return 100.0;
        }
        100.0 * self.count as f64 / self.max as f64
    }
}
