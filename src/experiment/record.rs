//! Persisted shape of one calibration run.
//!
//! Field names and nesting follow the run-file format read by the downstream
//! analysis stage, so every field carries an explicit serde rename. Per-point
//! sequences are parallel: index `i` in each of them refers to the same
//! calibration point, in visitation order.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::experiment::plan::Node;
use crate::measurement::{AggregatedBlock, ProbeReading};

/// Parallel mean / standard-deviation sequences.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValSd {
    /// Means
    pub val: Vec<f64>,
    /// Sample standard deviations
    pub sd: Vec<f64>,
}

impl ValSd {
    fn push(&mut self, block: &AggregatedBlock) {
        self.val.push(block.mean);
        self.sd.push(block.sd);
    }
}

/// Room conditions, one `[value, unit]` pair per point for each quantity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomConds {
    /// Temperature
    #[serde(rename = "T")]
    pub t: Vec<ProbeReading>,
    /// Pressure
    #[serde(rename = "P")]
    pub p: Vec<ProbeReading>,
    /// Relative humidity
    #[serde(rename = "RH")]
    pub rh: Vec<ProbeReading>,
}

/// Which per-point values came from a degraded (simulated) instrument.
///
/// Records written before provenance was tracked deserialize with all
/// sequences empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Input node means
    #[serde(rename = "IP_V")]
    pub ip_v: Vec<bool>,
    /// Output means
    #[serde(rename = "OP_V")]
    pub op_v: Vec<bool>,
    /// Pt-100 resistance
    #[serde(rename = "Pt_DVM")]
    pub pt_dvm: Vec<bool>,
    /// DUC temperature
    #[serde(rename = "T_GMH")]
    pub t_gmh: Vec<bool>,
    /// Room conditions (any of T, P, RH)
    #[serde(rename = "Room_conds")]
    pub room_conds: Vec<bool>,
    /// Source was not driving the DUC
    #[serde(rename = "SRC", default)]
    pub src: Vec<bool>,
    /// Relay box was not switching the input node
    #[serde(rename = "IVbox", default)]
    pub iv_box: Vec<bool>,
}

/// Everything measured at one calibration point.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordRow {
    /// Input node measured
    pub node: Node,
    /// Target DUC output (level x mask)
    pub nom_vout: f64,
    /// Input node statistics
    pub input: AggregatedBlock,
    /// DVM12 range read back (0 when not available)
    pub input_range: f64,
    /// Output statistics
    pub output: AggregatedBlock,
    /// DVM3 range read back (0 when not available)
    pub output_range: f64,
    /// DUC temperature
    pub t_gmh: ProbeReading,
    /// Pt-100 resistance reading
    pub pt_dvm: f64,
    /// Room temperature
    pub room_t: ProbeReading,
    /// Room pressure
    pub room_p: ProbeReading,
    /// Room relative humidity
    pub room_rh: ProbeReading,
    /// Pt-100 reading was synthesised
    pub pt_dvm_synthetic: bool,
    /// DUC temperature was synthesised
    pub t_gmh_synthetic: bool,
    /// Any room condition was synthesised
    pub room_synthetic: bool,
    /// Source was demo or degraded while the point was measured
    pub source_synthetic: bool,
    /// Relay box was demo or degraded while the point was measured
    pub switch_synthetic: bool,
}

/// One run as stored in the run file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Free-text operator comment
    #[serde(rename = "Comment")]
    pub comment: String,
    /// Series (input) resistance, ohms
    #[serde(rename = "Rs")]
    pub rs: f64,
    /// DUC gain setting
    #[serde(rename = "DUC_G")]
    pub duc_gain: f64,
    /// Pre-run settle delay, seconds
    #[serde(rename = "Settle_delay")]
    pub settle_delay: f64,
    /// Post-voltage-set delay, seconds
    #[serde(rename = "Vset_delay")]
    pub vset_delay: f64,
    /// Post-autozero delay, seconds
    #[serde(rename = "Azero_delay")]
    pub azero_delay: f64,
    /// DVM12 initialisation string
    #[serde(rename = "DVM12_init")]
    pub dvm12_init: String,
    /// DVM3 initialisation string
    #[serde(rename = "DVM3_init")]
    pub dvm3_init: String,
    /// Role name → instrument description
    #[serde(rename = "Instruments")]
    pub instruments: BTreeMap<String, String>,
    /// Readings per channel per point
    #[serde(rename = "Nreads")]
    pub nreads: usize,

    /// Mean reading time per point
    #[serde(rename = "Date_time")]
    pub date_time: Vec<String>,
    /// Input node per point
    #[serde(rename = "Node")]
    pub node: Vec<Node>,
    /// Target output per point
    #[serde(rename = "Nom_Vout")]
    pub nom_vout: Vec<f64>,
    /// Output statistics
    #[serde(rename = "OP_V")]
    pub op_v: ValSd,
    /// DVM3 range per point
    #[serde(rename = "OPrange")]
    pub op_range: Vec<f64>,
    /// Input node statistics
    #[serde(rename = "IP_V")]
    pub ip_v: ValSd,
    /// DVM12 range per point
    #[serde(rename = "IPrange")]
    pub ip_range: Vec<f64>,
    /// DUC temperature per point
    #[serde(rename = "T_GMH")]
    pub t_gmh: Vec<ProbeReading>,
    /// Pt-100 resistance per point
    #[serde(rename = "Pt_DVM")]
    pub pt_dvm: Vec<f64>,
    /// Room conditions per point
    #[serde(rename = "Room_conds")]
    pub room_conds: RoomConds,

    /// Synthetic-data flags, parallel to the per-point sequences
    #[serde(rename = "Demo", default)]
    pub demo: Provenance,
}

impl RunRecord {
    /// Number of calibration points recorded.
    pub fn rows(&self) -> usize {
        self.node.len()
    }

    /// Append one calibration point to every per-point sequence.
    pub fn push_row(&mut self, row: RecordRow) {
        self.date_time.push(row.input.formatted_time());
        self.node.push(row.node);
        self.nom_vout.push(row.nom_vout);
        self.ip_v.push(&row.input);
        self.ip_range.push(row.input_range);
        self.op_v.push(&row.output);
        self.op_range.push(row.output_range);
        self.pt_dvm.push(row.pt_dvm);
        self.t_gmh.push(row.t_gmh);
        self.room_conds.t.push(row.room_t);
        self.room_conds.p.push(row.room_p);
        self.room_conds.rh.push(row.room_rh);

        // without a live source or relay box the voltmeters saw the wrong stimulus
        self.demo
            .ip_v
            .push(row.input.synthetic || row.source_synthetic || row.switch_synthetic);
        self.demo
            .op_v
            .push(row.output.synthetic || row.source_synthetic);
        self.demo.pt_dvm.push(row.pt_dvm_synthetic);
        self.demo.t_gmh.push(row.t_gmh_synthetic);
        self.demo.room_conds.push(row.room_synthetic);
        self.demo.src.push(row.source_synthetic);
        self.demo.iv_box.push(row.switch_synthetic);
    }

    /// True if any recorded value was synthesised.
    pub fn has_synthetic_data(&self) -> bool {
        let d = &self.demo;
        [
            &d.ip_v,
            &d.op_v,
            &d.pt_dvm,
            &d.t_gmh,
            &d.room_conds,
            &d.src,
            &d.iv_box,
        ]
        .iter()
        .any(|seq| seq.iter().any(|flag| *flag))
    }
}

/// Identifier under which a run is stored.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// `IVY.v{version} {duc} (Gain={gain}; Rs={rs}) {dd/mm/YYYY HH:MM:SS}`
    pub fn generate(
        version: &str,
        duc_name: &str,
        gain: f64,
        rs: f64,
        now: DateTime<Local>,
    ) -> Self {
        Self(format!(
            "IVY.v{} {} (Gain={:e}; Rs={:e}) {}",
            version,
            duc_name,
            gain,
            rs,
            now.format("%d/%m/%Y %H:%M:%S")
        ))
    }

    /// The identifier text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn block(mean: f64, synthetic: bool) -> AggregatedBlock {
        AggregatedBlock {
            mean,
            sd: 1e-6,
            mean_time: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            n: 20,
            synthetic,
        }
    }

    fn row(node: Node, synthetic_input: bool) -> RecordRow {
        RecordRow {
            node,
            nom_vout: -1.0,
            input: block(0.1, synthetic_input),
            input_range: 1.0,
            output: block(-1.0, false),
            output_range: 1.0,
            t_gmh: ProbeReading::new(20.5, "deg C"),
            pt_dvm: 108.0,
            room_t: ProbeReading::new(20.8, "deg C"),
            room_p: ProbeReading::new(1013.2, "hPa"),
            room_rh: ProbeReading::new(45.3, "%RH"),
            pt_dvm_synthetic: false,
            t_gmh_synthetic: false,
            room_synthetic: false,
            source_synthetic: false,
            switch_synthetic: false,
        }
    }

    #[test]
    fn rows_stay_parallel() {
        let mut record = RunRecord::default();
        record.push_row(row(Node::V1, false));
        record.push_row(row(Node::V2, true));

        assert_eq!(record.rows(), 2);
        assert_eq!(record.ip_v.val.len(), 2);
        assert_eq!(record.room_conds.rh.len(), 2);
        assert_eq!(record.demo.ip_v, vec![false, true]);
        assert_eq!(record.demo.op_v, vec![false, false]);
        assert!(record.has_synthetic_data());
    }

    #[test]
    fn dead_relay_box_taints_input_but_not_output() {
        let mut record = RunRecord::default();
        record.push_row(RecordRow {
            switch_synthetic: true,
            ..row(Node::V2, false)
        });

        assert_eq!(record.demo.iv_box, vec![true]);
        assert_eq!(record.demo.ip_v, vec![true]);
        assert_eq!(record.demo.op_v, vec![false]);
        assert!(record.has_synthetic_data());
    }

    #[test]
    fn dead_source_taints_both_voltages() {
        let mut record = RunRecord::default();
        record.push_row(RecordRow {
            source_synthetic: true,
            ..row(Node::V1, false)
        });

        assert_eq!(record.demo.src, vec![true]);
        assert_eq!(record.demo.ip_v, vec![true]);
        assert_eq!(record.demo.op_v, vec![true]);
    }

    #[test]
    fn serializes_with_run_file_keys() {
        let mut record = RunRecord {
            comment: "bench check".into(),
            rs: 1e5,
            duc_gain: 1e6,
            nreads: 20,
            ..Default::default()
        };
        record.push_row(row(Node::V1, false));

        let json = serde_json::to_value(&record).unwrap();
        for key in [
            "Comment",
            "Rs",
            "DUC_G",
            "Settle_delay",
            "Vset_delay",
            "Azero_delay",
            "DVM12_init",
            "DVM3_init",
            "Instruments",
            "Nreads",
            "Date_time",
            "Node",
            "Nom_Vout",
            "OP_V",
            "OPrange",
            "IP_V",
            "IPrange",
            "T_GMH",
            "Pt_DVM",
            "Room_conds",
            "Demo",
        ] {
            assert!(json.get(key).is_some(), "missing {}", key);
        }
        assert_eq!(json["Node"][0], "V1");
        assert_eq!(json["IP_V"]["val"][0], 0.1);
        assert_eq!(json["T_GMH"][0][1], "deg C");
        assert_eq!(json["Room_conds"]["P"][0][0], 1013.2);
    }

    #[test]
    fn record_without_provenance_still_loads() {
        let mut json = serde_json::to_value(RunRecord::default()).unwrap();
        json.as_object_mut().unwrap().remove("Demo");
        let record: RunRecord = serde_json::from_value(json).unwrap();
        assert!(!record.has_synthetic_data());
    }

    #[test]
    fn generated_id_layout() {
        let now = Local.with_ymd_and_hms(2021, 2, 26, 9, 2, 43).unwrap();
        let id = RunId::generate("1.1", "IVY_DUC", 1e6, 1e5, now);
        assert_eq!(
            id.as_str(),
            "IVY.v1.1 IVY_DUC (Gain=1e6; Rs=1e5) 26/02/2021 09:02:43"
        );
    }
}
