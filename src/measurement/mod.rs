//! Sample batches and their aggregation.
//!
//! One calibration point collects a fixed number of raw readings per channel. The
//! batch is reduced to a mean, a sample standard deviation and a mean timestamp.
//! The standard deviation uses `N - 1` in the denominator because the downstream
//! uncertainty analysis assigns `N - 1` degrees of freedom to each mean.

use chrono::{DateTime, Duration, Local, Utc};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::error::{AppResult, DaqError};

/// Raw readings of one channel for one calibration point.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleBatch {
    channel: String,
    values: Vec<f64>,
    timestamps: Vec<DateTime<Utc>>,
    synthetic: bool,
}

impl SampleBatch {
    /// Empty batch for a named channel with room for `capacity` readings.
    pub fn new(channel: impl Into<String>, capacity: usize) -> Self {
        Self {
            channel: channel.into(),
            values: Vec::with_capacity(capacity),
            timestamps: Vec::with_capacity(capacity),
            synthetic: false,
        }
    }

    /// Append one reading taken at `at`.
    ///
    /// `synthetic` marks readings produced by a degraded instrument; the flag
    /// sticks for the rest of the batch.
    pub fn push(&mut self, value: f64, at: DateTime<Utc>, synthetic: bool) {
        self.values.push(value);
        self.timestamps.push(at);
        self.synthetic |= synthetic;
    }

    /// Channel name (`"V1"`, `"V2"`, `"V3"`).
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Raw values in acquisition order.
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Reading timestamps in acquisition order.
    pub fn timestamps(&self) -> &[DateTime<Utc>] {
        &self.timestamps
    }

    /// Number of readings.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if no readings have been taken.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True if any reading was synthesised.
    pub fn is_synthetic(&self) -> bool {
        self.synthetic
    }
}

/// Statistics of one [`SampleBatch`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregatedBlock {
    /// Arithmetic mean
    pub mean: f64,
    /// Sample standard deviation (ddof = 1)
    pub sd: f64,
    /// Mean of the reading timestamps
    pub mean_time: DateTime<Utc>,
    /// Number of readings
    pub n: usize,
    /// True if any reading was synthesised
    pub synthetic: bool,
}

impl AggregatedBlock {
    /// Degrees of freedom of the mean.
    pub fn dof(&self) -> usize {
        self.n.saturating_sub(1)
    }

    /// Mean time in the record's `dd/mm/YYYY HH:MM:SS` local-time format.
    pub fn formatted_time(&self) -> String {
        format_time(&self.mean_time)
    }
}

/// A probe measurement, persisted as a `[value, unit]` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeReading(pub f64, pub String);

impl ProbeReading {
    /// Build a reading from a probe's `(value, unit)` reply.
    pub fn new(value: f64, unit: impl Into<String>) -> Self {
        Self(value, unit.into())
    }

    /// Measured value
    pub fn value(&self) -> f64 {
        self.0
    }

    /// Unit label as reported by the probe
    pub fn unit(&self) -> &str {
        &self.1
    }
}

/// Format a timestamp the way run records store it.
pub fn format_time(at: &DateTime<Utc>) -> String {
    at.with_timezone(&Local)
        .format("%d/%m/%Y %H:%M:%S")
        .to_string()
}

/// A stand-in reading drawn from a normal distribution around `nominal`.
///
/// `sd` is the standard deviation. Used in place of a reading from an
/// instrument that is simulated or has stopped responding.
pub fn simulated_reading(nominal: f64, sd: f64) -> f64 {
    match Normal::new(nominal, sd.abs()) {
        Ok(normal) if sd != 0.0 && sd.is_finite() => normal.sample(&mut rand::thread_rng()),
        _ => nominal,
    }
}

/// Standard deviation of a simulated voltmeter reading near `nominal` volts.
pub fn voltmeter_spread(nominal: f64) -> f64 {
    1.0e-5 * nominal.abs() + 1.0e-6
}

/// Mean and sample standard deviation (ddof = 1) of a slice.
///
/// Returns `None` for fewer than two values.
pub fn mean_and_sd(values: &[f64]) -> Option<(f64, f64)> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let ss: f64 = values.iter().map(|v| (v - mean).powi(2)).sum();
    Some((mean, (ss / (n - 1.0)).sqrt()))
}

/// Mean of a set of timestamps, to microsecond resolution.
pub fn mean_timestamp(timestamps: &[DateTime<Utc>]) -> Option<DateTime<Utc>> {
    if timestamps.is_empty() {
        return None;
    }
    // offsets from the first stamp keep the sum well inside i64
    let origin = timestamps[0];
    let total: i64 = timestamps
        .iter()
        .map(|t| (*t - origin).num_microseconds().unwrap_or(0))
        .sum();
    let offset = total / timestamps.len() as i64;
    Some(origin + Duration::microseconds(offset))
}

/// Reduce a batch to its [`AggregatedBlock`].
///
/// The batch must hold exactly `expected` readings and `expected` timestamps;
/// anything else is an internal consistency failure.
pub fn aggregate(batch: &SampleBatch, expected: usize) -> AppResult<AggregatedBlock> {
    for actual in [batch.values.len(), batch.timestamps.len()] {
        if actual != expected {
            return Err(DaqError::SampleCount {
                channel: batch.channel.clone(),
                expected,
                actual,
            });
        }
    }
    let (mean, sd) = mean_and_sd(&batch.values).ok_or_else(|| DaqError::SampleCount {
        channel: batch.channel.clone(),
        expected: expected.max(2),
        actual: batch.values.len(),
    })?;
    let mean_time = mean_timestamp(&batch.timestamps).ok_or_else(|| DaqError::SampleCount {
        channel: batch.channel.clone(),
        expected,
        actual: 0,
    })?;

    Ok(AggregatedBlock {
        mean,
        sd,
        mean_time,
        n: batch.len(),
        synthetic: batch.synthetic,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn batch_of(values: &[f64]) -> SampleBatch {
        let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut batch = SampleBatch::new("V3", values.len());
        for (i, v) in values.iter().enumerate() {
            batch.push(*v, start + Duration::seconds(i as i64), false);
        }
        batch
    }

    #[test]
    fn identical_values_have_zero_sd() {
        let block = aggregate(&batch_of(&[0.25; 20]), 20).unwrap();
        assert_eq!(block.mean, 0.25);
        assert_eq!(block.sd, 0.0);
        assert_eq!(block.dof(), 19);
    }

    #[test]
    fn sample_sd_uses_n_minus_one() {
        let block = aggregate(&batch_of(&[1.0, 2.0, 3.0, 4.0, 5.0]), 5).unwrap();
        assert!((block.mean - 3.0).abs() < 1e-12);
        assert!((block.sd - 2.5_f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn mean_time_is_midpoint() {
        let batch = batch_of(&[1.0, 2.0, 3.0, 4.0, 5.0]);
        let block = aggregate(&batch, 5).unwrap();
        assert_eq!(block.mean_time, batch.timestamps()[2]);
    }

    #[test]
    fn wrong_count_is_rejected() {
        let err = aggregate(&batch_of(&[1.0, 2.0, 3.0]), 20).unwrap_err();
        assert!(matches!(
            err,
            DaqError::SampleCount {
                expected: 20,
                actual: 3,
                ..
            }
        ));
    }

    #[test]
    fn single_reading_has_no_sd() {
        assert!(mean_and_sd(&[1.0]).is_none());
        assert!(aggregate(&batch_of(&[1.0]), 1).is_err());
    }

    #[test]
    fn synthetic_flag_sticks() {
        let now = Utc::now();
        let mut batch = SampleBatch::new("V1", 3);
        batch.push(1.0, now, false);
        batch.push(1.0, now, true);
        batch.push(1.0, now, false);
        assert!(batch.is_synthetic());
        assert!(aggregate(&batch, 3).unwrap().synthetic);
    }

    #[test]
    fn simulated_readings_are_normally_scattered() {
        let sd = voltmeter_spread(-1.0);
        let values: Vec<f64> = (0..2000).map(|_| simulated_reading(-1.0, sd)).collect();
        let (mean, sample_sd) = mean_and_sd(&values).unwrap();
        assert!((mean + 1.0).abs() < 1e-6);
        assert!((sample_sd / sd - 1.0).abs() < 0.1);
        // a normal draw strays past one sd about a third of the time
        let outside = values.iter().filter(|v| (**v + 1.0).abs() > sd).count();
        assert!(outside > 400 && outside < 900);

        assert_eq!(simulated_reading(108.0, 0.0), 108.0);
        assert_eq!(simulated_reading(108.0, f64::NAN), 108.0);
    }

    #[test]
    fn probe_reading_is_a_pair() {
        let reading = ProbeReading::new(20.5, "deg C");
        assert_eq!(serde_json::to_string(&reading).unwrap(), r#"[20.5,"deg C"]"#);
        assert_eq!(reading.unit(), "deg C");
    }

    #[test]
    fn formatted_time_matches_record_layout() {
        let block = aggregate(&batch_of(&[1.0, 1.0]), 2).unwrap();
        let text = block.formatted_time();
        assert_eq!(text.len(), "17/10/2026 12:00:00".len());
        assert_eq!(&text[2..3], "/");
        assert_eq!(&text[5..6], "/");
    }
}
