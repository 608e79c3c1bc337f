//! Device clock calibration
//!
//! A calibration run sends a clock request many times. For each round the
//! host notes the time just before and just after the write; the midpoint is
//! taken as the host time at which the ring read its clock. The ring's
//! answer arrives later as a [`CalibAck`](crate::protocol::CalibAck).
//!
//! ```text
//! host  ──send──┬──returned──────────────  host_time = (send + recv) / 2
//!               │                          latency   = recv - send
//! ring  ────────┴── reads clock ── ack ──► device_time
//! ```
//!
//! Rounds with a high latency say little about when the ring read its clock,
//! so they are dropped before the fit. The remaining pairs are fitted with
//! ordinary least squares to `host = intercept + slope × device`.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, RingError};
use crate::protocol::ProtocolKind;

/// One paired round
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationSample {
    /// Host seconds just before the request was written
    pub host_send: f64,
    /// Host seconds just after the write returned
    pub host_recv: f64,
    /// Device seconds from the ack
    pub device_time: f64,
}

impl CalibrationSample {
    /// Estimated host time at which the device read its clock
    pub fn host_time(&self) -> f64 {
        (self.host_send + self.host_recv) / 2.0
    }

    pub fn latency(&self) -> f64 {
        self.host_recv - self.host_send
    }
}

/// Linear map from device seconds to host seconds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClockModel {
    pub intercept: f64,
    pub slope: f64,
}

impl ClockModel {
    pub fn host_time(&self, device_time: f64) -> f64 {
        self.intercept + self.slope * device_time
    }

    /// Inverse mapping
    pub fn device_time(&self, host_time: f64) -> f64 {
        (host_time - self.intercept) / self.slope
    }
}

/// Ordinary least squares fit of host time on device time
///
/// Needs at least two samples with distinct device times.
pub fn fit(samples: &[CalibrationSample]) -> Result<ClockModel> {
    if samples.len() < 2 {
        return Err(RingError::DegenerateFit {
            reason: format!("{} sample(s), at least 2 required", samples.len()),
        });
    }

    let n = samples.len() as f64;
    let mean_device = samples.iter().map(|s| s.device_time).sum::<f64>() / n;
    let mean_host = samples.iter().map(|s| s.host_time()).sum::<f64>() / n;

    let (sxx, sxy) = samples.iter().fold((0.0, 0.0), |(sxx, sxy), s| {
        let dx = s.device_time - mean_device;
        let dy = s.host_time() - mean_host;
        (sxx + dx * dx, sxy + dx * dy)
    });

    if sxx <= f64::EPSILON {
        return Err(RingError::DegenerateFit {
            reason: "all device times are identical".into(),
        });
    }

    let slope = sxy / sxx;
    Ok(ClockModel {
        intercept: mean_host - slope * mean_device,
        slope,
    })
}

/// Calibration run parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationConfig {
    #[serde(default = "default_rounds")]
    pub rounds: u32,

    /// Delay between rounds, milliseconds
    #[serde(default = "default_round_interval_ms")]
    pub round_interval_ms: u64,

    /// Rounds slower than this are discarded, seconds
    #[serde(default = "default_max_latency")]
    pub max_latency: f64,

    /// Fewer accepted rounds than this produce a warning
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    /// Wait before the first round and after the last, milliseconds
    #[serde(default = "default_settle_ms")]
    pub settle_ms: u64,
}

fn default_rounds() -> u32 {
    300
}

fn default_round_interval_ms() -> u64 {
    100
}

fn default_max_latency() -> f64 {
    0.010
}

fn default_min_samples() -> usize {
    20
}

fn default_settle_ms() -> u64 {
    1000
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            rounds: default_rounds(),
            round_interval_ms: default_round_interval_ms(),
            max_latency: default_max_latency(),
            min_samples: default_min_samples(),
            settle_ms: default_settle_ms(),
        }
    }
}

impl CalibrationConfig {
    /// Defaults with the latency threshold tuned per firmware family
    pub fn for_protocol(kind: ProtocolKind) -> Self {
        let max_latency = match kind {
            ProtocolKind::OpcodeV2 => default_max_latency(),
            ProtocolKind::Legacy | ProtocolKind::Zhw => 0.014,
        };
        Self {
            max_latency,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.rounds < 2 {
            return Err(RingError::config("calibration.rounds must be at least 2"));
        }
        if self.max_latency.is_nan() || self.max_latency <= 0.0 {
            return Err(RingError::config("calibration.max_latency must be positive"));
        }
        if self.min_samples < 2 {
            return Err(RingError::config("calibration.min_samples must be at least 2"));
        }
        Ok(())
    }
}

/// Non-fatal calibration problems
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationWarning {
    /// Fewer accepted rounds than configured; the model may be imprecise
    Insufficient { accepted: usize, required: usize },
    /// Acks that arrived without an outstanding round
    UnpairedAcks { count: usize },
}

/// Result of evaluating a set of samples
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationOutcome {
    /// `None` when the accepted samples cannot determine a line
    pub model: Option<ClockModel>,
    pub accepted: Vec<CalibrationSample>,
    pub rejected: usize,
    pub warnings: Vec<CalibrationWarning>,
}

impl CalibrationOutcome {
    pub fn is_insufficient(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, CalibrationWarning::Insufficient { .. }))
    }
}

/// Filter by latency, fit, and flag a thin result
pub fn evaluate(samples: &[CalibrationSample], config: &CalibrationConfig) -> CalibrationOutcome {
    let mut accepted: Vec<CalibrationSample> = samples
        .iter()
        .copied()
        .filter(|s| s.latency() < config.max_latency)
        .collect();
    accepted.sort_by(|a, b| a.latency().total_cmp(&b.latency()));
    let rejected = samples.len() - accepted.len();

    debug!(
        accepted = accepted.len(),
        rejected,
        "calibration samples filtered"
    );

    let mut warnings = Vec::new();
    if accepted.len() < config.min_samples {
        warn!(
            accepted = accepted.len(),
            required = config.min_samples,
            "not enough calibration samples"
        );
        warnings.push(CalibrationWarning::Insufficient {
            accepted: accepted.len(),
            required: config.min_samples,
        });
    }

    let model = match fit(&accepted) {
        Ok(model) => Some(model),
        Err(e) => {
            warn!(error = %e, "clock model not fitted");
            None
        }
    };

    CalibrationOutcome {
        model,
        accepted,
        rejected,
        warnings,
    }
}

/// Pairs rounds with acks as a run progresses
///
/// Acks carry no round id, so they are matched to outstanding rounds in
/// arrival order.
#[derive(Debug, Clone)]
pub struct CalibrationRun {
    config: CalibrationConfig,
    outstanding: VecDeque<(f64, f64)>,
    samples: Vec<CalibrationSample>,
    rounds_sent: u32,
    unpaired_acks: usize,
}

impl CalibrationRun {
    pub fn new(config: CalibrationConfig) -> Self {
        Self {
            config,
            outstanding: VecDeque::new(),
            samples: Vec::new(),
            rounds_sent: 0,
            unpaired_acks: 0,
        }
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    pub fn rounds_sent(&self) -> u32 {
        self.rounds_sent
    }

    /// All configured rounds have been sent
    pub fn is_complete(&self) -> bool {
        self.rounds_sent >= self.config.rounds
    }

    /// A request was written between `host_send` and `host_recv`
    pub fn record_round(&mut self, host_send: f64, host_recv: f64) {
        self.rounds_sent += 1;
        self.outstanding.push_back((host_send, host_recv));
    }

    /// A request write failed; the round produces no sample
    pub fn record_failed_round(&mut self) {
        self.rounds_sent += 1;
    }

    /// The ring answered with its clock in seconds
    pub fn record_ack(&mut self, device_time: f64) {
        match self.outstanding.pop_front() {
            Some((host_send, host_recv)) => self.samples.push(CalibrationSample {
                host_send,
                host_recv,
                device_time,
            }),
            None => self.unpaired_acks += 1,
        }
    }

    pub fn samples(&self) -> &[CalibrationSample] {
        &self.samples
    }

    /// Evaluate the paired samples; rounds still waiting for an ack are dropped
    pub fn finish(self) -> CalibrationOutcome {
        let mut outcome = evaluate(&self.samples, &self.config);
        if self.unpaired_acks > 0 {
            outcome.warnings.push(CalibrationWarning::UnpairedAcks {
                count: self.unpaired_acks,
            });
        }
        outcome
    }
}

/// Storable record of a successful calibration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub device: String,
    pub intercept: f64,
    pub slope: f64,
    pub host_times: Vec<f64>,
    pub device_times: Vec<f64>,
    pub latencies: Vec<f64>,
    pub rejected: usize,
    pub warnings: Vec<CalibrationWarning>,
    pub calibrated_at: DateTime<Utc>,
}

impl CalibrationReport {
    /// `None` if the outcome has no model
    pub fn from_outcome(
        device: impl Into<String>,
        outcome: &CalibrationOutcome,
        calibrated_at: DateTime<Utc>,
    ) -> Option<Self> {
        let model = outcome.model?;
        Some(Self {
            device: device.into(),
            intercept: model.intercept,
            slope: model.slope,
            host_times: outcome.accepted.iter().map(|s| s.host_time()).collect(),
            device_times: outcome.accepted.iter().map(|s| s.device_time).collect(),
            latencies: outcome.accepted.iter().map(|s| s.latency()).collect(),
            rejected: outcome.rejected,
            warnings: outcome.warnings.clone(),
            calibrated_at,
        })
    }

    pub fn model(&self) -> ClockModel {
        ClockModel {
            intercept: self.intercept,
            slope: self.slope,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const INTERCEPT: f64 = 1234.5;
    const SLOPE: f64 = 1.000_02;

    fn synthetic(count: usize, seed: u64) -> Vec<CalibrationSample> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..count)
            .map(|i| {
                let device_time = 10.0 + i as f64 * 0.1;
                let latency = rng.gen_range(0.002..0.008);
                let noise = rng.gen_range(-0.0005..0.0005);
                let midpoint = INTERCEPT + SLOPE * device_time + noise;
                CalibrationSample {
                    host_send: midpoint - latency / 2.0,
                    host_recv: midpoint + latency / 2.0,
                    device_time,
                }
            })
            .collect()
    }

    #[test]
    fn test_sample_midpoint_and_latency() {
        let sample = CalibrationSample { host_send: 1.0, host_recv: 1.004, device_time: 0.0 };
        assert_abs_diff_eq!(sample.host_time(), 1.002, epsilon = 1e-12);
        assert_abs_diff_eq!(sample.latency(), 0.004, epsilon = 1e-12);
    }

    #[test]
    fn test_exact_line() {
        let samples: Vec<_> = (0..5)
            .map(|i| {
                let d = i as f64;
                CalibrationSample { host_send: 3.0 + 2.0 * d, host_recv: 3.0 + 2.0 * d, device_time: d }
            })
            .collect();
        let model = fit(&samples).unwrap();
        assert_abs_diff_eq!(model.intercept, 3.0, epsilon = 1e-9);
        assert_abs_diff_eq!(model.slope, 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(model.device_time(model.host_time(7.5)), 7.5, epsilon = 1e-9);
    }

    #[test]
    fn test_recovers_known_model() {
        let samples = synthetic(300, 7);
        let model = fit(&samples).unwrap();
        assert_abs_diff_eq!(model.slope, SLOPE, epsilon = 1e-5);
        assert_abs_diff_eq!(model.intercept, INTERCEPT, epsilon = 1e-3);
    }

    #[test]
    fn test_outlier_is_rejected() {
        let config = CalibrationConfig::default();
        let clean = synthetic(200, 11);
        let baseline = evaluate(&clean, &config);

        let mut noisy = clean.clone();
        noisy.insert(
            100,
            CalibrationSample {
                host_send: INTERCEPT + 50.0,
                host_recv: INTERCEPT + 50.05,
                device_time: 15.0,
            },
        );
        let outcome = evaluate(&noisy, &config);

        assert_eq!(outcome.rejected, 1);
        assert_eq!(outcome.accepted.len(), 200);
        let (with, without) = (outcome.model.unwrap(), baseline.model.unwrap());
        assert_abs_diff_eq!(with.slope, without.slope, epsilon = 1e-9);
        assert_abs_diff_eq!(with.intercept, without.intercept, epsilon = 1e-6);
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn test_insufficient_samples_still_fit() {
        let outcome = evaluate(&synthetic(5, 3), &CalibrationConfig::default());
        assert!(outcome.model.is_some());
        assert!(outcome.is_insufficient());
        assert_eq!(
            outcome.warnings,
            vec![CalibrationWarning::Insufficient { accepted: 5, required: 20 }]
        );
    }

    #[test]
    fn test_degenerate_inputs() {
        assert!(matches!(fit(&[]), Err(RingError::DegenerateFit { .. })));
        let same = CalibrationSample { host_send: 1.0, host_recv: 1.001, device_time: 4.0 };
        assert!(matches!(fit(&[same, same]), Err(RingError::DegenerateFit { .. })));

        let outcome = evaluate(&[same], &CalibrationConfig::default());
        assert_eq!(outcome.model, None);
        assert!(outcome.is_insufficient());
    }

    #[test]
    fn test_run_pairs_acks_in_order() {
        let config = CalibrationConfig { rounds: 3, ..CalibrationConfig::default() };
        let mut run = CalibrationRun::new(config);

        run.record_round(1.000, 1.002);
        run.record_round(1.100, 1.103);
        run.record_ack(0.5);
        run.record_round(1.200, 1.201);
        run.record_ack(0.6);
        assert!(run.is_complete());

        let samples = run.samples();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].host_send, 1.000);
        assert_eq!(samples[0].device_time, 0.5);
        assert_eq!(samples[1].host_send, 1.100);

        // Third round never answered
        let outcome = run.finish();
        assert_eq!(outcome.accepted.len(), 2);
    }

    #[test]
    fn test_run_counts_unpaired_acks() {
        let mut run = CalibrationRun::new(CalibrationConfig::default());
        run.record_ack(3.0);
        let outcome = run.finish();
        assert!(outcome.warnings.contains(&CalibrationWarning::UnpairedAcks { count: 1 }));
    }

    #[test]
    fn test_variant_latency_thresholds() {
        assert_eq!(CalibrationConfig::for_protocol(ProtocolKind::OpcodeV2).max_latency, 0.010);
        assert_eq!(CalibrationConfig::for_protocol(ProtocolKind::Zhw).max_latency, 0.014);
        assert!(CalibrationConfig { rounds: 1, ..CalibrationConfig::default() }.validate().is_err());
    }

    #[test]
    fn test_report_round_trip() {
        let outcome = evaluate(&synthetic(30, 5), &CalibrationConfig::default());
        let at = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z").unwrap().with_timezone(&Utc);
        let report = CalibrationReport::from_outcome("AA:BB:CC:DD:EE:FF", &outcome, at).unwrap();
        assert_eq!(report.host_times.len(), 30);

        let parsed = CalibrationReport::from_json(&report.to_json().unwrap()).unwrap();
        assert_eq!(parsed.device, report.device);
        assert_eq!(parsed.calibrated_at, at);
        assert_eq!(parsed.latencies.len(), 30);
        let model = outcome.model.unwrap();
        assert_abs_diff_eq!(parsed.model().slope, model.slope, epsilon = 1e-12);
        assert_abs_diff_eq!(parsed.model().intercept, model.intercept, epsilon = 1e-9);
    }
}
