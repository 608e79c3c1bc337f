//! IMU normalization
//!
//! Turns raw batches into [`ImuSample`]s in SI units (m/s², rad/s) with one
//! timestamp per sample.
//!
//! # Scaling
//!
//! | Variant   | Raw unit                      | Conversion                            |
//! |-----------|-------------------------------|---------------------------------------|
//! | Legacy    | f32 m/s², rad/s               | none                                  |
//! | Opcode-V2 | i16 counts, FSR byte present  | `raw / scale(fsr_bits)`               |
//! | Opcode-V2 | i16 mg, mdeg/s (no FSR byte)  | `raw / 1000 × 9.8`, `raw / 180 × π`   |
//! | ZHW       | i32 thousandths               | `raw / 1000`                          |
//!
//! # Timestamps
//!
//! Batches that carry device time (Opcode-V2 tick trailer, ZHW per-record
//! microseconds) produce [`TimeBase::Device`] timestamps in device seconds;
//! map them with a [`ClockModel`]. Everything else is stamped with the host
//! capture time.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::calibration::ClockModel;
use crate::protocol::{FsrBits, OpcodeV2ImuBatch, RawImuBatch, ZhwImuBatch, DEVICE_TICK_HZ};

const GRAVITY: f64 = 9.8;

/// Clock a sample timestamp is expressed in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeBase {
    /// Ring clock, seconds
    Device,
    /// Host clock at capture, seconds
    Host,
}

/// One normalized inertial sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImuSample {
    /// m/s²
    pub accel: [f64; 3],
    /// rad/s
    pub gyro: [f64; 3],
    /// Seconds, in `time_base`
    pub timestamp: f64,
    pub time_base: TimeBase,
    /// Position within its batch
    pub index: usize,
}

impl ImuSample {
    /// Timestamp on the host clock, mapping device time through `model`
    pub fn host_time(&self, model: &ClockModel) -> f64 {
        match self.time_base {
            TimeBase::Host => self.timestamp,
            TimeBase::Device => model.host_time(self.timestamp),
        }
    }
}

/// Whether to rotate samples into the ring output frame
///
/// The output frame is `(-ay, az, -ax, -gy, gz, -gx)`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AxisRemap {
    /// Opcode-V2 is remapped, Legacy and ZHW stay in the device frame
    #[default]
    VariantDefault,
    Always,
    Never,
}

/// Normalizer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImuConfig {
    /// Subtracted from the (remapped) gyro output, rad/s
    #[serde(default)]
    pub gyro_bias: [f64; 3],

    #[serde(default)]
    pub axis_remap: AxisRemap,

    /// Opcode-V2 batch sizes whose fifth gz value is re-interpolated
    #[serde(default = "default_gz_smoothing_batch_sizes")]
    pub gz_smoothing_batch_sizes: Vec<usize>,

    /// Sample rate requested from Legacy firmware, Hz
    #[serde(default = "default_imu_freq")]
    pub imu_freq: u32,
}

fn default_gz_smoothing_batch_sizes() -> Vec<usize> {
    vec![8, 10]
}

fn default_imu_freq() -> u32 {
    200
}

impl Default for ImuConfig {
    fn default() -> Self {
        Self {
            gyro_bias: [0.0; 3],
            axis_remap: AxisRemap::default(),
            gz_smoothing_batch_sizes: default_gz_smoothing_batch_sizes(),
            imu_freq: default_imu_freq(),
        }
    }
}

/// Accelerometer counts per m/s² for the given FSR bits
pub fn accel_scale(bits: u8) -> f64 {
    32768.0 / 16.0 * f64::from(1u32 << bits) / GRAVITY
}

/// Gyroscope counts per rad/s for the given FSR bits
pub fn gyro_scale(bits: u8) -> f64 {
    32768.0 / 2000.0 * f64::from(1u32 << bits) / (PI / 180.0)
}

/// Converts raw batches to samples
#[derive(Debug, Clone, Default)]
pub struct ImuNormalizer {
    config: ImuConfig,
}

impl ImuNormalizer {
    pub fn new(config: ImuConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ImuConfig {
        &self.config
    }

    pub fn gyro_bias(&self) -> [f64; 3] {
        self.config.gyro_bias
    }

    pub fn set_gyro_bias(&mut self, bias: [f64; 3]) {
        self.config.gyro_bias = bias;
    }

    /// Normalize one batch; `capture_time` is host time when it arrived
    pub fn normalize(&self, batch: &RawImuBatch, capture_time: f64) -> Vec<ImuSample> {
        match batch {
            RawImuBatch::Legacy(record) => {
                let accel = record.accel.map(f64::from);
                let gyro = record.gyro.map(f64::from);
                vec![self.finish(accel, gyro, false, capture_time, TimeBase::Host, 0)]
            }
            RawImuBatch::OpcodeV2(batch) => self.normalize_opcode_v2(batch, capture_time),
            RawImuBatch::Zhw(batch) => self.normalize_zhw(batch),
        }
    }

    fn remap_enabled(&self, variant_default: bool) -> bool {
        match self.config.axis_remap {
            AxisRemap::VariantDefault => variant_default,
            AxisRemap::Always => true,
            AxisRemap::Never => false,
        }
    }

    fn finish(
        &self,
        accel: [f64; 3],
        gyro: [f64; 3],
        variant_remap: bool,
        timestamp: f64,
        time_base: TimeBase,
        index: usize,
    ) -> ImuSample {
        let [bx, by, bz] = self.config.gyro_bias;
        let ([ax, ay, az], [gx, gy, gz]) = (accel, gyro);
        let (accel, gyro) = if self.remap_enabled(variant_remap) {
            ([-ay, az, -ax], [-gy - bx, gz - by, -gx - bz])
        } else {
            ([ax, ay, az], [gx - bx, gy - by, gz - bz])
        };
        ImuSample {
            accel,
            gyro,
            timestamp,
            time_base,
            index,
        }
    }

    fn normalize_opcode_v2(&self, batch: &OpcodeV2ImuBatch, capture_time: f64) -> Vec<ImuSample> {
        let units = RawUnits::from_fsr(batch.fsr);
        let count = batch.records.len();
        let mut samples: Vec<ImuSample> = batch
            .records
            .iter()
            .enumerate()
            .map(|(index, raw)| {
                let accel = [raw[0], raw[1], raw[2]].map(|v| units.accel(v));
                let gyro = [raw[3], raw[4], raw[5]].map(|v| units.gyro(v));
                let (timestamp, time_base) = match batch.span_ticks {
                    Some((start, end)) => (
                        interpolate_ticks(start, end, index, count) / DEVICE_TICK_HZ,
                        TimeBase::Device,
                    ),
                    None => (capture_time, TimeBase::Host),
                };
                self.finish(accel, gyro, true, timestamp, time_base, index)
            })
            .collect();

        if batch.span_ticks.is_none() && self.config.gz_smoothing_batch_sizes.contains(&count) {
            smooth_fifth_gz(&mut samples);
        }
        samples
    }

    fn normalize_zhw(&self, batch: &ZhwImuBatch) -> Vec<ImuSample> {
        batch
            .records
            .iter()
            .enumerate()
            .map(|(index, record)| {
                let accel = record.accel.map(|v| f64::from(v) / 1e3);
                let gyro = record.gyro.map(|v| f64::from(v) / 1e3);
                let timestamp = f64::from(record.timestamp_us) / 1e6;
                self.finish(accel, gyro, false, timestamp, TimeBase::Device, index)
            })
            .collect()
    }
}

/// Opcode-V2 count conversion
#[derive(Debug, Clone, Copy)]
enum RawUnits {
    /// Counts per SI unit
    FullScale { accel: f64, gyro: f64 },
    /// mg and mdeg/s
    Milli,
}

impl RawUnits {
    fn from_fsr(fsr: Option<FsrBits>) -> Self {
        match fsr {
            Some(bits) => RawUnits::FullScale {
                accel: accel_scale(bits.accel),
                gyro: gyro_scale(bits.gyro),
            },
            None => RawUnits::Milli,
        }
    }

    fn accel(&self, raw: i16) -> f64 {
        match self {
            RawUnits::FullScale { accel, .. } => f64::from(raw) / accel,
            RawUnits::Milli => f64::from(raw) / 1e3 * GRAVITY,
        }
    }

    fn gyro(&self, raw: i16) -> f64 {
        match self {
            RawUnits::FullScale { gyro, .. } => f64::from(raw) / gyro,
            RawUnits::Milli => f64::from(raw) / 180.0 * PI,
        }
    }
}

fn interpolate_ticks(start: i32, end: i32, index: usize, count: usize) -> f64 {
    if count < 2 {
        return f64::from(start);
    }
    let start = f64::from(start);
    let end = f64::from(end);
    start + (end - start) * index as f64 / (count - 1) as f64
}

/// Replace sample 4's gz with the mean of its neighbours
fn smooth_fifth_gz(samples: &mut [ImuSample]) {
    if samples.len() < 6 {
        return;
    }
    samples[4].gyro[2] = (samples[3].gyro[2] + samples[5].gyro[2]) / 2.0;
}

/// Mean gyro output of samples taken at rest
///
/// Feed samples normalized with a zero bias; the result is suitable for
/// [`ImuNormalizer::set_gyro_bias`]. `None` for an empty slice.
pub fn estimate_gyro_bias(samples: &[ImuSample]) -> Option<[f64; 3]> {
    if samples.is_empty() {
        return None;
    }
    let n = samples.len() as f64;
    let sum = samples.iter().fold([0.0; 3], |acc, s| {
        [acc[0] + s.gyro[0], acc[1] + s.gyro[1], acc[2] + s.gyro[2]]
    });
    Some(sum.map(|v| v / n))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{LegacyImuRecord, ZhwImuRecord};
    use approx::{assert_abs_diff_eq, assert_relative_eq};

    fn v2(fsr: Option<FsrBits>, records: Vec<[i16; 6]>, span_ticks: Option<(i32, i32)>) -> RawImuBatch {
        RawImuBatch::OpcodeV2(OpcodeV2ImuBatch {
            fsr,
            records,
            span_ticks,
        })
    }

    #[test]
    fn test_fsr_scales() {
        assert_relative_eq!(accel_scale(0), 2048.0 / 9.8, max_relative = 1e-12);
        assert_relative_eq!(accel_scale(3), 16384.0 / 9.8, max_relative = 1e-12);
        assert_relative_eq!(gyro_scale(0), 16.384 / (PI / 180.0), max_relative = 1e-12);
    }

    #[test]
    fn test_fsr_scaling_and_remap() {
        let normalizer = ImuNormalizer::default();
        let fsr = FsrBits { accel: 1, gyro: 2 };
        let raw = [4096i16, -8192, 2048, 655, -1310, 1965];
        let samples = normalizer.normalize(&v2(Some(fsr), vec![raw], None), 3.0);
        let s = samples[0];

        let a = |r: i16| f64::from(r) / accel_scale(1);
        let g = |r: i16| f64::from(r) / gyro_scale(2);
        assert_relative_eq!(s.accel[0], -a(raw[1]), max_relative = 1e-6);
        assert_relative_eq!(s.accel[1], a(raw[2]), max_relative = 1e-6);
        assert_relative_eq!(s.accel[2], -a(raw[0]), max_relative = 1e-6);
        assert_relative_eq!(s.gyro[0], -g(raw[4]), max_relative = 1e-6);
        assert_relative_eq!(s.gyro[1], g(raw[5]), max_relative = 1e-6);
        assert_relative_eq!(s.gyro[2], -g(raw[3]), max_relative = 1e-6);
        assert_eq!(s.time_base, TimeBase::Host);
        assert_eq!(s.timestamp, 3.0);
    }

    #[test]
    fn test_milli_units_without_fsr() {
        let normalizer = ImuNormalizer::default();
        let samples = normalizer.normalize(&v2(None, vec![[1000, 0, 0, 180, 0, 0]], None), 0.0);
        // ax = 1 g lands on -z, gx = 180 deg/s lands on -gz
        assert_relative_eq!(samples[0].accel[2], -9.8, max_relative = 1e-9);
        assert_relative_eq!(samples[0].gyro[2], -PI, max_relative = 1e-9);
    }

    #[test]
    fn test_bias_subtracted_after_remap() {
        let mut normalizer = ImuNormalizer::default();
        normalizer.set_gyro_bias([0.1, 0.2, 0.3]);
        let samples = normalizer.normalize(&v2(None, vec![[0; 6]], None), 0.0);
        assert_abs_diff_eq!(samples[0].gyro[0], -0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(samples[0].gyro[1], -0.2, epsilon = 1e-12);
        assert_abs_diff_eq!(samples[0].gyro[2], -0.3, epsilon = 1e-12);
    }

    #[test]
    fn test_tick_interpolation() {
        let normalizer = ImuNormalizer::default();
        let records = vec![[0i16; 6]; 10];
        let samples = normalizer.normalize(&v2(None, records, Some((16384, 16384 + 9 * 82))), 99.0);

        assert_eq!(samples.len(), 10);
        for (i, s) in samples.iter().enumerate() {
            assert_eq!(s.time_base, TimeBase::Device);
            assert_eq!(s.index, i);
            assert_relative_eq!(s.timestamp, (16384.0 + 82.0 * i as f64) / 16384.0, max_relative = 1e-12);
        }
    }

    #[test]
    fn test_gz_smoothing_on_eight_sample_batch() {
        let normalizer = ImuNormalizer::default();
        let records: Vec<[i16; 6]> = (0..8).map(|i| [0, 0, 0, i * 100, 0, 0]).collect();
        let mut spiked = records.clone();
        spiked[4][3] = 30000;

        let samples = normalizer.normalize(&v2(None, spiked, None), 0.0);
        // gz = -gx after remap; neighbours are 300 and 500 mdeg/s
        assert_relative_eq!(samples[4].gyro[2], -(400.0 / 180.0 * PI), max_relative = 1e-9);
        assert_relative_eq!(samples[3].gyro[2], -(300.0 / 180.0 * PI), max_relative = 1e-9);
    }

    #[test]
    fn test_no_smoothing_for_other_sizes_or_timed_batches() {
        let normalizer = ImuNormalizer::default();
        let mut records = vec![[0i16; 6]; 7];
        records[4][3] = 1800;
        let samples = normalizer.normalize(&v2(None, records.clone(), None), 0.0);
        assert_relative_eq!(samples[4].gyro[2], -(1800.0 / 180.0 * PI), max_relative = 1e-9);

        records.push([0; 6]);
        let samples = normalizer.normalize(&v2(None, records, Some((0, 700))), 0.0);
        assert_relative_eq!(samples[4].gyro[2], -(1800.0 / 180.0 * PI), max_relative = 1e-9);
    }

    #[test]
    fn test_legacy_floats_pass_through() {
        let normalizer = ImuNormalizer::default();
        let record = LegacyImuRecord {
            accel: [0.1, -9.81, 3.25],
            gyro: [0.001, 0.5, -1.75],
            trailer: [0; 8],
        };
        let samples = normalizer.normalize(&RawImuBatch::Legacy(record.clone()), 12.5);
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].accel, record.accel.map(f64::from));
        assert_eq!(samples[0].gyro, record.gyro.map(f64::from));
        assert_eq!(samples[0].timestamp, 12.5);
    }

    #[test]
    fn test_legacy_remap_opt_in() {
        let normalizer = ImuNormalizer::new(ImuConfig {
            axis_remap: AxisRemap::Always,
            ..ImuConfig::default()
        });
        let record = LegacyImuRecord {
            accel: [1.0, 2.0, 3.0],
            gyro: [4.0, 5.0, 6.0],
            trailer: [0; 8],
        };
        let samples = normalizer.normalize(&RawImuBatch::Legacy(record), 0.0);
        assert_eq!(samples[0].accel, [-2.0, 3.0, -1.0]);
        assert_eq!(samples[0].gyro, [-5.0, 6.0, -4.0]);
    }

    #[test]
    fn test_zhw_units_and_device_time() {
        let normalizer = ImuNormalizer::default();
        let batch = RawImuBatch::Zhw(ZhwImuBatch {
            records: vec![ZhwImuRecord {
                accel: [9800, -500, 0],
                gyro: [1000, 0, -250],
                timestamp_us: 2_500_000,
            }],
        });
        let samples = normalizer.normalize(&batch, 0.0);
        assert_relative_eq!(samples[0].accel[0], 9.8, max_relative = 1e-12);
        assert_relative_eq!(samples[0].accel[1], -0.5, max_relative = 1e-12);
        assert_relative_eq!(samples[0].gyro[2], -0.25, max_relative = 1e-12);
        assert_eq!(samples[0].timestamp, 2.5);
        assert_eq!(samples[0].time_base, TimeBase::Device);
    }

    #[test]
    fn test_host_time_mapping() {
        let model = ClockModel { intercept: 100.0, slope: 2.0 };
        let device = ImuSample {
            accel: [0.0; 3],
            gyro: [0.0; 3],
            timestamp: 1.5,
            time_base: TimeBase::Device,
            index: 0,
        };
        assert_eq!(device.host_time(&model), 103.0);
        let host = ImuSample { time_base: TimeBase::Host, ..device };
        assert_eq!(host.host_time(&model), 1.5);
    }

    #[test]
    fn test_estimate_gyro_bias() {
        let normalizer = ImuNormalizer::default();
        let records = vec![[0, 0, 0, 18, -36, 54]; 4];
        let samples = normalizer.normalize(&v2(None, records, None), 0.0);
        let bias = estimate_gyro_bias(&samples).unwrap();

        let mut corrected = ImuNormalizer::default();
        corrected.set_gyro_bias(bias);
        let again = corrected.normalize(&v2(None, vec![[0, 0, 0, 18, -36, 54]], None), 0.0);
        for axis in again[0].gyro {
            assert_abs_diff_eq!(axis, 0.0, epsilon = 1e-12);
        }
        assert_eq!(estimate_gyro_bias(&[]), None);
    }
}
