//! # Sample Validation Module
//!
//! Turns raw sensor fields into typed, range-checked samples. Every function
//! here is pure: a rejected field yields `None`, a malformed accelerometer
//! payload yields the zero vector, and nothing ever panics on bad input.
//!
//! ## Accepted Inputs
//! - Heart rate: `bpm > 0`
//! - SpO2: `0..=100` percent
//! - Steps: `count >= 0`
//! - Accelerometer text: `"X:<int> Y:<int> Z:<int>"`
//! - Accelerometer binary: three little-endian `i16` in milli-g

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static ACCEL_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"X:(-?\d+)\s+Y:(-?\d+)\s+Z:(-?\d+)").ok());

const MILLI_G_PER_G: f32 = 1000.0;

/// Three-axis acceleration
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct AccelVector {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl AccelVector {
    pub const ZERO: AccelVector = AccelVector { x: 0.0, y: 0.0, z: 0.0 };

    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccelerometerSample {
    pub vector: AccelVector,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartRateSample {
    pub bpm: u16,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Spo2Sample {
    pub percent: f32,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepSample {
    pub count: u32,
    pub captured_at: DateTime<Utc>,
}

/// A validated physiological reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sample {
    Accelerometer(AccelerometerSample),
    HeartRate(HeartRateSample),
    Spo2(Spo2Sample),
    Steps(StepSample),
}


/// Where a sample came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleSource {
    /// Short-range link characteristic stream
    Link,
    /// Local-network sensor node
    Network,
    /// Generated while the real stream is silent
    Simulated,
}

/// Characteristic value as delivered by a link transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CharacteristicValue {
    /// Base64 text, as handed over by bridged platform stacks
    Base64(String),
    /// Bytes straight from a native adapter
    Raw(Vec<u8>),
}

impl CharacteristicValue {
    /// Payload bytes, or `None` when the base64 text does not decode
    pub fn bytes(&self) -> Option<Vec<u8>> {
        match self {
            CharacteristicValue::Base64(text) => STANDARD.decode(text.trim()).ok(),
            CharacteristicValue::Raw(bytes) => Some(bytes.clone()),
        }
    }
}

pub fn heart_rate(bpm: f64, captured_at: DateTime<Utc>) -> Option<HeartRateSample> {
    if !bpm.is_finite() || bpm <= 0.0 {
        return None;
    }
    let rounded = bpm.round();
    if rounded < 1.0 || rounded > f64::from(u16::MAX) {
        return None;
    }
    Some(HeartRateSample { bpm: rounded as u16, captured_at })
}

pub fn spo2(percent: f64, captured_at: DateTime<Utc>) -> Option<Spo2Sample> {
    if !(0.0..=100.0).contains(&percent) {
        return None;
    }
    Some(Spo2Sample { percent: percent as f32, captured_at })
}

pub fn steps(count: f64, captured_at: DateTime<Utc>) -> Option<StepSample> {
    if !count.is_finite() || count < 0.0 || count > f64::from(u32::MAX) {
        return None;
    }
    Some(StepSample { count: count.round() as u32, captured_at })
}

/// Parse the node's `"X:<int> Y:<int> Z:<int>"` text, zero vector on mismatch
pub fn parse_accelerometer_text(text: &str) -> AccelVector {
    let Some(pattern) = ACCEL_PATTERN.as_ref() else {
        return AccelVector::ZERO;
    };
    let Some(caps) = pattern.captures(text) else {
        log::debug!("Malformed accelerometer text: {:?}", text);
        return AccelVector::ZERO;
    };

    let axis = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<i32>().ok());
    match (axis(1), axis(2), axis(3)) {
        (Some(x), Some(y), Some(z)) => AccelVector::new(x as f32, y as f32, z as f32),
        _ => AccelVector::ZERO,
    }
}

/// Decode three little-endian `i16` milli-g values into g, zero vector when short
pub fn decode_accelerometer_bytes(bytes: &[u8]) -> AccelVector {
    if bytes.len() < 6 {
        log::debug!("Accelerometer payload too short: {} bytes", bytes.len());
        return AccelVector::ZERO;
    }
    let axis = |i: usize| f32::from(i16::from_le_bytes([bytes[i], bytes[i + 1]])) / MILLI_G_PER_G;
    AccelVector::new(axis(0), axis(2), axis(4))
}

/// Decode a characteristic update from the short-range link
pub fn decode_characteristic(
    value: &CharacteristicValue,
    captured_at: DateTime<Utc>,
) -> AccelerometerSample {
    let vector = match value.bytes() {
        Some(bytes) => decode_accelerometer_bytes(&bytes),
        None => {
            log::warn!("Discarding characteristic value that is not valid base64");
            AccelVector::ZERO
        }
    };
    AccelerometerSample { vector, captured_at }
}

/// Numbers or numeric strings; anything else is rejected
fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Validate every known field of a sensor-node JSON document.
///
/// Fields: `hr`, `spo2`, `lis3dh` (accelerometer text) and `steps`. Missing
/// or rejected fields produce no sample.
pub fn validate_readings(document: &Value, captured_at: DateTime<Utc>) -> Vec<Sample> {
    let Some(fields) = document.as_object() else {
        log::warn!("Discarding readings payload that is not a JSON object");
        return Vec::new();
    };

    let mut samples = Vec::with_capacity(4);

    if let Some(raw) = fields.get("hr").filter(|v| !v.is_null()) {
        match numeric(raw).and_then(|bpm| heart_rate(bpm, captured_at)) {
            Some(sample) => samples.push(Sample::HeartRate(sample)),
            None => log::debug!("Rejected heart rate field: {}", raw),
        }
    }

    if let Some(raw) = fields.get("spo2").filter(|v| !v.is_null()) {
        match numeric(raw).and_then(|percent| spo2(percent, captured_at)) {
            Some(sample) => samples.push(Sample::Spo2(sample)),
            None => log::debug!("Rejected SpO2 field: {}", raw),
        }
    }

    if let Some(raw) = fields.get("lis3dh").filter(|v| !v.is_null()) {
        let vector = raw
            .as_str()
            .map(parse_accelerometer_text)
            .unwrap_or(AccelVector::ZERO);
        samples.push(Sample::Accelerometer(AccelerometerSample { vector, captured_at }));
    }

    if let Some(raw) = fields.get("steps").filter(|v| !v.is_null()) {
        match numeric(raw).and_then(|count| steps(count, captured_at)) {
            Some(sample) => samples.push(Sample::Steps(sample)),
            None => log::debug!("Rejected step count field: {}", raw),
        }
    }

    samples
}
