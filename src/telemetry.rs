//! # Telemetry Channels Module
//!
//! Routes validated samples into per-metric rolling histories and keeps the
//! most recent sample of each kind for live display.
//!
//! ## Key Types
//! - `TelemetryUpdate`: Message sent from link drivers to the state owner
//! - `Channels`: One rolling history per metric (HR, SpO2, steps, ACC X/Y/Z)
//! - `LatestSamples`: Last-known value per metric

use crate::error::SessionError;
use crate::sample::{
    AccelerometerSample, HeartRateSample, Sample, SampleSource, Spo2Sample, StepSample,
};
use crate::session::ConnectionState;
use crate::timeseries::{Point, RollingHistory};
use crate::transport::DeviceDescriptor;

/// Updates flowing from the link drivers to the owning monitor
#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryUpdate {
    LinkState(ConnectionState),
    /// Candidate devices, strongest signal first
    Devices(Vec<DeviceDescriptor>),
    Sample { source: SampleSource, sample: Sample },
    LinkError(SessionError),
    NetworkConnected,
    NetworkDisconnected,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatestSamples {
    pub heart_rate: Option<HeartRateSample>,
    pub spo2: Option<Spo2Sample>,
    pub steps: Option<StepSample>,
    pub accelerometer: Option<AccelerometerSample>,
}

/// Container for all metric channels
#[derive(Debug, Clone, Default)]
pub struct Channels {
    pub heart_rate: RollingHistory<u16>,
    pub spo2: RollingHistory<f32>,
    pub steps: RollingHistory<u32>,
    pub acc_x: RollingHistory<f32>,
    pub acc_y: RollingHistory<f32>,
    pub acc_z: RollingHistory<f32>,
    pub latest: LatestSamples,
}

/// Read-only copy of every channel for charting
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistorySnapshot {
    pub heart_rate: Vec<Point<u16>>,
    pub spo2: Vec<Point<f32>>,
    pub steps: Vec<Point<u32>>,
    pub acc_x: Vec<Point<f32>>,
    pub acc_y: Vec<Point<f32>>,
    pub acc_z: Vec<Point<f32>>,
}

impl Channels {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a validated sample in its channel and as the latest value
    pub fn record(&mut self, sample: &Sample) {
        match *sample {
            Sample::HeartRate(s) => {
                self.heart_rate.push(s.bpm, s.captured_at);
                self.latest.heart_rate = Some(s);
            }
            Sample::Spo2(s) => {
                self.spo2.push(s.percent, s.captured_at);
                self.latest.spo2 = Some(s);
            }
            Sample::Steps(s) => {
                self.steps.push(s.count, s.captured_at);
                self.latest.steps = Some(s);
            }
            Sample::Accelerometer(s) => {
                self.acc_x.push(s.vector.x, s.captured_at);
                self.acc_y.push(s.vector.y, s.captured_at);
                self.acc_z.push(s.vector.z, s.captured_at);
                self.latest.accelerometer = Some(s);
            }
        }
    }

    /// Forget last-known values while keeping the chart histories
    pub fn clear_latest(&mut self) {
        self.latest = LatestSamples::default();
    }

    pub fn snapshot(&self) -> HistorySnapshot {
        HistorySnapshot {
            heart_rate: self.heart_rate.snapshot(),
            spo2: self.spo2.snapshot(),
            steps: self.steps.snapshot(),
            acc_x: self.acc_x.snapshot(),
            acc_y: self.acc_y.snapshot(),
            acc_z: self.acc_z.snapshot(),
        }
    }
}
