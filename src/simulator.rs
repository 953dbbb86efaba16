use crate::sample::{AccelVector, AccelerometerSample, HeartRateSample};
use chrono::{DateTime, Utc};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

pub const DEFAULT_SEED: u64 = 0x5EED_0F_11FE;

const BASELINE_HEART_RATE: f64 = 72.0;
const HEART_RATE_BOUNDS: (f64, f64) = (60.0, 100.0);
const HEART_RATE_STEP: f64 = 2.0;

/// Seeded generator of plausible accelerometer and heart-rate samples.
///
/// Accelerometer values jitter around 1 g on Z; heart rate takes a bounded
/// random walk from a resting baseline. The same seed always yields the same
/// sequence.
#[derive(Debug, Clone)]
pub struct Simulator {
    rng: ChaCha8Rng,
    heart_rate: f64,
}

impl Simulator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            heart_rate: BASELINE_HEART_RATE,
        }
    }

    pub fn next_samples(&mut self, now: DateTime<Utc>) -> (AccelerometerSample, HeartRateSample) {
        let vector = AccelVector::new(
            self.rng.gen_range(-0.1..=0.1),
            self.rng.gen_range(-0.1..=0.1),
            1.0 + self.rng.gen_range(-0.05..=0.05),
        );

        let step = self.rng.gen_range(-HEART_RATE_STEP..=HEART_RATE_STEP);
        self.heart_rate = (self.heart_rate + step).clamp(HEART_RATE_BOUNDS.0, HEART_RATE_BOUNDS.1);

        (
            AccelerometerSample { vector, captured_at: now },
            HeartRateSample { bpm: self.heart_rate.round() as u16, captured_at: now },
        )
    }
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new(DEFAULT_SEED)
    }
}
