//! # Calorie Engine Module
//!
//! Pure energy-expenditure estimates from heart rate and the user profile.
//!
//! ## Models
//! Four linear regressions keyed by gender and whether a VO2max value is used.
//! Each yields kJ/min, converted to kcal by dividing by 4.184.
//!
//! ## VO2max
//! Heart-rate ratio method: `15.3 * (max HR / resting HR)`, clamped to
//! 10..=100 ml/kg/min. Max HR is the observed maximum when plausible
//! (100..=220 bpm), otherwise `220 - age`.

use crate::profile::{Gender, UserProfile};

const KJ_PER_KCAL: f64 = 4.184;
const VO2_RATIO_FACTOR: f64 = 15.3;
const VO2_MIN: f64 = 10.0;
const VO2_MAX: f64 = 100.0;
const PLAUSIBLE_MAX_HR: std::ops::RangeInclusive<u16> = 100..=220;

/// Age-predicted maximum heart rate
pub fn age_predicted_max_heart_rate(age: u32) -> f64 {
    220.0 - f64::from(age)
}

/// Estimate VO2max, or `None` when age or resting heart rate are unusable
pub fn estimate_vo2_max(profile: &UserProfile, recent_heart_rates: &[u16]) -> Option<f64> {
    let age = profile.age.filter(|a| (1..=120).contains(a))?;
    let resting = profile.resting_heart_rate.filter(|hr| (1..=200).contains(hr))?;

    let max_heart_rate = recent_heart_rates
        .iter()
        .copied()
        .filter(|&hr| hr > 0)
        .max()
        .filter(|hr| PLAUSIBLE_MAX_HR.contains(hr))
        .map(f64::from)
        .unwrap_or_else(|| age_predicted_max_heart_rate(age));

    let vo2 = VO2_RATIO_FACTOR * (max_heart_rate / f64::from(resting));
    let clamped = vo2.clamp(VO2_MIN, VO2_MAX);
    Some((clamped * 100.0).round() / 100.0)
}

/// Estimate kcal burned over `duration_minutes` at `avg_heart_rate`.
///
/// Returns 0 for non-positive duration, heart rate, age or weight, and never
/// goes negative.
pub fn estimate_calories(
    duration_minutes: f64,
    avg_heart_rate: f64,
    profile: &UserProfile,
    use_vo2: bool,
) -> u32 {
    if !(duration_minutes > 0.0) || !(avg_heart_rate > 0.0) {
        return 0;
    }
    let (Some(age), Some(weight)) = (profile.age, profile.weight_kg) else {
        return 0;
    };
    if age == 0 || !(weight > 0.0) {
        return 0;
    }

    let hr = avg_heart_rate;
    let a = f64::from(age);
    let w = weight;
    let vo2 = profile.vo2_max.filter(|v| use_vo2 && *v > 0.0);

    let kj_per_minute = match (profile.gender, vo2) {
        (Gender::Female, Some(v)) => 0.45 * hr + 0.380 * v + 0.103 * w + 0.274 * a - 59.3954,
        (Gender::Male, Some(v)) => 0.634 * hr + 0.404 * v + 0.394 * w + 0.271 * a - 95.7735,
        (Gender::Female, None) => 0.4472 * hr - 0.1263 * w + 0.074 * a - 20.4022,
        (Gender::Male, None) => 0.6309 * hr + 0.1988 * w + 0.2017 * a - 55.0969,
    };

    let kcal = duration_minutes * kj_per_minute / KJ_PER_KCAL;
    if kcal.is_finite() && kcal > 0.0 {
        kcal.round().min(f64::from(u32::MAX)) as u32
    } else {
        0
    }
}

/// One heart-rate training zone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartRateZone {
    pub number: u8,
    pub name: &'static str,
    pub min_bpm: u16,
    pub max_bpm: u16,
}

const ZONES: [(&str, f64, f64); 5] = [
    ("Recovery", 0.50, 0.60),
    ("Aerobic", 0.60, 0.70),
    ("Tempo", 0.70, 0.80),
    ("Threshold", 0.80, 0.90),
    ("Maximum", 0.90, 1.00),
];

/// Five training zones as fractions of `max_heart_rate`
pub fn heart_rate_zones(max_heart_rate: u16) -> [HeartRateZone; 5] {
    let max = f64::from(max_heart_rate);
    let mut zones = [HeartRateZone { number: 0, name: "", min_bpm: 0, max_bpm: 0 }; 5];
    for (i, &(name, lo, hi)) in ZONES.iter().enumerate() {
        zones[i] = HeartRateZone {
            number: i as u8 + 1,
            name,
            min_bpm: (max * lo).round() as u16,
            max_bpm: (max * hi).round() as u16,
        };
    }
    zones
}

/// Zone containing `bpm`, `None` below zone 1. Rates above max count as zone 5.
pub fn zone_for(bpm: u16, max_heart_rate: u16) -> Option<HeartRateZone> {
    let zones = heart_rate_zones(max_heart_rate);
    if bpm < zones[0].min_bpm {
        return None;
    }
    zones
        .iter()
        .rev()
        .find(|z| bpm >= z.min_bpm)
        .copied()
}
