//! # User Profile Module
//!
//! Physiological profile used by the calorie engine, persisted as JSON under
//! a namespaced key and written back after every successful update.
//!
//! ## VO2max Pinning
//! A manually entered VO2max pins the value: automatic recalculation from
//! observed heart rates leaves it alone until the user switches back to
//! `Vo2MaxSetting::Automatic`.

use crate::calories;
use crate::error::ProfileError;
use crate::storage::{self, KeyValueStore, PROFILE_KEY};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

pub const AGE_RANGE: RangeInclusive<u32> = 1..=120;
pub const WEIGHT_RANGE_KG: RangeInclusive<f64> = 20.0..=300.0;
pub const RESTING_HR_RANGE: RangeInclusive<u32> = 30..=200;
pub const VO2_MAX_RANGE: RangeInclusive<f64> = 10.0..=100.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UserProfile {
    pub gender: Gender,
    pub age: Option<u32>,
    #[serde(rename = "weight")]
    pub weight_kg: Option<f64>,
    pub resting_heart_rate: Option<u32>,
    pub vo2_max: Option<f64>,
    pub vo2_max_manual: bool,
}

impl Default for UserProfile {
    fn default() -> Self {
        Self {
            gender: Gender::Male,
            age: Some(25),
            weight_kg: Some(70.0),
            resting_heart_rate: Some(60),
            vo2_max: None,
            vo2_max_manual: false,
        }
    }
}

impl UserProfile {
    /// All inputs the calorie formulas need are present and in range
    pub fn is_complete(&self) -> bool {
        self.age.is_some_and(|a| AGE_RANGE.contains(&a))
            && self.weight_kg.is_some_and(|w| WEIGHT_RANGE_KG.contains(&w))
            && self
                .resting_heart_rate
                .is_some_and(|hr| RESTING_HR_RANGE.contains(&hr))
    }

    pub fn is_vo2_max_pinned(&self) -> bool {
        self.vo2_max_manual
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Vo2MaxSetting {
    /// User-entered value, pinned against automatic recalculation
    Manual(f64),
    /// Drop the pin and estimate from heart-rate data
    Automatic,
}

/// Partial profile update; `None` fields are left unchanged
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileUpdate {
    pub gender: Option<Gender>,
    pub age: Option<u32>,
    pub weight_kg: Option<f64>,
    pub resting_heart_rate: Option<u32>,
    pub vo2_max: Option<Vo2MaxSetting>,
}

impl ProfileUpdate {
    fn validate(&self) -> Result<(), ProfileError> {
        if let Some(age) = self.age {
            check("age", f64::from(age), AGE_RANGE.contains(&age))?;
        }
        if let Some(weight) = self.weight_kg {
            check("weight", weight, WEIGHT_RANGE_KG.contains(&weight))?;
        }
        if let Some(hr) = self.resting_heart_rate {
            check("restingHeartRate", f64::from(hr), RESTING_HR_RANGE.contains(&hr))?;
        }
        if let Some(Vo2MaxSetting::Manual(v)) = self.vo2_max {
            check("vo2Max", v, VO2_MAX_RANGE.contains(&v))?;
        }
        Ok(())
    }
}

fn check(field: &'static str, value: f64, ok: bool) -> Result<(), ProfileError> {
    if ok {
        Ok(())
    } else {
        Err(ProfileError::OutOfRange { field, value })
    }
}

/// Owns the profile and its persistence
pub struct ProfileStore {
    profile: UserProfile,
    store: Box<dyn KeyValueStore>,
}

impl ProfileStore {
    /// Load the stored profile, falling back to defaults when absent or unreadable
    pub fn load(store: Box<dyn KeyValueStore>) -> Self {
        let profile = match storage::load_json(store.as_ref(), PROFILE_KEY) {
            Ok(profile) => profile.unwrap_or_default(),
            Err(e) => {
                log::error!("Error loading user profile: {}", e);
                UserProfile::default()
            }
        };
        Self { profile, store }
    }

    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }

    /// Apply a validated partial update and persist the result
    pub fn update(
        &mut self,
        update: ProfileUpdate,
        recent_heart_rates: &[u16],
    ) -> Result<&UserProfile, ProfileError> {
        update.validate()?;

        let p = &mut self.profile;
        if let Some(gender) = update.gender {
            p.gender = gender;
        }
        if let Some(age) = update.age {
            p.age = Some(age);
        }
        if let Some(weight) = update.weight_kg {
            p.weight_kg = Some(weight);
        }
        if let Some(hr) = update.resting_heart_rate {
            p.resting_heart_rate = Some(hr);
        }
        match update.vo2_max {
            Some(Vo2MaxSetting::Manual(v)) => {
                p.vo2_max = Some(v);
                p.vo2_max_manual = true;
            }
            Some(Vo2MaxSetting::Automatic) => {
                p.vo2_max_manual = false;
                p.vo2_max = calories::estimate_vo2_max(p, recent_heart_rates);
            }
            None => {}
        }

        self.persist();
        Ok(&self.profile)
    }

    /// Re-estimate VO2max from observed heart rates unless the value is pinned.
    ///
    /// Returns the stored value after the refresh.
    pub fn refresh_vo2_max(&mut self, recent_heart_rates: &[u16]) -> Option<f64> {
        if self.profile.vo2_max_manual {
            return self.profile.vo2_max;
        }
        let estimate = calories::estimate_vo2_max(&self.profile, recent_heart_rates);
        if estimate != self.profile.vo2_max {
            self.profile.vo2_max = estimate;
            self.persist();
        }
        self.profile.vo2_max
    }

    fn persist(&self) {
        if let Err(e) = storage::save_json(self.store.as_ref(), PROFILE_KEY, &self.profile) {
            log::error!("Error saving user profile: {}", e);
        }
    }
}
