//! # Calorie Ledger Module
//!
//! Append-only history of energy-expenditure entries, fed by live network
//! telemetry (one entry per accrual window) and manually logged workouts.
//!
//! The full ledger is written back to the key-value store after every
//! mutation. Storage failures are logged; the in-memory ledger stays
//! authoritative for the rest of the session.
//!
//! ## Queries
//! - `total_for_date` / `total_for_range`: sums by UTC calendar day (inclusive)
//! - `daily_series`: one total per day, oldest first, zero-filled
//! - `week_series` / `month_series`: chart series with an offset into the past

use crate::calories;
use crate::profile::UserProfile;
use crate::storage::{self, KeyValueStore, LEDGER_KEY};
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Origin of a ledger entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntrySource {
    /// Accrued from the local-network sensor node
    Wifi,
    /// Manually logged workout
    Workout,
    Other(String),
}

impl From<String> for EntrySource {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "wifi" => EntrySource::Wifi,
            "workout" => EntrySource::Workout,
            _ => EntrySource::Other(tag),
        }
    }
}

impl From<EntrySource> for String {
    fn from(source: EntrySource) -> Self {
        match source {
            EntrySource::Wifi => "wifi".to_string(),
            EntrySource::Workout => "workout".to_string(),
            EntrySource::Other(tag) => tag,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkoutKind {
    Running,
    Cycling,
    Swimming,
    Gym,
    Yoga,
    Walking,
}

impl WorkoutKind {
    /// Typical heart rate when nothing was measured
    pub fn estimated_heart_rate(&self) -> u16 {
        match self {
            WorkoutKind::Running => 145,
            WorkoutKind::Cycling => 130,
            WorkoutKind::Swimming => 135,
            WorkoutKind::Gym => 125,
            WorkoutKind::Yoga => 90,
            WorkoutKind::Walking => 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalorieEntry {
    pub timestamp: DateTime<Utc>,
    pub date: NaiveDate,
    pub calories: u32,
    pub source: EntrySource,
    pub heart_rate: u16,
    #[serde(rename = "duration")]
    pub duration_minutes: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workout: Option<WorkoutKind>,
}

impl CalorieEntry {
    /// Entry dated by the UTC day of `timestamp`
    pub fn new(
        timestamp: DateTime<Utc>,
        calories: u32,
        source: EntrySource,
        heart_rate: u16,
        duration_minutes: f64,
    ) -> Self {
        Self {
            timestamp,
            date: timestamp.date_naive(),
            calories,
            source,
            heart_rate,
            duration_minutes,
            workout: None,
        }
    }
}

/// A manually logged workout
#[derive(Debug, Clone, PartialEq)]
pub struct WorkoutLog {
    pub kind: WorkoutKind,
    pub duration_minutes: u32,
    /// Calories as entered; estimated from the profile when `None`
    pub calories: Option<u32>,
    /// Measured heart rate, if any
    pub heart_rate: Option<u16>,
    pub performed_at: DateTime<Utc>,
}

impl WorkoutLog {
    /// Build the ledger entry for this workout.
    ///
    /// Heart rate precedence: measured, then `live_heart_rate`, then the kind's
    /// typical rate. Returns `None` when no positive calorie figure results.
    pub fn to_entry(
        &self,
        profile: &UserProfile,
        live_heart_rate: Option<u16>,
    ) -> Option<CalorieEntry> {
        if self.duration_minutes == 0 {
            return None;
        }
        let heart_rate = self
            .heart_rate
            .or(live_heart_rate)
            .filter(|&hr| hr > 0)
            .unwrap_or_else(|| self.kind.estimated_heart_rate());

        let calories = self.calories.unwrap_or_else(|| {
            calories::estimate_calories(
                f64::from(self.duration_minutes),
                f64::from(heart_rate),
                profile,
                true,
            )
        });
        if calories == 0 {
            return None;
        }

        let mut entry = CalorieEntry::new(
            self.performed_at,
            calories,
            EntrySource::Workout,
            heart_rate,
            f64::from(self.duration_minutes),
        );
        entry.workout = Some(self.kind);
        Some(entry)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyTotal {
    pub date: NaiveDate,
    pub calories: u32,
}

pub struct HealthHistoryStore {
    entries: Vec<CalorieEntry>,
    store: Box<dyn KeyValueStore>,
}

impl HealthHistoryStore {
    /// Load the stored ledger; an absent or unreadable value starts empty
    pub fn load(store: Box<dyn KeyValueStore>) -> Self {
        let entries = match storage::load_json(store.as_ref(), LEDGER_KEY) {
            Ok(entries) => entries.unwrap_or_default(),
            Err(e) => {
                log::error!("Error loading calorie history: {}", e);
                Vec::new()
            }
        };
        log::info!("Loaded {} calorie entries", entries.len());
        Self { entries, store }
    }

    pub fn entries(&self) -> &[CalorieEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append and persist. Entries without calories are discarded.
    pub fn append(&mut self, entry: CalorieEntry) -> bool {
        if entry.calories == 0 {
            log::warn!("Invalid calorie entry: {:?}", entry);
            return false;
        }
        self.entries.push(entry);
        self.persist();
        true
    }

    pub fn total_for_date(&self, date: NaiveDate) -> u32 {
        self.total_for_range(date, date)
    }

    /// Sum over `start..=end`; an inverted range is empty
    pub fn total_for_range(&self, start: NaiveDate, end: NaiveDate) -> u32 {
        self.entries
            .iter()
            .filter(|e| e.date >= start && e.date <= end)
            .fold(0u32, |sum, e| sum.saturating_add(e.calories))
    }

    /// `days` totals ending `start_offset_days` before `today`, oldest first
    pub fn daily_series(
        &self,
        today: NaiveDate,
        start_offset_days: u32,
        days: u32,
    ) -> Vec<DailyTotal> {
        let end = today - Duration::days(i64::from(start_offset_days));
        (0..days)
            .rev()
            .map(|back| {
                let date = end - Duration::days(i64::from(back));
                DailyTotal { date, calories: self.total_for_date(date) }
            })
            .collect()
    }

    /// Seven days ending `week_offset` weeks before `today`
    pub fn week_series(&self, today: NaiveDate, week_offset: u32) -> Vec<DailyTotal> {
        self.daily_series(today, week_offset.saturating_mul(7), 7)
    }

    /// Every day of the calendar month `month_offset` months before `today`
    pub fn month_series(&self, today: NaiveDate, month_offset: u32) -> Vec<DailyTotal> {
        let Some(first) = first_of_month(today, month_offset) else {
            return Vec::new();
        };
        let days = match first.checked_add_months(Months::new(1)) {
            Some(next) => (next - first).num_days(),
            None => 0,
        };
        (0..days)
            .map(|i| {
                let date = first + Duration::days(i);
                DailyTotal { date, calories: self.total_for_date(date) }
            })
            .collect()
    }

    pub fn today_total(&self, today: NaiveDate) -> u32 {
        self.total_for_date(today)
    }

    /// Trailing seven days including today
    pub fn week_total(&self, today: NaiveDate) -> u32 {
        self.total_for_range(today - Duration::days(6), today)
    }

    /// Month to date
    pub fn month_total(&self, today: NaiveDate) -> u32 {
        match first_of_month(today, 0) {
            Some(first) => self.total_for_range(first, today),
            None => 0,
        }
    }

    /// Drop every entry and the stored ledger
    pub fn clear(&mut self) {
        self.entries.clear();
        if let Err(e) = self.store.remove(LEDGER_KEY) {
            log::error!("Error clearing calorie history: {}", e);
        }
    }

    fn persist(&self) {
        if let Err(e) = storage::save_json(self.store.as_ref(), LEDGER_KEY, &self.entries) {
            log::error!("Error saving calorie history: {}", e);
        }
    }
}

fn first_of_month(date: NaiveDate, months_back: u32) -> Option<NaiveDate> {
    date.with_day(1)?
        .checked_sub_months(Months::new(months_back))
}
