//! # Health Monitor Module
//!
//! Single owner of all mutable application state: link status, chart
//! histories, profile, ledger and the per-session calorie total. Drivers
//! never touch this state directly; they send `TelemetryUpdate`s which the
//! owner drains in arrival order.
//!
//! ## Calorie Accrual
//! Network heart-rate samples with a complete profile produce at most one
//! ledger entry per 60-second window, each worth one minute at the current
//! heart rate.

use crate::calories::{self, HeartRateZone};
use crate::error::{ProfileError, SessionError};
use crate::ledger::{CalorieEntry, EntrySource, HealthHistoryStore, WorkoutLog};
use crate::poller::CalorieAccrual;
use crate::profile::{ProfileStore, ProfileUpdate, UserProfile};
use crate::sample::{HeartRateSample, Sample, SampleSource};
use crate::session::ConnectionState;
use crate::storage::KeyValueStore;
use crate::telemetry::{Channels, HistorySnapshot, LatestSamples, TelemetryUpdate};
use crate::transport::DeviceDescriptor;
use chrono::NaiveDate;

/// Read-only view for display
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorSnapshot {
    pub connection_state: ConnectionState,
    pub network_connected: bool,
    /// Link data is synthetic
    pub simulated: bool,
    pub latest: LatestSamples,
    pub histories: HistorySnapshot,
    pub session_calories: u32,
    pub devices: Vec<DeviceDescriptor>,
    pub last_error: Option<SessionError>,
}

pub struct HealthMonitor {
    profile: ProfileStore,
    history: HealthHistoryStore,
    channels: Channels,
    link_state: ConnectionState,
    network_connected: bool,
    devices: Vec<DeviceDescriptor>,
    last_error: Option<SessionError>,
    accrual: CalorieAccrual,
    session_calories: u32,
}

impl HealthMonitor {
    pub fn new(profile: ProfileStore, history: HealthHistoryStore) -> Self {
        Self {
            profile,
            history,
            channels: Channels::new(),
            link_state: ConnectionState::Idle,
            network_connected: false,
            devices: Vec::new(),
            last_error: None,
            accrual: CalorieAccrual::new(),
            session_calories: 0,
        }
    }

    /// Load profile and ledger from the given stores
    pub fn open(
        profile_store: Box<dyn KeyValueStore>,
        ledger_store: Box<dyn KeyValueStore>,
    ) -> Self {
        Self::new(ProfileStore::load(profile_store), HealthHistoryStore::load(ledger_store))
    }

    /// Apply every pending update; returns how many were applied
    pub fn drain(&mut self, updates: &crossbeam_channel::Receiver<TelemetryUpdate>) -> usize {
        let mut applied = 0;
        while let Ok(update) = updates.try_recv() {
            self.apply(update);
            applied += 1;
        }
        applied
    }

    pub fn apply(&mut self, update: TelemetryUpdate) {
        match update {
            TelemetryUpdate::LinkState(state) => {
                if state == ConnectionState::Monitoring || state == ConnectionState::Scanning {
                    self.last_error = None;
                }
                self.link_state = state;
            }
            TelemetryUpdate::Devices(devices) => self.devices = devices,
            TelemetryUpdate::Sample { source, sample } => {
                self.channels.record(&sample);
                if let (SampleSource::Network, Sample::HeartRate(hr)) = (source, sample) {
                    self.accrue_calories(hr);
                }
            }
            TelemetryUpdate::LinkError(error) => {
                log::error!("{}", error);
                self.last_error = Some(error);
            }
            TelemetryUpdate::NetworkConnected => {
                self.network_connected = true;
                self.accrual.reset();
                self.session_calories = 0;
            }
            TelemetryUpdate::NetworkDisconnected => {
                self.network_connected = false;
                self.accrual.reset();
                self.session_calories = 0;
                self.channels.clear_latest();
            }
        }
    }

    fn accrue_calories(&mut self, sample: HeartRateSample) {
        let profile = self.profile.profile();
        if !profile.is_complete() || !self.accrual.is_due(sample.captured_at) {
            return;
        }
        self.accrual.mark(sample.captured_at);

        let calories = calories::estimate_calories(1.0, f64::from(sample.bpm), profile, true);
        if calories == 0 {
            return;
        }
        let entry =
            CalorieEntry::new(sample.captured_at, calories, EntrySource::Wifi, sample.bpm, 1.0);
        if self.history.append(entry) {
            self.session_calories = self.session_calories.saturating_add(calories);
            log::debug!("Logged {} kcal at {} bpm", calories, sample.bpm);
        }
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            connection_state: self.link_state,
            network_connected: self.network_connected,
            simulated: self.link_state == ConnectionState::Simulating,
            latest: self.channels.latest,
            histories: self.channels.snapshot(),
            session_calories: self.session_calories,
            devices: self.devices.clone(),
            last_error: self.last_error.clone(),
        }
    }

    pub fn profile(&self) -> &UserProfile {
        self.profile.profile()
    }

    pub fn history(&self) -> &HealthHistoryStore {
        &self.history
    }

    pub fn update_profile(&mut self, update: ProfileUpdate) -> Result<&UserProfile, ProfileError> {
        let recent = self.channels.heart_rate.values();
        self.profile.update(update, &recent)
    }

    /// Re-estimate VO2max from the heart-rate history unless pinned
    pub fn refresh_vo2_max(&mut self) -> Option<f64> {
        let recent = self.channels.heart_rate.values();
        self.profile.refresh_vo2_max(&recent)
    }

    /// Record a manual workout; `None` when it carries no calories
    pub fn log_workout(&mut self, workout: WorkoutLog) -> Option<CalorieEntry> {
        let live = if self.network_connected {
            self.channels.latest.heart_rate.map(|s| s.bpm)
        } else {
            None
        };
        let entry = workout.to_entry(self.profile.profile(), live)?;
        if self.history.append(entry.clone()) {
            log::info!("Logged {:?} workout: {} kcal", workout.kind, entry.calories);
            Some(entry)
        } else {
            None
        }
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
        log::info!("Calorie history cleared");
    }

    /// Training zones from the age-predicted maximum, if the age is known
    pub fn heart_rate_zones(&self) -> Option<[HeartRateZone; 5]> {
        let age = self.profile.profile().age?;
        let max = calories::age_predicted_max_heart_rate(age);
        (max > 0.0).then(|| calories::heart_rate_zones(max as u16))
    }

    pub fn today_total(&self, today: NaiveDate) -> u32 {
        self.history.today_total(today)
    }
}
