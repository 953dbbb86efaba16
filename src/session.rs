//! # Connection Session Module
//!
//! Sans-I/O state machine for the short-range link: scanning, connecting,
//! service discovery, characteristic monitoring, keepalive, reconnection and
//! the simulated-data mode.
//!
//! ## Design
//! Commands (`request_scan`, `stop_scan`, `connect`, `disconnect`) and
//! incoming `SessionEvent`s return the `Effect`s the driver must perform.
//! Nothing in here touches a radio, a clock or a task, so every transition
//! is unit-testable.
//!
//! ## Staleness
//! Each connect sequence gets a fresh attempt number and every I/O effect
//! carries it. Results tagged with an older attempt are ignored; a stale
//! successful connect is released with a disconnect. Timers are
//! generation-tagged the same way (see `scheduler`), so a timer that fires
//! after `disconnect` does nothing.
//!
//! ## State Flow
//! ```text
//! Idle -> Scanning -> Connecting -> Discovering -> Monitoring <-> Simulating
//!                                                      |
//!                                   link lost -> Reconnecting -> (Monitoring | Failed)
//! ```

use crate::error::SessionError;
use crate::sample::{self, CharacteristicValue, Sample, SampleSource};
use crate::scheduler::{TimerHandle, TimerKind, Timers};
use crate::simulator::{Simulator, DEFAULT_SEED};
use crate::telemetry::TelemetryUpdate;
use crate::transport::{ConnectOptions, DeviceDescriptor, DeviceHandle};
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

pub const SCAN_WINDOW: Duration = Duration::from_secs(10);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
pub const RECONNECT_DELAY: Duration = Duration::from_secs(2);
pub const MAX_RECONNECT_ATTEMPTS: u32 = 3;
pub const SIMULATION_PERIOD: Duration = Duration::from_millis(100);
pub const DATA_GRACE: Duration = Duration::from_secs(3);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);
pub const REQUESTED_MTU: u16 = 512;

pub const DEFAULT_SERVICE_UUID: &str = "19b10000-e8f2-537e-4f6c-d104768a1214";
pub const DEFAULT_CHARACTERISTIC_UUID: &str = "19b10001-e8f2-537e-4f6c-d104768a1214";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Scanning,
    Connecting,
    Discovering,
    Monitoring,
    Simulating,
    Reconnecting,
    Disconnecting,
    Failed,
}

impl ConnectionState {
    /// A device link is up (real or simulated data flowing)
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Monitoring | ConnectionState::Simulating)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Scanning => "Scanning...",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Discovering => "Discovering services...",
            ConnectionState::Monitoring => "Connected",
            ConnectionState::Simulating => "Connected (simulated data)",
            ConnectionState::Reconnecting => "Reconnecting...",
            ConnectionState::Disconnecting => "Disconnecting...",
            ConnectionState::Failed => "Connection failed",
        };
        write!(f, "{}", label)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    /// Case-insensitive name fragments; empty accepts every device
    pub name_filters: Vec<String>,
    pub service_uuid: String,
    pub characteristic_uuid: String,
    pub allow_simulation: bool,
    pub connect_options: ConnectOptions,
    pub simulation_seed: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            name_filters: vec!["nicla".to_string(), "arduino".to_string()],
            service_uuid: DEFAULT_SERVICE_UUID.to_string(),
            characteristic_uuid: DEFAULT_CHARACTERISTIC_UUID.to_string(),
            allow_simulation: true,
            connect_options: ConnectOptions {
                timeout: CONNECT_TIMEOUT,
                mtu: REQUESTED_MTU,
            },
            simulation_seed: DEFAULT_SEED,
        }
    }
}

impl SessionSettings {
    pub fn matches_name(&self, name: &str) -> bool {
        if self.name_filters.is_empty() {
            return true;
        }
        let name = name.to_lowercase();
        self.name_filters
            .iter()
            .any(|filter| name.contains(&filter.to_lowercase()))
    }
}

/// Platform preconditions checked before scanning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    pub permission_granted: bool,
    pub radio_enabled: bool,
}

/// Work the driver performs on behalf of the session
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StartScan,
    StopScan,
    Connect { attempt: u64, device_id: String, options: ConnectOptions },
    Discover { attempt: u64, handle: DeviceHandle },
    Subscribe { attempt: u64, handle: DeviceHandle, service: String, characteristic: String },
    CheckLiveness { attempt: u64, handle: DeviceHandle },
    Disconnect { attempt: u64, handle: DeviceHandle },
    Schedule { timer: TimerHandle, after: Duration },
    Cancel(TimerKind),
    Notify(TelemetryUpdate),
}

/// Results reported back by the driver
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    DeviceFound(DeviceDescriptor),
    ScanFailed(String),
    Connected { attempt: u64, handle: DeviceHandle },
    ConnectFailed { attempt: u64, reason: String },
    Discovered { attempt: u64 },
    DiscoveryFailed { attempt: u64, reason: String },
    Subscribed { attempt: u64 },
    SubscribeFailed { attempt: u64, reason: String },
    Characteristic { attempt: u64, value: CharacteristicValue },
    Liveness { attempt: u64, alive: bool },
    LinkLost { attempt: u64, reason: Option<String> },
    DisconnectComplete { attempt: u64 },
    TimerFired(TimerHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    /// Started by the user; failures are surfaced immediately
    User,
    /// Automatic recovery after link loss
    Reconnect,
}

pub struct ConnectionSession {
    settings: SessionSettings,
    state: ConnectionState,
    timers: Timers,
    attempt: u64,
    retry_count: u32,
    intent: Intent,
    target: Option<String>,
    handle: Option<DeviceHandle>,
    candidates: Vec<DeviceDescriptor>,
    simulator: Simulator,
    received_real_data: bool,
}

impl ConnectionSession {
    pub fn new(settings: SessionSettings) -> Self {
        let simulator = Simulator::new(settings.simulation_seed);
        Self {
            settings,
            state: ConnectionState::Idle,
            timers: Timers::new(),
            attempt: 0,
            retry_count: 0,
            intent: Intent::User,
            target: None,
            handle: None,
            candidates: Vec::new(),
            simulator,
            received_real_data: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Consecutive failed reconnect attempts
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Candidates from the current or last scan, strongest signal first
    pub fn candidates(&self) -> &[DeviceDescriptor] {
        &self.candidates
    }

    pub fn request_scan(&mut self, status: LinkStatus) -> Result<Vec<Effect>, SessionError> {
        if !status.permission_granted {
            return Err(SessionError::PermissionDenied);
        }
        if !status.radio_enabled {
            return Err(SessionError::LinkDisabled);
        }
        match self.state {
            ConnectionState::Scanning => return Ok(Vec::new()),
            ConnectionState::Idle | ConnectionState::Failed | ConnectionState::Disconnecting => {}
            other => return Err(SessionError::Busy(other)),
        }

        log::info!("Starting scan for {:?}", self.settings.name_filters);
        self.candidates.clear();
        let mut effects = vec![
            Effect::StartScan,
            self.schedule(TimerKind::ScanWindow, SCAN_WINDOW),
        ];
        effects.push(Effect::Notify(TelemetryUpdate::Devices(Vec::new())));
        self.transition(ConnectionState::Scanning, &mut effects);
        Ok(effects)
    }

    pub fn stop_scan(&mut self) -> Vec<Effect> {
        if self.state != ConnectionState::Scanning {
            return Vec::new();
        }
        let mut effects = Vec::new();
        self.end_scan(&mut effects);
        self.transition(ConnectionState::Idle, &mut effects);
        effects
    }

    /// Start a user-initiated connect sequence, replacing any current one
    pub fn connect(&mut self, device_id: &str) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.teardown(&mut effects);

        self.attempt += 1;
        self.retry_count = 0;
        self.intent = Intent::User;
        self.target = Some(device_id.to_string());
        log::info!("Connecting to device: {} (attempt {})", device_id, self.attempt);

        effects.push(Effect::Connect {
            attempt: self.attempt,
            device_id: device_id.to_string(),
            options: self.settings.connect_options,
        });
        self.transition(ConnectionState::Connecting, &mut effects);
        effects
    }

    /// Always honored: cancels every timer and returns towards `Idle`
    pub fn disconnect(&mut self) -> Vec<Effect> {
        let mut effects = Vec::new();
        let had_handle = self.handle.is_some();
        self.teardown(&mut effects);

        self.attempt += 1;
        self.retry_count = 0;
        self.target = None;
        log::info!("Disconnect requested");

        if had_handle {
            // `teardown` queued the release under the old attempt; retag it
            for effect in effects.iter_mut() {
                if let Effect::Disconnect { attempt, .. } = effect {
                    *attempt = self.attempt;
                }
            }
            self.transition(ConnectionState::Disconnecting, &mut effects);
        } else {
            self.transition(ConnectionState::Idle, &mut effects);
        }
        effects
    }

    pub fn handle(&mut self, event: SessionEvent, now: DateTime<Utc>) -> Vec<Effect> {
        let mut effects = Vec::new();
        match event {
            SessionEvent::DeviceFound(device) => self.on_device_found(device, &mut effects),
            SessionEvent::ScanFailed(reason) => {
                if self.state == ConnectionState::Scanning {
                    log::error!("Scan failed: {}", reason);
                    self.timers.cancel(TimerKind::ScanWindow);
                    effects.push(Effect::Cancel(TimerKind::ScanWindow));
                    let error = SessionError::ScanFailed(reason);
                    effects.push(Effect::Notify(TelemetryUpdate::LinkError(error)));
                    self.transition(ConnectionState::Idle, &mut effects);
                }
            }
            SessionEvent::Connected { attempt, handle } => {
                if attempt != self.attempt {
                    log::debug!("Releasing stale connection to {}", handle.id);
                    effects.push(Effect::Disconnect { attempt, handle });
                    return effects;
                }
                self.handle = Some(handle.clone());
                effects.push(Effect::Discover { attempt, handle });
                if self.intent == Intent::User {
                    self.transition(ConnectionState::Discovering, &mut effects);
                }
            }
            SessionEvent::Discovered { attempt } => {
                if attempt != self.attempt || self.handle.is_none() {
                    return effects;
                }
                if let Some(handle) = self.handle.clone() {
                    effects.push(Effect::Subscribe {
                        attempt,
                        handle,
                        service: self.settings.service_uuid.clone(),
                        characteristic: self.settings.characteristic_uuid.clone(),
                    });
                }
            }
            SessionEvent::Subscribed { attempt } => {
                // A link lost mid-setup already dropped the handle
                if attempt != self.attempt || self.handle.is_none() {
                    return effects;
                }
                self.on_link_up(&mut effects);
                if self.settings.allow_simulation {
                    effects.push(self.schedule(TimerKind::DataGrace, DATA_GRACE));
                }
                self.transition(ConnectionState::Monitoring, &mut effects);
            }
            SessionEvent::SubscribeFailed { attempt, reason } => {
                if attempt != self.attempt || self.handle.is_none() {
                    return effects;
                }
                if self.settings.allow_simulation {
                    log::warn!("Subscription failed ({}), switching to simulated data", reason);
                    self.on_link_up(&mut effects);
                    self.start_simulation(&mut effects);
                } else {
                    self.fail_attempt(reason, &mut effects);
                }
            }
            SessionEvent::ConnectFailed { attempt, reason } => {
                if attempt == self.attempt && self.handle.is_none() {
                    self.fail_attempt(reason, &mut effects);
                }
            }
            SessionEvent::DiscoveryFailed { attempt, reason } => {
                if attempt == self.attempt && self.handle.is_some() {
                    self.fail_attempt(reason, &mut effects);
                }
            }
            SessionEvent::Characteristic { attempt, value } => {
                if attempt != self.attempt || !self.state.is_connected() {
                    return effects;
                }
                self.on_real_sample(&value, now, &mut effects);
            }
            SessionEvent::Liveness { attempt, alive } => {
                if attempt != self.attempt || !self.state.is_connected() {
                    return effects;
                }
                if alive {
                    effects.push(self.schedule(TimerKind::Keepalive, KEEPALIVE_INTERVAL));
                } else {
                    log::warn!("Keepalive: device reports not connected, halting keepalive");
                }
            }
            SessionEvent::LinkLost { attempt, reason } => {
                if attempt != self.attempt || self.handle.is_none() {
                    return effects;
                }
                let reason = reason.unwrap_or_else(|| "no reason given".to_string());
                log::warn!("Device disconnected: {}", reason);
                self.handle = None;
                if !self.state.is_connected() {
                    // Lost before the subscription completed
                    self.fail_attempt(reason, &mut effects);
                    return effects;
                }
                for kind in self.timers.cancel_all() {
                    effects.push(Effect::Cancel(kind));
                }
                self.intent = Intent::Reconnect;
                effects.push(self.schedule(TimerKind::Reconnect, RECONNECT_DELAY));
                self.transition(ConnectionState::Reconnecting, &mut effects);
            }
            SessionEvent::DisconnectComplete { attempt } => {
                if attempt == self.attempt && self.state == ConnectionState::Disconnecting {
                    self.transition(ConnectionState::Idle, &mut effects);
                }
            }
            SessionEvent::TimerFired(timer) => {
                if self.timers.fire(timer) {
                    self.on_timer(timer.kind, now, &mut effects);
                }
            }
        }
        effects
    }

    fn on_device_found(&mut self, device: DeviceDescriptor, effects: &mut Vec<Effect>) {
        if self.state != ConnectionState::Scanning || !self.settings.matches_name(&device.name) {
            return;
        }
        match self.candidates.iter_mut().find(|c| c.id == device.id) {
            Some(existing) if *existing == device => return,
            Some(existing) => *existing = device,
            None => {
                log::info!("Found device: {} ({})", device.name, device.id);
                self.candidates.push(device);
            }
        }
        // Strongest first, unknown strength last
        self.candidates
            .sort_by_key(|c| std::cmp::Reverse(c.signal_strength.unwrap_or(i16::MIN)));
        effects.push(Effect::Notify(TelemetryUpdate::Devices(self.candidates.clone())));
    }

    fn on_timer(&mut self, kind: TimerKind, now: DateTime<Utc>, effects: &mut Vec<Effect>) {
        match kind {
            TimerKind::ScanWindow => {
                if self.state == ConnectionState::Scanning {
                    log::info!("Scan window elapsed, {} candidate(s)", self.candidates.len());
                    effects.push(Effect::StopScan);
                    self.transition(ConnectionState::Idle, effects);
                }
            }
            TimerKind::Keepalive => {
                if let (true, Some(handle)) = (self.state.is_connected(), self.handle.clone()) {
                    effects.push(Effect::CheckLiveness { attempt: self.attempt, handle });
                }
            }
            TimerKind::Reconnect => {
                let Some(device_id) = self.target.clone() else {
                    return;
                };
                if self.state != ConnectionState::Reconnecting {
                    return;
                }
                self.retry_count += 1;
                self.attempt += 1;
                log::info!(
                    "Reconnect attempt {}/{} to {}",
                    self.retry_count, MAX_RECONNECT_ATTEMPTS, device_id
                );
                effects.push(Effect::Connect {
                    attempt: self.attempt,
                    device_id,
                    options: self.settings.connect_options,
                });
            }
            TimerKind::Simulation => {
                if self.state == ConnectionState::Simulating {
                    let (accelerometer, heart_rate) = self.simulator.next_samples(now);
                    effects.push(sample_update(
                        SampleSource::Simulated,
                        Sample::Accelerometer(accelerometer),
                    ));
                    effects.push(sample_update(
                        SampleSource::Simulated,
                        Sample::HeartRate(heart_rate),
                    ));
                    effects.push(self.schedule(TimerKind::Simulation, SIMULATION_PERIOD));
                }
            }
            TimerKind::DataGrace => {
                if self.state == ConnectionState::Monitoring && !self.received_real_data {
                    log::warn!("No data within {:?}, switching to simulated data", DATA_GRACE);
                    self.start_simulation(effects);
                }
            }
        }
    }

    fn on_link_up(&mut self, effects: &mut Vec<Effect>) {
        self.retry_count = 0;
        self.intent = Intent::User;
        self.received_real_data = false;
        effects.push(self.schedule(TimerKind::Keepalive, KEEPALIVE_INTERVAL));
    }

    fn start_simulation(&mut self, effects: &mut Vec<Effect>) {
        effects.push(self.schedule(TimerKind::Simulation, SIMULATION_PERIOD));
        self.transition(ConnectionState::Simulating, effects);
    }

    fn on_real_sample(
        &mut self,
        value: &CharacteristicValue,
        now: DateTime<Utc>,
        effects: &mut Vec<Effect>,
    ) {
        self.received_real_data = true;
        if self.timers.cancel(TimerKind::DataGrace) {
            effects.push(Effect::Cancel(TimerKind::DataGrace));
        }
        if self.state == ConnectionState::Simulating {
            log::info!("Real data received, stopping simulation");
            self.timers.cancel(TimerKind::Simulation);
            effects.push(Effect::Cancel(TimerKind::Simulation));
            self.transition(ConnectionState::Monitoring, effects);
        }
        let accelerometer = sample::decode_characteristic(value, now);
        effects.push(sample_update(SampleSource::Link, Sample::Accelerometer(accelerometer)));
    }

    /// A connect, discovery or subscription step failed for the current attempt
    fn fail_attempt(&mut self, reason: String, effects: &mut Vec<Effect>) {
        let device_id = self.target.clone().unwrap_or_default();
        log::error!("Connection to {} failed: {}", device_id, reason);

        for kind in self.timers.cancel_all() {
            effects.push(Effect::Cancel(kind));
        }
        if let Some(handle) = self.handle.take() {
            effects.push(Effect::Disconnect { attempt: self.attempt, handle });
        }

        match self.intent {
            Intent::User => {
                self.target = None;
                effects.push(Effect::Notify(TelemetryUpdate::LinkError(
                    SessionError::DeviceUnreachable { device_id, reason },
                )));
                self.transition(ConnectionState::Idle, effects);
            }
            Intent::Reconnect if self.retry_count >= MAX_RECONNECT_ATTEMPTS => {
                let attempts = self.retry_count;
                self.retry_count = 0;
                self.target = None;
                self.intent = Intent::User;
                effects.push(Effect::Notify(TelemetryUpdate::LinkError(
                    SessionError::ReconnectExhausted { device_id, attempts },
                )));
                self.transition(ConnectionState::Failed, effects);
            }
            Intent::Reconnect => {
                effects.push(self.schedule(TimerKind::Reconnect, RECONNECT_DELAY));
                self.transition(ConnectionState::Reconnecting, effects);
            }
        }
    }

    /// Stop scanning, cancel timers and release any held device
    fn teardown(&mut self, effects: &mut Vec<Effect>) {
        if self.state == ConnectionState::Scanning {
            self.end_scan(effects);
        }
        for kind in self.timers.cancel_all() {
            effects.push(Effect::Cancel(kind));
        }
        if let Some(handle) = self.handle.take() {
            effects.push(Effect::Disconnect { attempt: self.attempt, handle });
        }
    }

    fn end_scan(&mut self, effects: &mut Vec<Effect>) {
        if self.timers.cancel(TimerKind::ScanWindow) {
            effects.push(Effect::Cancel(TimerKind::ScanWindow));
        }
        effects.push(Effect::StopScan);
    }

    fn schedule(&mut self, kind: TimerKind, after: Duration) -> Effect {
        Effect::Schedule { timer: self.timers.arm(kind), after }
    }

    fn transition(&mut self, next: ConnectionState, effects: &mut Vec<Effect>) {
        if self.state == next {
            return;
        }
        log::debug!("Connection state: {:?} -> {:?}", self.state, next);
        self.state = next;
        effects.push(Effect::Notify(TelemetryUpdate::LinkState(next)));
    }
}

fn sample_update(source: SampleSource, sample: Sample) -> Effect {
    Effect::Notify(TelemetryUpdate::Sample { source, sample })
}

#[cfg(test)]
mod tests {
    use super::*;

    const READY: LinkStatus = LinkStatus { permission_granted: true, radio_enabled: true };

    fn now() -> DateTime<Utc> {
        Utc::now()
    }

    fn scheduled(effects: &[Effect], kind: TimerKind) -> Option<TimerHandle> {
        effects.iter().find_map(|e| match e {
            Effect::Schedule { timer, .. } if timer.kind == kind => Some(*timer),
            _ => None,
        })
    }

    fn delay_of(effects: &[Effect], kind: TimerKind) -> Option<Duration> {
        effects.iter().find_map(|e| match e {
            Effect::Schedule { timer, after } if timer.kind == kind => Some(*after),
            _ => None,
        })
    }

    fn connect_attempt(effects: &[Effect]) -> Option<u64> {
        effects.iter().find_map(|e| match e {
            Effect::Connect { attempt, .. } => Some(*attempt),
            _ => None,
        })
    }

    fn errors(effects: &[Effect]) -> Vec<SessionError> {
        effects
            .iter()
            .filter_map(|e| match e {
                Effect::Notify(TelemetryUpdate::LinkError(err)) => Some(err.clone()),
                _ => None,
            })
            .collect()
    }

    fn handle() -> DeviceHandle {
        DeviceHandle { id: "AA:BB".to_string() }
    }

    fn device(id: &str, name: &str, rssi: i16) -> DeviceDescriptor {
        DeviceDescriptor { id: id.to_string(), name: name.to_string(), signal_strength: Some(rssi) }
    }

    /// Drive a full connect sequence; returns the effects of the final step
    fn establish(session: &mut ConnectionSession, attempt: u64) -> Vec<Effect> {
        session.handle(SessionEvent::Connected { attempt, handle: handle() }, now());
        session.handle(SessionEvent::Discovered { attempt }, now());
        session.handle(SessionEvent::Subscribed { attempt }, now())
    }

    fn monitoring_session(settings: SessionSettings) -> (ConnectionSession, Vec<Effect>) {
        let mut session = ConnectionSession::new(settings);
        let effects = session.connect("AA:BB");
        let attempt = connect_attempt(&effects).unwrap();
        let effects = establish(&mut session, attempt);
        assert_eq!(session.state(), ConnectionState::Monitoring);
        (session, effects)
    }

    /// Lose the link and fail `n` reconnect attempts
    fn fail_reconnects(session: &mut ConnectionSession, lost_attempt: u64, n: u32) -> Vec<Effect> {
        let mut effects =
            session.handle(SessionEvent::LinkLost { attempt: lost_attempt, reason: None }, now());
        for _ in 0..n {
            let timer = scheduled(&effects, TimerKind::Reconnect).unwrap();
            let fired = session.handle(SessionEvent::TimerFired(timer), now());
            let attempt = connect_attempt(&fired).unwrap();
            effects = session.handle(
                SessionEvent::ConnectFailed { attempt, reason: "timeout".to_string() },
                now(),
            );
        }
        effects
    }

    #[test]
    fn test_scan_preconditions() {
        let mut session = ConnectionSession::new(SessionSettings::default());
        assert_eq!(
            session.request_scan(LinkStatus { permission_granted: false, radio_enabled: true }),
            Err(SessionError::PermissionDenied)
        );
        assert_eq!(
            session.request_scan(LinkStatus { permission_granted: true, radio_enabled: false }),
            Err(SessionError::LinkDisabled)
        );
        assert_eq!(session.state(), ConnectionState::Idle);

        let effects = session.request_scan(READY).unwrap();
        assert!(effects.contains(&Effect::StartScan));
        assert_eq!(delay_of(&effects, TimerKind::ScanWindow), Some(Duration::from_secs(10)));
        assert_eq!(session.state(), ConnectionState::Scanning);
        assert!(session.request_scan(READY).unwrap().is_empty());
    }

    #[test]
    fn test_scan_rejected_while_connected() {
        let (mut session, _) = monitoring_session(SessionSettings::default());
        assert_eq!(
            session.request_scan(READY),
            Err(SessionError::Busy(ConnectionState::Monitoring))
        );
    }

    #[test]
    fn test_candidates_filtered_deduplicated_and_ranked() {
        let mut session = ConnectionSession::new(SessionSettings::default());
        session.request_scan(READY).unwrap();

        session.handle(SessionEvent::DeviceFound(device("1", "Nicla Sense ME", -70)), now());
        session.handle(SessionEvent::DeviceFound(device("2", "Headphones", -30)), now());
        session.handle(SessionEvent::DeviceFound(device("3", "ARDUINO nano", -50)), now());
        let effects =
            session.handle(SessionEvent::DeviceFound(device("1", "Nicla Sense ME", -40)), now());

        let ids: Vec<&str> = session.candidates().iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
        assert!(matches!(
            &effects[0],
            Effect::Notify(TelemetryUpdate::Devices(list)) if list.len() == 2
        ));

        // Identical advertisement publishes nothing
        let effects =
            session.handle(SessionEvent::DeviceFound(device("1", "Nicla Sense ME", -40)), now());
        assert!(effects.is_empty());
    }

    #[test]
    fn test_scan_window_auto_stops() {
        let mut session = ConnectionSession::new(SessionSettings::default());
        let effects = session.request_scan(READY).unwrap();
        let timer = scheduled(&effects, TimerKind::ScanWindow).unwrap();

        let effects = session.handle(SessionEvent::TimerFired(timer), now());
        assert!(effects.contains(&Effect::StopScan));
        assert_eq!(session.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_scan_failure_is_surfaced() {
        let mut session = ConnectionSession::new(SessionSettings::default());
        session.request_scan(READY).unwrap();
        let effects = session.handle(SessionEvent::ScanFailed("adapter busy".to_string()), now());
        assert_eq!(errors(&effects), vec![SessionError::ScanFailed("adapter busy".to_string())]);
        assert_eq!(session.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_connect_while_scanning_stops_scan_first() {
        let mut session = ConnectionSession::new(SessionSettings::default());
        session.request_scan(READY).unwrap();
        let effects = session.connect("AA:BB");

        let stop = effects.iter().position(|e| *e == Effect::StopScan).unwrap();
        let connect = effects.iter().position(|e| matches!(e, Effect::Connect { .. })).unwrap();
        assert!(stop < connect);
        assert!(matches!(
            &effects[connect],
            Effect::Connect { options, .. }
                if options.timeout == CONNECT_TIMEOUT && options.mtu == 512
        ));
        assert_eq!(session.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_full_connect_sequence() {
        let mut session = ConnectionSession::new(SessionSettings::default());
        let attempt = connect_attempt(&session.connect("AA:BB")).unwrap();

        let effects = session.handle(SessionEvent::Connected { attempt, handle: handle() }, now());
        assert!(effects.contains(&Effect::Discover { attempt, handle: handle() }));
        assert_eq!(session.state(), ConnectionState::Discovering);

        let effects = session.handle(SessionEvent::Discovered { attempt }, now());
        assert!(matches!(
            &effects[0],
            Effect::Subscribe { service, characteristic, .. }
                if service == DEFAULT_SERVICE_UUID && characteristic == DEFAULT_CHARACTERISTIC_UUID
        ));

        let effects = session.handle(SessionEvent::Subscribed { attempt }, now());
        assert_eq!(session.state(), ConnectionState::Monitoring);
        assert_eq!(delay_of(&effects, TimerKind::Keepalive), Some(Duration::from_secs(5)));
        assert_eq!(delay_of(&effects, TimerKind::DataGrace), Some(Duration::from_secs(3)));
    }

    #[test]
    fn test_user_connect_failure_is_surfaced() {
        let mut session = ConnectionSession::new(SessionSettings::default());
        let attempt = connect_attempt(&session.connect("AA:BB")).unwrap();
        let effects = session.handle(
            SessionEvent::ConnectFailed { attempt, reason: "timed out".to_string() },
            now(),
        );

        assert_eq!(
            errors(&effects),
            vec![SessionError::DeviceUnreachable {
                device_id: "AA:BB".to_string(),
                reason: "timed out".to_string()
            }]
        );
        assert_eq!(session.state(), ConnectionState::Idle);
        assert!(scheduled(&effects, TimerKind::Reconnect).is_none());
    }

    #[test]
    fn test_stale_connect_result_is_released() {
        let mut session = ConnectionSession::new(SessionSettings::default());
        let first = connect_attempt(&session.connect("AA:BB")).unwrap();
        let second = connect_attempt(&session.connect("CC:DD")).unwrap();
        assert!(second > first);

        let effects = session.handle(
            SessionEvent::Connected { attempt: first, handle: handle() },
            now(),
        );
        assert_eq!(effects, vec![Effect::Disconnect { attempt: first, handle: handle() }]);
        assert_eq!(session.state(), ConnectionState::Connecting);

        let effects = session.handle(
            SessionEvent::ConnectFailed { attempt: first, reason: "late".to_string() },
            now(),
        );
        assert!(effects.is_empty());
    }

    #[test]
    fn test_reconnect_success_resets_counter() {
        let (mut session, _) = monitoring_session(SessionSettings::default());
        let attempt = session.attempt;

        let effects = fail_reconnects(&mut session, attempt, 2);
        assert_eq!(session.retry_count(), 2);
        assert_eq!(session.state(), ConnectionState::Reconnecting);

        let timer = scheduled(&effects, TimerKind::Reconnect).unwrap();
        let fired = session.handle(SessionEvent::TimerFired(timer), now());
        let attempt = connect_attempt(&fired).unwrap();
        assert_eq!(session.retry_count(), 3);

        establish(&mut session, attempt);
        assert_eq!(session.state(), ConnectionState::Monitoring);
        assert_eq!(session.retry_count(), 0);
    }

    #[test]
    fn test_reconnect_exhaustion() {
        let (mut session, _) = monitoring_session(SessionSettings::default());
        let attempt = session.attempt;

        let lost = session.handle(SessionEvent::LinkLost { attempt, reason: None }, now());
        assert_eq!(session.state(), ConnectionState::Reconnecting);
        let timer = scheduled(&lost, TimerKind::Reconnect).unwrap();
        assert!(lost.contains(&Effect::Schedule { timer, after: RECONNECT_DELAY }));

        let effects = fail_reconnects(&mut session, attempt, 0);
        assert!(effects.is_empty(), "duplicate link loss must be ignored");

        let mut effects = lost;
        let mut surfaced = Vec::new();
        for _ in 0..MAX_RECONNECT_ATTEMPTS {
            let timer = scheduled(&effects, TimerKind::Reconnect).unwrap();
            let fired = session.handle(SessionEvent::TimerFired(timer), now());
            let attempt = connect_attempt(&fired).unwrap();
            effects = session.handle(
                SessionEvent::ConnectFailed { attempt, reason: "timeout".to_string() },
                now(),
            );
            surfaced.extend(errors(&effects));
        }

        assert_eq!(session.state(), ConnectionState::Failed);
        assert_eq!(session.retry_count(), 0);
        assert_eq!(
            surfaced,
            vec![SessionError::ReconnectExhausted { device_id: "AA:BB".to_string(), attempts: 3 }]
        );
        assert!(scheduled(&effects, TimerKind::Reconnect).is_none());

        // Fresh budget on the next connect
        let attempt = connect_attempt(&session.connect("AA:BB")).unwrap();
        establish(&mut session, attempt);
        assert_eq!(session.retry_count(), 0);
    }

    #[test]
    fn test_manual_disconnect_cancels_pending_reconnect() {
        let (mut session, _) = monitoring_session(SessionSettings::default());
        let attempt = session.attempt;
        let lost = session.handle(SessionEvent::LinkLost { attempt, reason: None }, now());
        let timer = scheduled(&lost, TimerKind::Reconnect).unwrap();

        let effects = session.disconnect();
        assert!(effects.contains(&Effect::Cancel(TimerKind::Reconnect)));
        assert_eq!(session.state(), ConnectionState::Idle);

        let fired = session.handle(SessionEvent::TimerFired(timer), now());
        assert!(connect_attempt(&fired).is_none());
        assert!(fired.is_empty());
    }

    #[test]
    fn test_manual_disconnect_with_handle_passes_through_disconnecting() {
        let (mut session, _) = monitoring_session(SessionSettings::default());
        let effects = session.disconnect();

        let attempt = session.attempt;
        assert!(effects.contains(&Effect::Disconnect { attempt, handle: handle() }));
        assert!(effects.contains(&Effect::Cancel(TimerKind::Keepalive)));
        assert_eq!(session.state(), ConnectionState::Disconnecting);

        // Late values from the old link are dropped
        let late = session.handle(
            SessionEvent::Characteristic {
                attempt: attempt - 1,
                value: CharacteristicValue::Raw(vec![0; 6]),
            },
            now(),
        );
        assert!(late.is_empty());

        session.handle(SessionEvent::DisconnectComplete { attempt }, now());
        assert_eq!(session.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_keepalive_halts_on_dead_link() {
        let (mut session, effects) = monitoring_session(SessionSettings::default());
        let attempt = session.attempt;
        let timer = scheduled(&effects, TimerKind::Keepalive).unwrap();

        let effects = session.handle(SessionEvent::TimerFired(timer), now());
        assert_eq!(effects, vec![Effect::CheckLiveness { attempt, handle: handle() }]);

        let effects = session.handle(SessionEvent::Liveness { attempt, alive: true }, now());
        assert_eq!(delay_of(&effects, TimerKind::Keepalive), Some(Duration::from_secs(5)));

        let effects = session.handle(SessionEvent::Liveness { attempt, alive: false }, now());
        assert!(effects.is_empty());
        assert_eq!(session.state(), ConnectionState::Monitoring);
    }

    #[test]
    fn test_silent_link_falls_back_to_simulation() {
        let (mut session, effects) = monitoring_session(SessionSettings::default());
        let grace = scheduled(&effects, TimerKind::DataGrace).unwrap();

        let effects = session.handle(SessionEvent::TimerFired(grace), now());
        assert_eq!(session.state(), ConnectionState::Simulating);
        let tick = scheduled(&effects, TimerKind::Simulation).unwrap();

        let effects = session.handle(SessionEvent::TimerFired(tick), now());
        let simulated = effects
            .iter()
            .filter(|e| {
                matches!(
                    e,
                    Effect::Notify(TelemetryUpdate::Sample {
                        source: SampleSource::Simulated,
                        ..
                    })
                )
            })
            .count();
        assert_eq!(simulated, 2);
        assert!(scheduled(&effects, TimerKind::Simulation).is_some());

        // A real sample ends the simulation immediately
        let attempt = session.attempt;
        let effects = session.handle(
            SessionEvent::Characteristic {
                attempt,
                value: CharacteristicValue::Base64("6AMAABj8".to_string()),
            },
            now(),
        );
        assert_eq!(session.state(), ConnectionState::Monitoring);
        assert!(effects.contains(&Effect::Cancel(TimerKind::Simulation)));
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Notify(TelemetryUpdate::Sample { source: SampleSource::Link, .. })
        )));
    }

    #[test]
    fn test_real_data_cancels_grace_window() {
        let (mut session, effects) = monitoring_session(SessionSettings::default());
        let grace = scheduled(&effects, TimerKind::DataGrace).unwrap();
        let attempt = session.attempt;

        let effects = session.handle(
            SessionEvent::Characteristic { attempt, value: CharacteristicValue::Raw(vec![0; 6]) },
            now(),
        );
        assert!(effects.contains(&Effect::Cancel(TimerKind::DataGrace)));
        assert!(session.handle(SessionEvent::TimerFired(grace), now()).is_empty());
        assert_eq!(session.state(), ConnectionState::Monitoring);
    }

    #[test]
    fn test_subscribe_failure_without_simulation_fails_connect() {
        let settings = SessionSettings { allow_simulation: false, ..SessionSettings::default() };
        let mut session = ConnectionSession::new(settings);
        let attempt = connect_attempt(&session.connect("AA:BB")).unwrap();
        session.handle(SessionEvent::Connected { attempt, handle: handle() }, now());
        session.handle(SessionEvent::Discovered { attempt }, now());

        let effects = session.handle(
            SessionEvent::SubscribeFailed { attempt, reason: "no characteristic".to_string() },
            now(),
        );
        assert!(effects.contains(&Effect::Disconnect { attempt, handle: handle() }));
        assert_eq!(errors(&effects).len(), 1);
        assert_eq!(session.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_subscribe_failure_enters_simulation() {
        let mut session = ConnectionSession::new(SessionSettings::default());
        let attempt = connect_attempt(&session.connect("AA:BB")).unwrap();
        session.handle(SessionEvent::Connected { attempt, handle: handle() }, now());
        session.handle(SessionEvent::Discovered { attempt }, now());

        let effects = session.handle(
            SessionEvent::SubscribeFailed { attempt, reason: "no characteristic".to_string() },
            now(),
        );
        assert_eq!(session.state(), ConnectionState::Simulating);
        assert!(scheduled(&effects, TimerKind::Simulation).is_some());
        assert!(scheduled(&effects, TimerKind::Keepalive).is_some());
    }

    #[test]
    fn test_no_grace_window_when_simulation_disabled() {
        let settings = SessionSettings { allow_simulation: false, ..SessionSettings::default() };
        let (_, effects) = monitoring_session(settings);
        assert!(scheduled(&effects, TimerKind::DataGrace).is_none());
    }

    #[test]
    fn test_disconnect_while_connecting_goes_idle() {
        let mut session = ConnectionSession::new(SessionSettings::default());
        let attempt = connect_attempt(&session.connect("AA:BB")).unwrap();
        let effects = session.disconnect();
        assert_eq!(session.state(), ConnectionState::Idle);
        assert!(!effects.iter().any(|e| matches!(e, Effect::Disconnect { .. })));

        // Connect completing afterwards is released, not adopted
        let effects = session.handle(SessionEvent::Connected { attempt, handle: handle() }, now());
        assert_eq!(effects, vec![Effect::Disconnect { attempt, handle: handle() }]);
        assert_eq!(session.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_link_lost_during_discovery_is_not_adopted() {
        let mut session = ConnectionSession::new(SessionSettings::default());
        let attempt = connect_attempt(&session.connect("AA:BB")).unwrap();
        session.handle(SessionEvent::Connected { attempt, handle: handle() }, now());
        session.handle(SessionEvent::Discovered { attempt }, now());

        let effects = session.handle(
            SessionEvent::LinkLost { attempt, reason: Some("device disconnected".to_string()) },
            now(),
        );
        assert_eq!(
            errors(&effects),
            vec![SessionError::DeviceUnreachable {
                device_id: "AA:BB".to_string(),
                reason: "device disconnected".to_string()
            }]
        );
        assert_eq!(session.state(), ConnectionState::Idle);

        // The subscription result racing the loss must not revive the link
        let effects = session.handle(SessionEvent::Subscribed { attempt }, now());
        assert!(effects.is_empty());
        assert_eq!(session.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_link_lost_during_reconnect_setup_uses_a_retry() {
        let (mut session, _) = monitoring_session(SessionSettings::default());
        let first = session.attempt;
        let lost = session.handle(SessionEvent::LinkLost { attempt: first, reason: None }, now());
        let timer = scheduled(&lost, TimerKind::Reconnect).unwrap();
        let fired = session.handle(SessionEvent::TimerFired(timer), now());
        let attempt = connect_attempt(&fired).unwrap();
        session.handle(SessionEvent::Connected { attempt, handle: handle() }, now());
        assert_eq!(session.state(), ConnectionState::Reconnecting);

        let effects = session.handle(SessionEvent::LinkLost { attempt, reason: None }, now());
        assert_eq!(session.retry_count(), 1);
        assert_eq!(session.state(), ConnectionState::Reconnecting);
        assert_eq!(delay_of(&effects, TimerKind::Reconnect), Some(Duration::from_secs(2)));

        assert!(session.handle(SessionEvent::Subscribed { attempt }, now()).is_empty());
        assert_eq!(session.state(), ConnectionState::Reconnecting);
    }
}
