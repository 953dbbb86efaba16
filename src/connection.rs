//! # Connection Management Module
//!
//! Async driver for the short-range link. Owns a `ConnectionSession`,
//! executes its effects against a `LinkTransport` and feeds the results back
//! in as session events.
//!
//! ## Key Components
//! - `ConnectionManager`: the driver loop, run as a tokio task
//! - `SessionController`: cloneable command handle for the UI side
//! - `SessionCommand`: commands sent from the UI to the driver
//!
//! All I/O runs in spawned tasks that only ever report back through the event
//! channel, so the session itself is mutated from this one loop. Timers are
//! spawned sleeps whose join handles are aborted on cancel; a sleep that
//! fires anyway is rejected by the session's generation check.

use crate::error::TransportError;
use crate::scheduler::TimerKind;
use crate::session::{ConnectionSession, Effect, LinkStatus, SessionEvent, SessionSettings};
use crate::telemetry::TelemetryUpdate;
use crate::transport::{LinkEvent, LinkTransport};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    Scan,
    StopScan,
    Connect(String),
    Disconnect,
    Shutdown,
}

/// Command handle for a running `ConnectionManager`
#[derive(Debug, Clone)]
pub struct SessionController {
    sender: UnboundedSender<SessionCommand>,
}

impl SessionController {
    pub fn scan(&self) -> bool {
        self.send(SessionCommand::Scan)
    }

    pub fn stop_scan(&self) -> bool {
        self.send(SessionCommand::StopScan)
    }

    pub fn connect(&self, device_id: impl Into<String>) -> bool {
        self.send(SessionCommand::Connect(device_id.into()))
    }

    pub fn disconnect(&self) -> bool {
        self.send(SessionCommand::Disconnect)
    }

    pub fn shutdown(&self) -> bool {
        self.send(SessionCommand::Shutdown)
    }

    /// Returns false once the manager has stopped
    fn send(&self, command: SessionCommand) -> bool {
        match self.sender.send(command) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Connection manager is not running, dropped {:?}", e.0);
                false
            }
        }
    }
}

pub struct ConnectionManager<T: LinkTransport> {
    transport: Arc<T>,
    session: ConnectionSession,
    commands: UnboundedReceiver<SessionCommand>,
    events_tx: UnboundedSender<SessionEvent>,
    events_rx: UnboundedReceiver<SessionEvent>,
    updates: crossbeam_channel::Sender<TelemetryUpdate>,
    timers: HashMap<TimerKind, JoinHandle<()>>,
}

impl<T: LinkTransport> ConnectionManager<T> {
    /// Creates a new ConnectionManager.
    ///
    /// Returns the manager and a controller for issuing commands from the UI side.
    pub fn new(
        transport: Arc<T>,
        settings: SessionSettings,
        updates: crossbeam_channel::Sender<TelemetryUpdate>,
    ) -> (Self, SessionController) {
        let (command_sender, commands) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let manager = ConnectionManager {
            transport,
            session: ConnectionSession::new(settings),
            commands,
            events_tx,
            events_rx,
            updates,
            timers: HashMap::new(),
        };

        (manager, SessionController { sender: command_sender })
    }

    /// Runs until `Shutdown` is received or every controller is dropped
    pub async fn run(mut self) {
        log::info!("Connection manager: started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Shutdown) | None => break,
                    Some(command) => self.on_command(command).await,
                },
                Some(event) = self.events_rx.recv() => {
                    let effects = self.session.handle(event, Utc::now());
                    self.execute(effects);
                }
            }
        }
        self.shutdown().await;
        log::info!("Connection manager: shut down");
    }

    async fn on_command(&mut self, command: SessionCommand) {
        log::debug!("Connection manager: {:?}", command);
        let effects = match command {
            SessionCommand::Scan => {
                let status = LinkStatus {
                    permission_granted: self.transport.permission_granted().await,
                    radio_enabled: self.transport.radio_enabled().await,
                };
                match self.session.request_scan(status) {
                    Ok(effects) => effects,
                    Err(e) => {
                        log::error!("Connection manager: scan refused: {}", e);
                        self.publish(TelemetryUpdate::LinkError(e));
                        return;
                    }
                }
            }
            SessionCommand::StopScan => self.session.stop_scan(),
            SessionCommand::Connect(device_id) => self.session.connect(&device_id),
            SessionCommand::Disconnect => self.session.disconnect(),
            SessionCommand::Shutdown => return,
        };
        self.execute(effects);
    }

    fn execute(&mut self, effects: Vec<Effect>) {
        // A connect in the same batch waits for the scan to stop
        let mut stopping_scan: Option<JoinHandle<()>> = None;
        for effect in effects {
            match effect {
                Effect::StartScan => self.start_scan(),
                Effect::StopScan => {
                    let transport = self.transport.clone();
                    stopping_scan = Some(tokio::spawn(async move {
                        if let Err(e) = transport.stop_scan().await {
                            log::warn!("Failed to stop scan: {}", e);
                        }
                    }));
                }
                Effect::Connect { attempt, device_id, options } => {
                    let transport = self.transport.clone();
                    let events = self.events_tx.clone();
                    let stopping_scan = stopping_scan.take();
                    tokio::spawn(async move {
                        if let Some(stop) = stopping_scan {
                            let _ = stop.await;
                        }
                        let connecting = transport.connect(&device_id, options);
                        let result = tokio::time::timeout(options.timeout, connecting)
                            .await
                            .unwrap_or(Err(TransportError::Timeout));
                        let event = match result {
                            Ok(handle) => SessionEvent::Connected { attempt, handle },
                            Err(e) => SessionEvent::ConnectFailed {
                                attempt,
                                reason: e.to_string(),
                            },
                        };
                        let _ = events.send(event);
                    });
                }
                Effect::Discover { attempt, handle } => {
                    let transport = self.transport.clone();
                    let events = self.events_tx.clone();
                    tokio::spawn(async move {
                        let event = match transport.discover(&handle).await {
                            Ok(()) => SessionEvent::Discovered { attempt },
                            Err(e) => SessionEvent::DiscoveryFailed {
                                attempt,
                                reason: e.to_string(),
                            },
                        };
                        let _ = events.send(event);
                    });
                }
                Effect::Subscribe { attempt, handle, service, characteristic } => {
                    let transport = self.transport.clone();
                    let events = self.events_tx.clone();
                    let sink = self.forward_link_events(attempt);
                    tokio::spawn(async move {
                        let subscribed = transport
                            .monitor(&handle, &service, &characteristic, sink)
                            .await;
                        let event = match subscribed {
                            Ok(()) => SessionEvent::Subscribed { attempt },
                            Err(e) => SessionEvent::SubscribeFailed {
                                attempt,
                                reason: e.to_string(),
                            },
                        };
                        let _ = events.send(event);
                    });
                }
                Effect::CheckLiveness { attempt, handle } => {
                    let transport = self.transport.clone();
                    let events = self.events_tx.clone();
                    tokio::spawn(async move {
                        let alive = match transport.is_connected(&handle).await {
                            Ok(alive) => alive,
                            Err(e) => {
                                log::warn!("Keepalive check failed: {}", e);
                                false
                            }
                        };
                        let _ = events.send(SessionEvent::Liveness { attempt, alive });
                    });
                }
                Effect::Disconnect { attempt, handle } => {
                    let transport = self.transport.clone();
                    let events = self.events_tx.clone();
                    tokio::spawn(async move {
                        if let Err(e) = transport.disconnect(&handle).await {
                            log::warn!("Failed to disconnect {}: {}", handle.id, e);
                        }
                        let _ = events.send(SessionEvent::DisconnectComplete { attempt });
                    });
                }
                Effect::Schedule { timer, after } => {
                    let events = self.events_tx.clone();
                    let task = tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = events.send(SessionEvent::TimerFired(timer));
                    });
                    if let Some(previous) = self.timers.insert(timer.kind, task) {
                        previous.abort();
                    }
                }
                Effect::Cancel(kind) => {
                    if let Some(task) = self.timers.remove(&kind) {
                        task.abort();
                    }
                }
                Effect::Notify(update) => self.publish(update),
            }
        }
    }

    fn start_scan(&self) {
        let transport = self.transport.clone();
        let events = self.events_tx.clone();
        let sink = self.forward_link_events(0);
        tokio::spawn(async move {
            if let Err(e) = transport.start_scan(sink).await {
                let _ = events.send(SessionEvent::ScanFailed(e.to_string()));
            }
        });
    }

    /// Sink whose link events are tagged with `attempt` and fed to the session
    fn forward_link_events(&self, attempt: u64) -> UnboundedSender<LinkEvent> {
        let (sink, mut link_events) = mpsc::unbounded_channel();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(link_event) = link_events.recv().await {
                let event = match link_event {
                    LinkEvent::DeviceFound(device) => SessionEvent::DeviceFound(device),
                    LinkEvent::Value(value) => SessionEvent::Characteristic { attempt, value },
                    LinkEvent::Lost(reason) => SessionEvent::LinkLost { attempt, reason },
                };
                if events.send(event).is_err() {
                    break;
                }
            }
        });
        sink
    }

    fn publish(&self, update: TelemetryUpdate) {
        if self.updates.send(update).is_err() {
            log::debug!("Connection manager: no receiver for telemetry update");
        }
    }

    /// Tear down inline so the device is released before the task ends
    async fn shutdown(&mut self) {
        for effect in self.session.disconnect() {
            match effect {
                Effect::StopScan => {
                    if let Err(e) = self.transport.stop_scan().await {
                        log::warn!("Failed to stop scan: {}", e);
                    }
                }
                Effect::Disconnect { handle, .. } => {
                    if let Err(e) = self.transport.disconnect(&handle).await {
                        log::warn!("Failed to disconnect {}: {}", handle.id, e);
                    }
                }
                Effect::Notify(update) => self.publish(update),
                _ => {}
            }
        }
        for (_, task) in self.timers.drain() {
            task.abort();
        }
        self.publish(TelemetryUpdate::LinkState(crate::session::ConnectionState::Idle));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::sample::CharacteristicValue;
    use crate::session::ConnectionState;
    use crate::transport::{ConnectOptions, DeviceDescriptor, DeviceHandle};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct MockTransport {
        radio_off: bool,
        /// Connect calls after this many fail
        healthy_connects: Option<usize>,
        connects: AtomicUsize,
        disconnects: AtomicUsize,
        link: Mutex<Option<UnboundedSender<LinkEvent>>>,
        /// Time the adapter takes to stop scanning
        stop_scan_delay: Duration,
        calls: Mutex<Vec<&'static str>>,
    }

    impl MockTransport {
        fn drop_link(&self) {
            if let Some(sink) = self.link.lock().unwrap().as_ref() {
                let _ = sink.send(LinkEvent::Lost(Some("out of range".to_string())));
            }
        }

        fn push_value(&self, bytes: Vec<u8>) {
            if let Some(sink) = self.link.lock().unwrap().as_ref() {
                let _ = sink.send(LinkEvent::Value(CharacteristicValue::Raw(bytes)));
            }
        }
    }

    #[async_trait]
    impl LinkTransport for MockTransport {
        async fn radio_enabled(&self) -> bool {
            !self.radio_off
        }

        async fn start_scan(&self, sink: UnboundedSender<LinkEvent>) -> Result<(), TransportError> {
            let _ = sink.send(LinkEvent::DeviceFound(DeviceDescriptor {
                id: "AA:BB".to_string(),
                name: "Nicla Sense ME".to_string(),
                signal_strength: Some(-60),
            }));
            Ok(())
        }

        async fn stop_scan(&self) -> Result<(), TransportError> {
            tokio::time::sleep(self.stop_scan_delay).await;
            self.calls.lock().unwrap().push("stop_scan");
            Ok(())
        }

        async fn connect(
            &self,
            device_id: &str,
            _options: ConnectOptions,
        ) -> Result<DeviceHandle, TransportError> {
            self.calls.lock().unwrap().push("connect");
            let n = self.connects.fetch_add(1, Ordering::SeqCst);
            match self.healthy_connects {
                Some(limit) if n >= limit => {
                    Err(TransportError::Backend("unreachable".to_string()))
                }
                _ => Ok(DeviceHandle { id: device_id.to_string() }),
            }
        }

        async fn discover(&self, _handle: &DeviceHandle) -> Result<(), TransportError> {
            Ok(())
        }

        async fn monitor(
            &self,
            _handle: &DeviceHandle,
            _service: &str,
            _characteristic: &str,
            sink: UnboundedSender<LinkEvent>,
        ) -> Result<(), TransportError> {
            *self.link.lock().unwrap() = Some(sink);
            Ok(())
        }

        async fn is_connected(&self, _handle: &DeviceHandle) -> Result<bool, TransportError> {
            Ok(true)
        }

        async fn disconnect(&self, _handle: &DeviceHandle) -> Result<(), TransportError> {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn settings() -> SessionSettings {
        SessionSettings { allow_simulation: false, ..SessionSettings::default() }
    }

    fn start(
        transport: Arc<MockTransport>,
        settings: SessionSettings,
    ) -> (SessionController, crossbeam_channel::Receiver<TelemetryUpdate>, JoinHandle<()>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let (manager, controller) = ConnectionManager::new(transport, settings, tx);
        let task = tokio::spawn(manager.run());
        (controller, rx, task)
    }

    fn states(updates: &crossbeam_channel::Receiver<TelemetryUpdate>) -> Vec<ConnectionState> {
        updates
            .try_iter()
            .filter_map(|u| match u {
                TelemetryUpdate::LinkState(state) => Some(state),
                _ => None,
            })
            .collect()
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_publishes_candidates() {
        let transport = Arc::new(MockTransport::default());
        let (controller, updates, _task) = start(transport, settings());

        assert!(controller.scan());
        settle().await;

        let devices: Vec<Vec<DeviceDescriptor>> = updates
            .try_iter()
            .filter_map(|u| match u {
                TelemetryUpdate::Devices(list) => Some(list),
                _ => None,
            })
            .collect();
        assert_eq!(devices.last().map(|l| l.len()), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_refused_when_radio_off() {
        let transport = Arc::new(MockTransport { radio_off: true, ..Default::default() });
        let (controller, updates, _task) = start(transport, settings());

        controller.scan();
        settle().await;

        let errors: Vec<_> = updates
            .try_iter()
            .filter_map(|u| match u {
                TelemetryUpdate::LinkError(e) => Some(e),
                _ => None,
            })
            .collect();
        assert_eq!(errors, vec![SessionError::LinkDisabled]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_waits_for_scan_to_stop() {
        let transport = Arc::new(MockTransport {
            stop_scan_delay: Duration::from_millis(500),
            ..Default::default()
        });
        let (controller, updates, _task) = start(transport.clone(), settings());

        controller.scan();
        settle().await;
        controller.connect("AA:BB");
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(*transport.calls.lock().unwrap(), vec!["stop_scan", "connect"]);
        assert_eq!(states(&updates).last(), Some(&ConnectionState::Monitoring));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_reaches_monitoring_and_forwards_values() {
        let transport = Arc::new(MockTransport::default());
        let (controller, updates, _task) = start(transport.clone(), settings());

        controller.connect("AA:BB");
        settle().await;
        assert_eq!(
            states(&updates),
            vec![
                ConnectionState::Connecting,
                ConnectionState::Discovering,
                ConnectionState::Monitoring
            ]
        );

        transport.push_value(vec![0xE8, 0x03, 0, 0, 0x18, 0xFC]);
        settle().await;
        let samples = updates
            .try_iter()
            .filter(|u| matches!(u, TelemetryUpdate::Sample { .. }))
            .count();
        assert_eq!(samples, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_manual_disconnect_prevents_reconnect() {
        let transport = Arc::new(MockTransport::default());
        let (controller, updates, _task) = start(transport.clone(), settings());

        controller.connect("AA:BB");
        settle().await;
        transport.drop_link();
        settle().await;
        assert_eq!(states(&updates).last(), Some(&ConnectionState::Reconnecting));

        // Before the 2 s reconnect delay elapses
        controller.disconnect();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
        assert_eq!(states(&updates).last(), Some(&ConnectionState::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_exhaustion_is_surfaced_once() {
        let transport = Arc::new(MockTransport { healthy_connects: Some(1), ..Default::default() });
        let (controller, updates, _task) = start(transport.clone(), settings());

        controller.connect("AA:BB");
        settle().await;
        transport.drop_link();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(transport.connects.load(Ordering::SeqCst), 4);
        let all: Vec<TelemetryUpdate> = updates.try_iter().collect();
        let exhausted = all
            .iter()
            .filter(|u| {
                matches!(
                    u,
                    TelemetryUpdate::LinkError(SessionError::ReconnectExhausted { .. })
                )
            })
            .count();
        assert_eq!(exhausted, 1);
        assert_eq!(
            all.iter().rev().find_map(|u| match u {
                TelemetryUpdate::LinkState(s) => Some(*s),
                _ => None,
            }),
            Some(ConnectionState::Failed)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_device_switches_to_simulation() {
        let transport = Arc::new(MockTransport::default());
        let settings = SessionSettings { allow_simulation: true, ..SessionSettings::default() };
        let (controller, updates, _task) = start(transport, settings);

        controller.connect("AA:BB");
        tokio::time::sleep(Duration::from_millis(3500)).await;

        let all: Vec<TelemetryUpdate> = updates.try_iter().collect();
        assert!(all.contains(&TelemetryUpdate::LinkState(ConnectionState::Simulating)));
        assert!(all.iter().any(|u| matches!(
            u,
            TelemetryUpdate::Sample { source: crate::sample::SampleSource::Simulated, .. }
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_releases_device() {
        let transport = Arc::new(MockTransport::default());
        let (controller, _updates, task) = start(transport.clone(), settings());

        controller.connect("AA:BB");
        settle().await;
        controller.shutdown();
        task.await.unwrap();

        assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);
        assert!(!controller.scan());
    }
}
