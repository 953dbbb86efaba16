//! Seam between the connection session and a concrete short-range radio stack.
//!
//! Implementations push asynchronous happenings (advertisements, notification
//! payloads, link loss) into the sink they are handed; request/response calls
//! return `TransportError` and are mapped to session events by the driver.

use crate::error::TransportError;
use crate::sample::CharacteristicValue;
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// A device seen while scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: String,
    pub name: String,
    pub signal_strength: Option<i16>,
}

/// An open connection to one device
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    pub timeout: Duration,
    pub mtu: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    DeviceFound(DeviceDescriptor),
    Value(CharacteristicValue),
    /// The monitored connection dropped
    Lost(Option<String>),
}

#[async_trait]
pub trait LinkTransport: Send + Sync + 'static {
    /// Whether the platform granted scan/connect permission
    async fn permission_granted(&self) -> bool {
        true
    }

    async fn radio_enabled(&self) -> bool;

    /// Start reporting advertisements into `sink` until `stop_scan`
    async fn start_scan(&self, sink: UnboundedSender<LinkEvent>) -> Result<(), TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    async fn connect(
        &self,
        device_id: &str,
        options: ConnectOptions,
    ) -> Result<DeviceHandle, TransportError>;

    /// Enumerate services and characteristics
    async fn discover(&self, handle: &DeviceHandle) -> Result<(), TransportError>;

    /// Subscribe to notifications; values and link loss go to `sink`
    async fn monitor(
        &self,
        handle: &DeviceHandle,
        service: &str,
        characteristic: &str,
        sink: UnboundedSender<LinkEvent>,
    ) -> Result<(), TransportError>;

    async fn is_connected(&self, handle: &DeviceHandle) -> Result<bool, TransportError>;

    async fn disconnect(&self, handle: &DeviceHandle) -> Result<(), TransportError>;
}
