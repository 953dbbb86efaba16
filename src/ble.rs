//! btleplug-backed `LinkTransport`.
//!
//! Uses the first adapter the platform reports. Peripherals seen while
//! scanning are cached by address so `connect` can find them again; each
//! monitored device gets a task that forwards notifications and reports the
//! link as lost when the peripheral disconnects or its stream ends.

use crate::error::TransportError;
use crate::sample::CharacteristicValue;
use crate::transport::{ConnectOptions, DeviceDescriptor, DeviceHandle, LinkEvent, LinkTransport};
use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, CentralState, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

pub struct BleTransport {
    adapter: Option<Adapter>,
    peripherals: Arc<Mutex<HashMap<String, Peripheral>>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    monitor_tasks: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl BleTransport {
    /// Open the platform manager. A machine without an adapter still yields a
    /// transport; it reports the radio as disabled.
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager.adapters().await?.into_iter().next();
        match &adapter {
            Some(adapter) => match adapter.adapter_info().await {
                Ok(info) => log::info!("Using Bluetooth adapter: {}", info),
                Err(e) => log::warn!("Bluetooth adapter info unavailable: {}", e),
            },
            None => log::warn!("No Bluetooth adapter found"),
        }

        Ok(Self {
            adapter,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            scan_task: Mutex::new(None),
            monitor_tasks: Mutex::new(HashMap::new()),
        })
    }

    fn adapter(&self) -> Result<&Adapter, TransportError> {
        self.adapter.as_ref().ok_or(TransportError::NoAdapter)
    }

    async fn peripheral(&self, device_id: &str) -> Result<Peripheral, TransportError> {
        if let Some(peripheral) = self.peripherals.lock().await.get(device_id) {
            return Ok(peripheral.clone());
        }
        // Not seen in this scan; ask the adapter directly
        let peripherals = self.adapter()?.peripherals().await?;
        let peripheral = peripherals
            .into_iter()
            .find(|p| p.address().to_string() == device_id)
            .ok_or_else(|| TransportError::UnknownDevice(device_id.to_string()))?;
        self.peripherals
            .lock()
            .await
            .insert(device_id.to_string(), peripheral.clone());
        Ok(peripheral)
    }
}

/// Backends that cannot report power say `Unknown`; only an explicit
/// `PoweredOff` counts as disabled
fn is_powered(state: &CentralState) -> bool {
    !matches!(state, CentralState::PoweredOff)
}

async fn describe(peripheral: &Peripheral) -> Option<DeviceDescriptor> {
    let properties = peripheral.properties().await.ok()??;
    let name = properties.local_name?;
    Some(DeviceDescriptor {
        id: peripheral.address().to_string(),
        name,
        signal_strength: properties.rssi,
    })
}

#[async_trait]
impl LinkTransport for BleTransport {
    async fn radio_enabled(&self) -> bool {
        let Some(adapter) = &self.adapter else {
            return false;
        };
        match adapter.adapter_state().await {
            Ok(state) => {
                log::debug!("Bluetooth adapter state: {:?}", state);
                is_powered(&state)
            }
            Err(e) => {
                log::warn!("Bluetooth adapter state unavailable: {}", e);
                true
            }
        }
    }

    async fn start_scan(&self, sink: UnboundedSender<LinkEvent>) -> Result<(), TransportError> {
        let adapter = self.adapter()?.clone();
        let mut events = adapter.events().await?;
        adapter.start_scan(ScanFilter::default()).await?;

        let peripherals = self.peripherals.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Some(device) = describe(&peripheral).await else {
                    continue;
                };
                peripherals.lock().await.insert(device.id.clone(), peripheral);
                if sink.send(LinkEvent::DeviceFound(device)).is_err() {
                    break;
                }
            }
        });

        if let Some(previous) = self.scan_task.lock().await.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        if let Some(task) = self.scan_task.lock().await.take() {
            task.abort();
        }
        self.adapter()?.stop_scan().await?;
        Ok(())
    }

    async fn connect(
        &self,
        device_id: &str,
        options: ConnectOptions,
    ) -> Result<DeviceHandle, TransportError> {
        let peripheral = self.peripheral(device_id).await?;
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        // MTU is negotiated by the platform stack
        log::debug!("Connected to {} (requested MTU {})", device_id, options.mtu);
        Ok(DeviceHandle { id: device_id.to_string() })
    }

    async fn discover(&self, handle: &DeviceHandle) -> Result<(), TransportError> {
        let peripheral = self.peripheral(&handle.id).await?;
        peripheral.discover_services().await?;
        log::debug!(
            "Discovered {} characteristics on {}",
            peripheral.characteristics().len(),
            handle.id
        );
        Ok(())
    }

    async fn monitor(
        &self,
        handle: &DeviceHandle,
        service: &str,
        characteristic: &str,
        sink: UnboundedSender<LinkEvent>,
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(&handle.id).await?;
        let target = peripheral
            .characteristics()
            .into_iter()
            .find(|c| {
                c.uuid.to_string().eq_ignore_ascii_case(characteristic)
                    && c.service_uuid.to_string().eq_ignore_ascii_case(service)
            })
            .ok_or_else(|| TransportError::MissingCharacteristic {
                service: service.to_string(),
                characteristic: characteristic.to_string(),
            })?;

        let mut notifications = peripheral.notifications().await?;
        let mut central_events = self.adapter()?.events().await?;
        peripheral.subscribe(&target).await?;

        let peripheral_id = peripheral.id();
        let uuid = target.uuid;
        let task = tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    notification = notifications.next() => match notification {
                        Some(n) if n.uuid == uuid => {
                            let value = LinkEvent::Value(CharacteristicValue::Raw(n.value));
                            if sink.send(value).is_err() {
                                return;
                            }
                        }
                        Some(_) => {}
                        None => break Some("notification stream ended".to_string()),
                    },
                    event = central_events.next() => match event {
                        Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral_id => {
                            break Some("device disconnected".to_string());
                        }
                        Some(_) => {}
                        None => break None,
                    },
                }
            };
            let _ = sink.send(LinkEvent::Lost(reason));
        });

        if let Some(previous) = self.monitor_tasks.lock().await.insert(handle.id.clone(), task) {
            previous.abort();
        }
        Ok(())
    }

    async fn is_connected(&self, handle: &DeviceHandle) -> Result<bool, TransportError> {
        let peripheral = self.peripheral(&handle.id).await?;
        Ok(peripheral.is_connected().await?)
    }

    async fn disconnect(&self, handle: &DeviceHandle) -> Result<(), TransportError> {
        if let Some(task) = self.monitor_tasks.lock().await.remove(&handle.id) {
            task.abort();
        }
        let peripheral = self.peripheral(&handle.id).await?;
        if peripheral.is_connected().await? {
            peripheral.disconnect().await?;
        }
        Ok(())
    }
}
