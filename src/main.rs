use std::time::Duration;
use vitalink::ble::BleTransport;
use vitalink::config::{Config, LinkKind};
use vitalink::storage::FileStore;
use vitalink::{
    ConnectionManager, ConnectionState, HealthMonitor, HttpReadingsSource, SessionController,
    TelemetryPoller, TelemetryUpdate,
};

const TICK: Duration = Duration::from_millis(100);
const STATUS_EVERY_TICKS: u32 = 50;

/// The running sensor link
enum Link {
    Ble {
        controller: SessionController,
        task: tokio::task::JoinHandle<()>,
    },
    Network(TelemetryPoller<HttpReadingsSource>),
}

#[tokio::main]
async fn main() {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::load().unwrap_or_else(|e| {
        log::warn!("{}; using default settings", e);
        Config::default()
    });

    let data_dir = config.data_dir();
    log::info!("Data directory: {}", data_dir.display());
    let store = FileStore::new(&data_dir);
    let mut monitor = HealthMonitor::open(Box::new(store.clone()), Box::new(store));

    // Drivers publish here; the monitor drains on every tick
    let (sender, receiver) = crossbeam_channel::unbounded::<TelemetryUpdate>();

    let mut link = match start_link(&config, sender).await {
        Some(link) => link,
        None => return,
    };

    let mut tick = tokio::time::interval(TICK);
    let mut ticks = 0u32;
    let mut autoconnected = false;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                log::info!("Shutting down");
                break;
            }
            _ = tick.tick() => {
                monitor.drain(&receiver);
                let snapshot = monitor.snapshot();

                if let Link::Ble { controller, .. } = &link {
                    if config.enable_autoconnect
                        && !autoconnected
                        && snapshot.connection_state == ConnectionState::Scanning
                    {
                        if let Some(device) = snapshot.devices.first() {
                            log::info!("Auto-connecting to {} ({})", device.name, device.id);
                            autoconnected = controller.connect(device.id.clone());
                        }
                    }
                }

                ticks = ticks.wrapping_add(1);
                if ticks % STATUS_EVERY_TICKS == 0 {
                    log_status(&monitor);
                }
            }
        }
    }

    match &mut link {
        Link::Ble { controller, task } => {
            controller.shutdown();
            if let Err(e) = task.await {
                log::error!("Connection manager task failed: {}", e);
            }
        }
        Link::Network(poller) => poller.disconnect(),
    }
    monitor.drain(&receiver);
    log_status(&monitor);
}

async fn start_link(
    config: &Config,
    sender: crossbeam_channel::Sender<TelemetryUpdate>,
) -> Option<Link> {
    match config.link {
        LinkKind::Ble => {
            let transport = match BleTransport::new().await {
                Ok(transport) => std::sync::Arc::new(transport),
                Err(e) => {
                    log::error!("Failed to open Bluetooth: {}", e);
                    return None;
                }
            };
            let (manager, controller) =
                ConnectionManager::new(transport, config.session_settings(), sender);
            let task = tokio::spawn(manager.run());
            controller.scan();
            Some(Link::Ble { controller, task })
        }
        LinkKind::Network => {
            let source = match HttpReadingsSource::new(config.sensor_endpoint.clone()) {
                Ok(source) => source,
                Err(e) => {
                    log::error!("Failed to create HTTP client: {}", e);
                    return None;
                }
            };
            log::info!("Connecting to sensor node at {}", source.endpoint());
            let mut poller = TelemetryPoller::new(source, sender);
            if let Err(e) = poller.connect().await {
                log::error!("Failed to connect to sensor node: {}", e);
                return None;
            }
            Some(Link::Network(poller))
        }
    }
}

fn log_status(monitor: &HealthMonitor) {
    let snapshot = monitor.snapshot();
    let heart_rate = snapshot
        .latest
        .heart_rate
        .map(|s| format!("{} bpm", s.bpm))
        .unwrap_or_else(|| "--".to_string());
    let spo2 = snapshot
        .latest
        .spo2
        .map(|s| format!("{:.0}%", s.percent))
        .unwrap_or_else(|| "--".to_string());
    let today = monitor.today_total(chrono::Utc::now().date_naive());

    log::info!(
        "{} | network: {} | HR {} | SpO2 {} | session {} kcal | today {} kcal{}",
        snapshot.connection_state,
        if snapshot.network_connected { "up" } else { "down" },
        heart_rate,
        spo2,
        snapshot.session_calories,
        today,
        if snapshot.simulated { " | simulated data" } else { "" }
    );
    if let Some(error) = &snapshot.last_error {
        log::warn!("Last link error: {}", error);
    }
}
