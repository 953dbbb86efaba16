//! Telemetry sessions for wearable health sensors.
//!
//! Two link variants feed one pipeline: a short-range BLE session
//! (`connection` driving `session`) and a local-network poller (`poller`).
//! Samples are validated (`sample`), kept in rolling chart histories
//! (`telemetry`), and turned into calorie ledger entries (`calories`,
//! `ledger`) by the single state owner, `monitor::HealthMonitor`.

pub mod ble;
pub mod calories;
pub mod config;
pub mod connection;
pub mod error;
pub mod ledger;
pub mod monitor;
pub mod poller;
pub mod profile;
pub mod sample;
pub mod scheduler;
pub mod session;
pub mod simulator;
pub mod storage;
pub mod telemetry;
pub mod timeseries;
pub mod transport;

pub use connection::{ConnectionManager, SessionController};
pub use monitor::{HealthMonitor, MonitorSnapshot};
pub use poller::{HttpReadingsSource, TelemetryPoller};
pub use session::{ConnectionSession, ConnectionState};
pub use telemetry::TelemetryUpdate;
