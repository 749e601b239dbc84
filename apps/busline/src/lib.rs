pub mod config;
pub mod controller;
pub mod dispatch;
pub mod monitor;
pub mod protocol;
pub mod store;
pub mod sync;
pub mod telemetry;
pub mod transport;

pub use controller::{BusClient, BusEvent};
pub use monitor::{ConnectionMonitor, ConnectionState, MonitorConfig};
