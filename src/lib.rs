//! Smart Energy Meter Agent
//!
//! Periodically samples a PZEM-004T power meter over a serial Modbus link and
//! forwards the validated readings to InfluxDB as tagged data points, while
//! staying reachable for pushed firmware updates and surviving transient
//! network loss.

pub mod config;
pub mod connectivity;
pub mod influx;
pub mod meter;
pub mod ota;
pub mod point;
pub mod scheduler;

// Re-export commonly used types for easier access
pub use config::{AccessPoint, Config, MeterSource};
pub use connectivity::{ConnectionState, ConnectivitySupervisor, NetworkLink, NmcliLink};
pub use influx::{InfluxWriter, PointWriter};
pub use meter::{MeasurementSet, MeterReader, Metric, MetricReading, PzemTransport, RegisterSource};
pub use ota::{UpdateListener, UpdateService};
pub use point::{DataPoint, PointBuilder};
pub use scheduler::{LoopScheduler, SamplerUnit};
