use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use tokio_modbus::prelude::*;
use tokio_serial::SerialStream;
use tracing::warn;

/// PZEM-004T v3 general address, answers regardless of configured slave id.
pub const PZEM_SLAVE_ADDR: u8 = 0xF8;
/// Fixed serial parameters of the PZEM-004T (9600 8N1).
pub const PZEM_BAUD_RATE: u32 = 9600;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// The six metrics exposed by the meter, in sampling order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Metric {
    Voltage = 0,
    Current = 1,
    Power = 2,
    Frequency = 3,
    TotalEnergyGenerated = 4,
    PowerFactor = 5,
}

impl Metric {
    pub const ALL: [Metric; 6] = [
        Metric::Voltage,
        Metric::Current,
        Metric::Power,
        Metric::Frequency,
        Metric::TotalEnergyGenerated,
        Metric::PowerFactor,
    ];

    /// Field name used in the outbound data point.
    pub fn field_name(self) -> &'static str {
        match self {
            Metric::Voltage => "voltage",
            Metric::Current => "current",
            Metric::Power => "power",
            Metric::Frequency => "frequency",
            Metric::TotalEnergyGenerated => "total_energy_generated",
            Metric::PowerFactor => "power_factor",
        }
    }

    /// Short name used in operator log lines.
    pub fn label(self) -> &'static str {
        match self {
            Metric::Voltage => "voltage",
            Metric::Current => "current",
            Metric::Power => "power",
            Metric::Frequency => "frequency",
            Metric::TotalEnergyGenerated => "energy",
            Metric::PowerFactor => "power factor",
        }
    }

    /// Input register address and count per the PZEM-004T v3 register map.
    /// Multi-register quantities arrive low word first.
    fn register(self) -> (u16, u16) {
        match self {
            Metric::Voltage => (0x0000, 1),
            Metric::Current => (0x0001, 2),
            Metric::Power => (0x0003, 2),
            Metric::Frequency => (0x0007, 1),
            Metric::TotalEnergyGenerated => (0x0005, 2),
            Metric::PowerFactor => (0x0008, 1),
        }
    }

    /// Raw register value is divided by this to yield the engineering unit
    /// (V, A, W, Hz, kWh, unitless).
    fn divisor(self) -> f64 {
        match self {
            Metric::Voltage => 10.0,
            Metric::Current => 1000.0,
            Metric::Power => 10.0,
            Metric::Frequency => 10.0,
            Metric::TotalEnergyGenerated => 1000.0,
            Metric::PowerFactor => 100.0,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// One named metric value. A reading is valid iff its value is finite;
/// an unreadable metric is carried as NaN, never as zero.
#[derive(Debug, Clone, Copy)]
pub struct MetricReading {
    pub metric: Metric,
    pub value: f64,
}

impl MetricReading {
    pub fn invalid(metric: Metric) -> Self {
        Self {
            metric,
            value: f64::NAN,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.value.is_finite()
    }
}

/// Holder of the six most recent readings, one per metric, updated in place
/// once per sampling tick and read only by the immediately following
/// build/publish step.
#[derive(Debug, Clone)]
pub struct MeasurementSet {
    readings: [MetricReading; 6],
}

impl MeasurementSet {
    pub fn new() -> Self {
        Self {
            readings: Metric::ALL.map(MetricReading::invalid),
        }
    }

    pub fn set(&mut self, reading: MetricReading) {
        self.readings[reading.metric.index()] = reading;
    }

    pub fn get(&self, metric: Metric) -> MetricReading {
        self.readings[metric.index()]
    }

    pub fn readings(&self) -> impl Iterator<Item = &MetricReading> {
        self.readings.iter()
    }
}

impl Default for MeasurementSet {
    fn default() -> Self {
        Self::new()
    }
}

/// One input-register request/response exchange with the meter.
/// The production implementation talks Modbus RTU over a serial line;
/// tests substitute a scripted source.
#[async_trait]
pub trait RegisterSource: Send {
    async fn read_input_registers(&mut self, addr: u16, count: u16) -> anyhow::Result<Vec<u16>>;
}

/// Modbus RTU transport to a PZEM-004T on a local serial port.
pub struct PzemTransport {
    ctx: client::Context,
}

impl PzemTransport {
    pub fn open(serial_path: &str) -> anyhow::Result<Self> {
        let builder = tokio_serial::new(serial_path, PZEM_BAUD_RATE);
        let port = SerialStream::open(&builder)
            .with_context(|| format!("failed to open serial port {serial_path}"))?;
        let ctx = rtu::attach_slave(port, Slave(PZEM_SLAVE_ADDR));
        Ok(Self { ctx })
    }
}

#[async_trait]
impl RegisterSource for PzemTransport {
    async fn read_input_registers(&mut self, addr: u16, count: u16) -> anyhow::Result<Vec<u16>> {
        let response = tokio::time::timeout(
            REQUEST_TIMEOUT,
            self.ctx.read_input_registers(addr, count),
        )
        .await
        .map_err(|_| anyhow!("meter did not answer within {REQUEST_TIMEOUT:?}"))?
        .context("modbus request failed")?;
        response.map_err(|exception| anyhow!("modbus exception: {exception:?}"))
    }
}

/// Reads individual metrics from one meter over a [`RegisterSource`].
/// Holds no reading state of its own; values land in the caller's
/// [`MeasurementSet`].
pub struct MeterReader<T> {
    name: String,
    transport: T,
}

impl<T: RegisterSource> MeterReader<T> {
    pub fn new(name: impl Into<String>, transport: T) -> Self {
        Self {
            name: name.into(),
            transport,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// One independent request/response exchange. A transport failure marks
    /// the reading invalid and logs once; it never aborts the sampling pass.
    pub async fn read_metric(&mut self, metric: Metric) -> MetricReading {
        let (addr, count) = metric.register();
        match self.transport.read_input_registers(addr, count).await {
            Ok(registers) if registers.len() == count as usize => MetricReading {
                metric,
                value: decode_registers(&registers) / metric.divisor(),
            },
            Ok(registers) => {
                warn!(
                    meter = %self.name,
                    "Error reading {}: short response ({} registers)",
                    metric.label(),
                    registers.len()
                );
                MetricReading::invalid(metric)
            }
            Err(e) => {
                warn!(meter = %self.name, "Error reading {}: {e:#}", metric.label());
                MetricReading::invalid(metric)
            }
        }
    }

    /// Reads all six metrics in fixed order into `set`. Order does not affect
    /// correctness; the fields are independent.
    pub async fn refresh_all(&mut self, set: &mut MeasurementSet) {
        for metric in Metric::ALL {
            set.set(self.read_metric(metric).await);
        }
    }
}

/// Registers carry the value low word first.
fn decode_registers(registers: &[u16]) -> f64 {
    let mut raw: u64 = 0;
    for (i, reg) in registers.iter().enumerate() {
        raw |= (*reg as u64) << (16 * i);
    }
    raw as f64
}
