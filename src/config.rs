use std::{env, net::SocketAddr, time::Duration};

use anyhow::{bail, Context};

/// One measurement source: a PZEM meter on its own serial port, published
/// under its own device tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeterSource {
    pub name: String,
    pub serial_path: String,
}

/// One WiFi candidate, tried in configuration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessPoint {
    pub ssid: String,
    pub psk: String,
}

/// Immutable agent configuration, loaded once at startup from the
/// environment. Nothing here changes while the loop runs.
#[derive(Debug, Clone)]
pub struct Config {
    pub influx_url: String,
    pub influx_org: String,
    pub influx_bucket: String,
    pub influx_token: String,
    pub sources: Vec<MeterSource>,
    pub wifi_iface: String,
    pub access_points: Vec<AccessPoint>,
    pub ota_listen: SocketAddr,
    pub ota_password: String,
    pub tick_period: Duration,
    pub publish_period: Duration,
}

impl Config {
    /// Startup is the only place the agent is allowed to die: a malformed
    /// required variable aborts here with a diagnostic.
    pub fn from_env() -> anyhow::Result<Self> {
        let influx_url = required("INFLUXDB_URL")?;
        let influx_url = influx_url.trim_end_matches('/').to_string();

        let config = Self {
            influx_url,
            influx_org: required("INFLUXDB_ORG")?,
            influx_bucket: required("INFLUXDB_BUCKET")?,
            influx_token: required("INFLUXDB_TOKEN")?,
            sources: parse_meter_devices(&required("METER_DEVICES")?)
                .context("invalid METER_DEVICES")?,
            wifi_iface: env::var("WIFI_IFACE").unwrap_or_else(|_| "wlan0".to_string()),
            access_points: parse_wifi_networks(&required("WIFI_NETWORKS")?)
                .context("invalid WIFI_NETWORKS")?,
            ota_listen: env::var("OTA_LISTEN")
                .unwrap_or_else(|_| "0.0.0.0:3232".to_string())
                .parse()
                .context("invalid OTA_LISTEN address")?,
            ota_password: required("OTA_PASSWORD")?,
            tick_period: Duration::from_millis(
                parse_env_number("TICK_MS", 1000).context("invalid TICK_MS")?,
            ),
            publish_period: Duration::from_secs(
                parse_env_number("PUBLISH_SECS", 10).context("invalid PUBLISH_SECS")?,
            ),
        };

        validate_periods(config.tick_period, config.publish_period)?;
        Ok(config)
    }
}

/// A zero tick would panic the interval at runtime; catch it here, where
/// dying with a diagnostic is still allowed.
fn validate_periods(tick: Duration, publish: Duration) -> anyhow::Result<()> {
    if tick.is_zero() {
        bail!("TICK_MS must be at least 1");
    }
    if publish < tick {
        bail!("PUBLISH_SECS must not be shorter than TICK_MS");
    }
    Ok(())
}

fn required(key: &str) -> anyhow::Result<String> {
    let value = env::var(key).with_context(|| format!("{key} must be set"))?;
    if value.is_empty() {
        bail!("{key} must not be empty");
    }
    Ok(value)
}

fn parse_env_number(key: &str, default: u64) -> anyhow::Result<u64> {
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{key}: `{raw}` is not a number")),
        Err(_) => Ok(default),
    }
}

/// `name:serial-path[,name:serial-path...]`, e.g.
/// `node-1:/dev/ttyUSB0,node-2:/dev/ttyUSB1`.
fn parse_meter_devices(raw: &str) -> anyhow::Result<Vec<MeterSource>> {
    let mut sources = Vec::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let Some((name, serial_path)) = entry.split_once(':') else {
            bail!("`{entry}` is not of the form name:serial-path");
        };
        if name.is_empty() || serial_path.is_empty() {
            bail!("`{entry}` is not of the form name:serial-path");
        }
        sources.push(MeterSource {
            name: name.to_string(),
            serial_path: serial_path.to_string(),
        });
    }
    if sources.is_empty() {
        bail!("no meter devices configured");
    }
    Ok(sources)
}

/// `ssid:psk[;ssid:psk...]`, candidates tried in listed order.
fn parse_wifi_networks(raw: &str) -> anyhow::Result<Vec<AccessPoint>> {
    let mut access_points = Vec::new();
    for entry in raw.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let Some((ssid, psk)) = entry.split_once(':') else {
            bail!("`{entry}` is not of the form ssid:psk");
        };
        if ssid.is_empty() {
            bail!("`{entry}` has an empty ssid");
        }
        access_points.push(AccessPoint {
            ssid: ssid.to_string(),
            psk: psk.to_string(),
        });
    }
    if access_points.is_empty() {
        bail!("no wifi networks configured");
    }
    Ok(access_points)
}
