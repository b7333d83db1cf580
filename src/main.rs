use std::path::PathBuf;

use smart_energy_meter::{
    Config, ConnectivitySupervisor, InfluxWriter, LoopScheduler, MeterReader, NmcliLink,
    PointBuilder, PzemTransport, SamplerUnit, UpdateListener,
};
use tracing::{info, warn};

const STAGING_PATH: &str = "/var/lib/smart-energy-meter/firmware-staging.bin";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    info!("Starting smart energy meter agent");

    let link = NmcliLink::new(config.wifi_iface.clone());
    let mut supervisor = ConnectivitySupervisor::new(link, config.access_points.clone());
    supervisor.ensure_connected().await;

    let writer = InfluxWriter::new(&config);
    if writer.validate_connection().await {
        info!("Connected to InfluxDB: {}", writer.server_url());
    } else {
        warn!("InfluxDB connection failed: {}", writer.server_url());
    }

    let updates = UpdateListener::bind(
        config.ota_listen,
        config.ota_password.clone(),
        PathBuf::from(STAGING_PATH),
    )
    .await?;

    let mut units = Vec::new();
    for source in &config.sources {
        info!(
            "Opening meter {} on {}",
            source.name, source.serial_path
        );
        let transport = PzemTransport::open(&source.serial_path)?;
        units.push(SamplerUnit::new(
            MeterReader::new(source.name.clone(), transport),
            PointBuilder::new(source.name.clone()),
        ));
    }

    LoopScheduler::new(
        units,
        supervisor,
        writer,
        updates,
        config.tick_period,
        config.publish_period,
    )
    .run()
    .await;

    Ok(())
}
