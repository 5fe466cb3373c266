//! Sensor info example
//!
//! Opens the fingerprint MCU, prints its firmware versions and sensor
//! parameters, then leaves the device idle.

use std::sync::Arc;

use fpmcu::{McuSensor, NoTelemetry, SensorDriver, SensorMode};
use fpmcu_transport::DevChannel;

#[tokio::main]
async fn main() -> fpmcu::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let path = std::env::var("FP_DEV").unwrap_or_else(|_| "/dev/cros_fp".to_string());

    let chan = DevChannel::open(&path)?;
    let mut sensor = McuSensor::open(chan, Arc::new(NoTelemetry)).await?;

    let version = sensor.get_version().await?;
    println!("Firmware: {version}");
    println!("Sensor:   {:?}", sensor.info());

    sensor.set_mode(SensorMode::None).await?;
    println!("Done!");

    Ok(())
}
