//! vitals-sim - a stand-in monitoring device for local development.

use vitals_feed::simulator::{DeviceSimulator, SimulatorSettings};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("vitals_feed=info".parse()?))
        .init();

    let settings = SimulatorSettings::load();
    tracing::info!(
        "Simulating a device at {} Hz, {} bpm",
        settings.sample_rate_hz,
        settings.heart_rate_bpm
    );

    let mut sim = DeviceSimulator::new(settings).spawn_configured().await?;
    tracing::info!("Try: curl http://{}/vitals?samples=5", sim.local_addr());

    tokio::signal::ctrl_c().await?;
    sim.shutdown().await;

    Ok(())
}
