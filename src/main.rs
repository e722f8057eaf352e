//! vitals-feed - stream readings from a monitoring device to the log.

use vitals_feed::{
    build_transport, ClientConfig, EndpointHandle, Handlers, ReadingStore, TransportError,
};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("vitals_feed=info".parse()?))
        .init();

    // Load configuration
    let cfg = ClientConfig::load()?;
    tracing::info!("Starting vitals-feed ({} transport) for {}", cfg.transport, cfg.endpoint);

    let endpoint = EndpointHandle::new(cfg.endpoint.clone());
    let store = ReadingStore::new(cfg.buffer_capacity);
    let transport = build_transport(&cfg, endpoint, store.clone())?;

    let source = cfg.source.clone();
    let _subscription = transport.set_handlers(
        Handlers::new()
            .on_connect(|| tracing::info!("Device connected"))
            .on_disconnect(|| tracing::warn!("Device disconnected"))
            .on_error(|e: &TransportError| tracing::debug!("Transport error: {}", e))
            .on_data(move |batch| {
                if let Some(last) = batch.last() {
                    tracing::info!(
                        "{}: {} reading(s), ecg={:.3} ppg={:?} hr={:?} spo2={:?}",
                        source,
                        batch.len(),
                        last.ecg,
                        last.ppg,
                        last.heart_rate,
                        last.spo2
                    );
                }
            }),
    );

    transport.connect();

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    transport.disconnect();
    tracing::info!("Buffered {} reading(s) for {}", store.len(&cfg.source), cfg.source);

    Ok(())
}
