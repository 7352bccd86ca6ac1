use anyhow::{Context, Result, anyhow};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use streamy::audio_output::create_sink;
use streamy::config::Config;
use streamy::controller::StreamController;
use streamy::transport::AsyncTransport;
use streamy::transport::tcp::TcpTransport;

const HALT_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(true)
        .init();

    info!("🚀 Starting streamy audio output...");
    let app_config = Config::from_env().context("Failed to load configuration")?;

    let transport = Arc::new(TcpTransport::bind(&app_config.listen_address).await?);

    let sink = create_sink(app_config.sink);
    info!("🔊 Using {:?} audio output.", app_config.sink);

    let controller = Arc::new(
        StreamController::init(
            app_config.format.clone(),
            app_config.settings.clone(),
            sink,
            transport.publisher(),
            transport.link(),
        )
        .context("Failed to initialize audio output")?,
    );
    info!(
        "🎧 Listening for PCM on topics {:?}. Press Ctrl+C to exit.",
        controller.topics()
    );

    let mut transport_task = tokio::spawn({
        let transport = transport.clone();
        let controller = controller.clone();
        async move { transport.run(controller).await }
    });

    let mut halt_check = tokio::time::interval(HALT_POLL_INTERVAL);
    let outcome: Result<()> = loop {
        tokio::select! {
            biased;
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, initiating shutdown...");
                break Ok(());
            }
            _ = halt_check.tick() => {
                if controller.halted() {
                    error!("🚨 Playback halted after a fatal audio error.");
                    break Err(anyhow!("audio output halted"));
                }
            }
            finished = &mut transport_task => {
                break match finished {
                    Ok(Ok(())) => Err(anyhow!("transport stopped unexpectedly")),
                    Ok(Err(e)) => Err(e.context("transport failed")),
                    Err(e) => Err(anyhow!("transport task panicked: {}", e)),
                };
            }
        }
    };

    // --- Shutdown Sequence ---
    info!("🔌 Shutting down control transport...");
    if let Err(e) = transport.shutdown().await {
        error!("🚨 Error stopping transport: {}", e);
    }
    if !transport_task.is_finished() {
        if let Err(e) = transport_task.await {
            error!("🚨 Transport task failed: {}", e);
        }
    }

    info!("🔌 Draining audio output...");
    let stats_controller = controller.clone();
    tokio::task::spawn_blocking(move || stats_controller.shutdown())
        .await
        .context("Audio output shutdown task failed")?;
    info!(
        "Played {} chunks ({} bytes), {} stops, {} dropped.",
        controller.stats().writes(),
        controller.stats().bytes(),
        controller.stats().stops(),
        controller.stats().dropped()
    );

    match &outcome {
        Ok(()) => info!("👋 streamy shut down gracefully. Goodbye!"),
        Err(e) => error!("🚨 streamy stopped: {:#}", e),
    }
    outcome
}
