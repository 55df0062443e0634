use anyhow::{Context, Result};
use facetrack_core::embedder::OnnxEmbedder;
use facetrack_core::{Event, FacePipeline};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing_subscriber::EnvFilter;
use zbus::object_server::SignalEmitter;

mod config;
mod dbus_interface;
mod engine;
mod feed;
mod store;

use config::{BusKind, Config};
use dbus_interface::{FaceTrackService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facetrackd starting");

    let config = Config::load()?;
    let pipeline_config = config.pipeline_config()?;

    let model_path = config.model_path.to_string_lossy();
    let embedder = Arc::new(
        OnnxEmbedder::load(&model_path)
            .with_context(|| format!("loading embedding model {model_path}"))?,
    );
    let store = Arc::new(store::DirStore::open(&config.store_dir)?);

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let pipeline = Arc::new(FacePipeline::new(
        pipeline_config,
        embedder,
        store,
        Arc::new(engine::ChannelSink(event_tx)),
    ));

    let engine = engine::spawn_engine(Arc::clone(&pipeline))?;
    match feed::open(config.feed_path.as_deref())? {
        Some(feed) => {
            engine::spawn_frame_loop(Arc::clone(&pipeline), feed)?;
        }
        None => tracing::info!("no frame feed configured; serving signals only"),
    }

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, FaceTrackService::new(engine))?
        .build()
        .await
        .context("registering on D-Bus")?;

    let liveness = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(pipeline.liveness_interval());
            loop {
                tick.tick().await;
                pipeline.liveness_tick(Instant::now());
            }
        })
    };

    let (stop_tx, stop_rx) = oneshot::channel();
    let forwarder = tokio::spawn(forward_events(conn.clone(), event_rx, stop_rx));

    tracing::info!(bus = ?config.bus, name = BUS_NAME, mode = %pipeline.mode(), "facetrackd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("facetrackd shutting down");

    liveness.abort();
    pipeline.shutdown();
    let _ = stop_tx.send(());
    let _ = forwarder.await;

    Ok(())
}

/// Log every engine event and rebroadcast it as a D-Bus signal. On stop,
/// drains what is already queued before returning.
async fn forward_events(
    conn: zbus::Connection,
    mut events: mpsc::UnboundedReceiver<Event>,
    mut stop: oneshot::Receiver<()>,
) {
    let emitter = SignalEmitter::new(&conn, OBJECT_PATH)
        .map_err(|e| tracing::error!(error = %e, "cannot create signal emitter; events will only be logged"))
        .ok();

    loop {
        tokio::select! {
            biased;
            Some(event) = events.recv() => forward(emitter.as_ref(), &event).await,
            _ = &mut stop => {
                while let Ok(event) = events.try_recv() {
                    forward(emitter.as_ref(), &event).await;
                }
                break;
            }
        }
    }
}

async fn forward(emitter: Option<&SignalEmitter<'_>>, event: &Event) {
    let payload = event.to_json();
    tracing::info!(kind = event.kind(), %payload, "event");
    let Some(emitter) = emitter else {
        return;
    };
    if let Err(e) = FaceTrackService::tracking_event(emitter, &payload).await {
        tracing::warn!(kind = event.kind(), error = %e, "failed to emit D-Bus signal");
    }
}
