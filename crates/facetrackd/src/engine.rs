use crate::feed::FrameFeed;
use facetrack_core::pipeline::PipelineStatus;
use facetrack_core::{Ack, Event, EventSink, FacePipeline, Signal, SignalError};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Signal(#[from] SignalError),
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Signal {
        signal: Signal,
        reply: oneshot::Sender<Result<Ack, SignalError>>,
    },
    Status {
        reply: oneshot::Sender<PipelineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Apply one inbound signal and wait for its acknowledgment.
    pub async fn signal(&self, signal: Signal) -> Result<Ack, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Signal { signal, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    pub async fn status(&self) -> Result<PipelineStatus, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Status { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the signal engine on a dedicated OS thread.
///
/// Signals are applied one at a time in arrival order. Enrollment runs the
/// embedding model, so this work stays off the async runtime.
pub fn spawn_engine(pipeline: Arc<FacePipeline>) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("facetrack-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Signal { signal, reply } => {
                        let kind = signal.kind();
                        let result = pipeline.handle_signal(signal, Instant::now());
                        if let Err(e) = &result {
                            tracing::warn!(kind, error = %e, "signal rejected");
                        }
                        let _ = reply.send(result);
                    }
                    EngineRequest::Status { reply } => {
                        let _ = reply.send(pipeline.status(Instant::now()));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(|source| EngineError::Spawn { name: "engine", source })?;

    Ok(EngineHandle { tx })
}

/// Run the frame loop on its own OS thread until the feed is exhausted or
/// the pipeline shuts down.
pub fn spawn_frame_loop(
    pipeline: Arc<FacePipeline>,
    mut feed: Box<dyn FrameFeed>,
) -> Result<std::thread::JoinHandle<()>, EngineError> {
    std::thread::Builder::new()
        .name("facetrack-frames".into())
        .spawn(move || {
            tracing::info!("frame loop started");
            let mut frames = 0u64;
            while let Some(next) = feed.next_frame() {
                if pipeline.is_shut_down() {
                    break;
                }
                match next {
                    Ok(frame) => {
                        let report = pipeline.process_frame(&frame);
                        frames += 1;
                        tracing::debug!(
                            frame = frames,
                            skipped = report.skipped,
                            merged = report.merged,
                            identified = report.identified,
                            "frame done"
                        );
                    }
                    Err(e) => tracing::warn!(error = %e, "dropping unreadable frame"),
                }
            }
            tracing::info!(frames, "frame loop finished");
        })
        .map_err(|source| EngineError::Spawn { name: "frame loop", source })
}

/// Event sink feeding the async forwarder.
pub struct ChannelSink(pub mpsc::UnboundedSender<Event>);

impl EventSink for ChannelSink {
    fn emit(&self, event: Event) {
        if self.0.send(event).is_err() {
            tracing::debug!("event forwarder gone; event dropped");
        }
    }
}
