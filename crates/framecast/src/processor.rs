//! Consumer: drains the work queue and runs inference on every request.
//!
//! Any inference failure ends the worker with an error, which the supervisor
//! escalates to process termination.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

use crate::frame::ProcessingRequest;
use crate::inference::Inferer;
use crate::queue::WorkQueue;
use crate::worker::{Worker, WorkerError};

pub struct FrameProcessor {
    queue: Arc<WorkQueue>,
    inferer: Arc<dyn Inferer>,
    poll_interval: Duration,
}

impl FrameProcessor {
    pub fn new(queue: Arc<WorkQueue>, inferer: Arc<dyn Inferer>, poll_interval: Duration) -> Self {
        Self {
            queue,
            inferer,
            poll_interval,
        }
    }

    async fn process(&self, request: ProcessingRequest) -> Result<(), WorkerError> {
        let ProcessingRequest {
            correlation_id,
            payload,
        } = request;
        log::info!("[consumer] Received {}", correlation_id);

        let inferer = self.inferer.clone();
        let started = Instant::now();
        let result = tokio::task::spawn_blocking(move || inferer.infer(&payload)).await;

        match result {
            Ok(Ok(detections)) => {
                log::info!(
                    "[consumer] Inference for {} took {:?} ({} detections)",
                    correlation_id,
                    started.elapsed(),
                    detections.len()
                );
                Ok(())
            }
            Ok(Err(e)) => Err(WorkerError::Inference {
                correlation_id,
                source: e,
            }),
            Err(e) => Err(WorkerError::InferencePanicked {
                correlation_id,
                message: e.to_string(),
            }),
        }
    }
}

#[async_trait]
impl Worker for FrameProcessor {
    async fn run(self: Box<Self>, mut shutdown: watch::Receiver<()>) -> Result<(), WorkerError> {
        log::info!("[consumer] Started");
        loop {
            if shutdown.has_changed().unwrap_or(true) {
                break;
            }

            match self.queue.get_item() {
                Some(request) => self.process(request).await?,
                None => {
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }
        log::info!("[consumer] Stopped");
        Ok(())
    }
}
