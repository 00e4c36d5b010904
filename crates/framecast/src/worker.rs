//! Worker lifecycle primitives shared by the producer, the consumer and the
//! supervisor.

use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinError;
use uuid::Uuid;

use crate::config::Config;
use crate::inference::{InferError, Inferer};
use crate::pipeline::FanOutPipeline;
use crate::processor::FrameProcessor;
use crate::queue::WorkQueue;
use crate::relay::{RelayError, UiConnector};
use crate::source::{SourceError, SourceFactory};

/// Errors that end a worker. Every one of them is fatal to the process.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Inference failed for {correlation_id}: {source}")]
    Inference {
        correlation_id: Uuid,
        #[source]
        source: InferError,
    },

    #[error("Inference panicked for {correlation_id}: {message}")]
    InferencePanicked { correlation_id: Uuid, message: String },

    #[error("{unit} panicked: {message}")]
    Panicked { unit: String, message: String },
}

pub const PRODUCER: &str = "producer";
pub const CONSUMER: &str = "consumer";

/// Best effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Map a failed join of one of `unit`'s tasks to a worker error
pub fn join_failure(unit: &str, error: JoinError) -> WorkerError {
    let message = if error.is_panic() {
        panic_message(&*error.into_panic())
    } else {
        error.to_string()
    };
    WorkerError::Panicked {
        unit: unit.to_string(),
        message,
    }
}

/// Run `f` on the blocking pool; a panic in it becomes `WorkerError::Panicked`
pub async fn run_blocking<T, F>(unit: &str, f: F) -> Result<T, WorkerError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| join_failure(unit, e))
}

/// A long running unit owned by the supervisor.
///
/// `run` must return soon after `shutdown` fires (or its sender is dropped).
#[async_trait]
pub trait Worker: Send {
    async fn run(self: Box<Self>, shutdown: watch::Receiver<()>) -> Result<(), WorkerError>;
}

/// Builds a fresh producer/consumer pair bound to one queue
pub trait WorkerFactory: Send + Sync {
    fn producer(&self, queue: Arc<WorkQueue>) -> Box<dyn Worker>;
    fn consumer(&self, queue: Arc<WorkQueue>) -> Box<dyn Worker>;
}

/// A worker failure reported for process teardown
#[derive(Debug)]
pub struct FatalReport {
    pub unit: String,
    pub error: WorkerError,
}

/// Clonable handle workers use to escalate unrecoverable failures
#[derive(Debug, Clone)]
pub struct FatalNotifier {
    tx: mpsc::UnboundedSender<FatalReport>,
}

pub fn fatal_channel() -> (FatalNotifier, mpsc::UnboundedReceiver<FatalReport>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (FatalNotifier { tx }, rx)
}

impl FatalNotifier {
    pub fn notify(&self, unit: &str, error: WorkerError) {
        log::error!("[{}] Fatal error: {}", unit, error);
        if self
            .tx
            .send(FatalReport {
                unit: unit.to_string(),
                error,
            })
            .is_err()
        {
            log::error!("[{}] Nobody is listening for fatal errors", unit);
        }
    }
}

/// Production wiring: fan-out pipeline as producer, frame processor as consumer
pub struct PipelineFactory {
    config: Config,
    sources: Arc<dyn SourceFactory>,
    ui: Arc<dyn UiConnector>,
    inferer: Arc<dyn Inferer>,
}

impl PipelineFactory {
    pub fn new(
        config: Config,
        sources: Arc<dyn SourceFactory>,
        ui: Arc<dyn UiConnector>,
        inferer: Arc<dyn Inferer>,
    ) -> Self {
        Self {
            config,
            sources,
            ui,
            inferer,
        }
    }
}

impl WorkerFactory for PipelineFactory {
    fn producer(&self, queue: Arc<WorkQueue>) -> Box<dyn Worker> {
        Box::new(FanOutPipeline::new(
            &self.config,
            self.sources.clone(),
            self.ui.clone(),
            queue,
        ))
    }

    fn consumer(&self, queue: Arc<WorkQueue>) -> Box<dyn Worker> {
        Box::new(FrameProcessor::new(
            queue,
            self.inferer.clone(),
            self.config.queue_poll_interval(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fatal_notifier_delivers_report() {
        let (notifier, mut rx) = fatal_channel();
        let cloned = notifier.clone();
        cloned.notify(
            "consumer",
            WorkerError::InferencePanicked {
                correlation_id: Uuid::nil(),
                message: "boom".to_string(),
            },
        );

        let report = rx.recv().await.unwrap();
        assert_eq!(report.unit, "consumer");
        assert!(matches!(
            report.error,
            WorkerError::InferencePanicked { .. }
        ));
    }

    #[tokio::test]
    async fn test_run_blocking_turns_panic_into_error() {
        let result: Result<(), WorkerError> =
            run_blocking(PRODUCER, || panic!("decoder state corrupted")).await;
        match result {
            Err(WorkerError::Panicked { unit, message }) => {
                assert_eq!(unit, "producer");
                assert_eq!(message, "decoder state corrupted");
            }
            other => panic!("unexpected result: {:?}", other),
        }

        assert_eq!(run_blocking(CONSUMER, || 7).await.unwrap(), 7);
    }

    #[test]
    fn test_panic_message_formats() {
        let formatted: Box<dyn Any + Send> = Box::new(format!("frame {}", 3));
        assert_eq!(panic_message(&*formatted), "frame 3");
        let opaque: Box<dyn Any + Send> = Box::new(42u32);
        assert_eq!(panic_message(&*opaque), "unknown panic payload");
    }

    #[test]
    fn test_fatal_notifier_without_listener_does_not_panic() {
        let (notifier, rx) = fatal_channel();
        drop(rx);
        notifier.notify(
            "producer",
            WorkerError::Source(SourceError::NoFrames("/nowhere".into())),
        );
    }
}
