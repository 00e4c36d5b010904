//! Worker supervisor
//!
//! Owns the producer and consumer units and the queue between them. Start,
//! stop and restart always operate on the pair; every start gets a fresh queue.

use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::queue::WorkQueue;
use crate::worker::{panic_message, FatalNotifier, Worker, WorkerError, WorkerFactory};

pub use crate::worker::{CONSUMER, PRODUCER};

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Could not terminate {unit} after {attempts} attempts")]
    TerminationFailed { unit: String, attempts: u32 },
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

/// A single failed attempt to stop a unit
#[derive(Debug, Error)]
#[error("{unit} did not stop within {timeout:?}")]
pub struct TerminateError {
    pub unit: String,
    pub timeout: Duration,
}

/// Something the supervisor can ask to stop
#[async_trait]
pub trait Terminate: Send {
    fn name(&self) -> &str;

    /// One graceful stop attempt bounded by `timeout`
    async fn terminate(&mut self, timeout: Duration) -> std::result::Result<(), TerminateError>;
}

/// How hard the supervisor tries before declaring a unit unstoppable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminationPolicy {
    /// Attempts after the first one
    pub retries: u32,
    /// Budget of each attempt
    pub timeout: Duration,
}

impl Default for TerminationPolicy {
    fn default() -> Self {
        Self {
            retries: 3,
            timeout: Duration::from_secs(1),
        }
    }
}

impl From<&Config> for TerminationPolicy {
    fn from(config: &Config) -> Self {
        Self {
            retries: config.terminate_retries,
            timeout: config.terminate_timeout(),
        }
    }
}

/// Stop `unit`, retrying up to `policy.retries` times after the first attempt
pub async fn terminate_with_retry<T: Terminate + ?Sized>(
    unit: &mut T,
    policy: &TerminationPolicy,
) -> Result<()> {
    let attempts = policy.retries + 1;
    for attempt in 1..=attempts {
        log::info!(
            "Terminating {} (attempt {}/{})...",
            unit.name(),
            attempt,
            attempts
        );
        match unit.terminate(policy.timeout).await {
            Ok(()) => return Ok(()),
            Err(e) => log::warn!("{}", e),
        }
    }

    log::error!("Could not terminate {}", unit.name());
    Err(SupervisorError::TerminationFailed {
        unit: unit.name().to_string(),
        attempts,
    })
}

/// Supervisor-owned handle to a running worker task
pub struct WorkerHandle {
    name: String,
    shutdown: watch::Sender<()>,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Spawn `worker`; an error it returns or a panic inside it is escalated
    /// through `fatal`
    pub fn spawn(name: &str, worker: Box<dyn Worker>, fatal: FatalNotifier) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(());
        let unit = name.to_string();
        let task = tokio::spawn(async move {
            let result = AssertUnwindSafe(worker.run(shutdown_rx))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| {
                    Err(WorkerError::Panicked {
                        unit: unit.clone(),
                        message: panic_message(&*payload),
                    })
                });
            match result {
                Ok(()) => log::info!("[{}] Exited", unit),
                Err(e) => fatal.notify(&unit, e),
            }
        });
        Self {
            name: name.to_string(),
            shutdown,
            task,
        }
    }

    pub fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }

    /// Last resort once graceful termination is exhausted
    fn abort(&self) {
        self.task.abort();
    }
}

#[async_trait]
impl Terminate for WorkerHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn terminate(&mut self, timeout: Duration) -> std::result::Result<(), TerminateError> {
        // Fails only when the worker already dropped its receiver
        let _ = self.shutdown.send(());
        match tokio::time::timeout(timeout, &mut self.task).await {
            Ok(_) => Ok(()),
            Err(_) => Err(TerminateError {
                unit: self.name.clone(),
                timeout,
            }),
        }
    }
}

pub struct Supervisor {
    factory: Arc<dyn WorkerFactory>,
    fatal: FatalNotifier,
    policy: TerminationPolicy,
    queue_capacity: Option<usize>,
    queue: Arc<WorkQueue>,
    producer: Option<WorkerHandle>,
    consumer: Option<WorkerHandle>,
}

impl Supervisor {
    pub fn new(
        factory: Arc<dyn WorkerFactory>,
        fatal: FatalNotifier,
        policy: TerminationPolicy,
        queue_capacity: Option<usize>,
    ) -> Self {
        Self {
            factory,
            fatal,
            policy,
            queue_capacity,
            queue: Arc::new(WorkQueue::new(queue_capacity)),
            producer: None,
            consumer: None,
        }
    }

    pub fn from_config(
        factory: Arc<dyn WorkerFactory>,
        fatal: FatalNotifier,
        config: &Config,
    ) -> Self {
        Self::new(
            factory,
            fatal,
            TerminationPolicy::from(config),
            config.queue_capacity,
        )
    }

    /// Queue shared by the current producer/consumer pair
    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn producer_alive(&self) -> bool {
        self.producer.as_ref().is_some_and(WorkerHandle::is_alive)
    }

    pub fn consumer_alive(&self) -> bool {
        self.consumer.as_ref().is_some_and(WorkerHandle::is_alive)
    }

    pub fn is_running(&self) -> bool {
        self.producer_alive() || self.consumer_alive()
    }

    /// Launch a producer and a consumer over a fresh queue.
    ///
    /// Returns false without side effects if either unit is still alive.
    pub fn start(&mut self) -> bool {
        log::info!("Starting all workers...");
        if self.producer_alive() {
            log::info!("{} is already running...", PRODUCER);
            return false;
        }
        if self.consumer_alive() {
            log::info!("{} is already running...", CONSUMER);
            return false;
        }

        self.queue = Arc::new(WorkQueue::new(self.queue_capacity));

        let producer = self.factory.producer(self.queue.clone());
        self.producer = Some(WorkerHandle::spawn(PRODUCER, producer, self.fatal.clone()));

        let consumer = self.factory.consumer(self.queue.clone());
        self.consumer = Some(WorkerHandle::spawn(CONSUMER, consumer, self.fatal.clone()));

        log::info!("Started all workers...");
        true
    }

    /// Stop every live unit and close the queue.
    ///
    /// Every unit gets its attempts even when an earlier one could not be
    /// stopped. An error names the first unit that survived all attempts; the
    /// caller must treat it as fatal.
    pub async fn stop(&mut self) -> Result<bool> {
        log::info!("Stopping all workers...");
        let mut first_error = None;
        for slot in [&mut self.producer, &mut self.consumer] {
            let Some(mut handle) = slot.take() else {
                continue;
            };
            if !handle.is_alive() {
                continue;
            }
            match terminate_with_retry(&mut handle, &self.policy).await {
                Ok(()) => log::info!("{} is stopped...", handle.name()),
                Err(e) => {
                    log::error!("Aborting {}", handle.name());
                    handle.abort();
                    first_error.get_or_insert(e);
                }
            }
        }

        self.queue.close();
        log::info!("Queue is closed...");

        match first_error {
            Some(e) => Err(e),
            None => {
                log::info!("Stopped all workers...");
                Ok(true)
            }
        }
    }

    /// `stop` then `start`. Not atomic: a failed stop leaves nothing running.
    pub async fn restart(&mut self) -> Result<bool> {
        log::info!("Restarting all workers...");
        self.stop().await?;
        let started = self.start();
        log::info!("Restarted all workers...");
        Ok(started)
    }
}
