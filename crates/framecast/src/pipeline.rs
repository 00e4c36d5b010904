//! Multi-rate fan-out pipeline (the producer).
//!
//! The capture loop reads the source at the capture rate and overwrites a
//! single-slot watch channel with the newest tagged frame. Two branch tasks
//! sample that slot at their own rates, most-recent-wins:
//!
//! ```text
//! source --capture tick--> [latest frame] --ui tick----> resize -> jpeg/base64 -> relay
//!                                         \--queue tick-> resize -> ProcessingRequest -> WorkQueue
//! ```
//!
//! A failed write in one branch is logged and never affects the other branch
//! or the capture loop. Source reads, resizing and JPEG encoding run on the
//! blocking pool so the runtime stays free for the hub.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};

use crate::config::{Config, FrameSize};
use crate::frame::{Frame, UiMessage};
use crate::queue::WorkQueue;
use crate::relay::{UiConnector, UiSink};
use crate::source::{FrameSource, SourceFactory};
use crate::worker::{join_failure, run_blocking, Worker, WorkerError, PRODUCER};

/// Producer lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Relay and source not yet acquired
    Disconnected,
    /// Source held but no frame read since (re)acquisition or rewind
    SourceAcquired,
    /// Frames are flowing
    Streaming,
}

/// Timing and shaping of the pipeline
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub capture_interval: Duration,
    pub ui_interval: Duration,
    pub queue_interval: Duration,
    pub ui_frame_size: FrameSize,
    pub queue_frame_size: FrameSize,
    pub jpeg_quality: u8,
    pub source_check_interval: Duration,
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            capture_interval: config.capture_interval(),
            ui_interval: config.ui_interval(),
            queue_interval: config.queue_interval(),
            ui_frame_size: config.ui_frame_size,
            queue_frame_size: config.queue_frame_size,
            jpeg_quality: config.jpeg_quality,
            source_check_interval: config.source_check_interval(),
        }
    }
}

pub struct FanOutPipeline {
    settings: PipelineSettings,
    sources: Arc<dyn SourceFactory>,
    ui: Arc<dyn UiConnector>,
    queue: Arc<WorkQueue>,
    state: PipelineState,
}

impl FanOutPipeline {
    pub fn new(
        config: &Config,
        sources: Arc<dyn SourceFactory>,
        ui: Arc<dyn UiConnector>,
        queue: Arc<WorkQueue>,
    ) -> Self {
        Self::with_settings(PipelineSettings::from(config), sources, ui, queue)
    }

    pub fn with_settings(
        settings: PipelineSettings,
        sources: Arc<dyn SourceFactory>,
        ui: Arc<dyn UiConnector>,
        queue: Arc<WorkQueue>,
    ) -> Self {
        Self {
            settings,
            sources,
            ui,
            queue,
            state: PipelineState::Disconnected,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    fn transition(&mut self, next: PipelineState) {
        if self.state != next {
            log::info!("[producer] {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    async fn open_source(&self) -> Result<Box<dyn FrameSource>, WorkerError> {
        let sources = self.sources.clone();
        run_blocking(PRODUCER, move || sources.open())
            .await?
            .map_err(WorkerError::from)
    }

    /// Read one frame off the runtime; on end-of-stream rewind and emit nothing
    async fn capture(
        &mut self,
        mut source: Box<dyn FrameSource>,
    ) -> Result<(Box<dyn FrameSource>, Option<Frame>), WorkerError> {
        let (source, image) = run_blocking(PRODUCER, move || {
            let image = source.read();
            if image.is_none() {
                source.reset_to_start();
            }
            (source, image)
        })
        .await?;

        let frame = match image {
            Some(image) => {
                self.transition(PipelineState::Streaming);
                Some(Frame::capture(image))
            }
            None => {
                log::debug!("[producer] End of stream, rewound source");
                self.transition(PipelineState::SourceAcquired);
                None
            }
        };
        Ok((source, frame))
    }

    /// Swap in a fresh source if the current one closed. Failure keeps the
    /// old handle and is retried on the next check.
    async fn check_source(&mut self, source: &mut Box<dyn FrameSource>) -> Result<(), WorkerError> {
        if source.is_open() {
            return Ok(());
        }
        log::error!("[producer] Source is no longer open, reacquiring");
        self.transition(PipelineState::SourceAcquired);
        let sources = self.sources.clone();
        match run_blocking(PRODUCER, move || sources.open()).await? {
            Ok(fresh) => {
                *source = fresh;
                log::info!("[producer] Source reacquired");
            }
            Err(e) => log::warn!("[producer] Failed to reacquire source: {}", e),
        }
        Ok(())
    }
}

#[async_trait]
impl Worker for FanOutPipeline {
    async fn run(mut self: Box<Self>, mut shutdown: watch::Receiver<()>) -> Result<(), WorkerError> {
        let ui_sink = self.ui.connect().await?;
        let mut source = self.open_source().await?;
        self.transition(PipelineState::SourceAcquired);

        let (latest_tx, latest_rx) = watch::channel::<Option<Frame>>(None);

        // Owned by this future: aborting the producer aborts its branches
        let mut branches = JoinSet::new();
        branches.spawn(ui_branch(
            ui_sink,
            latest_rx.clone(),
            self.settings.clone(),
            shutdown.clone(),
        ));
        branches.spawn(queue_branch(
            self.queue.clone(),
            latest_rx,
            self.settings.clone(),
            shutdown.clone(),
        ));

        let mut capture_tick = interval(self.settings.capture_interval);
        capture_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let check_period = self.settings.source_check_interval;
        let mut check_tick = interval_at(Instant::now() + check_period, check_period);
        check_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        log::info!("[producer] Started frame stream");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => break,

                // Branches only finish on shutdown, anything earlier is a failure
                Some(joined) = branches.join_next() => {
                    branch_result(joined)?;
                    break;
                }

                _ = check_tick.tick() => self.check_source(&mut source).await?,

                _ = capture_tick.tick() => {
                    let (returned, frame) = self.capture(source).await?;
                    source = returned;
                    if let Some(frame) = frame {
                        latest_tx.send_replace(Some(frame));
                    }
                }
            }
        }

        log::info!("[producer] Stopping frame stream");
        drop(latest_tx);
        while let Some(joined) = branches.join_next().await {
            branch_result(joined)?;
        }
        Ok(())
    }
}

fn branch_result(joined: Result<Result<(), WorkerError>, JoinError>) -> Result<(), WorkerError> {
    joined.map_err(|e| join_failure(PRODUCER, e))?
}

/// Take the newest frame if one arrived since the last sample.
///
/// Frames overwritten in between are never seen.
pub fn sample_latest(latest: &mut watch::Receiver<Option<Frame>>) -> Option<Frame> {
    if !latest.has_changed().unwrap_or(false) {
        return None;
    }
    latest.borrow_and_update().clone()
}

fn branch_interval(period: Duration) -> tokio::time::Interval {
    let mut tick = interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    tick
}

async fn ui_branch(
    mut sink: Box<dyn UiSink>,
    mut latest: watch::Receiver<Option<Frame>>,
    settings: PipelineSettings,
    mut shutdown: watch::Receiver<()>,
) -> Result<(), WorkerError> {
    let mut tick = branch_interval(settings.ui_interval);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                let Some(frame) = sample_latest(&mut latest) else { continue };
                let correlation_id = frame.correlation_id();
                let (size, quality) = (settings.ui_frame_size, settings.jpeg_quality);
                let encoded = run_blocking(PRODUCER, move || {
                    UiMessage::from_frame(&frame.resized(size), quality)
                })
                .await?;
                let message = match encoded {
                    Ok(message) => message,
                    Err(e) => {
                        log::error!("[producer] Failed to encode frame {}: {}", correlation_id, e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(message).await {
                    log::error!(
                        "[producer] Error writing frame {} to socket: {}",
                        correlation_id,
                        e
                    );
                }
            }
        }
    }
    Ok(())
}

async fn queue_branch(
    queue: Arc<WorkQueue>,
    mut latest: watch::Receiver<Option<Frame>>,
    settings: PipelineSettings,
    mut shutdown: watch::Receiver<()>,
) -> Result<(), WorkerError> {
    let mut tick = branch_interval(settings.queue_interval);
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = tick.tick() => {
                let Some(frame) = sample_latest(&mut latest) else { continue };
                let correlation_id = frame.correlation_id();
                let size = settings.queue_frame_size;
                let request =
                    run_blocking(PRODUCER, move || frame.resized(size).into_request()).await?;
                if !queue.add_item(request) {
                    log::warn!("[producer] Queue rejected frame {}", correlation_id);
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    #[test]
    fn test_sample_latest_is_most_recent_wins() {
        let (tx, mut rx) = watch::channel::<Option<Frame>>(None);
        assert!(sample_latest(&mut rx).is_none());

        let frames: Vec<Frame> = (0..3)
            .map(|_| Frame::capture(RgbImage::new(2, 2)))
            .collect();
        for frame in &frames {
            tx.send_replace(Some(frame.clone()));
        }

        let sampled = sample_latest(&mut rx).unwrap();
        assert_eq!(sampled.correlation_id(), frames[2].correlation_id());
        // Nothing new since the last sample
        assert!(sample_latest(&mut rx).is_none());

        let next = Frame::capture(RgbImage::new(2, 2));
        tx.send_replace(Some(next.clone()));
        assert_eq!(
            sample_latest(&mut rx).unwrap().correlation_id(),
            next.correlation_id()
        );
    }

    #[test]
    fn test_sample_latest_after_sender_dropped() {
        let (tx, mut rx) = watch::channel::<Option<Frame>>(None);
        tx.send_replace(Some(Frame::capture(RgbImage::new(1, 1))));
        drop(tx);
        assert!(sample_latest(&mut rx).is_none());
    }

    #[tokio::test]
    async fn test_end_of_stream_returns_to_source_acquired() {
        use crate::config::SourceConfig;
        use crate::relay::RelayConnector;
        use crate::source::SyntheticSource;

        let mut pipeline = FanOutPipeline::new(
            &Config::default(),
            Arc::new(SourceConfig::default()),
            Arc::new(RelayConnector::new("ws://127.0.0.1:9/unused")),
            Arc::new(WorkQueue::unbounded()),
        );
        assert_eq!(pipeline.state(), PipelineState::Disconnected);

        let source: Box<dyn FrameSource> = Box::new(SyntheticSource::new(4, 4, 1).unwrap());
        let (source, frame) = pipeline.capture(source).await.unwrap();
        assert!(frame.is_some());
        assert_eq!(pipeline.state(), PipelineState::Streaming);

        let (source, frame) = pipeline.capture(source).await.unwrap();
        assert!(frame.is_none());
        assert_eq!(pipeline.state(), PipelineState::SourceAcquired);

        // Rewound: the single frame is readable again
        let (_, frame) = pipeline.capture(source).await.unwrap();
        assert!(frame.is_some());
        assert_eq!(pipeline.state(), PipelineState::Streaming);
    }

    #[test]
    fn test_settings_from_config() {
        let config = Config {
            capture_rate: 20.0,
            ui_rate: 10.0,
            queue_rate: 4.0,
            ..Config::default()
        };
        let settings = PipelineSettings::from(&config);
        assert_eq!(settings.capture_interval, Duration::from_millis(50));
        assert_eq!(settings.ui_interval, Duration::from_millis(100));
        assert_eq!(settings.queue_interval, Duration::from_millis(250));
        assert_eq!(settings.source_check_interval, Duration::from_secs(10));
    }
}
