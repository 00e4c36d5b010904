//! Test helpers for framecast integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use image::{Rgb, RgbImage};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use framecast::config::FrameSize;
use framecast::hub::{self, Hub, HubError};
use framecast::inference::{Detections, InferError, Inferer};
use framecast::pipeline::PipelineSettings;
use framecast::relay::{RelayError, UiConnector, UiSink};
use framecast::source::{FrameSource, SourceError, SourceFactory};
use framecast::{UiMessage, WorkQueue, Worker, WorkerError, WorkerFactory};

/// Small frames and fast rates so tests stay cheap
pub fn test_settings() -> PipelineSettings {
    PipelineSettings {
        capture_interval: Duration::from_secs_f64(1.0 / 30.0),
        ui_interval: Duration::from_secs_f64(1.0 / 15.0),
        queue_interval: Duration::from_secs_f64(1.0 / 5.0),
        ui_frame_size: FrameSize::new(32, 24),
        queue_frame_size: FrameSize::new(16, 12),
        jpeg_quality: 80,
        source_check_interval: Duration::from_secs(10),
    }
}

// ---------------------------------------------------------------------------
// Live view sinks
// ---------------------------------------------------------------------------

/// Connector whose sinks record every message they are given
#[derive(Clone, Default)]
pub struct RecordingConnector {
    pub messages: Arc<Mutex<Vec<UiMessage>>>,
    pub connects: Arc<AtomicUsize>,
    /// Sinks handed out and not dropped yet
    pub live_sinks: Arc<AtomicUsize>,
}

impl RecordingConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<UiMessage> {
        self.messages.lock().unwrap().clone()
    }

    pub fn live_sinks(&self) -> usize {
        self.live_sinks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UiConnector for RecordingConnector {
    async fn connect(&self) -> Result<Box<dyn UiSink>, RelayError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.live_sinks.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(RecordingSink {
            messages: self.messages.clone(),
            live_sinks: self.live_sinks.clone(),
        }))
    }
}

pub struct RecordingSink {
    messages: Arc<Mutex<Vec<UiMessage>>>,
    live_sinks: Arc<AtomicUsize>,
}

#[async_trait]
impl UiSink for RecordingSink {
    async fn send(&mut self, message: UiMessage) -> Result<(), RelayError> {
        self.messages.lock().unwrap().push(message);
        Ok(())
    }
}

impl Drop for RecordingSink {
    fn drop(&mut self) {
        self.live_sinks.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Connector whose sink panics on the first send
pub struct PanickingConnector;

#[async_trait]
impl UiConnector for PanickingConnector {
    async fn connect(&self) -> Result<Box<dyn UiSink>, RelayError> {
        Ok(Box::new(PanickingSink))
    }
}

pub struct PanickingSink;

#[async_trait]
impl UiSink for PanickingSink {
    async fn send(&mut self, _message: UiMessage) -> Result<(), RelayError> {
        panic!("socket buffer accounting went negative");
    }
}

/// Connector that can never reach its endpoint
pub struct FailingConnector;

#[async_trait]
impl UiConnector for FailingConnector {
    async fn connect(&self) -> Result<Box<dyn UiSink>, RelayError> {
        Err(RelayError::WebSocket(
            tokio_tungstenite::tungstenite::Error::ConnectionClosed,
        ))
    }
}

// ---------------------------------------------------------------------------
// Frame sources
// ---------------------------------------------------------------------------

/// Shared counters of every source a `CountingSourceFactory` opened
#[derive(Clone, Default)]
pub struct SourceStats {
    pub opens: Arc<AtomicUsize>,
    pub reads: Arc<AtomicUsize>,
    pub resets: Arc<AtomicUsize>,
}

impl SourceStats {
    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
}

/// Source of `frames` flat frames that reports end-of-stream afterwards.
///
/// With `close_after` set it turns closed after that many reads and yields
/// nothing more, like a camera that went away.
pub struct CountingSource {
    frames: u32,
    position: u32,
    reads: usize,
    close_after: Option<usize>,
    stats: SourceStats,
}

impl FrameSource for CountingSource {
    fn read(&mut self) -> Option<RgbImage> {
        if !self.is_open() {
            return None;
        }
        self.reads += 1;
        self.stats.reads.fetch_add(1, Ordering::SeqCst);
        if self.position >= self.frames {
            return None;
        }
        self.position += 1;
        let shade = (self.position % 256) as u8;
        Some(RgbImage::from_pixel(64, 48, Rgb([shade, shade, shade])))
    }

    fn reset_to_start(&mut self) {
        self.stats.resets.fetch_add(1, Ordering::SeqCst);
        self.position = 0;
    }

    fn is_open(&self) -> bool {
        self.close_after.map_or(true, |limit| self.reads < limit)
    }
}

pub struct CountingSourceFactory {
    pub frames: u32,
    pub close_after: Option<usize>,
    pub stats: SourceStats,
}

impl CountingSourceFactory {
    pub fn new(frames: u32) -> Self {
        Self {
            frames,
            close_after: None,
            stats: SourceStats::default(),
        }
    }

    pub fn closing_after(mut self, reads: usize) -> Self {
        self.close_after = Some(reads);
        self
    }
}

impl SourceFactory for CountingSourceFactory {
    fn open(&self) -> Result<Box<dyn FrameSource>, SourceError> {
        self.stats.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountingSource {
            frames: self.frames,
            position: 0,
            reads: 0,
            close_after: self.close_after,
            stats: self.stats.clone(),
        }))
    }
}

/// Factory whose source is never available
pub struct MissingSourceFactory;

impl SourceFactory for MissingSourceFactory {
    fn open(&self) -> Result<Box<dyn FrameSource>, SourceError> {
        Err(SourceError::NoFrames("/dev/video-missing".into()))
    }
}

// ---------------------------------------------------------------------------
// Inference
// ---------------------------------------------------------------------------

/// Inferer that rejects every frame
pub struct RejectingInferer;

impl Inferer for RejectingInferer {
    fn infer(&self, _frame: &RgbImage) -> Result<Detections, InferError> {
        Err(InferError::Failed("model rejected input".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

/// How a scripted worker behaves once started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Waits for shutdown, then exits cleanly
    Idle,
    /// Ignores shutdown forever
    Stubborn,
    /// Fails as soon as it runs
    Failing,
    /// Panics as soon as it runs
    Panicking,
}

pub struct ScriptedWorker {
    behavior: Behavior,
    dropped: Arc<AtomicUsize>,
}

impl Drop for ScriptedWorker {
    fn drop(&mut self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Worker for ScriptedWorker {
    async fn run(self: Box<Self>, mut shutdown: watch::Receiver<()>) -> Result<(), WorkerError> {
        match self.behavior {
            Behavior::Idle => {
                let _ = shutdown.changed().await;
                Ok(())
            }
            Behavior::Stubborn => std::future::pending().await,
            Behavior::Failing => Err(WorkerError::Source(SourceError::NoFrames(
                "/dev/video-missing".into(),
            ))),
            Behavior::Panicking => panic!("bookkeeping bug in worker"),
        }
    }
}

/// Factory building scripted workers, recording the queue of every build
pub struct ScriptedFactory {
    pub producer: Behavior,
    pub consumer: Behavior,
    pub queues: Mutex<Vec<Arc<WorkQueue>>>,
    pub producers_built: AtomicUsize,
    pub consumers_built: AtomicUsize,
    /// Workers whose state has been dropped, after finishing or being aborted
    pub dropped: Arc<AtomicUsize>,
}

impl ScriptedFactory {
    pub fn new(producer: Behavior, consumer: Behavior) -> Self {
        Self {
            producer,
            consumer,
            queues: Mutex::new(Vec::new()),
            producers_built: AtomicUsize::new(0),
            consumers_built: AtomicUsize::new(0),
            dropped: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn idle() -> Self {
        Self::new(Behavior::Idle, Behavior::Idle)
    }

    pub fn producers_built(&self) -> usize {
        self.producers_built.load(Ordering::SeqCst)
    }

    pub fn consumers_built(&self) -> usize {
        self.consumers_built.load(Ordering::SeqCst)
    }

    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }

    pub fn queues(&self) -> Vec<Arc<WorkQueue>> {
        self.queues.lock().unwrap().clone()
    }
}

impl WorkerFactory for ScriptedFactory {
    fn producer(&self, queue: Arc<WorkQueue>) -> Box<dyn Worker> {
        self.producers_built.fetch_add(1, Ordering::SeqCst);
        self.queues.lock().unwrap().push(queue);
        Box::new(ScriptedWorker {
            behavior: self.producer,
            dropped: self.dropped.clone(),
        })
    }

    fn consumer(&self, _queue: Arc<WorkQueue>) -> Box<dyn Worker> {
        self.consumers_built.fetch_add(1, Ordering::SeqCst);
        Box::new(ScriptedWorker {
            behavior: self.consumer,
            dropped: self.dropped.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// Hub
// ---------------------------------------------------------------------------

/// Serve a hub on an ephemeral localhost port
pub async fn spawn_hub() -> (SocketAddr, Arc<Hub>, JoinHandle<Result<(), HubError>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hub = Arc::new(Hub::new());
    let task = tokio::spawn(hub::serve(listener, hub.clone()));
    (addr, hub, task)
}

pub fn subscriber_url(addr: SocketAddr) -> String {
    format!("ws://{}{}", addr, hub::SUBSCRIBER_PATH)
}

pub fn ingress_url(addr: SocketAddr) -> String {
    format!("ws://{}{}", addr, hub::INGRESS_PATH)
}

/// Poll `condition` until it holds, panicking after `timeout`
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}
