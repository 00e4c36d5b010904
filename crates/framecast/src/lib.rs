//! Framecast: captures frames at one rate, fans them out to a live view and to
//! an inference queue at independent rates, and supervises the workers doing it.

pub mod config;
pub mod frame;
pub mod hub;
pub mod inference;
pub mod pipeline;
pub mod processor;
pub mod queue;
pub mod relay;
pub mod source;
pub mod supervisor;
pub mod worker;

// Re-export commonly used types
pub use config::{Config, ConfigError, FrameSize, SourceConfig};
pub use frame::{Frame, ProcessingRequest, UiMessage};
pub use hub::Hub;
pub use queue::WorkQueue;
pub use supervisor::{Supervisor, SupervisorError, TerminationPolicy};
pub use worker::{fatal_channel, FatalNotifier, FatalReport, Worker, WorkerError, WorkerFactory};
