pub mod canonical;
pub mod capture;
pub mod cli;
pub mod config;
pub mod fsutil;
pub mod handler;
pub mod model;
pub mod notify;
pub mod pipeline;
pub mod processor;
pub mod queue;
pub mod store;

pub use canonical::{canonicalize, ContentUid};
pub use capture::{BulletproofCapture, CaptureResult};
pub use config::Config;
pub use handler::{HandlerRegistry, IngestionHandler};
pub use notify::FailureNotifier;
pub use pipeline::Pipeline;
pub use processor::QueueProcessor;
pub use queue::ProcessingQueue;
pub use store::ContentStore;
