//! Ingestion pipeline (§4.6) and background task runner (§4.11).

pub mod pipeline;
pub mod runner;

pub use pipeline::IngestionPipeline;
pub use runner::{BackgroundTaskRunner, Operation};
