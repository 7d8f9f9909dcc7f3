pub mod batcher;
pub mod collapse;
pub mod config;
pub mod coverage;
pub mod db;
pub mod error;
pub mod gateway;
pub mod models;
pub mod ollama;
pub mod pipeline;
pub mod qdrant_store;
pub mod query;
pub mod retrieval;
pub mod review;
pub mod server;
pub mod store;
pub mod synthesis;
pub mod tantivy_store;
pub mod text;

#[cfg(test)]
mod testing;

pub use config::AppConfig;
pub use error::{PipelineError, PipelineResult};
pub use pipeline::NarrativeService;
pub use server::run_server;
