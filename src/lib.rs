//! Librarian ingest: download completion detection and library import
//!
//! Polls download clients for finished downloads, resolves their payload
//! on local disk and imports the audio into the library through a durable
//! processing queue.

pub mod api;
pub mod app;
pub mod config;
pub mod db;
pub mod jobs;
pub mod pipeline;
pub mod services;

pub use app::{AppState, build_app};
pub use config::{Config, PipelineSettings};
pub use db::Database;
pub use pipeline::Pipeline;
