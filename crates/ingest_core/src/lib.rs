//! Deterministic provisioning model for the email ingestion pipeline.
//!
//! This crate owns the resource graph, the permission boundary, the artifact
//! builder and the object-store/event-router model. It intentionally excludes
//! AWS SDK and Lambda runtime concerns; those live in `ingest_lambda`.

pub mod artifact;
pub mod config;
pub mod error;
pub mod event;
pub mod function;
pub mod graph;
pub mod identity;
pub mod orchestrator;
pub mod router;
pub mod storage;

pub use error::{Error, Result};
