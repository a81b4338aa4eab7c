//! Lambda-side integration for the email ingestion pipeline.
//!
//! This crate owns runtime details: decoding storage notifications, the
//! receiver handler and the adapters it calls through. Provisioning semantics
//! live in `ingest_core`.

pub mod adapters;
pub mod config;
pub mod handlers;
pub mod notification;
