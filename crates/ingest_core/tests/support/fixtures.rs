#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use ingest_core::config::DeploymentConfig;

pub const BUCKET: &str = "insurance-emails";
pub const FUNCTION: &str = "email-receiver";

/// Deployment matching the sample config: `.pdf` uploads under `incoming/`.
pub fn deployment() -> DeploymentConfig {
    serde_json::from_value(serde_json::json!({
        "bucket_name": BUCKET,
        "stage": "dev",
        "function_name": FUNCTION,
        "timeout_seconds": 30,
        "memory_mb": 128,
        "filter": { "prefix": "incoming/", "suffix": ".pdf" },
        "environment": { "EXTRACTION_QUEUE": "claims-extraction" }
    }))
    .expect("deployment config should parse")
}

pub fn write_file(root: &Path, relative: &str, contents: &[u8]) -> PathBuf {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent dirs");
    }
    fs::write(&path, contents).expect("write fixture file");
    path
}

/// A function source tree with an entry point, a helper module and the
/// clutter the builder must leave out.
pub fn function_source(root: &Path) -> PathBuf {
    let source = root.join("function");
    write_file(&source, "bootstrap", b"#!/bin/sh\nexec ./handler\n");
    write_file(&source, "handler/receiver.py", b"def handler(event, context):\n    pass\n");
    write_file(&source, "handler/__pycache__/receiver.cpython-312.pyc", b"\x00\x01");
    write_file(&source, "tests/test_receiver.py", b"def test_it(): pass\n");
    write_file(&source, ".git/config", b"[core]\n");
    source
}
