#![allow(dead_code)]

use ingest_core::graph::ingestion_graph;
use ingest_core::orchestrator::{Orchestrator, SimulatedPlatform};

use super::fixtures::deployment;

pub const ARTIFACT_HASH: &str =
    "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

/// A platform with the sample deployment already applied.
pub fn deployed_platform() -> SimulatedPlatform {
    let graph = ingestion_graph(&deployment(), ARTIFACT_HASH).expect("ingestion graph");
    let mut platform = SimulatedPlatform::new();
    let report = platform.apply(&graph).expect("apply");
    assert!(report.is_success(), "initial apply failed: {report:?}");
    platform
}
