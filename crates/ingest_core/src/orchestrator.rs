//! Applies a desired graph in dependency order.
//!
//! The orchestrator walks `DesiredGraph::apply_order` one resource at a time
//! and stops at the first failure. Resources applied before the failure stay
//! applied; re-running the same graph converges because every step reports
//! `Unchanged` when the live state already matches.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{Error, Result};
use crate::event::EventSink;
use crate::function::FunctionRegistry;
use crate::graph::{DesiredGraph, Resource, ResourceId};
use crate::identity::{
    bucket_arn, Action, IdentityId, InvokeGrant, PermissionBoundary, ResourceScope,
    OBJECT_STORE_PRINCIPAL,
};
use crate::router::{Delivery, EventRouter, SubscribeResult, Subscription};
use crate::storage::InMemoryObjectStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ApplyOutcome {
    Created,
    Updated,
    Unchanged,
    Failed { reason: String },
}

impl ApplyOutcome {
    pub fn is_change(&self) -> bool {
        matches!(self, Self::Created | Self::Updated)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceOutcome {
    pub id: ResourceId,
    #[serde(flatten)]
    pub outcome: ApplyOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub outcomes: Vec<ResourceOutcome>,
    /// The resource the apply stopped at, if any.
    pub halted_at: Option<ResourceId>,
}

impl ApplyReport {
    pub fn is_success(&self) -> bool {
        self.halted_at.is_none()
    }

    pub fn outcome(&self, id: &ResourceId) -> Option<&ApplyOutcome> {
        self.outcomes
            .iter()
            .find(|entry| &entry.id == id)
            .map(|entry| &entry.outcome)
    }

    pub fn changed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|entry| entry.outcome.is_change())
            .count()
    }
}

/// Submits desired state to a platform. Graph-level errors (cycles, dangling
/// references) are returned before anything is applied; per-resource failures
/// land in the report.
pub trait Orchestrator {
    fn apply(&mut self, graph: &DesiredGraph) -> Result<ApplyReport>;
}

/// Result of pushing queued deliveries through a handler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub acknowledged: usize,
    pub left_for_retry: usize,
    pub failed: usize,
}

/// In-process platform: stores, identities, functions and the router live in
/// memory. Used by the CLI plan and by every provisioning test.
pub struct SimulatedPlatform {
    boundary: PermissionBoundary,
    functions: FunctionRegistry,
    router: Arc<EventRouter>,
    stores: BTreeMap<String, Arc<InMemoryObjectStore>>,
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPlatform {
    pub fn new() -> Self {
        Self {
            boundary: PermissionBoundary::new(),
            functions: FunctionRegistry::new(),
            router: Arc::new(EventRouter::new()),
            stores: BTreeMap::new(),
        }
    }

    pub fn router(&self) -> &Arc<EventRouter> {
        &self.router
    }

    pub fn store(&self, name: &str) -> Option<Arc<InMemoryObjectStore>> {
        self.stores.get(name).cloned()
    }

    pub fn boundary(&self) -> &PermissionBoundary {
        &self.boundary
    }

    pub fn boundary_mut(&mut self) -> &mut PermissionBoundary {
        &mut self.boundary
    }

    pub fn functions(&self) -> &FunctionRegistry {
        &self.functions
    }

    /// Checks an action of a registered function against its bound identity.
    pub fn authorize(&self, function: &str, action: Action, resource: &ResourceScope) -> Result<()> {
        let registration = self.functions.invoke_target(function)?;
        self.boundary
            .authorize(&registration.identity, action, resource)
    }

    pub fn apply_resource(&mut self, resource: &Resource) -> Result<ApplyOutcome> {
        match resource {
            Resource::ObjectStore { name, settings } => {
                settings.validate()?;
                if let Some(existing) = self.stores.get(name) {
                    if existing.settings() == *settings {
                        return Ok(ApplyOutcome::Unchanged);
                    }
                    existing.update_settings(settings.clone());
                    return Ok(ApplyOutcome::Updated);
                }
                let sink: Arc<dyn EventSink> = self.router.clone();
                self.stores.insert(
                    name.clone(),
                    Arc::new(InMemoryObjectStore::new(name.clone(), settings.clone(), sink)),
                );
                self.router.attach_source(name);
                Ok(ApplyOutcome::Created)
            }
            Resource::Identity { name, trust } => self
                .boundary
                .create_identity(name, trust.clone())
                .map(|(_, outcome)| outcome),
            Resource::Grant {
                name,
                identity,
                statements,
            } => self.boundary.set_statements(
                &IdentityId::new(identity.as_str()),
                name,
                statements.iter().cloned().collect(),
            ),
            Resource::Function {
                name,
                artifact_hash,
                identity,
                runtime,
            } => self
                .functions
                .register(
                    name,
                    artifact_hash,
                    &IdentityId::new(identity.as_str()),
                    runtime,
                    &self.boundary,
                )
                .map(|(outcome, _)| outcome),
            Resource::InvokePermission {
                name,
                function,
                source_bucket,
            } => {
                if self.functions.live(function).is_none() {
                    return Err(Error::validation(format!(
                        "invoke permission '{name}' targets unregistered function '{function}'"
                    )));
                }
                self.boundary.grant_invoke(
                    name,
                    InvokeGrant {
                        function: function.clone(),
                        principal: OBJECT_STORE_PRINCIPAL.to_string(),
                        source_arn: bucket_arn(source_bucket),
                    },
                )
            }
            Resource::Subscription {
                name,
                source_bucket,
                target_function,
                filter,
            } => {
                if self.functions.live(target_function).is_none() {
                    return Err(Error::misconfigured(
                        name,
                        format!("target function '{target_function}' is not registered"),
                    ));
                }
                let result = self.router.subscribe(
                    Subscription {
                        id: name.clone(),
                        source_bucket: source_bucket.clone(),
                        target_function: target_function.clone(),
                        filter: filter.clone(),
                    },
                    &self.boundary,
                )?;
                Ok(match result {
                    SubscribeResult::Created => ApplyOutcome::Created,
                    SubscribeResult::Replaced => ApplyOutcome::Updated,
                    SubscribeResult::Unchanged => ApplyOutcome::Unchanged,
                })
            }
        }
    }

    /// Drains the router queue through `handler`. Successful deliveries are
    /// acknowledged; transient failures stay in flight for
    /// `EventRouter::redeliver_unacked`; any other error is acknowledged and
    /// counted as failed, since retrying it cannot succeed.
    pub fn dispatch_pending<F>(&self, mut handler: F) -> DispatchSummary
    where
        F: FnMut(&Delivery) -> Result<()>,
    {
        let mut summary = DispatchSummary::default();
        while let Some(delivery) = self.router.poll() {
            match handler(&delivery) {
                Ok(()) => {
                    self.router.ack(delivery.delivery_id);
                    summary.acknowledged += 1;
                }
                Err(error) if error.is_retryable() => {
                    warn!(
                        component = "simulated_platform",
                        event = "delivery_retry_pending",
                        delivery_id = delivery.delivery_id,
                        attempt = delivery.attempt,
                        error = %error,
                    );
                    summary.left_for_retry += 1;
                }
                Err(error) => {
                    error!(
                        component = "simulated_platform",
                        event = "delivery_failed",
                        delivery_id = delivery.delivery_id,
                        key = %delivery.event.key,
                        error = %error,
                    );
                    self.router.ack(delivery.delivery_id);
                    summary.failed += 1;
                }
            }
        }
        summary
    }
}

impl Orchestrator for SimulatedPlatform {
    fn apply(&mut self, graph: &DesiredGraph) -> Result<ApplyReport> {
        let order = graph.apply_order()?;
        let mut report = ApplyReport::default();

        for id in order {
            let resource = graph.get(&id).ok_or_else(|| Error::NotFound {
                kind: "resource",
                name: id.to_string(),
            })?;

            match self.apply_resource(resource) {
                Ok(outcome) => {
                    info!(
                        component = "orchestrator",
                        event = "resource_applied",
                        resource = %id,
                        ?outcome,
                    );
                    report.outcomes.push(ResourceOutcome { id, outcome });
                }
                Err(failure) => {
                    error!(
                        component = "orchestrator",
                        event = "apply_halted",
                        resource = %id,
                        error = %failure,
                    );
                    report.outcomes.push(ResourceOutcome {
                        id: id.clone(),
                        outcome: ApplyOutcome::Failed {
                            reason: failure.to_string(),
                        },
                    });
                    report.halted_at = Some(id);
                    break;
                }
            }
        }
        Ok(report)
    }
}
