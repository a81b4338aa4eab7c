//! Desired-state resource graph.
//!
//! Declarations carry their own references (a grant names its identity, a
//! subscription names its store and function); the graph turns those into
//! explicit dependency edges and hands the orchestrator a deterministic
//! creation order.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::fmt;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::Serialize;

use crate::config::DeploymentConfig;
use crate::error::{Error, Result};
use crate::function::RuntimeConfig;
use crate::identity::{
    check_least_privilege, ingestion_statements, PolicyStatement, TrustPolicy,
    COMPUTE_SERVICE_PRINCIPAL,
};
use crate::router::NotificationFilter;
use crate::storage::StoreSettings;

/// Ordered so that ties in the creation order resolve layer by layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    ObjectStore,
    Identity,
    Grant,
    Function,
    InvokePermission,
    Subscription,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ObjectStore => "object_store",
            Self::Identity => "identity",
            Self::Grant => "grant",
            Self::Function => "function",
            Self::InvokePermission => "invoke_permission",
            Self::Subscription => "subscription",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ResourceId {
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceId {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.as_str(), self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Resource {
    ObjectStore {
        name: String,
        settings: StoreSettings,
    },
    Identity {
        name: String,
        trust: TrustPolicy,
    },
    Grant {
        name: String,
        identity: String,
        statements: Vec<PolicyStatement>,
    },
    Function {
        name: String,
        artifact_hash: String,
        identity: String,
        runtime: RuntimeConfig,
    },
    /// Resource-based right for the object store to invoke `function`,
    /// scoped to `source_bucket`.
    InvokePermission {
        name: String,
        function: String,
        source_bucket: String,
    },
    Subscription {
        name: String,
        source_bucket: String,
        target_function: String,
        filter: NotificationFilter,
    },
}

impl Resource {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::ObjectStore { .. } => ResourceKind::ObjectStore,
            Self::Identity { .. } => ResourceKind::Identity,
            Self::Grant { .. } => ResourceKind::Grant,
            Self::Function { .. } => ResourceKind::Function,
            Self::InvokePermission { .. } => ResourceKind::InvokePermission,
            Self::Subscription { .. } => ResourceKind::Subscription,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::ObjectStore { name, .. }
            | Self::Identity { name, .. }
            | Self::Grant { name, .. }
            | Self::Function { name, .. }
            | Self::InvokePermission { name, .. }
            | Self::Subscription { name, .. } => name,
        }
    }

    pub fn id(&self) -> ResourceId {
        ResourceId::new(self.kind(), self.name())
    }
}

#[derive(Debug, Clone, Default)]
pub struct DesiredGraph {
    resources: BTreeMap<ResourceId, Resource>,
    extra_edges: BTreeSet<(ResourceId, ResourceId)>,
}

impl DesiredGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, resource: Resource) -> Result<ResourceId> {
        if resource.name().trim().is_empty() {
            return Err(Error::validation(format!(
                "{} declaration has an empty name",
                resource.kind().as_str()
            )));
        }
        let id = resource.id();
        if self.resources.contains_key(&id) {
            return Err(Error::validation(format!("{id} is declared twice")));
        }
        self.resources.insert(id.clone(), resource);
        Ok(id)
    }

    /// Declares an ordering edge that is not implied by any reference.
    pub fn depends_on(&mut self, dependent: ResourceId, dependency: ResourceId) {
        self.extra_edges.insert((dependent, dependency));
    }

    pub fn get(&self, id: &ResourceId) -> Option<&Resource> {
        self.resources.get(id)
    }

    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.values()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    fn require(&self, id: ResourceId, by: &ResourceId) -> Result<ResourceId> {
        if self.resources.contains_key(&id) {
            Ok(id)
        } else {
            Err(Error::UnknownResource {
                referenced: id.to_string(),
                by: by.to_string(),
            })
        }
    }

    /// Everything `id` must wait for, derived from its references.
    pub fn dependencies(&self, id: &ResourceId) -> Result<BTreeSet<ResourceId>> {
        let resource = self.resources.get(id).ok_or_else(|| Error::NotFound {
            kind: "resource",
            name: id.to_string(),
        })?;

        let mut dependencies = BTreeSet::new();
        match resource {
            Resource::ObjectStore { .. } | Resource::Identity { .. } => {}
            Resource::Grant { identity, .. } => {
                dependencies.insert(self.require(ResourceId::new(ResourceKind::Identity, identity), id)?);
            }
            Resource::Function {
                identity: function_identity,
                ..
            } => {
                dependencies.insert(self.require(
                    ResourceId::new(ResourceKind::Identity, function_identity),
                    id,
                )?);
                // A function must not run before its permissions exist.
                dependencies.extend(
                    self.resources
                        .values()
                        .filter(|candidate| {
                            matches!(candidate, Resource::Grant { identity, .. } if identity == function_identity)
                        })
                        .map(Resource::id),
                );
            }
            Resource::InvokePermission {
                function,
                source_bucket,
                ..
            } => {
                dependencies.insert(self.require(ResourceId::new(ResourceKind::Function, function), id)?);
                dependencies.insert(
                    self.require(ResourceId::new(ResourceKind::ObjectStore, source_bucket), id)?,
                );
            }
            Resource::Subscription {
                name,
                source_bucket,
                target_function,
                ..
            } => {
                let store = ResourceId::new(ResourceKind::ObjectStore, source_bucket);
                if !self.resources.contains_key(&store) {
                    return Err(Error::misconfigured(
                        name,
                        format!("source store '{source_bucket}' is not declared"),
                    ));
                }
                dependencies.insert(store);
                dependencies.insert(
                    self.require(ResourceId::new(ResourceKind::Function, target_function), id)?,
                );

                let permissions: Vec<ResourceId> = self
                    .resources
                    .values()
                    .filter(|candidate| {
                        matches!(
                            candidate,
                            Resource::InvokePermission { function, source_bucket: bucket, .. }
                                if function == target_function && bucket == source_bucket
                        )
                    })
                    .map(Resource::id)
                    .collect();
                if permissions.is_empty() {
                    return Err(Error::misconfigured(
                        name,
                        format!(
                            "no invoke permission lets '{source_bucket}' invoke '{target_function}'"
                        ),
                    ));
                }
                dependencies.extend(permissions);
            }
        }

        for (dependent, dependency) in &self.extra_edges {
            if dependent == id {
                dependencies.insert(self.require(dependency.clone(), id)?);
            }
        }
        Ok(dependencies)
    }

    pub fn validate(&self) -> Result<()> {
        for (dependent, _) in &self.extra_edges {
            if !self.resources.contains_key(dependent) {
                return Err(Error::NotFound {
                    kind: "resource",
                    name: dependent.to_string(),
                });
            }
        }
        self.apply_order()?;

        for resource in self.resources.values() {
            let Resource::Function { name, identity, .. } = resource else {
                continue;
            };
            let trust_id = ResourceId::new(ResourceKind::Identity, identity);
            if let Some(Resource::Identity { trust, .. }) = self.resources.get(&trust_id) {
                if trust.principal != COMPUTE_SERVICE_PRINCIPAL {
                    return Err(Error::validation(format!(
                        "function '{name}' is bound to identity '{identity}', which trusts '{}' instead of {COMPUTE_SERVICE_PRINCIPAL}",
                        trust.principal
                    )));
                }
            }
        }
        Ok(())
    }

    /// Topological creation order. Ready resources are taken lowest kind
    /// first, then by name, so the same graph always yields the same order.
    pub fn apply_order(&self) -> Result<Vec<ResourceId>> {
        let mut graph: DiGraph<ResourceId, ()> = DiGraph::with_capacity(self.resources.len(), 0);
        let mut nodes: BTreeMap<ResourceId, NodeIndex> = BTreeMap::new();
        for id in self.resources.keys() {
            nodes.insert(id.clone(), graph.add_node(id.clone()));
        }
        for (id, &dependent) in &nodes {
            for dependency in self.dependencies(id)? {
                if let Some(&from) = nodes.get(&dependency) {
                    graph.update_edge(from, dependent, ());
                }
            }
        }

        let mut in_degree: BTreeMap<NodeIndex, usize> = graph
            .node_indices()
            .map(|node| {
                (
                    node,
                    graph.neighbors_directed(node, Direction::Incoming).count(),
                )
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<(ResourceId, NodeIndex)>> = in_degree
            .iter()
            .filter(|&(_, &degree)| degree == 0)
            .map(|(&node, _)| Reverse((graph[node].clone(), node)))
            .collect();

        let mut order = Vec::with_capacity(graph.node_count());
        while let Some(Reverse((id, node))) = ready.pop() {
            order.push(id);
            for next in graph.neighbors_directed(node, Direction::Outgoing) {
                if let Some(degree) = in_degree.get_mut(&next) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        ready.push(Reverse((graph[next].clone(), next)));
                    }
                }
            }
        }

        if order.len() != graph.node_count() {
            let stuck = in_degree
                .iter()
                .filter(|&(_, &degree)| degree > 0)
                .map(|(&node, _)| graph[node].clone())
                .min()
                .map_or_else(|| "unknown".to_string(), |id| id.to_string());
            return Err(Error::DependencyCycle(stuck));
        }
        Ok(order)
    }
}

/// Names of the resources the ingestion graph declares for one function.
pub fn identity_name(function: &str) -> String {
    format!("{function}-execution")
}

pub fn grant_name(function: &str) -> String {
    format!("{function}-ingest-access")
}

/// One name per function, so moving the source bucket replaces the grant.
pub fn invoke_permission_name(function: &str) -> String {
    format!("{function}-allow-object-store")
}

pub fn subscription_name(function: &str) -> String {
    format!("{function}-object-created")
}

/// Declares the whole ingestion pipeline for one deployment: store, identity,
/// least-privilege grant, function, invoke permission and subscription.
pub fn ingestion_graph(config: &DeploymentConfig, artifact_hash: &str) -> Result<DesiredGraph> {
    config.validate()?;

    let function = config.function_name.as_str();
    let bucket = config.bucket_name.as_str();
    let statements = ingestion_statements(bucket, config.read_prefix(), function);
    check_least_privilege(&statements, bucket, function)?;

    let mut graph = DesiredGraph::new();
    graph.add(Resource::ObjectStore {
        name: bucket.to_string(),
        settings: config.store.clone(),
    })?;
    graph.add(Resource::Identity {
        name: identity_name(function),
        trust: TrustPolicy::compute_service(),
    })?;
    graph.add(Resource::Grant {
        name: grant_name(function),
        identity: identity_name(function),
        statements,
    })?;
    graph.add(Resource::Function {
        name: function.to_string(),
        artifact_hash: artifact_hash.to_string(),
        identity: identity_name(function),
        runtime: config.runtime_config(),
    })?;
    graph.add(Resource::InvokePermission {
        name: invoke_permission_name(function),
        function: function.to_string(),
        source_bucket: bucket.to_string(),
    })?;
    graph.add(Resource::Subscription {
        name: subscription_name(function),
        source_bucket: bucket.to_string(),
        target_function: function.to_string(),
        filter: config.filter.clone(),
    })?;

    graph.validate()?;
    Ok(graph)
}
