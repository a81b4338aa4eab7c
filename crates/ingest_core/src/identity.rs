//! Execution identities, permission grants and resource-based invoke rights.
//!
//! Evaluation is deny-by-default: an action is allowed only when an explicit
//! statement lists it for a scope covering the requested resource.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::error::{Error, Result};
use crate::orchestrator::ApplyOutcome;
use crate::router::InvokePermissions;

pub const COMPUTE_SERVICE_PRINCIPAL: &str = "lambda.amazonaws.com";
pub const OBJECT_STORE_PRINCIPAL: &str = "s3.amazonaws.com";
pub const POLICY_VERSION: &str = "2012-10-17";

pub fn bucket_arn(bucket: &str) -> String {
    format!("arn:aws:s3:::{bucket}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    ReadObject,
    ListBucket,
    EmitLogs,
    WriteObject,
    DeleteObject,
    InvokeFunction,
    PassRole,
}

/// The complete action set of the ingestion function, and nothing more.
pub const INGESTION_ALLOW_LIST: [Action; 3] =
    [Action::ReadObject, Action::ListBucket, Action::EmitLogs];

impl Action {
    pub const ALL: [Action; 7] = [
        Action::ReadObject,
        Action::ListBucket,
        Action::EmitLogs,
        Action::WriteObject,
        Action::DeleteObject,
        Action::InvokeFunction,
        Action::PassRole,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadObject => "read-object",
            Self::ListBucket => "list-bucket",
            Self::EmitLogs => "emit-logs",
            Self::WriteObject => "write-object",
            Self::DeleteObject => "delete-object",
            Self::InvokeFunction => "invoke-function",
            Self::PassRole => "pass-role",
        }
    }

    /// Platform action names the logical action expands to in a policy document.
    pub fn platform_actions(self) -> &'static [&'static str] {
        match self {
            Self::ReadObject => &["s3:GetObject", "s3:GetObjectVersion"],
            Self::ListBucket => &["s3:ListBucket"],
            Self::EmitLogs => &[
                "logs:CreateLogGroup",
                "logs:CreateLogStream",
                "logs:PutLogEvents",
            ],
            Self::WriteObject => &["s3:PutObject"],
            Self::DeleteObject => &["s3:DeleteObject", "s3:DeleteObjectVersion"],
            Self::InvokeFunction => &["lambda:InvokeFunction"],
            Self::PassRole => &["iam:PassRole"],
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceScope {
    Bucket { name: String },
    Objects { bucket: String, prefix: String },
    LogGroup { function: String },
    Function { name: String },
    Wildcard,
}

impl ResourceScope {
    pub fn arn(&self) -> String {
        match self {
            Self::Bucket { name } => bucket_arn(name),
            Self::Objects { bucket, prefix } => format!("{}/{prefix}*", bucket_arn(bucket)),
            Self::LogGroup { function } => {
                format!("arn:aws:logs:*:*:log-group:/aws/lambda/{function}:*")
            }
            Self::Function { name } => format!("arn:aws:lambda:*:*:function:{name}"),
            Self::Wildcard => "*".to_string(),
        }
    }

    pub fn covers(&self, requested: &ResourceScope) -> bool {
        match (self, requested) {
            (Self::Wildcard, _) => true,
            (Self::Bucket { name }, Self::Bucket { name: other }) => name == other,
            (
                Self::Objects { bucket, prefix },
                Self::Objects {
                    bucket: other_bucket,
                    prefix: other_prefix,
                },
            ) => bucket == other_bucket && other_prefix.starts_with(prefix.as_str()),
            (Self::LogGroup { function }, Self::LogGroup { function: other }) => function == other,
            (Self::Function { name }, Self::Function { name: other }) => name == other,
            _ => false,
        }
    }

    pub fn object(bucket: &str, key: &str) -> Self {
        Self::Objects {
            bucket: bucket.to_string(),
            prefix: key.to_string(),
        }
    }
}

impl fmt::Display for ResourceScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.arn())
    }
}

/// Who may assume an identity. Restricted to one named service principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustPolicy {
    pub principal: String,
}

impl TrustPolicy {
    pub fn new(principal: impl Into<String>) -> Result<Self> {
        let principal = principal.into();
        let trimmed = principal.trim();
        if trimmed.is_empty() {
            return Err(Error::validation("trust principal cannot be empty"));
        }
        if trimmed.contains('*') {
            return Err(Error::validation(format!(
                "trust principal '{trimmed}' must name a single service, not a wildcard"
            )));
        }
        Ok(Self {
            principal: trimmed.to_string(),
        })
    }

    pub fn compute_service() -> Self {
        Self {
            principal: COMPUTE_SERVICE_PRINCIPAL.to_string(),
        }
    }

    pub fn document(&self) -> Value {
        json!({
            "Version": POLICY_VERSION,
            "Statement": [{
                "Effect": "Allow",
                "Principal": { "Service": self.principal },
                "Action": "sts:AssumeRole",
            }]
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PolicyStatement {
    pub actions: BTreeSet<Action>,
    pub resource: ResourceScope,
}

impl PolicyStatement {
    pub fn new(actions: impl IntoIterator<Item = Action>, resource: ResourceScope) -> Self {
        Self {
            actions: actions.into_iter().collect(),
            resource,
        }
    }

    fn document(&self) -> Value {
        let actions: Vec<&str> = self
            .actions
            .iter()
            .flat_map(|action| action.platform_actions().iter().copied())
            .collect();
        json!({
            "Effect": "Allow",
            "Action": actions,
            "Resource": self.resource.arn(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IdentityId(String);

impl IdentityId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionIdentity {
    pub id: IdentityId,
    pub trust: TrustPolicy,
    /// Statement sets keyed by the grant that declared them.
    #[serde(default)]
    pub grants: BTreeMap<String, BTreeSet<PolicyStatement>>,
    /// Union of every grant; what evaluation consults.
    pub statements: BTreeSet<PolicyStatement>,
}

impl ExecutionIdentity {
    fn refresh_statements(&mut self) {
        self.statements = self.grants.values().flatten().cloned().collect();
    }

    pub fn allowed_actions(&self) -> BTreeSet<Action> {
        self.statements
            .iter()
            .flat_map(|statement| statement.actions.iter().copied())
            .collect()
    }

    pub fn permission_document(&self) -> Value {
        permission_document(&self.statements)
    }
}

pub fn permission_document<'a>(statements: impl IntoIterator<Item = &'a PolicyStatement>) -> Value {
    let statements: Vec<Value> = statements
        .into_iter()
        .map(PolicyStatement::document)
        .collect();
    json!({
        "Version": POLICY_VERSION,
        "Statement": statements,
    })
}

/// Statements of the ingestion function: read objects under `prefix`, list the
/// bucket, write its own logs.
pub fn ingestion_statements(bucket: &str, prefix: &str, function: &str) -> Vec<PolicyStatement> {
    vec![
        PolicyStatement::new(
            [Action::ReadObject],
            ResourceScope::Objects {
                bucket: bucket.to_string(),
                prefix: prefix.to_string(),
            },
        ),
        PolicyStatement::new(
            [Action::ListBucket],
            ResourceScope::Bucket {
                name: bucket.to_string(),
            },
        ),
        PolicyStatement::new(
            [Action::EmitLogs],
            ResourceScope::LogGroup {
                function: function.to_string(),
            },
        ),
    ]
}

/// Rejects any statement set broader than the ingestion allow-list: foreign
/// actions, wildcard scopes, or scopes outside `bucket` and the function's
/// own log group.
pub fn check_least_privilege<'a>(
    statements: impl IntoIterator<Item = &'a PolicyStatement>,
    bucket: &str,
    function: &str,
) -> Result<()> {
    for statement in statements {
        for action in &statement.actions {
            if !INGESTION_ALLOW_LIST.contains(action) {
                return Err(Error::validation(format!(
                    "least privilege violated: action '{action}' is outside the ingestion allow-list"
                )));
            }
            let in_scope = match (action, &statement.resource) {
                (Action::ReadObject, ResourceScope::Objects { bucket: b, .. }) => b == bucket,
                (Action::ListBucket, ResourceScope::Bucket { name }) => name == bucket,
                (Action::EmitLogs, ResourceScope::LogGroup { function: f }) => f == function,
                _ => false,
            };
            if !in_scope {
                return Err(Error::validation(format!(
                    "least privilege violated: '{action}' granted on {} is outside the ingestion scope",
                    statement.resource
                )));
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InvokeGrant {
    pub function: String,
    pub principal: String,
    pub source_arn: String,
}

#[derive(Debug, Default)]
pub struct PermissionBoundary {
    identities: BTreeMap<IdentityId, ExecutionIdentity>,
    /// Keyed by the invoke permission's name, so redeclaring it replaces the grant.
    invoke_grants: BTreeMap<String, InvokeGrant>,
}

/// Grant name used by `PermissionBoundary::grant` for ad hoc statements.
pub const INLINE_GRANT: &str = "inline";

impl PermissionBoundary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the identity, or updates its trust policy when it already exists.
    pub fn create_identity(
        &mut self,
        name: &str,
        trust: TrustPolicy,
    ) -> Result<(IdentityId, ApplyOutcome)> {
        if name.trim().is_empty() {
            return Err(Error::validation("identity name cannot be empty"));
        }
        let id = IdentityId::new(name.trim());

        let outcome = match self.identities.get_mut(&id) {
            Some(existing) if existing.trust == trust => ApplyOutcome::Unchanged,
            Some(existing) => {
                existing.trust = trust;
                ApplyOutcome::Updated
            }
            None => {
                self.identities.insert(
                    id.clone(),
                    ExecutionIdentity {
                        id: id.clone(),
                        trust,
                        grants: BTreeMap::new(),
                        statements: BTreeSet::new(),
                    },
                );
                ApplyOutcome::Created
            }
        };
        if outcome != ApplyOutcome::Unchanged {
            info!(component = "permission_boundary", event = "identity_applied", identity = %id, ?outcome);
        }
        Ok((id, outcome))
    }

    /// Adds one allow statement. Re-granting an existing statement is a no-op.
    pub fn grant(
        &mut self,
        id: &IdentityId,
        actions: impl IntoIterator<Item = Action>,
        resource: ResourceScope,
    ) -> Result<ApplyOutcome> {
        let statement = PolicyStatement::new(actions, resource);
        if statement.actions.is_empty() {
            return Err(Error::validation(format!(
                "grant for identity '{id}' lists no actions"
            )));
        }

        let identity = self.identities.get_mut(id).ok_or_else(|| Error::NotFound {
            kind: "identity",
            name: id.to_string(),
        })?;

        let inserted = identity
            .grants
            .entry(INLINE_GRANT.to_string())
            .or_default()
            .insert(statement);
        if inserted {
            identity.refresh_statements();
            info!(component = "permission_boundary", event = "grant_applied", identity = %id);
            Ok(ApplyOutcome::Created)
        } else {
            Ok(ApplyOutcome::Unchanged)
        }
    }

    /// Replaces the statements declared by `grant_name` with exactly
    /// `statements`. Statements the grant no longer declares are revoked.
    pub fn set_statements(
        &mut self,
        id: &IdentityId,
        grant_name: &str,
        statements: BTreeSet<PolicyStatement>,
    ) -> Result<ApplyOutcome> {
        if statements.is_empty() {
            return Err(Error::validation(format!(
                "grant '{grant_name}' for identity '{id}' declares no statements"
            )));
        }
        if let Some(empty) = statements.iter().find(|statement| statement.actions.is_empty()) {
            return Err(Error::validation(format!(
                "grant '{grant_name}' lists no actions for {}",
                empty.resource
            )));
        }

        let identity = self.identities.get_mut(id).ok_or_else(|| Error::NotFound {
            kind: "identity",
            name: id.to_string(),
        })?;

        let outcome = match identity.grants.get(grant_name) {
            Some(current) if *current == statements => return Ok(ApplyOutcome::Unchanged),
            Some(_) => ApplyOutcome::Updated,
            None => ApplyOutcome::Created,
        };
        identity.grants.insert(grant_name.to_string(), statements);
        identity.refresh_statements();
        info!(
            component = "permission_boundary",
            event = "grant_applied",
            identity = %id,
            grant = %grant_name,
            ?outcome,
        );
        Ok(outcome)
    }

    pub fn identity(&self, id: &IdentityId) -> Option<&ExecutionIdentity> {
        self.identities.get(id)
    }

    pub fn evaluate(&self, id: &IdentityId, action: Action, resource: &ResourceScope) -> Decision {
        let Some(identity) = self.identities.get(id) else {
            return Decision::Deny;
        };
        let allowed = identity.statements.iter().any(|statement| {
            statement.actions.contains(&action) && statement.resource.covers(resource)
        });
        if allowed {
            Decision::Allow
        } else {
            Decision::Deny
        }
    }

    pub fn authorize(&self, id: &IdentityId, action: Action, resource: &ResourceScope) -> Result<()> {
        match self.evaluate(id, action, resource) {
            Decision::Allow => Ok(()),
            Decision::Deny => Err(Error::PermissionDenied {
                principal: id.to_string(),
                action: action.to_string(),
                resource: resource.arn(),
            }),
        }
    }

    /// Declares the invoke grant `name`. Redeclaring it with another source or
    /// principal replaces the old grant rather than adding a second one.
    pub fn grant_invoke(&mut self, name: &str, grant: InvokeGrant) -> Result<ApplyOutcome> {
        if grant.principal.trim().is_empty() || grant.principal.contains('*') {
            return Err(Error::validation(format!(
                "invoke grant on '{}' must name a single service principal",
                grant.function
            )));
        }
        if grant.source_arn.trim().is_empty() {
            return Err(Error::validation(format!(
                "invoke grant on '{}' must be scoped to a source resource",
                grant.function
            )));
        }

        let outcome = match self.invoke_grants.get(name) {
            Some(current) if *current == grant => return Ok(ApplyOutcome::Unchanged),
            Some(_) => ApplyOutcome::Updated,
            None => ApplyOutcome::Created,
        };
        info!(
            component = "permission_boundary",
            event = "invoke_granted",
            function = %grant.function,
            source_arn = %grant.source_arn,
            ?outcome,
        );
        self.invoke_grants.insert(name.to_string(), grant);
        Ok(outcome)
    }
}

impl InvokePermissions for PermissionBoundary {
    fn allows_invoke(&self, principal: &str, source_arn: &str, function: &str) -> bool {
        self.invoke_grants.values().any(|grant| {
            grant.function == function && grant.principal == principal && grant.source_arn == source_arn
        })
    }
}
