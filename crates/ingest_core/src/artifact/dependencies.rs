//! Pinned dependency lock files and their closure.
//!
//! One requirement per line, `name==version`. Everything after `#` is a
//! comment. Packages live in a dependency root as `<name>-<version>/` and may
//! carry their own lock file, which is followed transitively.

use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};

/// Lock file a resolved package may ship to declare its own requirements.
pub const PACKAGE_LOCK_FILE: &str = "package.lock";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Requirement {
    pub name: String,
    pub version: String,
}

impl Requirement {
    pub fn directory_name(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedDependency {
    pub name: String,
    pub version: String,
    #[serde(skip)]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencySpec {
    requirements: Vec<Requirement>,
}

fn is_package_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

fn is_exact_version(version: &str) -> bool {
    !version.is_empty()
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '+')
}

impl DependencySpec {
    pub fn parse(text: &str) -> Result<Self> {
        let mut requirements: Vec<Requirement> = Vec::new();
        for (index, raw) in text.lines().enumerate() {
            let line_number = index + 1;
            let line = raw.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }

            let Some((name, version)) = line.split_once("==") else {
                return Err(Error::build(format!(
                    "line {line_number}: '{line}' is not pinned to an exact version (expected name==version)"
                )));
            };
            let (name, version) = (name.trim(), version.trim());
            if !is_package_name(name) || !is_exact_version(version) {
                return Err(Error::build(format!(
                    "line {line_number}: '{line}' is not pinned to an exact version (expected name==version)"
                )));
            }

            if let Some(existing) = requirements.iter().find(|r| r.name == name) {
                if existing.version != version {
                    return Err(Error::build(format!(
                        "dependency '{name}' is pinned to both {} and {version}",
                        existing.version
                    )));
                }
                continue;
            }
            requirements.push(Requirement {
                name: name.to_string(),
                version: version.to_string(),
            });
        }
        Ok(Self { requirements })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|error| {
            Error::build(format!(
                "cannot read dependency lock '{}': {error}",
                path.display()
            ))
        })?;
        Self::parse(&text)
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// Resolves the full closure under `root`, sorted by package name. A
    /// package pinned to two versions anywhere in the closure is a conflict.
    pub fn resolve(&self, root: &Path) -> Result<Vec<ResolvedDependency>> {
        let mut resolved: BTreeMap<String, ResolvedDependency> = BTreeMap::new();
        let mut queue: VecDeque<(Requirement, String)> = self
            .requirements
            .iter()
            .cloned()
            .map(|requirement| (requirement, "the dependency lock".to_string()))
            .collect();

        while let Some((requirement, required_by)) = queue.pop_front() {
            if let Some(existing) = resolved.get(&requirement.name) {
                if existing.version != requirement.version {
                    return Err(Error::build(format!(
                        "version conflict for '{}': {} resolved, {required_by} requires {}",
                        requirement.name, existing.version, requirement.version
                    )));
                }
                continue;
            }

            let path = root.join(requirement.directory_name());
            if !path.is_dir() {
                return Err(Error::build(format!(
                    "cannot resolve {}=={} required by {required_by}: '{}' does not exist",
                    requirement.name,
                    requirement.version,
                    path.display()
                )));
            }
            debug!(
                component = "artifact_builder",
                event = "dependency_resolved",
                name = %requirement.name,
                version = %requirement.version,
            );

            let nested_lock = path.join(PACKAGE_LOCK_FILE);
            if nested_lock.is_file() {
                let nested = DependencySpec::load(&nested_lock)?;
                let parent = format!("{}=={}", requirement.name, requirement.version);
                queue.extend(
                    nested
                        .requirements
                        .into_iter()
                        .map(|child| (child, parent.clone())),
                );
            }

            resolved.insert(
                requirement.name.clone(),
                ResolvedDependency {
                    name: requirement.name,
                    version: requirement.version,
                    path,
                },
            );
        }

        Ok(resolved.into_values().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package(root: &Path, dir: &str, lock: Option<&str>) {
        let path = root.join(dir);
        fs::create_dir_all(&path).expect("create package dir");
        fs::write(path.join("module.py"), dir).expect("write module");
        if let Some(lock) = lock {
            fs::write(path.join(PACKAGE_LOCK_FILE), lock).expect("write lock");
        }
    }

    #[test]
    fn parse_skips_comments_and_blank_lines() {
        let spec = DependencySpec::parse(
            "# runtime deps\n\nboto3==1.34.0  # aws client\n  requests == 2.31.0\n",
        )
        .expect("parse");
        assert_eq!(
            spec.requirements(),
            &[
                Requirement {
                    name: "boto3".to_string(),
                    version: "1.34.0".to_string()
                },
                Requirement {
                    name: "requests".to_string(),
                    version: "2.31.0".to_string()
                },
            ]
        );
    }

    #[test]
    fn unpinned_requirements_fail() {
        for line in ["boto3", "boto3>=1.0", "boto3~=1.34", "boto3==", "==1.0"] {
            let error = DependencySpec::parse(line).expect_err("unpinned");
            assert!(matches!(error, Error::BuildFailure(_)), "{line}");
        }
    }

    #[test]
    fn resolve_follows_nested_locks() {
        let root = tempfile::tempdir().expect("temp dir");
        package(root.path(), "requests-2.31.0", Some("urllib3==2.2.1\n"));
        package(root.path(), "urllib3-2.2.1", None);

        let resolved = DependencySpec::parse("requests==2.31.0")
            .expect("parse")
            .resolve(root.path())
            .expect("resolve");
        let names: Vec<&str> = resolved.iter().map(|dep| dep.name.as_str()).collect();
        assert_eq!(names, vec!["requests", "urllib3"]);
    }

    #[test]
    fn resolve_reports_missing_package() {
        let root = tempfile::tempdir().expect("temp dir");
        let error = DependencySpec::parse("requests==2.31.0")
            .expect("parse")
            .resolve(root.path())
            .expect_err("missing");
        assert!(error.to_string().contains("cannot resolve requests==2.31.0"));
    }

    #[test]
    fn resolve_rejects_conflicting_versions() {
        let root = tempfile::tempdir().expect("temp dir");
        package(root.path(), "requests-2.31.0", Some("urllib3==1.26.0\n"));
        package(root.path(), "urllib3-2.2.1", None);
        package(root.path(), "urllib3-1.26.0", None);

        let error = DependencySpec::parse("urllib3==2.2.1\nrequests==2.31.0")
            .expect("parse")
            .resolve(root.path())
            .expect_err("conflict");
        assert!(error.to_string().contains("version conflict for 'urllib3'"));
    }
}
