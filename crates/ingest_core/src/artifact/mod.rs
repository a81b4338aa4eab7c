//! Deployment artifact builder.
//!
//! `build` stages the function source plus its pinned dependency closure into
//! a single zip, hashes it and writes it next to a JSON manifest. Both files
//! are fully staged as temporary siblings before either is renamed into
//! place, so a failed build never leaves a partial or mismatched artifact.

pub mod archive;
pub mod dependencies;

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::{NamedTempFile, TempPath};
use tracing::{info, warn};

pub use dependencies::{DependencySpec, Requirement, ResolvedDependency};

use crate::error::{Error, Result};
use crate::storage::content_hash;

pub const MANIFEST_EXTENSION: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildRequest {
    pub source_dir: PathBuf,
    /// Archive path of the file the runtime starts, e.g. `bootstrap`.
    pub entry_point: String,
    pub dependency_lock: Option<PathBuf>,
    /// Directory holding `<name>-<version>/` package trees.
    pub dependency_root: Option<PathBuf>,
    pub output_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactManifest {
    pub content_hash: String,
    pub entry_point: String,
    pub source_files: Vec<String>,
    pub dependencies: Vec<ResolvedDependency>,
    pub built_at: DateTime<Utc>,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub manifest: ArtifactManifest,
}

pub fn manifest_path(artifact_path: &Path) -> PathBuf {
    artifact_path.with_extension(MANIFEST_EXTENSION)
}

fn output_dir(path: &Path) -> Result<PathBuf> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .map_err(|error| Error::io(format!("failed to create '{}'", parent.display()), error))?;
    Ok(parent)
}

/// Writes `bytes` to a temporary sibling of `path`. Nothing is visible at
/// `path` until the returned file is persisted.
fn stage(path: &Path, bytes: &[u8]) -> Result<NamedTempFile> {
    let mut staged = NamedTempFile::new_in(output_dir(path)?)
        .map_err(|error| Error::io("failed to create staging file", error))?;
    staged
        .write_all(bytes)
        .and_then(|()| staged.as_file().sync_all())
        .map_err(|error| Error::io("failed to write staging file", error))?;
    Ok(staged)
}

/// Moves a fully staged archive and manifest into place. When the manifest
/// cannot be published the new archive is withdrawn and the previous one, if
/// any, is put back, so the pair on disk always matches.
fn publish(archive_path: &Path, archive: NamedTempFile, manifest: NamedTempFile) -> Result<()> {
    let previous = if archive_path.is_file() {
        let slot = NamedTempFile::new_in(output_dir(archive_path)?)
            .map_err(|error| Error::io("failed to reserve backup slot", error))?
            .into_temp_path();
        fs::rename(archive_path, &slot).map_err(|error| {
            Error::io(
                format!("failed to set aside '{}'", archive_path.display()),
                error,
            )
        })?;
        Some(slot)
    } else {
        None
    };

    let restore = |previous: Option<TempPath>| {
        let _ = fs::remove_file(archive_path);
        if let Some(previous) = previous {
            if let Err(error) = previous.persist(archive_path) {
                warn!(
                    component = "artifact_builder",
                    event = "restore_failed",
                    path = %archive_path.display(),
                    error = %error.error,
                );
            }
        }
    };

    if let Err(error) = archive.persist(archive_path) {
        restore(previous);
        return Err(Error::io(
            format!("failed to move artifact to '{}'", archive_path.display()),
            error.error,
        ));
    }

    let manifest_file = manifest_path(archive_path);
    if let Err(error) = manifest.persist(&manifest_file) {
        restore(previous);
        return Err(Error::io(
            format!("failed to move manifest to '{}'", manifest_file.display()),
            error.error,
        ));
    }
    Ok(())
}

pub fn build(request: &BuildRequest) -> Result<Artifact> {
    if !request.source_dir.is_dir() {
        return Err(Error::build(format!(
            "source directory '{}' does not exist",
            request.source_dir.display()
        )));
    }

    let mut files = archive::collect_files(&request.source_dir)?;
    if files.is_empty() {
        return Err(Error::build(format!(
            "source tree '{}' contains no deployable files",
            request.source_dir.display()
        )));
    }
    if !files.contains_key(&request.entry_point) {
        return Err(Error::build(format!(
            "entry point '{}' is missing from '{}'",
            request.entry_point,
            request.source_dir.display()
        )));
    }
    let source_files: Vec<String> = files.keys().cloned().collect();

    let dependencies = match &request.dependency_lock {
        None => Vec::new(),
        Some(lock) => {
            let root = request.dependency_root.as_deref().ok_or_else(|| {
                Error::build("a dependency lock was given without a dependency root")
            })?;
            DependencySpec::load(lock)?.resolve(root)?
        }
    };

    for dependency in &dependencies {
        for (name, path) in archive::collect_files(&dependency.path)? {
            if files.contains_key(&name) {
                return Err(Error::build(format!(
                    "'{name}' from {}=={} collides with a file already staged",
                    dependency.name, dependency.version
                )));
            }
            files.insert(name, path);
        }
    }

    let bytes = archive::write_archive(&files, &request.entry_point)?;
    let manifest = ArtifactManifest {
        content_hash: content_hash(&bytes),
        entry_point: request.entry_point.clone(),
        source_files,
        dependencies,
        built_at: Utc::now(),
        size_bytes: bytes.len() as u64,
    };
    let manifest_json = serde_json::to_vec_pretty(&manifest)
        .map_err(|error| Error::build(format!("failed to encode manifest: {error}")))?;

    let staged_archive = stage(&request.output_path, &bytes)?;
    let staged_manifest = stage(&manifest_path(&request.output_path), &manifest_json)?;
    publish(&request.output_path, staged_archive, staged_manifest)?;

    info!(
        component = "artifact_builder",
        event = "artifact_built",
        path = %request.output_path.display(),
        content_hash = %manifest.content_hash,
        files = files.len(),
        dependencies = manifest.dependencies.len(),
        size_bytes = manifest.size_bytes,
    );

    Ok(Artifact {
        path: request.output_path.clone(),
        manifest,
    })
}

impl Artifact {
    /// Loads a previously built artifact. The archive is re-hashed and must
    /// match its manifest.
    pub fn load(path: &Path) -> Result<Self> {
        let manifest_file = manifest_path(path);
        if !path.is_file() || !manifest_file.is_file() {
            return Err(Error::MissingArtifact {
                path: path.to_path_buf(),
            });
        }

        let bytes = fs::read(path)
            .map_err(|error| Error::io(format!("failed to read '{}'", path.display()), error))?;
        let manifest_text = fs::read_to_string(&manifest_file).map_err(|error| {
            Error::io(
                format!("failed to read '{}'", manifest_file.display()),
                error,
            )
        })?;
        let manifest: ArtifactManifest = serde_json::from_str(&manifest_text).map_err(|error| {
            Error::build(format!(
                "malformed artifact manifest '{}': {error}",
                manifest_file.display()
            ))
        })?;

        let actual = content_hash(&bytes);
        if actual != manifest.content_hash {
            return Err(Error::build(format!(
                "artifact '{}' hashes to {actual} but its manifest records {}; rebuild it",
                path.display(),
                manifest.content_hash
            )));
        }

        Ok(Self {
            path: path.to_path_buf(),
            manifest,
        })
    }

    pub fn content_hash(&self) -> &str {
        &self.manifest.content_hash
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_sits_next_to_archive() {
        assert_eq!(
            manifest_path(Path::new("dist/email_receiver.zip")),
            PathBuf::from("dist/email_receiver.manifest.json")
        );
    }

    #[test]
    fn load_without_build_reports_missing_artifact() {
        let dir = tempfile::tempdir().expect("temp dir");
        let error = Artifact::load(&dir.path().join("email_receiver.zip")).expect_err("missing");
        assert!(matches!(error, Error::MissingArtifact { .. }));
    }

    #[test]
    fn entry_point_must_be_staged() {
        let dir = tempfile::tempdir().expect("temp dir");
        let source = dir.path().join("src");
        fs::create_dir_all(&source).expect("mkdir");
        fs::write(source.join("handler.py"), b"def handler(): pass").expect("write");

        let output = dir.path().join("dist/app.zip");
        let error = build(&BuildRequest {
            source_dir: source,
            entry_point: "bootstrap".to_string(),
            dependency_lock: None,
            dependency_root: None,
            output_path: output.clone(),
        })
        .expect_err("missing entry point");
        assert!(error.to_string().contains("entry point 'bootstrap'"));
        assert!(!output.exists());
    }
}
