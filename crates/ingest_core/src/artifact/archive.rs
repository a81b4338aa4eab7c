//! Staging walk and deterministic zip writer.

use std::collections::BTreeMap;
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};

use walkdir::{DirEntry, WalkDir};
use zip::write::FileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use crate::artifact::dependencies::PACKAGE_LOCK_FILE;
use crate::error::{Error, Result};

const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    "__pycache__",
    ".pytest_cache",
    ".mypy_cache",
    ".tox",
    "test",
    "tests",
    "target",
];

const EXCLUDED_FILES: &[&str] = &[".DS_Store", ".gitignore", PACKAGE_LOCK_FILE];

const EXCLUDED_EXTENSIONS: &[&str] = &["pyc", "pyo"];

fn is_excluded_dir(name: &str) -> bool {
    EXCLUDED_DIRS.contains(&name)
}

fn is_excluded_file(name: &str) -> bool {
    if EXCLUDED_FILES.contains(&name) {
        return true;
    }
    if name.starts_with("test_") {
        return true;
    }
    let (stem, extension) = match name.rsplit_once('.') {
        Some((stem, extension)) => (stem, Some(extension)),
        None => (name, None),
    };
    stem.ends_with("_test") || extension.is_some_and(|ext| EXCLUDED_EXTENSIONS.contains(&ext))
}

fn keep(entry: &DirEntry) -> bool {
    if entry.depth() == 0 {
        return true;
    }
    let name = entry.file_name().to_string_lossy();
    if entry.file_type().is_dir() {
        !is_excluded_dir(&name)
    } else {
        !is_excluded_file(&name)
    }
}

/// Archive path with `/` separators, whatever the host separator is.
fn archive_path(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).map_err(|_| {
        Error::build(format!(
            "'{}' is outside the staging root '{}'",
            path.display(),
            root.display()
        ))
    })?;
    let parts: Vec<String> = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();
    Ok(parts.join("/"))
}

/// Every file under `root` that belongs in an artifact, keyed by archive path.
/// Test files, caches and VCS metadata are left out.
pub fn collect_files(root: &Path) -> Result<BTreeMap<String, PathBuf>> {
    let mut files = BTreeMap::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(keep);

    for entry in walker {
        let entry = entry.map_err(|error| {
            Error::build(format!("failed to walk '{}': {error}", root.display()))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.into_path();
        files.insert(archive_path(root, &path)?, path);
    }
    Ok(files)
}

/// Zips `files` in key order with fixed timestamps and modes, so identical
/// inputs give identical bytes.
pub fn write_archive(files: &BTreeMap<String, PathBuf>, entry_point: &str) -> Result<Vec<u8>> {
    let zip_error = |error: zip::result::ZipError| Error::build(format!("zip writer failed: {error}"));

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, path) in files {
        let mode = if name == entry_point { 0o755 } else { 0o644 };
        let options = FileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(DateTime::default())
            .unix_permissions(mode);

        let bytes = fs::read(path)
            .map_err(|error| Error::io(format!("failed to read '{}'", path.display()), error))?;
        zip.start_file(name.as_str(), options).map_err(zip_error)?;
        zip.write_all(&bytes)
            .map_err(|error| Error::io(format!("failed to write archive entry '{name}'"), error))?;
    }
    let cursor = zip.finish().map_err(zip_error)?;
    Ok(cursor.into_inner())
}
