mod support;

use std::fs;
use std::io::Read;

use ingest_core::artifact::{build, manifest_path, Artifact, BuildRequest};
use ingest_core::Error;

use support::fixtures::{function_source, write_file};

fn request(root: &std::path::Path) -> BuildRequest {
    BuildRequest {
        source_dir: function_source(root),
        entry_point: "bootstrap".to_string(),
        dependency_lock: None,
        dependency_root: None,
        output_path: root.join("dist/email_receiver.zip"),
    }
}

fn archive_names(bytes: &[u8]) -> Vec<String> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).expect("valid zip");
    (0..archive.len())
        .map(|index| archive.by_index(index).expect("entry").name().to_string())
        .collect()
}

#[test]
fn unchanged_inputs_build_identical_archives() {
    let dir = tempfile::tempdir().expect("temp dir");
    let request = request(dir.path());

    let first = build(&request).expect("first build");
    let first_bytes = fs::read(&first.path).expect("read artifact");
    let second = build(&request).expect("second build");
    let second_bytes = fs::read(&second.path).expect("read artifact");

    assert_eq!(first.content_hash(), second.content_hash());
    assert_eq!(first_bytes, second_bytes);
}

#[test]
fn source_change_changes_the_hash() {
    let dir = tempfile::tempdir().expect("temp dir");
    let request = request(dir.path());
    let before = build(&request).expect("build");

    write_file(
        &request.source_dir,
        "handler/receiver.py",
        b"def handler(event, context):\n    return 200\n",
    );
    let after = build(&request).expect("build");
    assert_ne!(before.content_hash(), after.content_hash());
}

#[test]
fn archive_excludes_tests_caches_and_vcs_metadata() {
    let dir = tempfile::tempdir().expect("temp dir");
    let artifact = build(&request(dir.path())).expect("build");

    let bytes = fs::read(&artifact.path).expect("read artifact");
    assert_eq!(archive_names(&bytes), vec!["bootstrap", "handler/receiver.py"]);
    assert_eq!(artifact.manifest.source_files, vec!["bootstrap", "handler/receiver.py"]);
}

#[test]
fn dependency_closure_lands_at_archive_root() {
    let dir = tempfile::tempdir().expect("temp dir");
    let deps = dir.path().join("deps");
    write_file(&deps, "requests-2.31.0/requests/__init__.py", b"# requests");
    write_file(&deps, "requests-2.31.0/package.lock", b"urllib3==2.2.1\n");
    write_file(&deps, "urllib3-2.2.1/urllib3/__init__.py", b"# urllib3");
    let lock = write_file(dir.path(), "requirements.lock", b"# pinned\nrequests==2.31.0\n");

    let mut request = request(dir.path());
    request.dependency_lock = Some(lock);
    request.dependency_root = Some(deps);
    let artifact = build(&request).expect("build");

    let names: Vec<&str> = artifact
        .manifest
        .dependencies
        .iter()
        .map(|dependency| dependency.name.as_str())
        .collect();
    assert_eq!(names, vec!["requests", "urllib3"]);

    let bytes = fs::read(&artifact.path).expect("read artifact");
    let entries = archive_names(&bytes);
    assert!(entries.contains(&"requests/__init__.py".to_string()));
    assert!(entries.contains(&"urllib3/__init__.py".to_string()));
    assert!(!entries.iter().any(|name| name.ends_with("package.lock")));

    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes)).expect("zip");
    let mut contents = String::new();
    archive
        .by_name("urllib3/__init__.py")
        .expect("entry")
        .read_to_string(&mut contents)
        .expect("read entry");
    assert_eq!(contents, "# urllib3");
}

#[test]
fn empty_source_tree_fails_without_partial_artifact() {
    let dir = tempfile::tempdir().expect("temp dir");
    let source = dir.path().join("empty");
    fs::create_dir_all(source.join("__pycache__")).expect("mkdir");
    write_file(&source, "__pycache__/stale.pyc", b"\x00");

    let output = dir.path().join("dist/email_receiver.zip");
    let error = build(&BuildRequest {
        source_dir: source,
        entry_point: "bootstrap".to_string(),
        dependency_lock: None,
        dependency_root: None,
        output_path: output.clone(),
    })
    .expect_err("empty tree");

    assert!(matches!(error, Error::BuildFailure(_)));
    assert!(!output.exists());
    assert!(!manifest_path(&output).exists());
}

#[test]
fn unresolvable_dependency_fails_and_keeps_previous_artifact() {
    let dir = tempfile::tempdir().expect("temp dir");
    let mut request = request(dir.path());
    let good = build(&request).expect("build");
    let good_bytes = fs::read(&good.path).expect("read");

    request.dependency_lock = Some(write_file(dir.path(), "requirements.lock", b"boto3>=1.34\n"));
    request.dependency_root = Some(dir.path().join("deps"));
    let error = build(&request).expect_err("unpinned");
    assert!(matches!(error, Error::BuildFailure(_)));

    assert_eq!(fs::read(&good.path).expect("read"), good_bytes);
    assert_eq!(
        Artifact::load(&good.path).expect("load").content_hash(),
        good.content_hash()
    );
}

#[test]
fn source_file_colliding_with_dependency_fails() {
    let dir = tempfile::tempdir().expect("temp dir");
    let deps = dir.path().join("deps");
    write_file(&deps, "shadow-1.0.0/bootstrap", b"not ours");
    let lock = write_file(dir.path(), "requirements.lock", b"shadow==1.0.0\n");

    let mut request = request(dir.path());
    request.dependency_lock = Some(lock);
    request.dependency_root = Some(deps);
    let error = build(&request).expect_err("collision");
    assert!(error.to_string().contains("collides"));
}

#[test]
fn tampered_artifact_is_rejected_on_load() {
    let dir = tempfile::tempdir().expect("temp dir");
    let artifact = build(&request(dir.path())).expect("build");
    fs::write(&artifact.path, b"not the archive").expect("overwrite");

    let error = Artifact::load(&artifact.path).expect_err("hash mismatch");
    assert!(error.to_string().contains("rebuild"));
}

#[test]
fn unpublishable_manifest_leaves_no_new_archive() {
    let dir = tempfile::tempdir().expect("temp dir");
    let request = request(dir.path());
    fs::create_dir_all(manifest_path(&request.output_path)).expect("block manifest path");

    let error = build(&request).expect_err("manifest cannot be published");
    assert!(matches!(error, Error::Io { .. }));
    assert!(!request.output_path.exists());
}

#[test]
fn failed_manifest_publish_restores_the_previous_archive() {
    let dir = tempfile::tempdir().expect("temp dir");
    let request = request(dir.path());
    build(&request).expect("first build");
    let previous = fs::read(&request.output_path).expect("read artifact");

    let manifest = manifest_path(&request.output_path);
    fs::remove_file(&manifest).expect("remove manifest");
    fs::create_dir_all(&manifest).expect("block manifest path");
    write_file(
        &request.source_dir,
        "handler/receiver.py",
        b"def handler(event, context):\n    return 202\n",
    );

    build(&request).expect_err("manifest cannot be published");
    let on_disk = fs::read(&request.output_path).expect("previous archive restored");
    assert_eq!(on_disk, previous);
}
