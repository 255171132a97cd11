use std::sync::Arc;

use memvfs::{Errno, FileSet, FileSetEntry, MemFs, MemFsOptions};
use serde_json::json;

use crate::helpers::{fs, init_logging, FakeTree};

#[test]
fn apply_builds_nested_trees_from_plain_values() {
    let fs = fs();
    let mut inner = FileSet::new();
    inner.insert("readme.md".to_string(), "# hi".into());
    inner.insert("raw.bin".to_string(), vec![1u8, 2, 3].into());

    let mut files = FileSet::new();
    files.insert("/project".to_string(), inner.into());
    files.insert("/notes.txt".to_string(), "plain string".into());
    fs.apply(&files).unwrap();

    assert_eq!(fs.read_file("/project/readme.md").unwrap(), b"# hi");
    assert_eq!(fs.read_file("/project/raw.bin").unwrap(), [1, 2, 3]);
    assert_eq!(fs.read_file("/notes.txt").unwrap(), b"plain string");
    assert!(fs.stat("/project").unwrap().is_directory());
}

#[test]
fn constructor_applies_files_and_enters_cwd() {
    init_logging();
    let mut files = FileSet::new();
    files.insert("/srv/app/config.json".to_string(), "{}".into());
    let fs = MemFs::with_options(MemFsOptions {
        files: Some(files),
        cwd: Some("/srv/app".to_string()),
        ..Default::default()
    })
    .unwrap();

    assert_eq!(fs.cwd(), "/srv/app");
    assert_eq!(fs.read_file("config.json").unwrap(), b"{}");
}

#[test]
fn deferred_entries_may_reference_first_pass_files() {
    let fs = fs();
    let mut files = FileSet::new();
    // BTreeMap order would apply /a-link before /z/original; the deferred
    // second pass makes it work anyway.
    files.insert("/a-link".to_string(), FileSetEntry::hard_link("/z/original"));
    files.insert("/a-sym".to_string(), FileSetEntry::symlink("/z/original"));
    files.insert("/z/original".to_string(), "payload".into());
    fs.apply(&files).unwrap();

    assert_eq!(fs.read_file("/a-link").unwrap(), b"payload");
    assert_eq!(fs.stat("/a-link").unwrap().nlink, 2);
    assert_eq!(fs.readlink("/a-sym").unwrap(), "/z/original");
}

#[test]
fn apply_mounts_in_the_deferred_pass() {
    let fs = fs();
    let tree = Arc::new(FakeTree::new().dir("/ext").file("/ext/f.txt", "ext"));
    let mut files = FileSet::new();
    files.insert("/m".to_string(), FileSetEntry::mount("/ext", tree.clone()));
    fs.apply(&files).unwrap();

    assert_eq!(tree.readdir_count(), 0);
    assert_eq!(fs.read_file("/m/f.txt").unwrap(), b"ext");
}

#[test]
fn remove_entries_rimraf_existing_paths() {
    let fs = fs();
    fs.mkdirp("/old/deep").unwrap();
    fs.write_file("/old/deep/f", "x").unwrap();

    let mut files = FileSet::new();
    files.insert("/old".to_string(), FileSetEntry::Remove);
    files.insert("/new".to_string(), "fresh".into());
    fs.apply(&files).unwrap();

    assert!(!fs.exists("/old"));
    assert_eq!(fs.read_file("/new").unwrap(), b"fresh");
}

#[test]
fn roots_may_only_be_directories_or_mounts() {
    init_logging();

    let mut files = FileSet::new();
    files.insert("/".to_string(), "not allowed".into());
    assert_eq!(fs_err(&files), Errno::EINVAL);

    let mut files = FileSet::new();
    files.insert("/".to_string(), FileSetEntry::symlink("/x"));
    assert_eq!(fs_err(&files), Errno::EINVAL);

    let mut files = FileSet::new();
    files.insert("/".to_string(), FileSetEntry::Remove);
    assert_eq!(fs_err(&files), Errno::EINVAL);

    // A directory entry at the root merely restates the root.
    let mut files = FileSet::new();
    files.insert("/".to_string(), FileSet::new().into());
    MemFs::new().apply(&files).unwrap();
}

fn fs_err(files: &FileSet) -> Errno {
    MemFs::new().apply(files).unwrap_err().code
}

#[test]
fn modes_and_metadata_ride_along() {
    let fs = fs();
    let mut files = FileSet::new();
    files.insert(
        "/bin/tool".to_string(),
        FileSetEntry::file("#!/bin/sh").with_mode(0o755),
    );
    files.insert(
        "/tagged".to_string(),
        FileSetEntry::file("x").with_metadata(json!({"owner": "tests"})),
    );
    fs.apply(&files).unwrap();

    assert_eq!(fs.stat("/bin/tool").unwrap().mode & 0o7777, 0o755);
    assert_eq!(
        fs.metadata("/tagged").unwrap(),
        Some(json!({"owner": "tests"}))
    );
    assert_eq!(fs.metadata("/bin/tool").unwrap(), None);
}

#[test]
fn apply_is_rejected_on_a_frozen_file_system() {
    let fs = fs();
    fs.make_readonly();
    let mut files = FileSet::new();
    files.insert("/x".to_string(), "x".into());
    assert_eq!(fs.apply(&files).unwrap_err().code, Errno::EROFS);
}
