use std::sync::Arc;

use memvfs::Errno;

use crate::helpers::{fs, FakeTree};

#[test]
fn mount_consults_the_resolver_lazily_and_exactly_once() {
    let fs = fs();
    let tree = Arc::new(FakeTree::new().dir("/src").file("/src/a.txt", "alpha"));
    fs.mount("/src", "/m", tree.clone()).unwrap();

    // Nothing is listed until the mount is first walked through.
    assert_eq!(tree.readdir_count(), 0);
    assert_eq!(tree.stat_count(), 0);

    let st = fs.stat("/m/a.txt").unwrap();
    assert!(st.is_file());
    assert_eq!(st.size, 5);
    assert_eq!(tree.readdir_count(), 1);
    assert_eq!(tree.stat_count(), 1);

    // A second stat is served from the materialized tree.
    fs.stat("/m/a.txt").unwrap();
    fs.readdir("/m").unwrap();
    assert_eq!(tree.readdir_count(), 1);
    assert_eq!(tree.stat_count(), 1);
}

#[test]
fn nested_mount_directories_stay_pinned_until_visited() {
    let fs = fs();
    let tree = Arc::new(
        FakeTree::new()
            .dir("/src")
            .dir("/src/sub")
            .file("/src/sub/deep.txt", "deep"),
    );
    fs.mount("/src", "/m", tree.clone()).unwrap();

    assert_eq!(fs.readdir("/m").unwrap(), vec!["sub"]);
    assert_eq!(tree.readdir_count(), 1);

    // Descending into the subdirectory triggers its own listing.
    assert_eq!(fs.readdir("/m/sub").unwrap(), vec!["deep.txt"]);
    assert_eq!(tree.readdir_count(), 2);
    assert_eq!(fs.read_file("/m/sub/deep.txt").unwrap(), b"deep");
}

#[test]
fn file_contents_load_once_on_first_read() {
    let fs = fs();
    let tree = Arc::new(FakeTree::new().dir("/src").file("/src/a.txt", "alpha"));
    fs.mount("/src", "/m", tree.clone()).unwrap();

    // stat pins the size without reading contents.
    assert_eq!(fs.stat("/m/a.txt").unwrap().size, 5);
    assert_eq!(tree.read_count(), 0);

    assert_eq!(fs.read_file("/m/a.txt").unwrap(), b"alpha");
    assert_eq!(tree.read_count(), 1);
    assert_eq!(fs.read_file("/m/a.txt").unwrap(), b"alpha");
    assert_eq!(tree.read_count(), 1);
}

#[test]
fn mounted_files_accept_writes_in_memory() {
    let fs = fs();
    let tree = Arc::new(FakeTree::new().dir("/src").file("/src/a.txt", "alpha"));
    fs.mount("/src", "/m", tree.clone()).unwrap();

    fs.write_file("/m/a.txt", "rewritten").unwrap();
    assert_eq!(fs.read_file("/m/a.txt").unwrap(), b"rewritten");
    // The external tree is never written back.
    assert_eq!(tree.read_count(), 0);
}

#[test]
fn non_file_non_dir_entries_are_not_materialized() {
    let fs = fs();
    let tree = Arc::new(
        FakeTree::new()
            .dir("/src")
            .file("/src/keep.txt", "k")
            .special("/src/link", 0o120777),
    );
    fs.mount("/src", "/m", tree).unwrap();
    assert_eq!(fs.readdir("/m").unwrap(), vec!["keep.txt"]);
    assert!(!fs.exists("/m/link"));
}

#[test]
fn mount_target_collisions_and_missing_parents() {
    let fs = fs();
    let tree = Arc::new(FakeTree::new().dir("/src"));
    fs.mkdir("/taken").unwrap();
    assert_eq!(
        fs.mount("/src", "/taken", tree.clone()).unwrap_err().code,
        Errno::EEXIST
    );
    assert_eq!(
        fs.mount("/src", "/no/parent", tree).unwrap_err().code,
        Errno::ENOENT
    );
}

#[test]
fn resolver_errors_surface_as_fs_errors() {
    let fs = fs();
    // The source directory does not exist in the fake tree.
    let tree = Arc::new(FakeTree::new());
    fs.mount("/ghost", "/m", tree).unwrap();
    assert_eq!(fs.readdir("/m").unwrap_err().code, Errno::ENOENT);
}

#[test]
fn host_fs_mounts_a_real_directory() {
    let fs = fs();
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("hello.txt"), "from disk").unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("sub/nested.txt"), "nested").unwrap();

    let host = Arc::new(memvfs::HostFs);
    fs.mount(dir.path().to_str().unwrap(), "/host", host).unwrap();

    assert_eq!(fs.readdir("/host").unwrap(), vec!["hello.txt", "sub"]);
    assert_eq!(fs.read_file("/host/hello.txt").unwrap(), b"from disk");
    assert_eq!(fs.read_file("/host/sub/nested.txt").unwrap(), b"nested");
    assert!(fs.stat("/host/sub").unwrap().is_directory());
}
