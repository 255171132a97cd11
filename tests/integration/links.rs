use memvfs::Errno;

use crate::helpers::fs;

#[test]
fn symlink_readlink_round_trip() {
    let fs = fs();
    fs.mkdir("/d").unwrap();
    fs.symlink("../up", "/d/rel").unwrap();
    fs.symlink("/abs/target", "/d/abs").unwrap();

    // Targets are stored verbatim.
    assert_eq!(fs.readlink("/d/rel").unwrap(), "../up");
    assert_eq!(fs.readlink("/d/abs").unwrap(), "/abs/target");
    assert_eq!(fs.readlink("/d").unwrap_err().code, Errno::EINVAL);
}

#[test]
fn stat_follows_lstat_does_not() {
    let fs = fs();
    fs.write_file("/target", "payload").unwrap();
    fs.symlink("/target", "/ln").unwrap();

    let st = fs.stat("/ln").unwrap();
    assert!(st.is_file());
    assert_eq!(st.size, 7);
    assert_eq!(st.ino, fs.stat("/target").unwrap().ino);

    let lst = fs.lstat("/ln").unwrap();
    assert!(lst.is_symbolic_link());
    assert_eq!(lst.size, "/target".len() as u64);
    assert_ne!(lst.ino, st.ino);
}

#[test]
fn relative_symlinks_resolve_against_their_directory() {
    let fs = fs();
    fs.mkdirp("/a/b").unwrap();
    fs.write_file("/a/data", "here").unwrap();
    fs.symlink("../data", "/a/b/link").unwrap();
    assert_eq!(fs.read_file("/a/b/link").unwrap(), b"here");
    assert_eq!(fs.realpath("/a/b/link").unwrap(), "/a/data");
}

#[test]
fn symlinked_directories_resolve_mid_path() {
    let fs = fs();
    fs.mkdirp("/real/inner").unwrap();
    fs.write_file("/real/inner/f", "x").unwrap();
    fs.symlink("/real", "/alias").unwrap();

    assert_eq!(fs.read_file("/alias/inner/f").unwrap(), b"x");
    // Even under no-follow, only the final component is exempt.
    assert!(fs.lstat("/alias/inner/f").unwrap().is_file());
}

#[test]
fn broken_symlinks_stat_enoent_but_lstat_fine() {
    let fs = fs();
    fs.symlink("/nowhere", "/dangling").unwrap();
    assert_eq!(fs.stat("/dangling").unwrap_err().code, Errno::ENOENT);
    assert!(fs.lstat("/dangling").unwrap().is_symbolic_link());

    // Unlink removes the link itself.
    fs.unlink("/dangling").unwrap();
    assert_eq!(fs.lstat("/dangling").unwrap_err().code, Errno::ENOENT);
}

#[test]
fn hard_link_accounting() {
    let fs = fs();
    fs.write_file("/x", "z").unwrap();
    fs.link("/x", "/y").unwrap();

    assert_eq!(fs.stat("/x").unwrap().nlink, 2);
    assert_eq!(fs.stat("/x").unwrap().ino, fs.stat("/y").unwrap().ino);

    fs.unlink("/x").unwrap();
    assert_eq!(fs.stat("/y").unwrap().nlink, 1);
    assert_eq!(fs.read_file("/y").unwrap(), b"z");
}

#[test]
fn hard_links_share_content_writes() {
    let fs = fs();
    fs.write_file("/x", "first").unwrap();
    fs.link("/x", "/y").unwrap();
    fs.write_file("/y", "second").unwrap();
    assert_eq!(fs.read_file("/x").unwrap(), b"second");
}

#[test]
fn link_failure_modes() {
    let fs = fs();
    fs.mkdir("/d").unwrap();
    fs.write_file("/f", "x").unwrap();

    assert_eq!(fs.link("/d", "/d2").unwrap_err().code, Errno::EPERM);
    assert_eq!(fs.link("/f", "/f").unwrap_err().code, Errno::EEXIST);
    assert_eq!(fs.link("/gone", "/g").unwrap_err().code, Errno::ENOENT);
    assert_eq!(fs.link("/f", "/no/dir/g").unwrap_err().code, Errno::ENOENT);
}

#[test]
fn hard_link_to_a_symlink_links_the_symlink() {
    let fs = fs();
    fs.write_file("/t", "x").unwrap();
    fs.symlink("/t", "/s").unwrap();
    fs.link("/s", "/s2").unwrap();
    assert!(fs.lstat("/s2").unwrap().is_symbolic_link());
    assert_eq!(fs.lstat("/s").unwrap().nlink, 2);
}

#[test]
fn direct_symlink_loop() {
    let fs = fs();
    fs.symlink("/l", "/l").unwrap();
    assert_eq!(fs.stat("/l").unwrap_err().code, Errno::ELOOP);
    assert!(fs.lstat("/l").unwrap().is_symbolic_link());
}

#[test]
fn mutual_symlink_loop() {
    let fs = fs();
    fs.symlink("/b", "/a").unwrap();
    fs.symlink("/a", "/b").unwrap();
    assert_eq!(fs.stat("/a").unwrap_err().code, Errno::ELOOP);
}

#[test]
fn chain_of_39_resolves_and_40_loops() {
    let fs = fs();
    fs.write_file("/t", "deep").unwrap();
    fs.symlink("/t", "/s1").unwrap();
    for i in 2..=40 {
        fs.symlink(&format!("/s{}", i - 1), &format!("/s{}", i)).unwrap();
    }
    // 39 expansions fit inside the budget.
    assert_eq!(fs.read_file("/s39").unwrap(), b"deep");
    // The 40th does not.
    assert_eq!(fs.stat("/s40").unwrap_err().code, Errno::ELOOP);
}

#[test]
fn rename_follows_no_final_symlinks() {
    let fs = fs();
    fs.write_file("/t", "x").unwrap();
    fs.symlink("/t", "/s").unwrap();
    fs.rename("/s", "/moved").unwrap();
    // The symlink moved; the target stayed.
    assert!(fs.lstat("/moved").unwrap().is_symbolic_link());
    assert_eq!(fs.read_file("/t").unwrap(), b"x");
    assert!(!fs.exists("/s"));
}

#[test]
fn multi_directory_links_report_all_paths() {
    let fs = fs();
    fs.mkdirp("/a").unwrap();
    fs.mkdirp("/b").unwrap();
    fs.write_file("/a/one", "n").unwrap();
    fs.link("/a/one", "/b/two").unwrap();
    fs.link("/a/one", "/a/three").unwrap();

    assert_eq!(fs.stat("/a/one").unwrap().nlink, 3);
    assert_eq!(
        fs.paths("/b/two").unwrap(),
        vec![
            "/a/one".to_string(),
            "/a/three".to_string(),
            "/b/two".to_string()
        ]
    );

    fs.unlink("/a/one").unwrap();
    assert_eq!(
        fs.paths("/b/two").unwrap(),
        vec!["/a/three".to_string(), "/b/two".to_string()]
    );
}
