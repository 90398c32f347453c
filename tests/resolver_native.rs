// Native loader tests against libraries already mapped into the test process.
#![cfg(target_os = "linux")]

use std::path::PathBuf;

use epkit::core::error::ErrorKind;
use epkit::core::resolver::{LibraryResolver, LoadOutcome};

fn resident_libc() -> PathBuf {
    let maps = std::fs::read_to_string("/proc/self/maps").expect("read maps");
    maps.lines()
        .filter_map(|line| line.split_whitespace().nth(5))
        .map(PathBuf::from)
        .find(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("libc.so") || name.starts_with("libc-"))
        })
        .expect("libc mapped")
}

#[test]
fn probe_finds_resident_libc_with_path() {
    let libc = resident_libc();
    let name = libc.file_name().unwrap().to_str().unwrap();
    let residency = LibraryResolver::native().probe(name).expect("resident");
    assert_eq!(residency.path.as_deref(), Some(libc.as_path()));
}

#[test]
fn preloading_resident_library_from_same_path_is_noop() {
    let libc = resident_libc();
    let loaded = LibraryResolver::native()
        .preload_dependency(&libc)
        .expect("preload");
    assert_eq!(loaded.outcome, LoadOutcome::AlreadyResident);
    assert_eq!(loaded.path, std::fs::canonicalize(&libc).unwrap());
}

#[test]
fn same_name_from_other_path_is_dependency_order_error() {
    let libc = resident_libc();
    let temp = tempfile::tempdir().expect("tempdir");
    let copy = temp.path().join(libc.file_name().unwrap());
    std::fs::copy(&libc, &copy).expect("copy libc");

    let err = LibraryResolver::native()
        .preload_dependency(&copy)
        .expect_err("conflict");
    assert_eq!(err.kind(), ErrorKind::DependencyOrder);
    assert_eq!(err.role(), Some("dependency"));
    assert!(err.message().unwrap().contains(&libc.display().to_string()));
}
