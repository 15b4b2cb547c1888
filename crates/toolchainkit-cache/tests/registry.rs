use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use tempfile::TempDir;
use toolchainkit_cache::{
    canonical_project_path, CacheDir, CacheError, Registration, Registry, UnusedFilter,
};

fn new_cache() -> (TempDir, CacheDir) {
    let tmp = tempfile::tempdir().unwrap();
    let cache = CacheDir::at(tmp.path().join("cache")).unwrap();
    (tmp, cache)
}

fn fake_install(cache: &CacheDir, id: &str, bytes: usize) -> PathBuf {
    let dir = cache.toolchain_path(id).unwrap();
    fs::create_dir_all(dir.join("bin")).unwrap();
    fs::write(dir.join("bin").join("cc"), vec![7u8; bytes]).unwrap();
    dir
}

fn registration(path: &Path, size_mb: f64) -> Registration {
    Registration {
        path: path.to_path_buf(),
        size_mb,
        hash: String::new(),
        source_url: "https://example.invalid/tool.tar.gz".to_owned(),
        verified: false,
    }
}

fn project(tmp: &TempDir, name: &str) -> PathBuf {
    let dir = tmp.path().join(name);
    fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn references_are_a_set_of_projects() {
    let (tmp, cache) = new_cache();
    let registry = Registry::open(&cache);
    let path = fake_install(&cache, "llvm-18-linux-x64", 16);
    registry
        .register("llvm-18-linux-x64", registration(&path, 1.0))
        .unwrap();

    let a = project(&tmp, "a");
    let b = project(&tmp, "b");
    assert_eq!(registry.add_ref("llvm-18-linux-x64", &a).unwrap(), 1);
    assert_eq!(registry.add_ref("llvm-18-linux-x64", &a).unwrap(), 1);
    assert_eq!(registry.add_ref("llvm-18-linux-x64", &b).unwrap(), 2);

    assert_eq!(registry.remove_ref("llvm-18-linux-x64", &a).unwrap(), Some(1));
    assert_eq!(registry.remove_ref("llvm-18-linux-x64", &a).unwrap(), Some(1));
    assert_eq!(registry.remove_ref("unknown-1-linux-x64", &a).unwrap(), None);

    let record = registry.get("llvm-18-linux-x64").unwrap().unwrap();
    assert_eq!(
        record.projects.into_iter().collect::<Vec<_>>(),
        vec![canonical_project_path(&b).unwrap()]
    );
}

#[test]
fn add_ref_refreshes_last_used() {
    let (tmp, cache) = new_cache();
    let registry = Registry::open(&cache);
    let path = fake_install(&cache, "gcc-13-linux-x64", 16);
    registry
        .register("gcc-13-linux-x64", registration(&path, 1.0))
        .unwrap();

    let mut txn = registry.begin().unwrap();
    txn.document_mut()
        .toolchains
        .get_mut("gcc-13-linux-x64")
        .unwrap()
        .last_used = "2020-01-01T00:00:00Z".to_owned();
    txn.commit().unwrap();
    let before = registry
        .get("gcc-13-linux-x64")
        .unwrap()
        .unwrap()
        .last_used_at()
        .unwrap();

    registry
        .add_ref("gcc-13-linux-x64", &project(&tmp, "p"))
        .unwrap();
    let after = registry
        .get("gcc-13-linux-x64")
        .unwrap()
        .unwrap()
        .last_used_at()
        .unwrap();
    assert!(after > before);
}

#[test]
fn unregister_in_use_leaves_document_untouched() {
    let (tmp, cache) = new_cache();
    let registry = Registry::open(&cache);
    let path = fake_install(&cache, "llvm-18-linux-x64", 16);
    registry
        .register("llvm-18-linux-x64", registration(&path, 1.0))
        .unwrap();
    registry
        .add_ref("llvm-18-linux-x64", &project(&tmp, "p"))
        .unwrap();

    let before = fs::read(registry.path()).unwrap();
    let err = registry.unregister("llvm-18-linux-x64").unwrap_err();
    match err {
        CacheError::ToolchainInUse { id, projects } => {
            assert_eq!(id, "llvm-18-linux-x64");
            assert_eq!(projects.len(), 1);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(fs::read(registry.path()).unwrap(), before);
    assert!(path.is_dir());

    // Unknown ids are a no-op.
    registry.unregister("nothing-0-none").unwrap();
}

#[test]
fn total_size_is_the_sum_of_records() {
    let (_tmp, cache) = new_cache();
    let registry = Registry::open(&cache);
    let a = fake_install(&cache, "a-1-linux-x64", 1);
    let b = fake_install(&cache, "b-1-linux-x64", 1);
    registry.register("a-1-linux-x64", registration(&a, 100.0)).unwrap();
    registry.register("b-1-linux-x64", registration(&b, 200.0)).unwrap();
    assert_eq!(registry.snapshot().unwrap().total_size_mb, 300.0);

    registry.unregister("a-1-linux-x64").unwrap();
    let document = registry.snapshot().unwrap();
    assert_eq!(document.total_size_mb, 200.0);
    assert_eq!(document.toolchains.len(), 1);

    // Files on disk are not the registry's business.
    assert!(a.is_dir());
}

#[test]
fn unparsable_registry_is_quarantined_and_rebuilt() {
    let (_tmp, cache) = new_cache();
    fake_install(&cache, "llvm-18-linux-x64", 2048);
    fs::create_dir_all(cache.toolchains_dir().join(".staging-abc").join("bin")).unwrap();
    fs::write(cache.registry_path(), b"{ this is not json").unwrap();

    let registry = Registry::open(&cache);
    assert_eq!(registry.list_ids().unwrap(), vec!["llvm-18-linux-x64"]);

    let record = registry.get("llvm-18-linux-x64").unwrap().unwrap();
    assert_eq!(record.ref_count(), 0);
    assert!(record.size_bytes() >= 2048);
    assert!(record.last_used_at().is_some());

    let quarantined: Vec<String> = fs::read_dir(cache.root())
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with("registry.json.corrupt-"))
        .collect();
    assert_eq!(quarantined.len(), 1, "{quarantined:?}");

    // The rebuilt document was persisted.
    let value: serde_json::Value =
        serde_json::from_slice(&fs::read(cache.registry_path()).unwrap()).unwrap();
    assert_eq!(value["version"], 1);
}

#[test]
fn registry_missing_required_keys_is_rebuilt_the_same_way() {
    let (_tmp, cache) = new_cache();
    fake_install(&cache, "cmake-3.28-linux-x64", 16);
    fs::write(cache.registry_path(), br#"{"toolchains": {}}"#).unwrap();

    let registry = Registry::open(&cache);
    assert_eq!(registry.list_ids().unwrap(), vec!["cmake-3.28-linux-x64"]);
    assert!(fs::read_dir(cache.root()).unwrap().any(|entry| entry
        .unwrap()
        .file_name()
        .to_string_lossy()
        .starts_with("registry.json.corrupt-")));
}

#[test]
fn newer_format_version_is_a_hard_error() {
    let (_tmp, cache) = new_cache();
    fs::write(cache.registry_path(), br#"{"version": 99, "toolchains": {}}"#).unwrap();

    let registry = Registry::open(&cache);
    let err = registry.list_ids().unwrap_err();
    assert!(matches!(err, CacheError::Registry { .. }), "{err:?}");
    assert!(cache.registry_path().is_file());
}

#[test]
fn concurrent_add_ref_loses_no_updates() {
    const THREADS: usize = 8;
    let (tmp, cache) = new_cache();
    let registry = Registry::open(&cache);
    let path = fake_install(&cache, "llvm-18-linux-x64", 16);
    registry
        .register("llvm-18-linux-x64", registration(&path, 1.0))
        .unwrap();

    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let registry = registry.clone();
            let barrier = Arc::clone(&barrier);
            let project = project(&tmp, &format!("project-{i}"));
            std::thread::spawn(move || {
                barrier.wait();
                registry.add_ref("llvm-18-linux-x64", &project).unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(registry.ref_count("llvm-18-linux-x64").unwrap(), THREADS);
}

#[test]
fn add_ref_purges_records_whose_install_vanished() {
    let (tmp, cache) = new_cache();
    let registry = Registry::open(&cache);
    let gone = cache.toolchain_path("gone-1-linux-x64").unwrap();
    registry
        .register("gone-1-linux-x64", registration(&gone, 1.0))
        .unwrap();

    let err = registry
        .add_ref("gone-1-linux-x64", &project(&tmp, "p"))
        .unwrap_err();
    assert!(matches!(err, CacheError::ToolchainNotInCache { .. }), "{err:?}");
    assert!(registry.get("gone-1-linux-x64").unwrap().is_none());
}

#[test]
fn unused_filter_and_stats() {
    let (tmp, cache) = new_cache();
    let registry = Registry::open(&cache);
    for id in ["a-1-linux-x64", "b-1-linux-x64", "c-1-linux-x64"] {
        let path = fake_install(&cache, id, 16);
        registry.register(id, registration(&path, 10.0)).unwrap();
    }
    registry
        .add_ref("a-1-linux-x64", &project(&tmp, "p"))
        .unwrap();

    let mut txn = registry.begin().unwrap();
    txn.document_mut()
        .toolchains
        .get_mut("b-1-linux-x64")
        .unwrap()
        .last_used = "2000-01-01T00:00:00Z".to_owned();
    txn.commit().unwrap();

    assert_eq!(
        registry.unused_toolchains(&UnusedFilter::default()).unwrap(),
        vec!["b-1-linux-x64", "c-1-linux-x64"]
    );
    assert_eq!(
        registry
            .unused_toolchains(&UnusedFilter::older_than(Duration::from_secs(30 * 24 * 3600)))
            .unwrap(),
        vec!["b-1-linux-x64"]
    );

    let stats = registry.stats().unwrap();
    assert_eq!(stats.total_toolchains, 3);
    assert_eq!(stats.total_size_mb, 30.0);
    assert_eq!(stats.unused_toolchains, 2);
    assert_eq!(stats.reclaimable_size_mb, 20.0);
    assert_eq!(stats.last_cleanup, None);

    registry.mark_cleanup().unwrap();
    assert!(registry.stats().unwrap().last_cleanup.is_some());
}

#[test]
fn prune_missing_drops_only_vanished_installs() {
    let (_tmp, cache) = new_cache();
    let registry = Registry::open(&cache);
    let kept = fake_install(&cache, "kept-1-linux-x64", 16);
    let gone = fake_install(&cache, "gone-1-linux-x64", 16);
    registry.register("kept-1-linux-x64", registration(&kept, 1.0)).unwrap();
    registry.register("gone-1-linux-x64", registration(&gone, 1.0)).unwrap();
    fs::remove_dir_all(&gone).unwrap();

    assert_eq!(registry.prune_missing().unwrap(), vec!["gone-1-linux-x64"]);
    assert_eq!(registry.list_ids().unwrap(), vec!["kept-1-linux-x64"]);
    assert!(registry.prune_missing().unwrap().is_empty());
}

#[test]
fn invalid_ids_are_rejected() {
    let (_tmp, cache) = new_cache();
    let registry = Registry::open(&cache);
    for id in ["", "../escape", ".hidden", "a/b"] {
        let err = registry
            .register(id, registration(Path::new("/tmp/x"), 1.0))
            .unwrap_err();
        assert!(matches!(err, CacheError::InvalidArgument { .. }), "{id}: {err:?}");
    }
}

#[test]
fn re_registering_keeps_existing_references() {
    let (tmp, cache) = new_cache();
    let registry = Registry::open(&cache);
    let path = fake_install(&cache, "cmake-3.28-linux-x64", 16);
    registry
        .register("cmake-3.28-linux-x64", registration(&path, 1.0))
        .unwrap();
    let user = project(&tmp, "user");
    registry.add_ref("cmake-3.28-linux-x64", &user).unwrap();

    let mut replacement = registration(&path, 2.5);
    replacement.hash = "sha256:abcd".to_owned();
    replacement.verified = true;
    registry
        .register("cmake-3.28-linux-x64", replacement)
        .unwrap();

    let record = registry.get("cmake-3.28-linux-x64").unwrap().unwrap();
    assert_eq!(record.ref_count(), 1);
    assert!(record
        .projects
        .contains(&canonical_project_path(&user).unwrap()));
    assert_eq!(record.size_mb, 2.5);
    assert_eq!(record.hash, "sha256:abcd");
    assert!(record.verified);
}
