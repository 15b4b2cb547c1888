use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::time::Duration;

use toolchainkit_cache::{
    CacheDir, CacheError, Coordination, CoordinatorOptions, DownloadCoordinator, LockManager,
};

fn finish_install(dest: &Path) {
    fs::create_dir_all(dest.join("bin")).unwrap();
    fs::write(dest.join("bin").join("clang"), b"elf").unwrap();
}

#[test]
fn installed_toolchain_takes_the_fast_path() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = CacheDir::at(tmp.path()).unwrap();
    let locks = LockManager::for_cache(&cache);
    let dest = cache.toolchain_path("llvm-18-linux-x64").unwrap();
    finish_install(&dest);

    let coordinator = DownloadCoordinator::new(locks.clone());
    let outcome = coordinator.coordinate("llvm-18-linux-x64", &dest).unwrap();
    assert!(!outcome.should_download());
    assert!(!locks
        .toolchain_lock_path("llvm-18-linux-x64")
        .unwrap()
        .exists());
}

#[test]
fn empty_destination_directory_still_needs_a_download() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = CacheDir::at(tmp.path()).unwrap();
    let dest = cache.toolchain_path("llvm-18-linux-x64").unwrap();
    fs::create_dir_all(&dest).unwrap();

    let coordinator = DownloadCoordinator::new(LockManager::for_cache(&cache));
    match coordinator.coordinate("llvm-18-linux-x64", &dest).unwrap() {
        Coordination::Download(permit) => assert_eq!(permit.toolchain_id(), "llvm-18-linux-x64"),
        Coordination::Ready => panic!("an empty directory is not an install"),
    }
}

#[test]
fn exactly_one_concurrent_caller_downloads() {
    const THREADS: usize = 8;
    let tmp = tempfile::tempdir().unwrap();
    let cache = CacheDir::at(tmp.path()).unwrap();
    let coordinator = DownloadCoordinator::new(LockManager::for_cache(&cache));
    let dest = cache.toolchain_path("gcc-13-linux-x64").unwrap();

    let downloads = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(THREADS));
    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let coordinator = coordinator.clone();
            let dest = dest.clone();
            let downloads = Arc::clone(&downloads);
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                barrier.wait();
                match coordinator.coordinate("gcc-13-linux-x64", &dest).unwrap() {
                    Coordination::Download(permit) => {
                        downloads.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(100));
                        finish_install(&dest);
                        drop(permit);
                    }
                    Coordination::Ready => {}
                }
                assert!(dest.join("bin").join("clang").is_file());
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(downloads.load(Ordering::SeqCst), 1);
}

#[test]
fn lock_timeout_falls_back_to_polling_for_the_install() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = CacheDir::at(tmp.path()).unwrap();
    let locks = LockManager::for_cache(&cache);
    let dest = cache.toolchain_path("cmake-3.28-linux-x64").unwrap();

    // Simulates a slow installer elsewhere that keeps the lock the whole time.
    let held = locks.lock_toolchain("cmake-3.28-linux-x64").unwrap();
    let installer = {
        let dest = dest.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(300));
            finish_install(&dest);
        })
    };

    let coordinator = DownloadCoordinator::new(locks).with_options(CoordinatorOptions {
        lock_timeout: Duration::from_millis(100),
        wait_timeout: Duration::from_secs(10),
        poll_interval: Duration::from_millis(20),
    });
    let outcome = coordinator.coordinate("cmake-3.28-linux-x64", &dest).unwrap();
    assert!(matches!(outcome, Coordination::Ready));

    installer.join().unwrap();
    drop(held);
}

#[test]
fn waiting_gives_up_after_the_wait_timeout() {
    let tmp = tempfile::tempdir().unwrap();
    let cache = CacheDir::at(tmp.path()).unwrap();
    let locks = LockManager::for_cache(&cache);
    let dest = cache.toolchain_path("ninja-1.12-linux-x64").unwrap();
    let _held = locks.lock_toolchain("ninja-1.12-linux-x64").unwrap();

    let coordinator = DownloadCoordinator::new(locks).with_options(CoordinatorOptions {
        lock_timeout: Duration::from_millis(50),
        wait_timeout: Duration::from_millis(100),
        poll_interval: Duration::from_millis(20),
    });
    let err = coordinator
        .coordinate("ninja-1.12-linux-x64", &dest)
        .unwrap_err();
    match &err {
        CacheError::CoordinatorTimeout { id, waited } => {
            assert_eq!(id, "ninja-1.12-linux-x64");
            assert!(*waited >= Duration::from_millis(100));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(err.is_retryable());
}
