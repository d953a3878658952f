//! End-to-end tests: scan a source root, publish invokers, execute detectors

use std::fs;
use std::path::Path;
use std::time::Duration;

use detector_api::{
    DetectorDescriptor, DetectorManifest, DetectorRequest, DetectorStatus, InvokeResult,
};
use detector_host::{CacheError, InvokerCache, SourceWatcher, SourceWatcherConfig};
use tempfile::TempDir;

const MANIFEST_OFFSET: usize = 1024;
const RESULT_OFFSET: usize = 4096;
const SCRATCH_OFFSET: usize = 32768;

fn escape_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("\\{:02x}", b)).collect()
}

fn pack(ptr: usize, len: usize) -> i64 {
    ((ptr as i64) << 32) | len as i64
}

/// Synthesize a detector module as WAT text; wasmtime compiles it directly.
fn detector_wat(id: &str, name: &str, status: DetectorStatus, message: &str) -> String {
    let manifest = DetectorManifest::new(
        DetectorDescriptor::new(id, name)
            .version("1.0.0")
            .description("integration fixture"),
    );
    let result = InvokeResult::success(status, message);

    let manifest_bytes = rmp_serde::to_vec(&manifest).unwrap();
    let result_bytes = rmp_serde::to_vec(&result).unwrap();
    let manifest_packed = pack(MANIFEST_OFFSET, manifest_bytes.len());
    let result_packed = pack(RESULT_OFFSET, result_bytes.len());

    format!(
        r#"(module
  (memory (export "memory") 1)
  (data (i32.const {MANIFEST_OFFSET}) "{manifest_data}")
  (data (i32.const {RESULT_OFFSET}) "{result_data}")
  (func (export "detector_alloc") (param i32) (result i32) i32.const {SCRATCH_OFFSET})
  (func (export "detector_dealloc") (param i32) (param i32))
  (func (export "detector_manifest") (result i64) i64.const {manifest_packed})
  (func (export "detector_invoke") (param i32) (param i32) (result i64) i64.const {result_packed}))"#,
        manifest_data = escape_bytes(&manifest_bytes),
        result_data = escape_bytes(&result_bytes),
    )
}

fn write_detector(root: &Path, dir_name: &str, wat: &str) {
    let dir = root.join(dir_name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join(format!("{dir_name}.wasm")), wat).unwrap();
}

#[tokio::test]
async fn test_scan_publish_and_invoke() {
    let temp = TempDir::new().unwrap();
    write_detector(
        temp.path(),
        "appcrashes",
        &detector_wat(
            "appcrashes",
            "App Crashes",
            DetectorStatus::Critical,
            "3 crashes in the last hour",
        ),
    );
    write_detector(
        temp.path(),
        "cpu",
        &detector_wat("cpu", "CPU Usage", DetectorStatus::Success, "CPU is healthy"),
    );

    let cache = InvokerCache::new();
    let mut config = SourceWatcherConfig::new(temp.path());
    config.watch_for_changes = false;

    let watcher = SourceWatcher::start(config, cache.clone()).unwrap();

    // Host readiness gates on the first pass
    watcher.first_pass_done().await;
    assert_eq!(cache.len(), 2);

    let request = DetectorRequest::new("/subscriptions/s1/sites/contoso")
        .parameter("stamp", "waws-prod-bay-001");

    match cache.invoke("appcrashes", &request).await.unwrap() {
        InvokeResult::Success(report) => {
            assert_eq!(report.status, DetectorStatus::Critical);
            assert_eq!(report.message, "3 crashes in the last hour");
        }
        InvokeResult::Error(e) => panic!("Unexpected error: {:?}", e),
    }

    match cache.invoke("cpu", &request).await.unwrap() {
        InvokeResult::Success(report) => {
            assert_eq!(report.status, DetectorStatus::Success);
        }
        InvokeResult::Error(e) => panic!("Unexpected error: {:?}", e),
    }
}

#[tokio::test]
async fn test_unknown_detector_is_a_clear_error() {
    let temp = TempDir::new().unwrap();
    write_detector(
        temp.path(),
        "cpu",
        &detector_wat("cpu", "CPU Usage", DetectorStatus::Success, "ok"),
    );

    let cache = InvokerCache::new();
    let mut config = SourceWatcherConfig::new(temp.path());
    config.watch_for_changes = false;

    let watcher = SourceWatcher::start(config, cache.clone()).unwrap();
    watcher.first_pass_done().await;

    let request = DetectorRequest::new("/subscriptions/s1/sites/contoso");
    match cache.invoke("doesnotexist", &request).await {
        Err(CacheError::DetectorNotFound(id)) => assert_eq!(id, "doesnotexist"),
        other => panic!("Expected DetectorNotFound, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_mixed_pass_publishes_the_valid_detectors() {
    let temp = TempDir::new().unwrap();
    write_detector(
        temp.path(),
        "cpu",
        &detector_wat("cpu", "CPU Usage", DetectorStatus::Success, "ok"),
    );
    // Corrupt artifact alongside the valid ones
    write_detector(temp.path(), "broken", "\0not a wasm module");
    // Source-only draft, never published
    let draft = temp.path().join("draft");
    fs::create_dir_all(&draft).unwrap();
    fs::write(draft.join("detector.rs"), "// not compiled yet").unwrap();

    let cache = InvokerCache::new();
    let mut config = SourceWatcherConfig::new(temp.path());
    config.watch_for_changes = false;

    let watcher = SourceWatcher::start(config, cache.clone()).unwrap();
    watcher.first_pass_done().await;

    assert_eq!(cache.len(), 1);
    assert!(cache.contains("cpu"));
}

#[tokio::test]
async fn test_newer_artifact_wins_within_a_directory() {
    let temp = TempDir::new().unwrap();
    let dir = temp.path().join("cpu");
    fs::create_dir_all(&dir).unwrap();

    let old = detector_wat("cpu", "CPU Usage (old)", DetectorStatus::Success, "old");
    let new = detector_wat("cpu", "CPU Usage", DetectorStatus::Success, "new");

    let old_path = dir.join("cpu_old.wasm");
    fs::write(&old_path, old).unwrap();
    let stale = std::time::SystemTime::now() - Duration::from_secs(3600);
    let file = fs::File::options().write(true).open(&old_path).unwrap();
    file.set_modified(stale).unwrap();

    fs::write(dir.join("cpu.wasm"), new).unwrap();

    let cache = InvokerCache::new();
    let mut config = SourceWatcherConfig::new(temp.path());
    config.watch_for_changes = false;

    let watcher = SourceWatcher::start(config, cache.clone()).unwrap();
    watcher.first_pass_done().await;

    let invoker = cache.get("cpu").unwrap();
    assert_eq!(invoker.descriptor().name, "CPU Usage");
}
