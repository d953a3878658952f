//! In-test detector fixtures built from WAT text.
//!
//! wasmtime compiles WAT as well as binary wasm, so tests synthesize tiny
//! detector modules whose exports return pre-serialized payloads baked into
//! linear memory as data segments.

use detector_api::{DetectorDescriptor, DetectorManifest, DetectorStatus, InvokeResult};

const MANIFEST_OFFSET: usize = 1024;
const RESULT_OFFSET: usize = 4096;
const SCRATCH_OFFSET: usize = 32768;

fn escape_bytes(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("\\{:02x}", b)).collect()
}

fn pack(ptr: usize, len: usize) -> i64 {
    ((ptr as i64) << 32) | len as i64
}

/// Build a detector module returning the given manifest and invoke result
pub(crate) fn detector_wat(manifest: &DetectorManifest, result: &InvokeResult) -> String {
    let manifest_bytes = rmp_serde::to_vec(manifest).expect("serialize manifest fixture");
    let result_bytes = rmp_serde::to_vec(result).expect("serialize result fixture");
    assert!(manifest_bytes.len() < RESULT_OFFSET - MANIFEST_OFFSET);
    assert!(result_bytes.len() < SCRATCH_OFFSET - RESULT_OFFSET);

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

/// Build a detector module that reports a healthy resource
pub(crate) fn healthy_detector_wat(id: &str, name: &str) -> String {
    let manifest = DetectorManifest::new(DetectorDescriptor::new(id, name).version("1.0.0"));
    detector_wat(
        &manifest,
        &InvokeResult::success(DetectorStatus::Success, "healthy"),
    )
}

/// Build a detector module with an explicit version string
pub(crate) fn versioned_detector_wat(id: &str, name: &str, version: &str) -> String {
    let manifest = DetectorManifest::new(DetectorDescriptor::new(id, name).version(version));
    detector_wat(
        &manifest,
        &InvokeResult::success(DetectorStatus::Success, "healthy"),
    )
}
