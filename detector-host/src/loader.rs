//! Detector loader using wasmtime
//!
//! Binds a discovered artifact to an executable wasm instance, locates the
//! well-known entry-point export, reads the declared identity and produces
//! an immutable [`Invoker`]. Loads of distinct artifacts may run concurrently;
//! the only shared state is the wasmtime engine, which tolerates that.

use std::path::PathBuf;

use detector_api::{
    DetectorDescriptor, DetectorManifest, DetectorRequest, InvokeResult, ALLOC_EXPORT, API_VERSION,
    DEALLOC_EXPORT, INVOKE_EXPORT, MANIFEST_EXPORT, MEMORY_EXPORT,
};
use thiserror::Error;
use tokio::sync::Mutex;
use wasmtime::*;

use crate::scanner::DetectorArtifact;

/// CPU budget per guest call
const FUEL_PER_CALL: u64 = 10_000_000;

/// Errors that can occur while constructing the loader itself
#[derive(Debug, Error)]
pub enum LoaderInitError {
    #[error("Engine creation failed: {0}")]
    EngineCreation(#[source] anyhow::Error),
}

/// Errors that can occur while loading or running a detector
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Artifact in {0} has no compiled unit")]
    NoCompiledUnit(PathBuf),

    #[error("Failed to read artifact {path}: {source}")]
    ArtifactRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Module load failed: {0}")]
    ModuleLoad(#[source] anyhow::Error),

    #[error("Instantiation failed: {0}")]
    Instantiation(#[source] anyhow::Error),

    #[error("No entry point found (expected a `detector_manifest` export)")]
    EntryPointNotFound,

    #[error("Ambiguous entry point: found exports {0:?}")]
    EntryPointAmbiguous(Vec<String>),

    #[error("Export not found: {0}")]
    ExportNotFound(String),

    #[error("Function call failed: {function} - {source}")]
    FunctionCall {
        function: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("API version mismatch: expected {expected}, got {actual}")]
    ApiVersionMismatch { expected: u32, actual: u32 },

    #[error("Serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    #[error("Deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    #[error("Memory access error: {0}")]
    MemoryAccess(String),

    #[error("Fuel exhausted (CPU limit exceeded)")]
    FuelExhausted,

    #[error("Engine error: {0}")]
    Engine(#[source] anyhow::Error),
}

/// Metadata captured alongside a detector, built from its companion source.
///
/// Empty metadata is valid: a detector without source text still loads.
#[derive(Debug, Clone, Default)]
pub struct DetectorMetadata {
    pub source_text: String,
}

impl DetectorMetadata {
    pub fn new(source_text: impl Into<String>) -> Self {
        Self {
            source_text: source_text.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.source_text.is_empty()
    }
}

/// Detector loader with a shared wasmtime engine
pub struct DetectorLoader {
    engine: Engine,
}

/// The loaded, callable binding of one detector to its entry point.
///
/// Immutable once constructed: a changed artifact produces a brand-new
/// `Invoker`, never a mutation of an existing one. Execution is serialized
/// per invoker because a wasm store requires exclusive access.
pub struct Invoker {
    descriptor: DetectorDescriptor,
    metadata: DetectorMetadata,
    instance: Mutex<DetectorInstance>,
}

impl Invoker {
    /// Declared identity of the loaded detector
    pub fn descriptor(&self) -> &DetectorDescriptor {
        &self.descriptor
    }

    /// Registry key for this invoker
    pub fn id(&self) -> &str {
        &self.descriptor.id
    }

    /// Companion-source metadata
    pub fn metadata(&self) -> &DetectorMetadata {
        &self.metadata
    }

    /// Run the detector against a request
    pub async fn invoke(&self, request: &DetectorRequest) -> Result<InvokeResult, LoadError> {
        let mut instance = self.instance.lock().await;
        instance.invoke(request)
    }
}

impl std::fmt::Debug for Invoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invoker")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}

/// Instantiated detector with its bound exports
pub struct DetectorInstance {
    store: Store<()>,
    instance: Instance,
    memory: Memory,
    alloc_fn: TypedFunc<i32, i32>,
    dealloc_fn: TypedFunc<(i32, i32), ()>,
}

/// Unpack ptr and len from a packed i64
#[inline]
fn unpack_ptr_len(packed: i64) -> (i32, i32) {
    let ptr = (packed >> 32) as i32;
    let len = (packed & 0xFFFFFFFF) as i32;
    (ptr, len)
}

impl DetectorLoader {
    /// Create a new loader with a fuel-metered engine
    pub fn new() -> Result<Self, LoaderInitError> {
        let mut config = Config::new();
        config.consume_fuel(true);
        config.wasm_memory64(false);

        let engine = Engine::new(&config).map_err(LoaderInitError::EngineCreation)?;

        Ok(Self { engine })
    }

    /// Load a discovered artifact into an invoker.
    ///
    /// Reads the compiled unit from disk; a diagnostic-only artifact (no
    /// compiled unit) yields [`LoadError::NoCompiledUnit`], which callers
    /// treat as skip-with-warning rather than failure.
    pub fn load(&self, artifact: &DetectorArtifact) -> Result<Invoker, LoadError> {
        let metadata = match &artifact.source_text {
            Some(text) => DetectorMetadata::new(text.clone()),
            None => DetectorMetadata::default(),
        };

        let wasm_path = artifact
            .artifact_path
            .as_ref()
            .ok_or_else(|| LoadError::NoCompiledUnit(artifact.directory.clone()))?;

        let wasm_bytes = std::fs::read(wasm_path).map_err(|e| LoadError::ArtifactRead {
            path: wasm_path.clone(),
            source: e,
        })?;

        self.load_bytes(&wasm_bytes, metadata)
    }

    /// Load a detector from raw module bytes
    pub fn load_bytes(
        &self,
        wasm_bytes: &[u8],
        metadata: DetectorMetadata,
    ) -> Result<Invoker, LoadError> {
        // 1. Compile module
        let module = Module::new(&self.engine, wasm_bytes).map_err(LoadError::ModuleLoad)?;

        // 2. Entry-point discovery: exactly one manifest export must exist
        let manifest_export = find_entry_point(&module)?;

        // 3. Create store with fuel limit
        let mut store = Store::new(&self.engine, ());
        store.set_fuel(FUEL_PER_CALL).map_err(LoadError::Engine)?;

        // 4. Instantiate (empty linker, no host imports)
        let linker = Linker::new(&self.engine);
        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(LoadError::Instantiation)?;

        // 5. Bind memory and allocator exports
        let memory = instance
            .get_memory(&mut store, MEMORY_EXPORT)
            .ok_or_else(|| LoadError::ExportNotFound(MEMORY_EXPORT.to_string()))?;

        let alloc_fn = instance
            .get_typed_func::<i32, i32>(&mut store, ALLOC_EXPORT)
            .map_err(|_| LoadError::ExportNotFound(ALLOC_EXPORT.to_string()))?;

        let dealloc_fn = instance
            .get_typed_func::<(i32, i32), ()>(&mut store, DEALLOC_EXPORT)
            .map_err(|_| LoadError::ExportNotFound(DEALLOC_EXPORT.to_string()))?;

        // 6. Query the entry point for the declared identity
        let manifest_fn = instance
            .get_typed_func::<(), i64>(&mut store, &manifest_export)
            .map_err(|_| LoadError::ExportNotFound(manifest_export.clone()))?;

        let packed = manifest_fn
            .call(&mut store, ())
            .map_err(|e| map_call_error(&manifest_export, e))?;
        let (ptr, len) = unpack_ptr_len(packed);

        let manifest_bytes = read_memory(&store, &memory, ptr as usize, len as usize)?;
        let manifest: DetectorManifest =
            rmp_serde::from_slice(&manifest_bytes).map_err(LoadError::Deserialization)?;

        // 7. Validate API version before anything is published
        if manifest.api_version != API_VERSION {
            return Err(LoadError::ApiVersionMismatch {
                expected: API_VERSION,
                actual: manifest.api_version,
            });
        }

        // 8. Hand the manifest buffer back to the guest
        dealloc_fn
            .call(&mut store, (ptr, len))
            .map_err(|e| map_call_error(DEALLOC_EXPORT, e))?;

        tracing::debug!(
            id = %manifest.descriptor.id,
            name = %manifest.descriptor.name,
            "Detector loaded"
        );

        Ok(Invoker {
            descriptor: manifest.descriptor,
            metadata,
            instance: Mutex::new(DetectorInstance {
                store,
                instance,
                memory,
                alloc_fn,
                dealloc_fn,
            }),
        })
    }
}

/// Locate the single manifest export.
///
/// Zero candidates means the module is not a detector; more than one (for
/// example a stale versioned export left beside the current one) is ambiguous
/// and rejected rather than guessed at.
fn find_entry_point(module: &Module) -> Result<String, LoadError> {
    let mut candidates: Vec<String> = module
        .exports()
        .filter(|e| {
            e.name().starts_with(MANIFEST_EXPORT) && matches!(e.ty(), ExternType::Func(_))
        })
        .map(|e| e.name().to_string())
        .collect();

    match candidates.len() {
        0 => Err(LoadError::EntryPointNotFound),
        1 => Ok(candidates.remove(0)),
        _ => {
            candidates.sort();
            Err(LoadError::EntryPointAmbiguous(candidates))
        }
    }
}

fn map_call_error(function: &str, error: anyhow::Error) -> LoadError {
    if error.to_string().contains("fuel") {
        LoadError::FuelExhausted
    } else {
        LoadError::FunctionCall {
            function: function.to_string(),
            source: error,
        }
    }
}

fn read_memory(
    store: &Store<()>,
    memory: &Memory,
    ptr: usize,
    len: usize,
) -> Result<Vec<u8>, LoadError> {
    let data = memory.data(store);
    if ptr + len > data.len() {
        return Err(LoadError::MemoryAccess(format!(
            "Out of bounds: ptr={}, len={}, memory_size={}",
            ptr,
            len,
            data.len()
        )));
    }
    Ok(data[ptr..ptr + len].to_vec())
}

impl DetectorInstance {
    /// Run the detector's `detector_invoke` export against a request
    pub fn invoke(&mut self, request: &DetectorRequest) -> Result<InvokeResult, LoadError> {
        // 1. Serialize the request
        let request_bytes = rmp_serde::to_vec(request).map_err(LoadError::Serialization)?;

        // 2. Allocate guest memory and copy the request in
        let request_len = request_bytes.len() as i32;
        let request_ptr = self
            .alloc_fn
            .call(&mut self.store, request_len)
            .map_err(|e| map_call_error(ALLOC_EXPORT, e))?;

        self.memory
            .write(&mut self.store, request_ptr as usize, &request_bytes)
            .map_err(|e| LoadError::MemoryAccess(format!("Failed to write request: {}", e)))?;

        // 3. Call the invoke export with a fresh fuel budget
        let invoke_fn = self
            .instance
            .get_typed_func::<(i32, i32), i64>(&mut self.store, INVOKE_EXPORT)
            .map_err(|_| LoadError::ExportNotFound(INVOKE_EXPORT.to_string()))?;

        self.store.set_fuel(FUEL_PER_CALL).map_err(LoadError::Engine)?;

        let packed = invoke_fn
            .call(&mut self.store, (request_ptr, request_len))
            .map_err(|e| map_call_error(INVOKE_EXPORT, e))?;
        let (result_ptr, result_len) = unpack_ptr_len(packed);

        // 4. Read the result back out
        let result_bytes = read_memory(
            &self.store,
            &self.memory,
            result_ptr as usize,
            result_len as usize,
        )?;

        let result: InvokeResult =
            rmp_serde::from_slice(&result_bytes).map_err(LoadError::Deserialization)?;

        // 5. Release both buffers; the result is already copied out
        self.dealloc_fn
            .call(&mut self.store, (request_ptr, request_len))
            .ok();
        self.dealloc_fn
            .call(&mut self.store, (result_ptr, result_len))
            .ok();

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{detector_wat, healthy_detector_wat};
    use detector_api::{DetectorManifest, DetectorStatus};

    #[test]
    fn test_loader_creation() {
        assert!(DetectorLoader::new().is_ok());
    }

    #[test]
    fn test_pack_unpack() {
        let ptr = 0x12345678_i32;
        let len = 0x00000100_i32;
        let packed = ((ptr as i64) << 32) | (len as i64 & 0xFFFFFFFF);
        let (up, ul) = unpack_ptr_len(packed);
        assert_eq!(up, ptr);
        assert_eq!(ul, len);
    }

    #[test]
    fn test_load_reads_declared_identity() {
        let loader = DetectorLoader::new().unwrap();
        let wat = healthy_detector_wat("appcrashes", "App Crashes");

        let invoker = loader
            .load_bytes(wat.as_bytes(), DetectorMetadata::default())
            .unwrap();

        assert_eq!(invoker.id(), "appcrashes");
        assert_eq!(invoker.descriptor().name, "App Crashes");
        assert!(invoker.metadata().is_empty());
    }

    #[test]
    fn test_load_rejects_garbage_bytes() {
        let loader = DetectorLoader::new().unwrap();
        let result = loader.load_bytes(b"\0garbage, not a module", DetectorMetadata::default());
        assert!(matches!(result, Err(LoadError::ModuleLoad(_))));
    }

    #[test]
    fn test_load_requires_entry_point() {
        let loader = DetectorLoader::new().unwrap();
        let wat = r#"(module (memory (export "memory") 1))"#;
        let result = loader.load_bytes(wat.as_bytes(), DetectorMetadata::default());
        assert!(matches!(result, Err(LoadError::EntryPointNotFound)));
    }

    #[test]
    fn test_load_rejects_ambiguous_entry_point() {
        let loader = DetectorLoader::new().unwrap();
        let mut wat = healthy_detector_wat("cpu", "CPU Usage");
        // A second manifest-prefixed export makes discovery ambiguous
        wat = wat.replace(
            "(func (export \"detector_invoke\")",
            "(func (export \"detector_manifest_v2\") (result i64) i64.const 0)\n  (func (export \"detector_invoke\")",
        );

        let result = loader.load_bytes(wat.as_bytes(), DetectorMetadata::default());
        match result {
            Err(LoadError::EntryPointAmbiguous(names)) => {
                assert_eq!(names.len(), 2);
                assert!(names.contains(&"detector_manifest".to_string()));
                assert!(names.contains(&"detector_manifest_v2".to_string()));
            }
            other => panic!("Expected EntryPointAmbiguous, got {:?}", other.err()),
        }
    }

    #[test]
    fn test_load_rejects_api_version_mismatch() {
        let loader = DetectorLoader::new().unwrap();
        let manifest = DetectorManifest {
            api_version: API_VERSION + 1,
            descriptor: detector_api::DetectorDescriptor::new("future", "Future"),
        };
        let wat = detector_wat(
            &manifest,
            &InvokeResult::success(DetectorStatus::Success, "ok"),
        );

        let result = loader.load_bytes(wat.as_bytes(), DetectorMetadata::default());
        assert!(matches!(
            result,
            Err(LoadError::ApiVersionMismatch {
                expected: API_VERSION,
                ..
            })
        ));
    }

    #[test]
    fn test_load_diagnostic_only_artifact_is_skippable() {
        let loader = DetectorLoader::new().unwrap();
        let artifact = DetectorArtifact {
            directory: "/detectors/draft".into(),
            artifact_path: None,
            last_modified: None,
            source_text: Some("// work in progress".to_string()),
        };

        let result = loader.load(&artifact);
        assert!(matches!(result, Err(LoadError::NoCompiledUnit(_))));
    }

    #[tokio::test]
    async fn test_invoke_round_trip() {
        let loader = DetectorLoader::new().unwrap();
        let wat = healthy_detector_wat("memleak", "Memory Leaks");
        let invoker = loader
            .load_bytes(wat.as_bytes(), DetectorMetadata::default())
            .unwrap();

        let request = DetectorRequest::new("/subscriptions/s1/sites/contoso");
        let result = invoker.invoke(&request).await.unwrap();

        match result {
            InvokeResult::Success(report) => {
                assert_eq!(report.status, DetectorStatus::Success);
                assert_eq!(report.message, "healthy");
            }
            InvokeResult::Error(e) => panic!("Unexpected error: {:?}", e),
        }
    }
}
