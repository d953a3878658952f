//! detector-host: registry subsystem for dynamically loaded detector plugins
//!
//! Keeps an in-memory registry of compiled detector plugins synchronized with
//! a source directory without serving half-loaded or stale plugins to
//! in-flight requests. The pieces:
//!
//! - [`scanner`]: discovers compiled plugin artifacts and companion source text
//! - [`loader`]: binds an artifact to its entry point and produces an [`Invoker`]
//! - [`cache`]: concurrent registry publishing the newest invoker per id
//! - [`watcher`]: drives scan/load/publish passes and exposes a readiness signal
//! - [`token`]: background credential refresh for downstream data backends
//! - [`telemetry`]: timing/outcome instrumentation around downstream calls

pub mod cache;
pub mod loader;
pub mod scanner;
pub mod telemetry;
pub mod token;
pub mod watcher;

#[cfg(test)]
pub(crate) mod testutil;

pub use cache::{CacheError, InvokerCache};
pub use loader::{
    DetectorInstance, DetectorLoader, DetectorMetadata, Invoker, LoadError, LoaderInitError,
};
pub use scanner::{ArtifactScanner, DetectorArtifact, ScanError};
pub use telemetry::{
    instrument_call, CallOutcome, DependencyCallRecord, MemoryTelemetrySink, TelemetrySink,
    TracingTelemetrySink,
};
pub use token::{
    ClientCredentialAcquirer, CredentialToken, CredentialTokenService, TokenAcquirer, TokenError,
    TokenServiceConfig,
};
pub use watcher::{SourceWatcher, SourceWatcherConfig, WatcherError};

pub use detector_api::{
    DetectorDescriptor, DetectorManifest, DetectorReport, DetectorRequest, DetectorStatus,
    InvokeError, InvokeResult, API_VERSION,
};
