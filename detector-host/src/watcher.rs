//! Source watcher: drives scan → load → publish passes
//!
//! Runs one pass at startup, signals completion so the host can gate
//! readiness, then re-runs passes on debounced file-system change
//! notifications. One bad detector never aborts a pass; a missing source
//! root aborts construction, because the host cannot serve detectors
//! without one.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, watch};

use crate::cache::InvokerCache;
use crate::loader::{DetectorLoader, LoadError, LoaderInitError};
use crate::scanner::{ArtifactScanner, ScanError, ARTIFACT_EXTENSION, SOURCE_EXTENSION};

/// Configuration for the source watcher
#[derive(Debug, Clone)]
pub struct SourceWatcherConfig {
    /// Root directory holding one subdirectory per detector
    pub source_root: PathBuf,

    /// Debounce window for change-driven rescans
    pub debounce: Duration,

    /// Whether to keep rescanning on file-system changes after the first pass
    pub watch_for_changes: bool,
}

impl SourceWatcherConfig {
    /// Config with default debounce and change-watching enabled
    pub fn new(source_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            debounce: Duration::from_millis(500),
            watch_for_changes: true,
        }
    }
}

/// Errors that prevent the watcher from starting
#[derive(Debug, thiserror::Error)]
pub enum WatcherError {
    #[error("Detector source unavailable: {0}")]
    Source(#[from] ScanError),

    #[error("Loader initialization failed: {0}")]
    Loader(#[from] LoaderInitError),

    #[error("Failed to initialize file watcher: {0}")]
    WatcherInit(#[source] notify::Error),
}

/// Watches a detector source root and keeps an [`InvokerCache`] current
pub struct SourceWatcher {
    cache: InvokerCache,
    first_pass_rx: watch::Receiver<bool>,
    shutdown_tx: mpsc::Sender<()>,
    _watcher: Option<RecommendedWatcher>,
}

impl SourceWatcher {
    /// Start watching: run the first pass in the background and, if
    /// configured, keep rescanning on debounced change notifications.
    ///
    /// Fails fast when the source root does not exist.
    pub fn start(config: SourceWatcherConfig, cache: InvokerCache) -> Result<Self, WatcherError> {
        if !config.source_root.is_dir() {
            return Err(ScanError::SourceRootNotFound(config.source_root.clone()).into());
        }

        let scanner = ArtifactScanner::new(&config.source_root);
        let loader = DetectorLoader::new()?;

        let (first_pass_tx, first_pass_rx) = watch::channel(false);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let (event_tx, mut event_rx) = mpsc::channel::<Event>(100);

        let fs_watcher = if config.watch_for_changes {
            let tx = event_tx.clone();
            let mut watcher =
                notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
                    if let Ok(event) = res {
                        let _ = tx.blocking_send(event);
                    }
                })
                .map_err(WatcherError::WatcherInit)?;

            watcher
                .watch(&config.source_root, RecursiveMode::Recursive)
                .map_err(WatcherError::WatcherInit)?;
            tracing::info!(root = %config.source_root.display(), "Watching detector source root");
            Some(watcher)
        } else {
            None
        };

        let pass_cache = cache.clone();
        let debounce = config.debounce;
        tokio::spawn(async move {
            run_pass(&scanner, &loader, &pass_cache);
            let _ = first_pass_tx.send(true);

            let mut rescan_deadline: Option<tokio::time::Instant> = None;
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::info!("Source watcher shutting down");
                        break;
                    }

                    Some(event) = event_rx.recv() => {
                        if event.paths.iter().any(|p| is_detector_file(p)) {
                            rescan_deadline = Some(tokio::time::Instant::now() + debounce);
                        }
                    }

                    _ = async {
                        match rescan_deadline {
                            Some(deadline) => tokio::time::sleep_until(deadline).await,
                            None => std::future::pending::<()>().await,
                        }
                    } => {
                        rescan_deadline = None;
                        run_pass(&scanner, &loader, &pass_cache);
                    }
                }
            }
        });

        Ok(Self {
            cache,
            first_pass_rx,
            shutdown_tx,
            _watcher: fs_watcher,
        })
    }

    /// Wait until the first scan pass has completed.
    ///
    /// Host readiness and health checks gate on this; later rescans do not
    /// re-signal. Returns immediately once the first pass is done.
    pub async fn first_pass_done(&self) {
        let mut rx = self.first_pass_rx.clone();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// The cache this watcher publishes into
    pub fn cache(&self) -> &InvokerCache {
        &self.cache
    }

    /// Stop the watcher loop
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}

/// One complete scan → load → publish pass.
///
/// Artifacts are processed independently: a load failure is logged with its
/// directory, artifact path and failure kind, and the pass moves on. The
/// cache entry for a failing id is left untouched.
fn run_pass(scanner: &ArtifactScanner, loader: &DetectorLoader, cache: &InvokerCache) {
    tracing::info!(root = %scanner.source_root().display(), "Source watcher pass starting");

    let artifacts = match scanner.scan() {
        Ok(artifacts) => artifacts,
        Err(e) => {
            // Root vanished after startup; keep serving the last good state.
            tracing::error!(error = %e, "Source scan failed, keeping current cache");
            return;
        }
    };

    for artifact in &artifacts {
        if !artifact.has_compiled_unit() {
            tracing::warn!(
                directory = %artifact.directory.display(),
                "No compiled unit (.wasm). Skipping cache update"
            );
            continue;
        }

        match loader.load(artifact) {
            Ok(invoker) => {
                tracing::info!(
                    id = %invoker.id(),
                    path = %artifact.artifact_path.as_ref().unwrap().display(),
                    "Publishing invoker"
                );
                cache.upsert(invoker);
            }
            Err(e) => log_load_failure(artifact, &e),
        }
    }

    tracing::info!(detectors = cache.len(), "Source watcher pass complete");
}

fn log_load_failure(artifact: &crate::scanner::DetectorArtifact, error: &LoadError) {
    let path = artifact
        .artifact_path
        .as_deref()
        .unwrap_or(&artifact.directory);
    tracing::warn!(
        directory = %artifact.directory.display(),
        path = %path.display(),
        error = %error,
        "Failed to load detector, previous cache entry (if any) left in place"
    );
}

fn is_detector_file(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            ext.eq_ignore_ascii_case(ARTIFACT_EXTENSION) || ext.eq_ignore_ascii_case(SOURCE_EXTENSION)
        })
        .unwrap_or(false)
}
