//! Artifact discovery over a detector source root
//!
//! Each subdirectory of the source root holds one detector: a compiled wasm
//! artifact plus, optionally, the source text it was built from. The scanner
//! only reads the file system; publishing into the cache is the watcher's job.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;

/// File extension of a compiled detector artifact
pub const ARTIFACT_EXTENSION: &str = "wasm";

/// File extension of companion detector source text
pub const SOURCE_EXTENSION: &str = "rs";

/// Errors that abort a scan outright
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Detector source root not found: {0}")]
    SourceRootNotFound(PathBuf),

    #[error("Failed to read source root {path}: {source}")]
    ReadRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// One discovered detector: compiled unit plus optional companion source.
///
/// Produced fresh on every scan pass; never persisted.
#[derive(Debug, Clone)]
pub struct DetectorArtifact {
    /// Directory this detector was discovered in
    pub directory: PathBuf,

    /// Newest compiled unit in the directory, if any
    pub artifact_path: Option<PathBuf>,

    /// Last-modified time of the compiled unit
    pub last_modified: Option<SystemTime>,

    /// Companion source text, read from the newest source file
    pub source_text: Option<String>,
}

impl DetectorArtifact {
    /// Whether the directory contained a loadable compiled unit
    pub fn has_compiled_unit(&self) -> bool {
        self.artifact_path.is_some()
    }
}

/// Scans a source root for detector artifacts
pub struct ArtifactScanner {
    source_root: PathBuf,
}

impl ArtifactScanner {
    /// Create a scanner over the given source root
    pub fn new(source_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
        }
    }

    /// The source root this scanner reads from
    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    /// Scan the source root, producing one artifact per detector directory.
    ///
    /// A missing root is fatal; an unreadable subdirectory is logged and
    /// skipped, so the scan always completes with whatever it could read.
    /// Directories with neither a compiled unit nor source text are ignored.
    pub fn scan(&self) -> Result<Vec<DetectorArtifact>, ScanError> {
        if !self.source_root.is_dir() {
            return Err(ScanError::SourceRootNotFound(self.source_root.clone()));
        }

        let entries = fs::read_dir(&self.source_root).map_err(|e| ScanError::ReadRoot {
            path: self.source_root.clone(),
            source: e,
        })?;

        let mut artifacts = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!(
                        root = %self.source_root.display(),
                        error = %e,
                        "Failed to read source root entry, skipping"
                    );
                    continue;
                }
            };

            let path = entry.path();
            if !path.is_dir() {
                continue;
            }

            match scan_detector_dir(&path) {
                Ok(Some(artifact)) => artifacts.push(artifact),
                Ok(None) => {
                    tracing::debug!(directory = %path.display(), "No detector files, ignoring");
                }
                Err(e) => {
                    tracing::warn!(
                        directory = %path.display(),
                        error = %e,
                        "Unreadable detector directory, skipping"
                    );
                }
            }
        }

        // Deterministic pass order regardless of read_dir ordering
        artifacts.sort_by(|a, b| a.directory.cmp(&b.directory));
        Ok(artifacts)
    }
}

/// Scan one detector directory: newest `.wasm` is the compiled unit, newest
/// `.rs` (independently) is the source text.
fn scan_detector_dir(dir: &Path) -> io::Result<Option<DetectorArtifact>> {
    let mut files: Vec<(PathBuf, SystemTime)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        files.push((path, modified));
    }

    // Newest first; the first match per extension wins
    files.sort_by(|a, b| b.1.cmp(&a.1));

    let compiled = files.iter().find(|(p, _)| has_extension(p, ARTIFACT_EXTENSION));
    let source = files.iter().find(|(p, _)| has_extension(p, SOURCE_EXTENSION));

    if compiled.is_none() && source.is_none() {
        return Ok(None);
    }

    let source_text = match source {
        Some((path, _)) => match fs::read_to_string(path) {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read source text");
                None
            }
        },
        None => None,
    };

    Ok(Some(DetectorArtifact {
        directory: dir.to_path_buf(),
        artifact_path: compiled.map(|(p, _)| p.clone()),
        last_modified: compiled.map(|(_, t)| *t),
        source_text,
    }))
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .map(|e| e.eq_ignore_ascii_case(extension))
        .unwrap_or(false)
}
