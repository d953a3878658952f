//! detector-api: Shared types for the detector plugin system
//!
//! This crate defines the protocol between the host registry and a guest
//! (wasm detector). Communication uses MessagePack serialization.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// API version for compatibility checking
pub const API_VERSION: u32 = 1;

/// Well-known export that returns the detector's manifest.
///
/// Exactly one export with this prefix must exist in a loadable module;
/// the host treats zero as "no entry point" and several as ambiguous.
pub const MANIFEST_EXPORT: &str = "detector_manifest";

/// Well-known export that runs the detector against a request
pub const INVOKE_EXPORT: &str = "detector_invoke";

/// Well-known allocator exports
pub const ALLOC_EXPORT: &str = "detector_alloc";
pub const DEALLOC_EXPORT: &str = "detector_dealloc";

/// Well-known linear memory export
pub const MEMORY_EXPORT: &str = "memory";

/// Identity and metadata a detector declares about itself
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DetectorDescriptor {
    /// Unique detector id (registry key, e.g. "appcrashes")
    pub id: String,

    /// Human-readable name shown in diagnostics UIs
    pub name: String,

    /// Detector version (semver)
    #[serde(default)]
    pub version: Option<String>,

    /// Detector author
    #[serde(default)]
    pub author: Option<String>,

    /// Category for grouping (e.g. "availability", "performance")
    #[serde(default)]
    pub category: Option<String>,

    /// Short description of what the detector diagnoses
    #[serde(default)]
    pub description: String,
}

/// Manifest returned by the guest's `detector_manifest` export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorManifest {
    /// API version for compatibility
    pub api_version: u32,

    /// Declared identity of the detector
    pub descriptor: DetectorDescriptor,
}

/// A diagnosis request passed to a detector
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectorRequest {
    /// Resource under diagnosis (e.g. an ARM resource URI)
    pub resource_uri: String,

    /// Free-form request parameters (time range, stamp name, ...)
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// Health verdict of a detector run, ordered by severity (lower = worse)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub enum DetectorStatus {
    Critical,
    Warning,
    Info,
    Success,
    None,
}

/// Result of running a detector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InvokeResult {
    /// Diagnosis completed and produced a report
    Success(DetectorReport),

    /// The detector itself failed
    Error(InvokeError),
}

/// Report produced by a successful detector run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorReport {
    /// Overall health verdict
    pub status: DetectorStatus,

    /// Markdown body describing the diagnosis
    pub message: String,
}

/// Error details from a failed detector run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeError {
    /// Exit code (1 = user error, 101 = system error)
    pub code: u8,

    /// Error message
    pub message: String,
}

impl DetectorDescriptor {
    /// Create a descriptor with the mandatory identity fields
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: None,
            author: None,
            category: None,
            description: String::new(),
        }
    }

    /// Set version
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Set author
    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    /// Set category
    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Set description
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl DetectorManifest {
    /// Create a manifest for the current API version
    pub fn new(descriptor: DetectorDescriptor) -> Self {
        Self {
            api_version: API_VERSION,
            descriptor,
        }
    }
}

impl DetectorRequest {
    /// Create a request for a resource
    pub fn new(resource_uri: impl Into<String>) -> Self {
        Self {
            resource_uri: resource_uri.into(),
            parameters: BTreeMap::new(),
        }
    }

    /// Add a request parameter
    pub fn parameter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(key.into(), value.into());
        self
    }
}

impl InvokeResult {
    /// Create a success result
    pub fn success(status: DetectorStatus, message: impl Into<String>) -> Self {
        Self::Success(DetectorReport {
            status,
            message: message.into(),
        })
    }

    /// Create a user error (exit code 1)
    pub fn user_error(message: impl Into<String>) -> Self {
        Self::Error(InvokeError {
            code: 1,
            message: message.into(),
        })
    }

    /// Create a system error (exit code 101)
    pub fn system_error(message: impl Into<String>) -> Self {
        Self::Error(InvokeError {
            code: 101,
            message: message.into(),
        })
    }
}
