//! detector-sdk: SDK for authoring wasm detectors
//!
//! Provides the `Detector` trait and the `export_detector!` macro that
//! generates the well-known exports the host registry binds to.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use detector_sdk::prelude::*;
//!
//! struct AppCrashDetector;
//!
//! impl Detector for AppCrashDetector {
//!     fn manifest() -> DetectorManifest {
//!         DetectorManifest::new(
//!             DetectorDescriptor::new("appcrashes", "App Crashes")
//!                 .category("availability")
//!                 .description("Detects recent application crashes"),
//!         )
//!     }
//!
//!     fn invoke(request: DetectorRequest) -> InvokeResult {
//!         InvokeResult::success(
//!             DetectorStatus::Success,
//!             format!("No crashes found for {}", request.resource_uri),
//!         )
//!     }
//! }
//!
//! // Generate all required exports
//! export_detector!(AppCrashDetector);
//! ```

use std::alloc::{alloc, dealloc, Layout};

// Re-export everything from detector-api
pub use detector_api::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{export_detector, memory, Detector};
    pub use detector_api::{
        DetectorDescriptor, DetectorManifest, DetectorReport, DetectorRequest, DetectorStatus,
        InvokeError, InvokeResult, API_VERSION,
    };
}

/// Trait that detectors must implement
pub trait Detector {
    /// Returns the manifest declaring the detector's identity
    fn manifest() -> DetectorManifest;

    /// Runs the diagnosis for the given request
    fn invoke(request: DetectorRequest) -> InvokeResult;
}

/// Memory utilities for wasm detector development
pub mod memory {
    use super::*;

    /// Allocate memory in the wasm linear memory
    ///
    /// # Safety
    /// This function is safe to call from the host.
    #[inline]
    pub fn detector_alloc(size: i32) -> i32 {
        if size <= 0 {
            return 0;
        }
        let layout = Layout::from_size_align(size as usize, 1).unwrap();
        unsafe { alloc(layout) as i32 }
    }

    /// Deallocate memory in the wasm linear memory
    ///
    /// # Safety
    /// The ptr must have been allocated by `detector_alloc` with the same size.
    #[inline]
    pub fn detector_dealloc(ptr: i32, size: i32) {
        if ptr == 0 || size <= 0 {
            return;
        }
        let layout = Layout::from_size_align(size as usize, 1).unwrap();
        unsafe { dealloc(ptr as *mut u8, layout) }
    }

    /// Pack a pointer and length into a single i64 value
    ///
    /// This is the standard way to return two values from a wasm function
    /// since wasm32-unknown-unknown doesn't support multi-value returns.
    #[inline]
    pub fn pack_ptr_len(ptr: i32, len: i32) -> i64 {
        ((ptr as i64) << 32) | (len as i64 & 0xFFFFFFFF)
    }

    /// Serialize data and return it as an allocated buffer
    ///
    /// Returns a packed i64 containing the pointer and length.
    pub fn serialize_and_return<T: serde::Serialize>(data: &T) -> i64 {
        let bytes = rmp_serde::to_vec(data).unwrap_or_default();
        let len = bytes.len() as i32;
        let ptr = detector_alloc(len);

        if ptr != 0 && len > 0 {
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, len as usize);
            }
        }

        pack_ptr_len(ptr, len)
    }

    /// Deserialize data from a raw pointer and length
    ///
    /// # Safety
    /// The pointer must be valid and point to `len` bytes of valid MessagePack data.
    pub unsafe fn deserialize_from_ptr<T: serde::de::DeserializeOwned>(
        ptr: i32,
        len: i32,
    ) -> Option<T> {
        if ptr == 0 || len <= 0 {
            return None;
        }
        let slice = std::slice::from_raw_parts(ptr as *const u8, len as usize);
        rmp_serde::from_slice(slice).ok()
    }
}

/// Macro to export all required detector functions
///
/// This macro generates the `detector_manifest`, `detector_invoke`,
/// `detector_alloc` and `detector_dealloc` exports the host binds to.
///
/// # Example
///
/// ```rust,ignore
/// struct MyDetector;
///
/// impl Detector for MyDetector {
///     fn manifest() -> DetectorManifest { /* ... */ }
///     fn invoke(request: DetectorRequest) -> InvokeResult { /* ... */ }
/// }
///
/// export_detector!(MyDetector);
/// ```
#[macro_export]
macro_rules! export_detector {
    ($detector:ty) => {
        #[no_mangle]
        pub extern "C" fn detector_manifest() -> i64 {
            let manifest = <$detector as $crate::Detector>::manifest();
            $crate::memory::serialize_and_return(&manifest)
        }

        #[no_mangle]
        pub extern "C" fn detector_invoke(request_ptr: i32, request_len: i32) -> i64 {
            let request: $crate::DetectorRequest = unsafe {
                $crate::memory::deserialize_from_ptr(request_ptr, request_len).unwrap_or_default()
            };
            let result = <$detector as $crate::Detector>::invoke(request);
            $crate::memory::serialize_and_return(&result)
        }

        #[no_mangle]
        pub extern "C" fn detector_alloc(size: i32) -> i32 {
            $crate::memory::detector_alloc(size)
        }

        #[no_mangle]
        pub extern "C" fn detector_dealloc(ptr: i32, size: i32) {
            $crate::memory::detector_dealloc(ptr, size)
        }
    };
}
