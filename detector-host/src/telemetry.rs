//! Instrumentation around downstream backend calls
//!
//! A single generic middleware wraps every data-provider call: on
//! completion exactly one structured record is emitted with timing and
//! outcome, and any error is re-raised unchanged. This is a logging
//! boundary, never a behavior-altering one.

use std::fmt;
use std::future::Future;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

/// Outcome of one instrumented call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Exception,
}

/// One emitted record per downstream call
#[derive(Debug, Clone)]
pub struct DependencyCallRecord {
    /// Correlation id of the triggering request; empty when unavailable
    pub request_id: String,

    /// Name of the downstream operation, e.g. "kusto.execute_query"
    pub operation: String,

    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub latency_ms: i64,
    pub outcome: CallOutcome,

    /// Error type name, set only on failure
    pub exception_type: Option<String>,

    /// Error display text, set only on failure
    pub exception_detail: Option<String>,
}

/// Destination for dependency-call records
pub trait TelemetrySink: Send + Sync {
    fn record(&self, record: DependencyCallRecord);
}

/// Default sink: structured tracing events
#[derive(Debug, Default)]
pub struct TracingTelemetrySink;

impl TracingTelemetrySink {
    pub fn new() -> Self {
        Self
    }
}

impl TelemetrySink for TracingTelemetrySink {
    fn record(&self, record: DependencyCallRecord) {
        let start = record.start_time.format("%H:%M:%S%.3f");
        let end = record.end_time.format("%H:%M:%S%.3f");
        match record.outcome {
            CallOutcome::Success => {
                tracing::info!(
                    request_id = %record.request_id,
                    operation = %record.operation,
                    start = %start,
                    end = %end,
                    latency_ms = record.latency_ms,
                    "Dependency call succeeded"
                );
            }
            CallOutcome::Exception => {
                tracing::error!(
                    request_id = %record.request_id,
                    operation = %record.operation,
                    start = %start,
                    end = %end,
                    latency_ms = record.latency_ms,
                    exception_type = record.exception_type.as_deref().unwrap_or(""),
                    exception_detail = record.exception_detail.as_deref().unwrap_or(""),
                    "Dependency call failed"
                );
            }
        }
    }
}

/// In-memory sink for asserting emitted records in tests
#[derive(Default)]
pub struct MemoryTelemetrySink {
    records: RwLock<Vec<DependencyCallRecord>>,
}

impl MemoryTelemetrySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All recorded calls so far
    pub fn records(&self) -> Vec<DependencyCallRecord> {
        self.records.read().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.records.read().unwrap().len()
    }
}

impl TelemetrySink for MemoryTelemetrySink {
    fn record(&self, record: DependencyCallRecord) {
        self.records.write().unwrap().push(record);
    }
}

impl fmt::Debug for MemoryTelemetrySink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryTelemetrySink")
            .field("count", &self.count())
            .finish()
    }
}

/// Wrap one downstream call with timing and outcome telemetry.
///
/// Emits exactly one record whether the call succeeds or fails; a failure
/// is recorded and then returned unchanged to the caller. `request_id`
/// defaults to an empty string when unavailable.
pub async fn instrument_call<S, F, T, E>(
    sink: &S,
    operation: &str,
    request_id: Option<&str>,
    call: F,
) -> Result<T, E>
where
    S: TelemetrySink + ?Sized,
    F: Future<Output = Result<T, E>>,
    E: std::error::Error,
{
    let start_time = Utc::now();
    let result = call.await;
    let end_time = Utc::now();
    let latency_ms = (end_time - start_time).num_milliseconds();

    let (outcome, exception_type, exception_detail) = match &result {
        Ok(_) => (CallOutcome::Success, None, None),
        Err(e) => (
            CallOutcome::Exception,
            Some(error_type_name::<E>()),
            Some(e.to_string()),
        ),
    };

    sink.record(DependencyCallRecord {
        request_id: request_id.unwrap_or("").to_string(),
        operation: operation.to_string(),
        start_time,
        end_time,
        latency_ms,
        outcome,
        exception_type,
        exception_detail,
    });

    result
}

/// Unqualified type name of the error, e.g. "TimeoutError"
fn error_type_name<E>() -> String {
    let full = std::any::type_name::<E>();
    full.rsplit("::").next().unwrap_or(full).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("operation timed out")]
    struct TimeoutError;

    #[tokio::test]
    async fn test_success_emits_one_record() {
        let sink = MemoryTelemetrySink::new();

        let result: Result<u32, TimeoutError> = instrument_call(
            &sink,
            "kusto.execute_query",
            Some("req-42"),
            async { Ok(7) },
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        let records = sink.records();
        assert_eq!(records.len(), 1);

        let record = &records[0];
        assert_eq!(record.request_id, "req-42");
        assert_eq!(record.operation, "kusto.execute_query");
        assert_eq!(record.outcome, CallOutcome::Success);
        assert!(record.exception_type.is_none());
        assert!(record.latency_ms >= 0);
        assert!(record.end_time >= record.start_time);
    }

    #[tokio::test]
    async fn test_failure_is_recorded_and_reraised() {
        let sink = MemoryTelemetrySink::new();

        let result: Result<u32, TimeoutError> =
            instrument_call(&sink, "observer.get_site", None, async {
                Err(TimeoutError)
            })
            .await;

        // The original error propagates unchanged
        assert!(matches!(result, Err(TimeoutError)));

        // Exactly one failure record with the error's type name
        let records = sink.records();
        assert_eq!(records.len(), 1);

        let record = &records[0];
        assert_eq!(record.outcome, CallOutcome::Exception);
        assert_eq!(record.exception_type.as_deref(), Some("TimeoutError"));
        assert_eq!(record.exception_detail.as_deref(), Some("operation timed out"));
        assert_eq!(record.request_id, "");
    }

    #[tokio::test]
    async fn test_missing_request_id_defaults_to_empty() {
        let sink = MemoryTelemetrySink::new();

        let _: Result<(), TimeoutError> =
            instrument_call(&sink, "geomaster.get_app_settings", None, async { Ok(()) }).await;

        assert_eq!(sink.records()[0].request_id, "");
    }

    #[test]
    fn test_error_type_name_is_unqualified() {
        assert_eq!(error_type_name::<TimeoutError>(), "TimeoutError");
        assert_eq!(error_type_name::<std::io::Error>(), "Error");
    }
}
