//! Tracing and logging setup shared by the courier binaries.

/// Initialize process-wide logging, format taken from `LOG_FORMAT`.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    tracing::init(tracing::LogFormat::from_env());
}

/// Tracing configuration (filters, formatting).
pub mod tracing;
