//! Tracing/logging setup shared by every process embedding a worker host.

/// Initialize process-wide logging with JSON output.
///
/// This is safe to call multiple times; subsequent calls become no-ops.
pub fn init() {
    tracing::init_with(LogFormat::Json);
}

pub use tracing::{LogFormat, ParseLogFormatError, init_with};

/// Tracing configuration (filters, formatting).
pub mod tracing;
