//! Debug logging module for development-time diagnostics
//!
//! Byte-level tracing of the connection (every read, every flush) is far too
//! chatty for production logs, so it goes through these macros instead of
//! calling `tracing` directly. They are controlled by the `dev-log` feature flag.
//!
//! - **Zero-cost abstraction**: Completely removed when `dev-log` is disabled
//! - **Routed through tracing**: When enabled they emit `tracing` events, so the
//!   subscriber the application installed decides where they go
//!
//! # Usage
//!
//! ```bash
//! cargo test --features "dev-log"
//! ```
//!
//! ```rust
//! use hotaru_h2c::{debug_log, debug_trace};
//!
//! debug_log!("Flushing {} bytes", 24);
//! debug_trace!("Dispatching event {:?}", "DataReceived");
//! ```

/// General-purpose debug logging macro
///
/// Emits a `tracing::debug!` event when `dev-log` is enabled.
/// Use for connection flow information (flushes, reads, registry changes).
#[macro_export]
#[cfg(feature = "dev-log")]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        $crate::__tracing::debug!("[DEBUG] {}", format!($($arg)*));
    };
}

#[macro_export]
#[cfg(not(feature = "dev-log"))]
macro_rules! debug_log {
    ($($arg:tt)*) => {};
}

/// Detailed trace logging for verbose debugging
///
/// Emits a `tracing::trace!` event when `dev-log` is enabled.
/// Use for per-event dispatch and state transitions.
#[macro_export]
#[cfg(feature = "dev-log")]
macro_rules! debug_trace {
    ($($arg:tt)*) => {
        $crate::__tracing::trace!("[TRACE] {}", format!($($arg)*));
    };
}

#[macro_export]
#[cfg(not(feature = "dev-log"))]
macro_rules! debug_trace {
    ($($arg:tt)*) => {};
}
