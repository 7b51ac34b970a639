//! Type aliases for hotaru_h2c.
//!
//! Connection state is shared between the caller and the reader, writer and
//! timer tasks. All internal code MUST take its locks through this module.
//!
//! ## Concurrency Primitives
//!
//! We use `parking_lot` for synchronization:
//! - **No lock poisoning**: a panicking stream handler cannot poison the connection
//! - **Cheap uncontended locking**: the connection lock is taken once per event
//!
//! The lock is only ever held between suspension points. Never hold a guard
//! across an `.await` or while a user callback runs.
//!
//! ```rust
//! use hotaru_h2c::alias::PMutex;
//!
//! let data = PMutex::new(vec![1, 2, 3]);
//! data.lock().push(4);  // No unwrap needed!
//! assert_eq!(data.lock().len(), 4);
//! ```

/// Mutex without poisoning (parking_lot implementation).
pub use parking_lot::Mutex as PMutex;
