//! Durable Store-and-Forward Buffer
//!
//! ## Overview
//!
//! Readings that cannot be delivered are parked in a local SQLite database and
//! drained once the broker is reachable again. The buffer must survive process
//! restarts and power loss, so every append is a committed, fully synced write.
//!
//! ## Schema
//!
//! One table per device identity:
//!
//! ```text
//! readings_device7
//! ├── id           INTEGER PRIMARY KEY AUTOINCREMENT   (monotonic row identity)
//! ├── time         TEXT     RFC3339, UTC, nanoseconds
//! ├── temperature  REAL
//! ├── direction    TEXT
//! └── ...          one column per configured measurement
//! ```
//!
//! ### Schema Evolution
//!
//! Columns are only ever appended. If the configured measurement set grows
//! between runs, the missing columns are added on the next append; readings
//! buffered earlier read back those measurements as unavailable.
//!
//! ## Lifecycle
//!
//! ```text
//! append ──▶ [rows...] ──▶ all() ──▶ publish ──▶ clear() (DROP TABLE)
//!                              └── publish failed: rows stay untouched
//! ```
//!
//! A missing table is the normal empty state: `count()` returns 0 and `all()`
//! returns nothing. The table is created again on the next append.

#![deny(unsafe_code)]

pub mod buffer;
pub mod error;

pub use buffer::{BufferedReading, LocalBuffer};
pub use error::{StorageError, StorageResult};
