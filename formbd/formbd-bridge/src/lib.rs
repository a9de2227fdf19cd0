//! Safe host-side bindings for the FormBD storage engine.
//!
//! The engine is reached through three kinds of opaque handles: databases,
//! transactions and cursors. This crate wraps each handle in an owning
//! [`Resource`] that releases it exactly once, whether the host releases it
//! explicitly or simply drops the last reference. A transaction dropped while
//! still active is rolled back.
//!
//! Engine status codes surface as [`Status`]; failures the bridge detects on
//! its own (bad arguments, handles that were already released) are reported
//! as `invalid_arg` and never reach native code.
//!
//! ```ignore
//! let bridge = formbd_bridge::Bridge::linked(BridgeConfig::default())?;
//! let db = bridge.open(b"/var/lib/formbd/main")?;
//! let txn = bridge.txn_begin(&db)?;
//! let cursor = bridge.query_execute(&db, b"SELECT *", b"{\"actor\":\"cli\"}")?;
//! for document in cursor.documents() {
//!     println!("{}", String::from_utf8_lossy(&document?));
//! }
//! bridge.txn_commit(&txn)?;
//! ```

mod bridge;
mod config;
mod cursor;
pub mod engine;
mod error;
mod executor;
mod handle;
mod status;
mod txn;

#[cfg(test)]
mod bench;

pub use bridge::Bridge;
pub use config::{
    BridgeConfig, ConfigError, DEFAULT_CURSOR_BUFFER_CAPACITY, MAX_CURSOR_BUFFER_CAPACITY,
};
pub use cursor::{Cursor, Documents, Fetch};
pub use engine::{NativeEngine, RawHandle, StatusCode};
pub use error::{BridgeError, BridgeResult};
pub use executor::{AsyncBridge, BlockingExecutor};
pub use handle::{CursorKind, Database, DatabaseKind, Resource, ResourceKind, TransactionKind};
pub use status::Status;
pub use txn::{Transaction, TxnState};
