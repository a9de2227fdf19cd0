//! The seam between the bridge and the FormBD native engine.
//!
//! Everything above this module talks to the engine through [`NativeEngine`].
//! The production implementation forwards to `libformbd` (feature `native`);
//! tests and the stress harness use the in-process [`testing::StubEngine`].

use std::ffi::c_void;
use std::fmt;
use std::ptr::NonNull;

#[cfg(feature = "native")]
pub mod ffi;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

#[cfg(feature = "native")]
pub use ffi::LinkedEngine;

/// Integer outcome of a single native call.
pub type StatusCode = i32;

/// Opaque engine handle. Never dereferenced on this side of the boundary.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawHandle(NonNull<c_void>);

// The engine owns whatever the address points at; the bridge only forwards it.
unsafe impl Send for RawHandle {}
unsafe impl Sync for RawHandle {}

impl RawHandle {
    /// Wraps an address returned by the engine. `None` for null.
    pub fn from_ptr(ptr: *mut c_void) -> Option<Self> {
        NonNull::new(ptr).map(Self)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }
}

impl fmt::Debug for RawHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawHandle({:p})", self.0)
    }
}

/// Outcome of a native constructor: the status plus whatever handle the
/// engine wrote into its out-parameter.
pub type Constructed = (StatusCode, Option<RawHandle>);

/// The fixed set of entry points exported by the native engine.
///
/// Implementations only forward. Handle liveness is guaranteed by the caller:
/// the bridge never passes a handle that it has already released.
pub trait NativeEngine: Send + Sync + 'static {
    fn init(&self) -> StatusCode;

    fn cleanup(&self);

    fn open(&self, path: &[u8]) -> Constructed;

    fn create(&self, path: &[u8], block_count: u64) -> Constructed;

    fn close(&self, db: RawHandle) -> StatusCode;

    fn txn_begin(&self, db: RawHandle) -> Constructed;

    fn txn_commit(&self, txn: RawHandle) -> StatusCode;

    fn txn_rollback(&self, txn: RawHandle) -> StatusCode;

    fn query_execute(&self, db: RawHandle, query: &[u8], provenance: &[u8]) -> Constructed;

    /// Writes at most `buffer.len()` bytes of the next document and reports
    /// the document length through `written`. A well-behaved engine never
    /// reports more than it was given room for; callers must not rely on it.
    fn cursor_next(&self, cursor: RawHandle, buffer: &mut [u8], written: &mut u64) -> StatusCode;

    fn cursor_close(&self, cursor: RawHandle);
}
