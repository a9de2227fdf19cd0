//! Owning wrappers around native handles.
//!
//! A [`Resource`] holds exactly one engine handle in an atomic slot. An empty
//! slot means the handle has been released; it is never handed to the engine
//! again. Explicit release (`close`, commit, rollback) and finalization
//! (`Drop`) both go through the same swap-to-null, so however they interleave
//! the handle is released at most once.

use std::ffi::c_void;
use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::engine::{Constructed, NativeEngine, RawHandle, StatusCode};
use crate::error::{check, BridgeError, BridgeResult};
use crate::executor::Finalizer;
use crate::status::Status;

/// Per-kind behaviour of a [`Resource`].
pub trait ResourceKind: Send + Sync + 'static {
    /// Name used in errors and log events.
    const NAME: &'static str;

    /// Returns the handle to the engine. Called at most once per handle.
    fn release(engine: &dyn NativeEngine, handle: RawHandle) -> StatusCode;
}

/// Marker for database handles. Released with the native close call.
#[derive(Debug)]
pub enum DatabaseKind {}

/// Marker for transaction handles. Releasing an unfinished transaction rolls
/// it back.
#[derive(Debug)]
pub enum TransactionKind {}

/// Marker for cursor handles. Released with the native cursor-close call.
#[derive(Debug)]
pub enum CursorKind {}

impl ResourceKind for DatabaseKind {
    const NAME: &'static str = "database";

    fn release(engine: &dyn NativeEngine, handle: RawHandle) -> StatusCode {
        engine.close(handle)
    }
}

impl ResourceKind for TransactionKind {
    const NAME: &'static str = "transaction";

    fn release(engine: &dyn NativeEngine, handle: RawHandle) -> StatusCode {
        engine.txn_rollback(handle)
    }
}

impl ResourceKind for CursorKind {
    const NAME: &'static str = "cursor";

    fn release(engine: &dyn NativeEngine, handle: RawHandle) -> StatusCode {
        engine.cursor_close(handle);
        Status::Ok.code()
    }
}

/// Liveness flag and handle in one word.
struct HandleSlot(AtomicPtr<c_void>);

impl HandleSlot {
    fn new(handle: RawHandle) -> Self {
        Self(AtomicPtr::new(handle.as_ptr()))
    }

    fn get(&self) -> Option<RawHandle> {
        RawHandle::from_ptr(self.0.load(Ordering::Acquire))
    }

    fn take(&self) -> Option<RawHandle> {
        RawHandle::from_ptr(self.0.swap(ptr::null_mut(), Ordering::AcqRel))
    }

    fn restore(&self, handle: RawHandle) -> bool {
        self.0
            .compare_exchange(
                ptr::null_mut(),
                handle.as_ptr(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// Host-visible owner of one native handle.
///
/// Callers must not drive the same resource from two threads at once; the
/// engine gives no guarantees for concurrent use of one handle. Release is the
/// exception: it is safe from any thread, including a racing `Drop`.
pub struct Resource<K: ResourceKind> {
    slot: HandleSlot,
    engine: Arc<dyn NativeEngine>,
    finalizer: Option<Finalizer>,
    _kind: PhantomData<fn() -> K>,
}

/// An open FormBD database.
pub type Database = Resource<DatabaseKind>;

impl<K: ResourceKind> Resource<K> {
    /// Runs a native constructor and wraps its handle.
    ///
    /// Nothing is returned to the caller unless the engine reported success
    /// *and* produced a handle. A handle produced alongside a failure is
    /// released immediately.
    pub(crate) fn acquire<F>(
        engine: &Arc<dyn NativeEngine>,
        operation: &'static str,
        construct: F,
    ) -> BridgeResult<Self>
    where
        F: FnOnce(&dyn NativeEngine) -> Constructed,
    {
        let (code, handle) = construct(engine.as_ref());
        match (Status::from_code(code), handle) {
            (Status::Ok, Some(handle)) => Ok(Self {
                slot: HandleSlot::new(handle),
                engine: Arc::clone(engine),
                finalizer: None,
                _kind: PhantomData,
            }),
            (Status::Ok, None) => Err(BridgeError::MissingHandle { operation }),
            (status, stray) => {
                if let Some(stray) = stray {
                    let released = K::release(engine.as_ref(), stray);
                    debug!(
                        name: "resource.acquire.stray_handle",
                        target: "formbd-bridge",
                        kind = K::NAME,
                        operation,
                        release_code = released,
                        "Released handle returned alongside a failure"
                    );
                }
                debug!(
                    name: "resource.acquire.failed",
                    target: "formbd-bridge",
                    kind = K::NAME,
                    operation,
                    status = %status,
                    code,
                    "Native constructor failed"
                );
                Err(BridgeError::Native { status, code })
            }
        }
    }

    /// Whether the handle is still held.
    pub fn is_live(&self) -> bool {
        self.slot.get().is_some()
    }

    /// Releases the handle now instead of waiting for the last reference to
    /// go away. Fails with [`BridgeError::Released`] if it is already gone.
    pub fn close(&self) -> BridgeResult<()> {
        let handle = self.claim()?;
        check(K::release(self.engine.as_ref(), handle))
    }

    /// The live handle, for calls that use it without consuming it.
    pub(crate) fn handle(&self) -> BridgeResult<RawHandle> {
        self.slot
            .get()
            .ok_or(BridgeError::Released { kind: K::NAME })
    }

    /// Takes the handle out of the slot. Exactly one caller wins.
    pub(crate) fn claim(&self) -> BridgeResult<RawHandle> {
        self.slot
            .take()
            .ok_or(BridgeError::Released { kind: K::NAME })
    }

    /// Puts back a handle taken by [`claim`](Self::claim) whose consuming call
    /// failed, so finalization still sees it.
    pub(crate) fn restore(&self, handle: RawHandle) {
        let restored = self.slot.restore(handle);
        debug_assert!(restored, "{} slot refilled while claimed", K::NAME);
    }

    pub(crate) fn engine(&self) -> &Arc<dyn NativeEngine> {
        &self.engine
    }

    /// Routes this resource's finalization through `finalizer`.
    pub(crate) fn finalized_by(mut self, finalizer: Option<Finalizer>) -> Self {
        self.finalizer = finalizer;
        self
    }

    pub(crate) fn finalizer(&self) -> Option<Finalizer> {
        self.finalizer.clone()
    }

    pub(crate) fn belongs_to(&self, engine: &Arc<dyn NativeEngine>) -> bool {
        Arc::ptr_eq(&self.engine, engine)
    }
}

impl<K: ResourceKind> Drop for Resource<K> {
    fn drop(&mut self) {
        let Some(handle) = self.slot.take() else {
            return;
        };
        let release = Release::<K> {
            engine: Arc::clone(&self.engine),
            handle,
            _kind: PhantomData,
        };
        match &self.finalizer {
            Some(finalizer) => finalizer.submit(move || drop(release)),
            None => drop(release),
        }
    }
}

/// A handle claimed by finalization. Dropping it performs the release, on
/// whichever thread that happens.
struct Release<K: ResourceKind> {
    engine: Arc<dyn NativeEngine>,
    handle: RawHandle,
    _kind: PhantomData<fn() -> K>,
}

impl<K: ResourceKind> Drop for Release<K> {
    fn drop(&mut self) {
        let code = K::release(self.engine.as_ref(), self.handle);
        let status = Status::from_code(code);
        if status.is_ok() {
            debug!(
                name: "resource.finalize",
                target: "formbd-bridge",
                kind = K::NAME,
                "Released unreachable handle"
            );
        } else {
            // Nobody is left to return this to.
            warn!(
                name: "resource.finalize.failed",
                target: "formbd-bridge",
                kind = K::NAME,
                status = %status,
                code,
                "Native release failed during finalization"
            );
        }
    }
}

impl<K: ResourceKind> fmt::Debug for Resource<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("kind", &K::NAME)
            .field("handle", &self.slot.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{Call, StubEngine};
    use std::thread;

    fn engine() -> (Arc<StubEngine>, Arc<dyn NativeEngine>) {
        let stub = Arc::new(StubEngine::new().with_existing_path("/db"));
        let engine: Arc<dyn NativeEngine> = stub.clone();
        (stub, engine)
    }

    fn open(engine: &Arc<dyn NativeEngine>) -> BridgeResult<Database> {
        Database::acquire(engine, "open", |e| e.open(b"/db"))
    }

    #[test]
    fn test_drop_releases_once() {
        let (stub, engine) = engine();
        let db = open(&engine).unwrap();
        assert!(db.is_live());
        drop(db);
        assert_eq!(stub.calls(Call::Close), 1);
        assert_eq!(stub.live_handles(), 0);
    }

    #[test]
    fn test_close_then_drop_releases_once() {
        let (stub, engine) = engine();
        let db = open(&engine).unwrap();
        db.close().unwrap();
        assert!(!db.is_live());
        assert_eq!(db.close(), Err(BridgeError::Released { kind: "database" }));
        drop(db);
        assert_eq!(stub.calls(Call::Close), 1);
    }

    #[test]
    fn test_failed_acquire_exposes_nothing() {
        let (stub, engine) = engine();
        let err = Database::acquire(&engine, "open", |e| e.open(b"/missing")).unwrap_err();
        assert_eq!(err.status(), Status::NotFound);
        assert!(err.is_native());
        assert_eq!(stub.calls(Call::Close), 0);
    }

    #[test]
    fn test_failed_acquire_releases_stray_handle() {
        let (stub, engine) = engine();
        stub.hand_out_handle_on_failure();
        stub.fail_next(Call::Open, Status::PermissionDenied);
        let err = open(&engine).unwrap_err();
        assert_eq!(err.status(), Status::PermissionDenied);
        assert_eq!(stub.calls(Call::Close), 1);
        assert_eq!(stub.live_handles(), 0);
    }

    #[test]
    fn test_success_without_handle_is_internal_error() {
        let (stub, engine) = engine();
        stub.fail_next_code(Call::Open, 0);
        let err = open(&engine).unwrap_err();
        assert_eq!(err, BridgeError::MissingHandle { operation: "open" });
        assert_eq!(err.status(), Status::InternalError);
    }

    #[test]
    fn test_racing_close_releases_once() {
        let (stub, engine) = engine();
        let db = Arc::new(open(&engine).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let db = Arc::clone(&db);
                thread::spawn(move || db.close().is_ok())
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        drop(db);
        assert_eq!(wins, 1);
        assert_eq!(stub.calls(Call::Close), 1);
    }

    #[test]
    fn test_failed_close_is_reported_once() {
        let (stub, engine) = engine();
        let db = open(&engine).unwrap();
        stub.fail_next(Call::Close, Status::IoError);
        let err = db.close().unwrap_err();
        assert_eq!(err.status(), Status::IoError);
        assert!(!db.is_live());
        drop(db);
        assert_eq!(stub.calls(Call::Close), 1);
    }

    #[test]
    fn test_failed_finalizer_release_is_swallowed() {
        let (stub, engine) = engine();
        let db = open(&engine).unwrap();
        stub.fail_next(Call::Close, Status::IoError);
        drop(db);
        assert_eq!(stub.calls(Call::Close), 1);
        // The injected failure skipped the engine's own bookkeeping.
        assert_eq!(stub.live_handles(), 1);
        let again = open(&engine).unwrap();
        drop(again);
        assert_eq!(stub.calls(Call::Close), 2);
        assert_eq!(stub.live_handles(), 1);
    }

    #[test]
    fn test_claim_and_restore() {
        let (_stub, engine) = engine();
        let db = open(&engine).unwrap();
        let handle = db.claim().unwrap();
        assert!(!db.is_live());
        assert!(db.handle().is_err());
        db.restore(handle);
        assert_eq!(db.handle().unwrap(), handle);
    }
}
