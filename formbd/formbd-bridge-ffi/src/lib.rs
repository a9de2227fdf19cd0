//! C-compatible FFI bindings for formbd-bridge
//!
//! Every handle given to C is a boxed wrapper holding one reference to a
//! bridge resource. The `*_free` functions drop that reference; when it is the
//! last one the resource is released, which rolls back a transaction that was
//! never committed. `*_close`, `formbd_txn_commit` and `formbd_txn_rollback`
//! release the native side early and leave the wrapper to be freed.

// Allow #[repr(C)] and other FFI attributes without wrapping in unsafe blocks (standard FFI practice)
#![allow(unsafe_attr_outside_unsafe)]

use once_cell::sync::OnceCell;
use std::os::raw::{c_char, c_int};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::slice;
use std::sync::Arc;
use tracing::{debug, warn};

use formbd_bridge::{
    Bridge, BridgeConfig, BridgeError, ConfigError, Cursor, Database, Fetch, NativeEngine, Status,
    Transaction,
};

const DATABASE_MAGIC: u64 = 0xF0DB_DA7A;
const TRANSACTION_MAGIC: u64 = 0xF0DB_7A11;
const CURSOR_MAGIC: u64 = 0xF0DB_C0C5;
const DOCUMENT_MAGIC: u64 = 0xF0DB_D0C5;

/// The bridge behind every entry point. Set once per process.
static BRIDGE: OnceCell<Bridge> = OnceCell::new();

/// Installs the engine the C entry points talk to.
///
/// Returns `Ok(false)` if a bridge was already in place; the first
/// installation wins. With the `native` feature the linked engine is installed
/// on first use when nothing else was.
pub fn install_engine(
    engine: Arc<dyn NativeEngine>,
    config: BridgeConfig,
) -> Result<bool, ConfigError> {
    let mut installed = false;
    BRIDGE.get_or_try_init(|| {
        installed = true;
        Bridge::new(engine, config)
    })?;
    debug!(
        name: "ffi.install_engine",
        target: "formbd-bridge-ffi",
        installed,
        "Engine installation requested"
    );
    Ok(installed)
}

fn bridge() -> Option<&'static Bridge> {
    #[cfg(feature = "native")]
    {
        BRIDGE
            .get_or_try_init(|| Bridge::linked(BridgeConfig::from_env()?))
            .map_err(|e| {
                warn!(
                    name: "ffi.bridge.unavailable",
                    target: "formbd-bridge-ffi",
                    error = %e,
                    "Could not configure the linked engine"
                );
            })
            .ok()
    }
    #[cfg(not(feature = "native"))]
    {
        BRIDGE.get()
    }
}

/// Status codes returned by FFI functions
///
/// Values 0..=11 are the engine's own codes and keep their numbering.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormbdStatus {
    Ok = 0,
    InvalidArg = 1,
    NotFound = 2,
    PermissionDenied = 3,
    AlreadyExists = 4,
    ConstraintViolation = 5,
    TypeMismatch = 6,
    OutOfMemory = 7,
    IoError = 8,
    Corruption = 9,
    Conflict = 10,
    InternalError = 11,

    /// The cursor has no more documents. Not an error.
    Done = 100,
}

impl From<Status> for FormbdStatus {
    fn from(status: Status) -> Self {
        match status {
            Status::Ok => Self::Ok,
            Status::InvalidArg => Self::InvalidArg,
            Status::NotFound => Self::NotFound,
            Status::PermissionDenied => Self::PermissionDenied,
            Status::AlreadyExists => Self::AlreadyExists,
            Status::ConstraintViolation => Self::ConstraintViolation,
            Status::TypeMismatch => Self::TypeMismatch,
            Status::OutOfMemory => Self::OutOfMemory,
            Status::IoError => Self::IoError,
            Status::Corruption => Self::Corruption,
            Status::Conflict => Self::Conflict,
            Status::InternalError => Self::InternalError,
        }
    }
}

impl From<BridgeError> for FormbdStatus {
    fn from(error: BridgeError) -> Self {
        error.status().into()
    }
}

/// Trait for handles that support validation
///
/// Implementors are `#[repr(C)]` with the `u64` magic as their first field.
trait ValidatedHandle {
    const MAGIC: u64;

    fn set_magic(&mut self, magic: u64);
}

macro_rules! validated_handle {
    ($handle:ty, $magic:ident) => {
        impl ValidatedHandle for $handle {
            const MAGIC: u64 = $magic;

            fn set_magic(&mut self, magic: u64) {
                self.magic = magic;
            }
        }
    };
}

/// Opaque handle for an open database
#[repr(C)]
pub struct FormbdDatabase {
    magic: u64, // Must stay first: kinds are told apart by this field alone
    db: Arc<Database>,
}

/// Opaque handle for a transaction
#[repr(C)]
pub struct FormbdTransaction {
    magic: u64,
    txn: Arc<Transaction>,
}

/// Opaque handle for a result cursor
#[repr(C)]
pub struct FormbdCursor {
    magic: u64,
    cursor: Arc<Cursor>,
}

/// Opaque handle owning one result document
#[repr(C)]
pub struct FormbdDocument {
    magic: u64,
    data: Box<[u8]>,
}

validated_handle!(FormbdDatabase, DATABASE_MAGIC);
validated_handle!(FormbdTransaction, TRANSACTION_MAGIC);
validated_handle!(FormbdCursor, CURSOR_MAGIC);
validated_handle!(FormbdDocument, DOCUMENT_MAGIC);

/// Null, foreign-kind and freed handles are all `InvalidArg`.
unsafe fn validate_handle<'a, T: ValidatedHandle>(handle: *const T) -> Result<&'a T, FormbdStatus> {
    if handle.is_null() {
        return Err(FormbdStatus::InvalidArg);
    }
    // Read only the magic until the kind is known.
    let magic = unsafe { handle.cast::<u64>().read() };
    if magic != T::MAGIC {
        return Err(FormbdStatus::InvalidArg);
    }
    Ok(unsafe { &*handle })
}

/// Clears the magic number and drops the box. Invalid handles are ignored.
unsafe fn free_handle<T: ValidatedHandle>(handle: *mut T) {
    if unsafe { validate_handle(handle) }.is_err() {
        return;
    }
    if let Some(h) = unsafe { handle.as_mut() } {
        h.set_magic(0);
    }
    drop(unsafe { Box::from_raw(handle) });
}

/// Nulls `out` and returns it, or `InvalidArg` if there is nowhere to write.
unsafe fn prepare_out<T>(out: *mut *mut T) -> Result<*mut *mut T, FormbdStatus> {
    if out.is_null() {
        return Err(FormbdStatus::InvalidArg);
    }
    unsafe { *out = ptr::null_mut() };
    Ok(out)
}

unsafe fn publish<T>(out: *mut *mut T, value: T) {
    unsafe { *out = Box::into_raw(Box::new(value)) };
}

/// Borrows a caller-provided byte range. Null is rejected even when `len` is 0.
unsafe fn borrow_bytes<'a>(data: *const c_char, len: u64) -> Result<&'a [u8], FormbdStatus> {
    if data.is_null() {
        return Err(FormbdStatus::InvalidArg);
    }
    let len = usize::try_from(len).map_err(|_| FormbdStatus::InvalidArg)?;
    Ok(unsafe { slice::from_raw_parts(data.cast::<u8>(), len) })
}

/// Runs an entry point, turning a panic into `InternalError`.
fn guard<F>(entry: F) -> FormbdStatus
where
    F: FnOnce(&'static Bridge) -> Result<FormbdStatus, FormbdStatus>,
{
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| match bridge() {
        Some(bridge) => entry(bridge).unwrap_or_else(|status| status),
        None => FormbdStatus::InternalError,
    }));
    outcome.unwrap_or_else(|_| {
        warn!(
            name: "ffi.panic",
            target: "formbd-bridge-ffi",
            "Panic caught at the C boundary"
        );
        FormbdStatus::InternalError
    })
}

/// Initializes the engine.
#[no_mangle]
pub extern "C" fn formbd_init() -> FormbdStatus {
    guard(|bridge| Ok(bridge.init().into()))
}

/// Tears the engine down. Handles still held by the caller must not be used
/// afterwards except to free them.
#[no_mangle]
pub extern "C" fn formbd_cleanup() {
    guard(|bridge| {
        bridge.cleanup();
        Ok(FormbdStatus::Ok)
    });
}

/// Opens an existing database.
///
/// # Safety
/// - path must point to path_len readable bytes
/// - out_db must be a valid pointer; on success it receives a handle the caller must free with formbd_db_free
#[no_mangle]
pub unsafe extern "C" fn formbd_open(
    path: *const c_char,
    path_len: u64,
    out_db: *mut *mut FormbdDatabase,
) -> FormbdStatus {
    guard(|bridge| {
        let out_db = unsafe { prepare_out(out_db) }?;
        let path = unsafe { borrow_bytes(path, path_len) }?;
        let db = bridge.open(path)?;
        unsafe {
            publish(
                out_db,
                FormbdDatabase {
                    magic: DATABASE_MAGIC,
                    db,
                },
            )
        };
        Ok(FormbdStatus::Ok)
    })
}

/// Creates a database of block_count blocks.
///
/// # Safety
/// - path must point to path_len readable bytes
/// - out_db must be a valid pointer; on success it receives a handle the caller must free with formbd_db_free
#[no_mangle]
pub unsafe extern "C" fn formbd_create(
    path: *const c_char,
    path_len: u64,
    block_count: u64,
    out_db: *mut *mut FormbdDatabase,
) -> FormbdStatus {
    guard(|bridge| {
        let out_db = unsafe { prepare_out(out_db) }?;
        let path = unsafe { borrow_bytes(path, path_len) }?;
        let db = bridge.create(path, block_count)?;
        unsafe {
            publish(
                out_db,
                FormbdDatabase {
                    magic: DATABASE_MAGIC,
                    db,
                },
            )
        };
        Ok(FormbdStatus::Ok)
    })
}

/// Closes the database now. The handle must still be freed.
///
/// # Safety
/// - db must be a handle returned by formbd_open or formbd_create, or null
#[no_mangle]
pub unsafe extern "C" fn formbd_db_close(db: *mut FormbdDatabase) -> FormbdStatus {
    guard(|bridge| {
        let db = unsafe { validate_handle(db) }?;
        bridge.close(&db.db)?;
        Ok(FormbdStatus::Ok)
    })
}

/// Frees a database handle, closing the database if nothing else holds it.
///
/// # Safety
/// - db must be a handle returned by formbd_open or formbd_create, or null
/// - db must not be used after calling this function
#[no_mangle]
pub unsafe extern "C" fn formbd_db_free(db: *mut FormbdDatabase) {
    let _ = panic::catch_unwind(AssertUnwindSafe(|| unsafe { free_handle(db) }));
}

/// Begins a transaction.
///
/// # Safety
/// - db must be a handle returned by formbd_open or formbd_create
/// - out_txn must be a valid pointer; on success it receives a handle the caller must free with formbd_txn_free
#[no_mangle]
pub unsafe extern "C" fn formbd_txn_begin(
    db: *mut FormbdDatabase,
    out_txn: *mut *mut FormbdTransaction,
) -> FormbdStatus {
    guard(|bridge| {
        let out_txn = unsafe { prepare_out(out_txn) }?;
        let db = unsafe { validate_handle(db) }?;
        let txn = bridge.txn_begin(&db.db)?;
        unsafe {
            publish(
                out_txn,
                FormbdTransaction {
                    magic: TRANSACTION_MAGIC,
                    txn,
                },
            )
        };
        Ok(FormbdStatus::Ok)
    })
}

/// Commits a transaction.
///
/// # Safety
/// - txn must be a handle returned by formbd_txn_begin, or null
#[no_mangle]
pub unsafe extern "C" fn formbd_txn_commit(txn: *mut FormbdTransaction) -> FormbdStatus {
    guard(|bridge| {
        let txn = unsafe { validate_handle(txn) }?;
        bridge.txn_commit(&txn.txn)?;
        Ok(FormbdStatus::Ok)
    })
}

/// Rolls a transaction back.
///
/// # Safety
/// - txn must be a handle returned by formbd_txn_begin, or null
#[no_mangle]
pub unsafe extern "C" fn formbd_txn_rollback(txn: *mut FormbdTransaction) -> FormbdStatus {
    guard(|bridge| {
        let txn = unsafe { validate_handle(txn) }?;
        bridge.txn_rollback(&txn.txn)?;
        Ok(FormbdStatus::Ok)
    })
}

/// Frees a transaction handle. A transaction that was neither committed nor
/// rolled back is rolled back.
///
/// # Safety
/// - txn must be a handle returned by formbd_txn_begin, or null
/// - txn must not be used after calling this function
#[no_mangle]
pub unsafe extern "C" fn formbd_txn_free(txn: *mut FormbdTransaction) {
    let _ = panic::catch_unwind(AssertUnwindSafe(|| unsafe { free_handle(txn) }));
}

/// Runs a query.
///
/// # Safety
/// - db must be a handle returned by formbd_open or formbd_create
/// - query and provenance_json must point to query_len and provenance_len readable bytes
/// - out_cursor must be a valid pointer; on success it receives a handle the caller must free with formbd_cursor_free
#[no_mangle]
pub unsafe extern "C" fn formbd_query_execute(
    db: *mut FormbdDatabase,
    query: *const c_char,
    query_len: u64,
    provenance_json: *const c_char,
    provenance_len: u64,
    out_cursor: *mut *mut FormbdCursor,
) -> FormbdStatus {
    guard(|bridge| {
        let out_cursor = unsafe { prepare_out(out_cursor) }?;
        let db = unsafe { validate_handle(db) }?;
        let query = unsafe { borrow_bytes(query, query_len) }?;
        let provenance = unsafe { borrow_bytes(provenance_json, provenance_len) }?;
        let cursor = bridge.query_execute(&db.db, query, provenance)?;
        unsafe {
            publish(
                out_cursor,
                FormbdCursor {
                    magic: CURSOR_MAGIC,
                    cursor,
                },
            )
        };
        Ok(FormbdStatus::Ok)
    })
}

/// Fetches the next document.
///
/// Returns `Ok` with a document in *out_document, `Done` with null once the
/// cursor is exhausted (and on every later call), or an error.
///
/// # Safety
/// - cursor must be a handle returned by formbd_query_execute, or null
/// - out_document must be a valid pointer; a document written there must be freed with formbd_document_free
#[no_mangle]
pub unsafe extern "C" fn formbd_cursor_next(
    cursor: *mut FormbdCursor,
    out_document: *mut *mut FormbdDocument,
) -> FormbdStatus {
    guard(|bridge| {
        let out_document = unsafe { prepare_out(out_document) }?;
        let cursor = unsafe { validate_handle(cursor) }?;
        match bridge.cursor_next(&cursor.cursor)? {
            Fetch::Document(data) => {
                unsafe {
                    publish(
                        out_document,
                        FormbdDocument {
                            magic: DOCUMENT_MAGIC,
                            data: data.into_boxed_slice(),
                        },
                    )
                };
                Ok(FormbdStatus::Ok)
            }
            Fetch::Exhausted => Ok(FormbdStatus::Done),
        }
    })
}

/// Closes the cursor now. The handle must still be freed.
///
/// # Safety
/// - cursor must be a handle returned by formbd_query_execute, or null
#[no_mangle]
pub unsafe extern "C" fn formbd_cursor_close(cursor: *mut FormbdCursor) -> FormbdStatus {
    guard(|bridge| {
        let cursor = unsafe { validate_handle(cursor) }?;
        bridge.cursor_close(&cursor.cursor)?;
        Ok(FormbdStatus::Ok)
    })
}

/// Frees a cursor handle, closing the cursor if nothing else holds it.
///
/// # Safety
/// - cursor must be a handle returned by formbd_query_execute, or null
/// - cursor must not be used after calling this function
#[no_mangle]
pub unsafe extern "C" fn formbd_cursor_free(cursor: *mut FormbdCursor) {
    let _ = panic::catch_unwind(AssertUnwindSafe(|| unsafe { free_handle(cursor) }));
}

/// Start of the document bytes, or null for an invalid handle. Valid until
/// the document is freed.
///
/// # Safety
/// - document must be a handle returned by formbd_cursor_next, or null
#[no_mangle]
pub unsafe extern "C" fn formbd_document_data(document: *const FormbdDocument) -> *const u8 {
    match unsafe { validate_handle(document) } {
        Ok(document) => document.data.as_ptr(),
        Err(_) => ptr::null(),
    }
}

/// Length of the document in bytes, or 0 for an invalid handle.
///
/// # Safety
/// - document must be a handle returned by formbd_cursor_next, or null
#[no_mangle]
pub unsafe extern "C" fn formbd_document_len(document: *const FormbdDocument) -> u64 {
    match unsafe { validate_handle(document) } {
        Ok(document) => document.data.len() as u64,
        Err(_) => 0,
    }
}

/// Frees a document.
///
/// # Safety
/// - document must be a handle returned by formbd_cursor_next, or null
/// - document must not be used after calling this function
#[no_mangle]
pub unsafe extern "C" fn formbd_document_free(document: *mut FormbdDocument) {
    let _ = panic::catch_unwind(AssertUnwindSafe(|| unsafe { free_handle(document) }));
}

/// Symbolic name of a status code (`"not_found"`, `"done"`, ...). Unknown
/// codes are `"internal_error"`. The string is static.
#[no_mangle]
pub extern "C" fn formbd_status_name(status: c_int) -> *const c_char {
    if status == FormbdStatus::Done as c_int {
        return c"done".as_ptr();
    }
    Status::from_code(status).as_c_str().as_ptr()
}
