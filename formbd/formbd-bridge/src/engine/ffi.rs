//! Low-level bindings to `libformbd`.
//!
//! Linking is driven by `build.rs` (`FORMBD_LIB_DIR`), so this block carries
//! no `#[link]` attribute.

use std::ffi::c_void;
use std::os::raw::c_char;
use std::ptr;

use super::{Constructed, NativeEngine, RawHandle, StatusCode};

unsafe extern "C" {
    pub fn fdb_init() -> i32;
    pub fn fdb_cleanup();
    pub fn fdb_open(path: *const c_char, path_len: u64, db_out: *mut *mut c_void) -> i32;
    pub fn fdb_close(db: *mut c_void) -> i32;
    pub fn fdb_create(
        path: *const c_char,
        path_len: u64,
        block_count: u64,
        db_out: *mut *mut c_void,
    ) -> i32;

    pub fn fdb_txn_begin(db: *mut c_void, txn_out: *mut *mut c_void) -> i32;
    pub fn fdb_txn_commit(txn: *mut c_void) -> i32;
    pub fn fdb_txn_rollback(txn: *mut c_void) -> i32;

    pub fn fdb_query_execute(
        db: *mut c_void,
        query_str: *const c_char,
        query_len: u64,
        provenance_json: *const c_char,
        provenance_len: u64,
        cursor_out: *mut *mut c_void,
    ) -> i32;

    pub fn fdb_cursor_next(
        cursor: *mut c_void,
        document_json_out: *mut c_char,
        buffer_len: u64,
        written_out: *mut u64,
    ) -> i32;

    pub fn fdb_cursor_close(cursor: *mut c_void);
}

/// [`NativeEngine`] backed by the linked `libformbd`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinkedEngine;

impl NativeEngine for LinkedEngine {
    fn init(&self) -> StatusCode {
        unsafe { fdb_init() }
    }

    fn cleanup(&self) {
        unsafe { fdb_cleanup() }
    }

    fn open(&self, path: &[u8]) -> Constructed {
        let mut out: *mut c_void = ptr::null_mut();
        let status = unsafe { fdb_open(path.as_ptr().cast(), path.len() as u64, &mut out) };
        (status, RawHandle::from_ptr(out))
    }

    fn create(&self, path: &[u8], block_count: u64) -> Constructed {
        let mut out: *mut c_void = ptr::null_mut();
        let status = unsafe {
            fdb_create(
                path.as_ptr().cast(),
                path.len() as u64,
                block_count,
                &mut out,
            )
        };
        (status, RawHandle::from_ptr(out))
    }

    fn close(&self, db: RawHandle) -> StatusCode {
        unsafe { fdb_close(db.as_ptr()) }
    }

    fn txn_begin(&self, db: RawHandle) -> Constructed {
        let mut out: *mut c_void = ptr::null_mut();
        let status = unsafe { fdb_txn_begin(db.as_ptr(), &mut out) };
        (status, RawHandle::from_ptr(out))
    }

    fn txn_commit(&self, txn: RawHandle) -> StatusCode {
        unsafe { fdb_txn_commit(txn.as_ptr()) }
    }

    fn txn_rollback(&self, txn: RawHandle) -> StatusCode {
        unsafe { fdb_txn_rollback(txn.as_ptr()) }
    }

    fn query_execute(&self, db: RawHandle, query: &[u8], provenance: &[u8]) -> Constructed {
        let mut out: *mut c_void = ptr::null_mut();
        let status = unsafe {
            fdb_query_execute(
                db.as_ptr(),
                query.as_ptr().cast(),
                query.len() as u64,
                provenance.as_ptr().cast(),
                provenance.len() as u64,
                &mut out,
            )
        };
        (status, RawHandle::from_ptr(out))
    }

    fn cursor_next(&self, cursor: RawHandle, buffer: &mut [u8], written: &mut u64) -> StatusCode {
        unsafe {
            fdb_cursor_next(
                cursor.as_ptr(),
                buffer.as_mut_ptr().cast(),
                buffer.len() as u64,
                written,
            )
        }
    }

    fn cursor_close(&self, cursor: RawHandle) {
        unsafe { fdb_cursor_close(cursor.as_ptr()) }
    }
}
