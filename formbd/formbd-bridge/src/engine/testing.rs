//! In-process stand-in for `libformbd`.
//!
//! `StubEngine` keeps just enough state to behave like the real engine at the
//! boundary (paths that exist, which handles are live, what each cursor still
//! has to yield) and counts every call so tests can assert exactly how often
//! the bridge reached native code.

use std::collections::{HashMap, HashSet, VecDeque};
use std::ffi::c_void;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{Constructed, NativeEngine, RawHandle, StatusCode};
use crate::status::Status;

/// Native entry points, for call counting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    Init,
    Cleanup,
    Open,
    Create,
    Close,
    TxnBegin,
    TxnCommit,
    TxnRollback,
    QueryExecute,
    CursorNext,
    CursorClose,
}

const CALL_KINDS: usize = 11;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Database,
    Transaction,
    Cursor,
}

#[derive(Default)]
struct State {
    paths: HashSet<Vec<u8>>,
    live: HashMap<usize, Kind>,
    cursors: HashMap<usize, VecDeque<Vec<u8>>>,
    drained: HashSet<usize>,
    documents: Vec<Vec<u8>>,
    failures: HashMap<Call, StatusCode>,
    stray_handle_on_failure: bool,
    misreported_written: Option<u64>,
}

/// Instrumented fake engine.
pub struct StubEngine {
    state: Mutex<State>,
    calls: [AtomicUsize; CALL_KINDS],
    threads: Mutex<HashMap<Call, Option<String>>>,
    past_exhaustion: AtomicUsize,
    next_id: AtomicUsize,
}

impl Default for StubEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StubEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            calls: std::array::from_fn(|_| AtomicUsize::new(0)),
            threads: Mutex::new(HashMap::new()),
            past_exhaustion: AtomicUsize::new(0),
            next_id: AtomicUsize::new(1),
        }
    }

    /// Documents every subsequent query yields, in order.
    pub fn with_documents<I, D>(self, documents: I) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<Vec<u8>>,
    {
        self.set_documents(documents);
        self
    }

    pub fn set_documents<I, D>(&self, documents: I)
    where
        I: IntoIterator<Item = D>,
        D: Into<Vec<u8>>,
    {
        self.state().documents = documents.into_iter().map(Into::into).collect();
    }

    /// Marks `path` as an existing database file.
    pub fn with_existing_path(self, path: impl Into<Vec<u8>>) -> Self {
        self.state().paths.insert(path.into());
        self
    }

    /// The next call to `call` returns `status` instead of doing its work.
    pub fn fail_next(&self, call: Call, status: Status) {
        self.fail_next_code(call, status.code());
    }

    /// Like [`fail_next`](Self::fail_next) with a raw, possibly unknown, code.
    pub fn fail_next_code(&self, call: Call, code: StatusCode) {
        self.state().failures.insert(call, code);
    }

    /// Failed constructors still write a (live) handle into the out-slot.
    pub fn hand_out_handle_on_failure(&self) {
        self.state().stray_handle_on_failure = true;
    }

    /// The next successful `cursor_next` reports `written` regardless of the
    /// buffer it was given.
    pub fn misreport_next_written(&self, written: u64) {
        self.state().misreported_written = Some(written);
    }

    pub fn calls(&self, call: Call) -> usize {
        self.calls[call as usize].load(Ordering::SeqCst)
    }

    /// Name of the thread that last made `call`. `None` if it was never made
    /// or the thread is unnamed.
    pub fn last_thread(&self, call: Call) -> Option<String> {
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&call)
            .cloned()
            .flatten()
    }

    /// `cursor_next` calls made on a cursor that had already reported
    /// `not_found`.
    pub fn calls_past_exhaustion(&self) -> usize {
        self.past_exhaustion.load(Ordering::SeqCst)
    }

    /// Handles handed out and not yet closed, committed or rolled back.
    pub fn live_handles(&self) -> usize {
        self.state().live.len()
    }

    pub fn is_live(&self, handle: RawHandle) -> bool {
        self.state().live.contains_key(&Self::id(handle))
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, call: Call) {
        let thread = std::thread::current().name().map(str::to_owned);
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(call, thread);
        self.calls[call as usize].fetch_add(1, Ordering::SeqCst);
    }

    fn id(handle: RawHandle) -> usize {
        handle.as_ptr() as usize >> 4
    }

    fn allocate(&self, state: &mut State, kind: Kind) -> RawHandle {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        state.live.insert(id, kind);
        RawHandle::from_ptr((id << 4) as *mut c_void).expect("stub handle ids start at 1")
    }

    fn injected(&self, state: &mut State, call: Call, kind: Kind) -> Option<Constructed> {
        let code = state.failures.remove(&call)?;
        let stray = state
            .stray_handle_on_failure
            .then(|| self.allocate(state, kind));
        Some((code, stray))
    }

    fn injected_status(state: &mut State, call: Call) -> Option<StatusCode> {
        state.failures.remove(&call)
    }

    fn release(state: &mut State, handle: RawHandle, kind: Kind) -> StatusCode {
        let id = Self::id(handle);
        if state.live.get(&id) != Some(&kind) {
            return Status::InvalidArg.code();
        }
        state.live.remove(&id);
        Status::Ok.code()
    }

    fn has(state: &State, handle: RawHandle, kind: Kind) -> bool {
        state.live.get(&Self::id(handle)) == Some(&kind)
    }
}

impl NativeEngine for StubEngine {
    fn init(&self) -> StatusCode {
        self.record(Call::Init);
        Self::injected_status(&mut self.state(), Call::Init).unwrap_or(Status::Ok.code())
    }

    fn cleanup(&self) {
        self.record(Call::Cleanup);
    }

    fn open(&self, path: &[u8]) -> Constructed {
        self.record(Call::Open);
        let mut state = self.state();
        if let Some(injected) = self.injected(&mut state, Call::Open, Kind::Database) {
            return injected;
        }
        if path.is_empty() {
            return (Status::InvalidArg.code(), None);
        }
        if !state.paths.contains(path) {
            return (Status::NotFound.code(), None);
        }
        (Status::Ok.code(), Some(self.allocate(&mut state, Kind::Database)))
    }

    fn create(&self, path: &[u8], block_count: u64) -> Constructed {
        self.record(Call::Create);
        let mut state = self.state();
        if let Some(injected) = self.injected(&mut state, Call::Create, Kind::Database) {
            return injected;
        }
        if path.is_empty() || block_count == 0 {
            return (Status::InvalidArg.code(), None);
        }
        if !state.paths.insert(path.to_vec()) {
            return (Status::AlreadyExists.code(), None);
        }
        (Status::Ok.code(), Some(self.allocate(&mut state, Kind::Database)))
    }

    fn close(&self, db: RawHandle) -> StatusCode {
        self.record(Call::Close);
        let mut state = self.state();
        if let Some(code) = Self::injected_status(&mut state, Call::Close) {
            return code;
        }
        Self::release(&mut state, db, Kind::Database)
    }

    fn txn_begin(&self, db: RawHandle) -> Constructed {
        self.record(Call::TxnBegin);
        let mut state = self.state();
        if let Some(injected) = self.injected(&mut state, Call::TxnBegin, Kind::Transaction) {
            return injected;
        }
        if !Self::has(&state, db, Kind::Database) {
            return (Status::InvalidArg.code(), None);
        }
        (Status::Ok.code(), Some(self.allocate(&mut state, Kind::Transaction)))
    }

    fn txn_commit(&self, txn: RawHandle) -> StatusCode {
        self.record(Call::TxnCommit);
        let mut state = self.state();
        if let Some(code) = Self::injected_status(&mut state, Call::TxnCommit) {
            return code;
        }
        Self::release(&mut state, txn, Kind::Transaction)
    }

    fn txn_rollback(&self, txn: RawHandle) -> StatusCode {
        self.record(Call::TxnRollback);
        let mut state = self.state();
        if let Some(code) = Self::injected_status(&mut state, Call::TxnRollback) {
            // A failed rollback still ends the transaction on the engine side.
            Self::release(&mut state, txn, Kind::Transaction);
            return code;
        }
        Self::release(&mut state, txn, Kind::Transaction)
    }

    fn query_execute(&self, db: RawHandle, query: &[u8], _provenance: &[u8]) -> Constructed {
        self.record(Call::QueryExecute);
        let mut state = self.state();
        if let Some(injected) = self.injected(&mut state, Call::QueryExecute, Kind::Cursor) {
            return injected;
        }
        if !Self::has(&state, db, Kind::Database) || query.is_empty() {
            return (Status::InvalidArg.code(), None);
        }
        let cursor = self.allocate(&mut state, Kind::Cursor);
        let documents = state.documents.iter().cloned().collect();
        state.cursors.insert(Self::id(cursor), documents);
        (Status::Ok.code(), Some(cursor))
    }

    fn cursor_next(&self, cursor: RawHandle, buffer: &mut [u8], written: &mut u64) -> StatusCode {
        self.record(Call::CursorNext);
        let mut state = self.state();
        if let Some(code) = Self::injected_status(&mut state, Call::CursorNext) {
            return code;
        }
        if !Self::has(&state, cursor, Kind::Cursor) {
            return Status::InvalidArg.code();
        }
        if let Some(reported) = state.misreported_written.take() {
            *written = reported;
            return Status::Ok.code();
        }
        let id = Self::id(cursor);
        match state.cursors.get_mut(&id).and_then(VecDeque::pop_front) {
            Some(document) => {
                // Oversized documents are reported at full length but not copied.
                if document.len() <= buffer.len() {
                    buffer[..document.len()].copy_from_slice(&document);
                }
                *written = document.len() as u64;
                Status::Ok.code()
            }
            None => {
                if !state.drained.insert(id) {
                    self.past_exhaustion.fetch_add(1, Ordering::SeqCst);
                }
                Status::NotFound.code()
            }
        }
    }

    fn cursor_close(&self, cursor: RawHandle) {
        self.record(Call::CursorClose);
        let mut state = self.state();
        let id = Self::id(cursor);
        state.cursors.remove(&id);
        state.drained.remove(&id);
        Self::release(&mut state, cursor, Kind::Cursor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_requires_existing_path() {
        let engine = StubEngine::new().with_existing_path("/data/a");
        assert_eq!(engine.open(b"/data/missing").0, Status::NotFound.code());
        let (code, handle) = engine.open(b"/data/a");
        assert_eq!(code, Status::Ok.code());
        assert!(engine.is_live(handle.unwrap()));
        assert_eq!(engine.calls(Call::Open), 2);
    }

    #[test]
    fn test_injected_failure_is_one_shot() {
        let engine = StubEngine::new();
        engine.fail_next(Call::Create, Status::IoError);
        assert_eq!(engine.create(b"/x", 1), (Status::IoError.code(), None));
        assert_eq!(engine.create(b"/x", 1).0, Status::Ok.code());
    }

    #[test]
    fn test_cursor_yields_documents_then_not_found() {
        let engine = StubEngine::new().with_documents(["{\"a\":1}"]);
        let (_, db) = engine.create(b"/db", 4);
        let (_, cursor) = engine.query_execute(db.unwrap(), b"SELECT *", b"{}");
        let cursor = cursor.unwrap();
        let mut buffer = [0u8; 32];
        let mut written = 0;
        assert_eq!(engine.cursor_next(cursor, &mut buffer, &mut written), 0);
        assert_eq!(&buffer[..written as usize], b"{\"a\":1}");
        assert_eq!(
            engine.cursor_next(cursor, &mut buffer, &mut written),
            Status::NotFound.code()
        );
        assert_eq!(engine.calls_past_exhaustion(), 0);
        engine.cursor_next(cursor, &mut buffer, &mut written);
        assert_eq!(engine.calls_past_exhaustion(), 1);
    }

    #[test]
    fn test_released_handles_are_rejected() {
        let engine = StubEngine::new();
        let (_, db) = engine.create(b"/db", 4);
        let (_, txn) = engine.txn_begin(db.unwrap());
        let txn = txn.unwrap();
        assert_eq!(engine.txn_commit(txn), Status::Ok.code());
        assert_eq!(engine.txn_commit(txn), Status::InvalidArg.code());
        assert_eq!(engine.live_handles(), 1);
    }
}
