//! Pull-based streaming of query results.
//!
//! Each [`Cursor::next`] asks the engine for one document, written into a
//! bounded scratch buffer owned by the cursor. The engine reports how many
//! bytes the document has; a report larger than the buffer is treated as
//! corruption and nothing is copied. Documents are returned as fresh `Vec`s,
//! never as views into the scratch buffer.
//!
//! Iteration is forward-only and cannot be restarted. The first `not_found`
//! from the engine ends the sequence and is remembered locally: later calls
//! return [`Fetch::Exhausted`] without going back to native code.

use std::iter::FusedIterator;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::engine::NativeEngine;
use crate::error::{BridgeError, BridgeResult};
use crate::handle::{CursorKind, Database, Resource};
use crate::status::Status;

/// Outcome of a successful [`Cursor::next`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetch {
    /// One result document, as raw bytes.
    Document(Vec<u8>),
    /// No more documents.
    Exhausted,
}

/// A FormBD result cursor.
///
/// Must not outlive the [`Database`] it was queried against.
#[derive(Debug)]
pub struct Cursor {
    resource: Resource<CursorKind>,
    scratch: Mutex<Box<[u8]>>,
    exhausted: AtomicBool,
}

impl Cursor {
    pub(crate) fn execute(
        db: &Database,
        query: &[u8],
        provenance: &[u8],
        buffer_capacity: usize,
    ) -> BridgeResult<Self> {
        let db_handle = db.handle()?;
        let resource = Resource::acquire(db.engine(), "query_execute", |engine| {
            engine.query_execute(db_handle, query, provenance)
        })?
        .finalized_by(db.finalizer());
        Ok(Self {
            resource,
            scratch: Mutex::new(vec![0u8; buffer_capacity].into_boxed_slice()),
            exhausted: AtomicBool::new(false),
        })
    }

    /// Fetches the next document.
    pub fn next(&self) -> BridgeResult<Fetch> {
        let handle = self.resource.handle()?;
        if self.exhausted.load(Ordering::Acquire) {
            return Ok(Fetch::Exhausted);
        }

        let mut scratch = self.scratch.lock().unwrap_or_else(PoisonError::into_inner);
        let capacity = scratch.len();
        let mut written = 0u64;
        let code = self
            .resource
            .engine()
            .cursor_next(handle, &mut scratch, &mut written);

        match Status::from_code(code) {
            Status::Ok => {
                let len = usize::try_from(written)
                    .ok()
                    .filter(|len| *len <= capacity)
                    .ok_or_else(|| {
                        debug!(
                            name: "cursor.next.overrun",
                            target: "formbd-bridge",
                            written,
                            capacity,
                            "Engine reported more bytes than the buffer holds"
                        );
                        BridgeError::BufferOverrun { written, capacity }
                    })?;
                Ok(Fetch::Document(scratch[..len].to_vec()))
            }
            Status::NotFound => {
                self.exhausted.store(true, Ordering::Release);
                Ok(Fetch::Exhausted)
            }
            status => Err(BridgeError::Native { status, code }),
        }
    }

    /// Whether the end of the results has been reached.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }

    pub fn is_live(&self) -> bool {
        self.resource.is_live()
    }

    /// Releases the native cursor now.
    pub fn close(&self) -> BridgeResult<()> {
        self.resource.close()
    }

    pub(crate) fn belongs_to(&self, engine: &Arc<dyn NativeEngine>) -> bool {
        self.resource.belongs_to(engine)
    }

    /// Capacity of the per-call document buffer.
    pub fn buffer_capacity(&self) -> usize {
        self.scratch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Iterates the remaining documents. Stops after exhaustion or after
    /// yielding the first error.
    pub fn documents(&self) -> Documents<'_> {
        Documents {
            cursor: self,
            done: false,
        }
    }
}

/// Iterator returned by [`Cursor::documents`].
#[derive(Debug)]
pub struct Documents<'a> {
    cursor: &'a Cursor,
    done: bool,
}

impl Iterator for Documents<'_> {
    type Item = BridgeResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.cursor.next() {
            Ok(Fetch::Document(document)) => Some(Ok(document)),
            Ok(Fetch::Exhausted) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl FusedIterator for Documents<'_> {}
