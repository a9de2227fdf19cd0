//! The operations exposed to the host.
//!
//! Every entry point validates its arguments before touching native code and
//! returns a value; nothing here retries, panics across the boundary, or
//! aborts the caller.

use std::fmt;
use std::sync::Arc;

use serde_json::value::RawValue;
use tracing::debug;

use crate::config::{BridgeConfig, ConfigError};
use crate::cursor::{Cursor, Fetch};
use crate::engine::NativeEngine;
use crate::error::{BridgeError, BridgeResult};
use crate::executor::Finalizer;
use crate::handle::Database;
use crate::status::Status;
use crate::txn::Transaction;

/// Synchronous bridge over one native engine.
///
/// Calls that may block on I/O run on the caller's thread. Hosts driving the
/// bridge from an async scheduler should go through
/// [`AsyncBridge`](crate::AsyncBridge) instead.
pub struct Bridge {
    engine: Arc<dyn NativeEngine>,
    config: BridgeConfig,
    finalizer: Option<Finalizer>,
}

impl Bridge {
    pub fn new(engine: Arc<dyn NativeEngine>, config: BridgeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            engine,
            config,
            finalizer: None,
        })
    }

    /// Databases opened from here on, and everything begun on them, finalize
    /// through `finalizer`.
    pub(crate) fn with_finalizer(mut self, finalizer: Option<Finalizer>) -> Self {
        self.finalizer = finalizer;
        self
    }

    /// Bridge over the linked `libformbd`.
    #[cfg(feature = "native")]
    pub fn linked(config: BridgeConfig) -> Result<Self, ConfigError> {
        Self::new(Arc::new(crate::engine::LinkedEngine), config)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Initializes the engine. The status is the only output.
    pub fn init(&self) -> Status {
        let status = Status::from_code(self.engine.init());
        debug!(name: "bridge.init", target: "formbd-bridge", status = %status, "Engine initialized");
        status
    }

    /// Tears the engine down. Resources still alive afterwards are the
    /// caller's problem.
    pub fn cleanup(&self) {
        self.engine.cleanup();
        debug!(name: "bridge.cleanup", target: "formbd-bridge", "Engine cleaned up");
    }

    /// Opens an existing database.
    pub fn open(&self, path: &[u8]) -> BridgeResult<Arc<Database>> {
        traced("open", || {
            require_path(path)?;
            Database::acquire(&self.engine, "open", |engine| engine.open(path))
                .map(|db| self.share(db))
        })
    }

    /// Creates a database of `block_count` blocks.
    pub fn create(&self, path: &[u8], block_count: u64) -> BridgeResult<Arc<Database>> {
        traced("create", || {
            require_path(path)?;
            Database::acquire(&self.engine, "create", |engine| {
                engine.create(path, block_count)
            })
            .map(|db| self.share(db))
        })
    }

    /// Closes a database now rather than when its last reference is dropped.
    pub fn close(&self, db: &Database) -> BridgeResult<()> {
        traced("close", || {
            self.owns(db.belongs_to(&self.engine), "database")?;
            db.close()
        })
    }

    pub fn txn_begin(&self, db: &Database) -> BridgeResult<Arc<Transaction>> {
        traced("txn_begin", || {
            self.owns(db.belongs_to(&self.engine), "database")?;
            Transaction::begin(db).map(Arc::new)
        })
    }

    pub fn txn_commit(&self, txn: &Transaction) -> BridgeResult<()> {
        traced("txn_commit", || {
            self.owns(txn.belongs_to(&self.engine), "transaction")?;
            txn.commit()
        })
    }

    pub fn txn_rollback(&self, txn: &Transaction) -> BridgeResult<()> {
        traced("txn_rollback", || {
            self.owns(txn.belongs_to(&self.engine), "transaction")?;
            txn.rollback()
        })
    }

    /// Runs `query` against `db`. `provenance` is JSON text forwarded to the
    /// engine untouched; empty provenance means no metadata and is forwarded
    /// as-is.
    pub fn query_execute(
        &self,
        db: &Database,
        query: &[u8],
        provenance: &[u8],
    ) -> BridgeResult<Arc<Cursor>> {
        traced("query_execute", || {
            self.owns(db.belongs_to(&self.engine), "database")?;
            if query.is_empty() {
                return Err(BridgeError::InvalidArgument("query text is empty"));
            }
            if self.config.validate_provenance
                && !provenance.is_empty()
                && serde_json::from_slice::<&RawValue>(provenance).is_err()
            {
                return Err(BridgeError::InvalidArgument(
                    "provenance metadata is not well-formed JSON",
                ));
            }
            Cursor::execute(db, query, provenance, self.config.cursor_buffer_capacity)
                .map(Arc::new)
        })
    }

    pub fn cursor_next(&self, cursor: &Cursor) -> BridgeResult<Fetch> {
        traced("cursor_next", || {
            self.owns(cursor.belongs_to(&self.engine), "cursor")?;
            cursor.next()
        })
    }

    pub fn cursor_close(&self, cursor: &Cursor) -> BridgeResult<()> {
        traced("cursor_close", || {
            self.owns(cursor.belongs_to(&self.engine), "cursor")?;
            cursor.close()
        })
    }

    fn share(&self, db: Database) -> Arc<Database> {
        Arc::new(db.finalized_by(self.finalizer.clone()))
    }

    fn owns(&self, owned: bool, kind: &'static str) -> BridgeResult<()> {
        if owned {
            Ok(())
        } else {
            Err(BridgeError::ForeignResource { kind })
        }
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn require_path(path: &[u8]) -> BridgeResult<()> {
    if path.is_empty() {
        return Err(BridgeError::InvalidArgument("path is empty"));
    }
    Ok(())
}

fn traced<T>(operation: &'static str, call: impl FnOnce() -> BridgeResult<T>) -> BridgeResult<T> {
    let result = call();
    if let Err(e) = &result {
        debug!(
            name: "bridge.call.failed",
            target: "formbd-bridge",
            operation,
            status = %e.status(),
            native = e.is_native(),
            error = %e,
            "Bridge call failed"
        );
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{Call, StubEngine};
    use crate::txn::TxnState;

    fn bridge_with(stub: StubEngine) -> (Arc<StubEngine>, Bridge) {
        let stub = Arc::new(stub);
        let bridge = Bridge::new(stub.clone(), BridgeConfig::default()).unwrap();
        (stub, bridge)
    }

    #[test]
    fn test_end_to_end() {
        let (stub, bridge) =
            bridge_with(StubEngine::new().with_documents(["{\"id\":1}", "{\"id\":2}"]));
        assert_eq!(bridge.init(), Status::Ok);

        let db = bridge.create(b"/tmp/t1", 16).unwrap();
        assert!(db.is_live());
        let txn = bridge.txn_begin(&db).unwrap();
        let cursor = bridge.query_execute(&db, b"SELECT *", b"{}").unwrap();

        let mut documents = Vec::new();
        while let Fetch::Document(document) = bridge.cursor_next(&cursor).unwrap() {
            documents.push(document);
        }
        assert_eq!(documents, vec![b"{\"id\":1}".to_vec(), b"{\"id\":2}".to_vec()]);

        bridge.txn_commit(&txn).unwrap();
        assert_eq!(txn.state(), TxnState::Terminated);

        drop((cursor, txn, db));
        assert_eq!(stub.calls(Call::TxnRollback), 0);
        assert_eq!(stub.live_handles(), 0);
    }

    #[test]
    fn test_open_missing_path_yields_no_resource() {
        let (stub, bridge) = bridge_with(StubEngine::new());
        let paths: [&[u8]; 3] = [b"/nope", b"/tmp/\xff\xfe", b"relative/path"];
        for path in paths {
            let status = bridge.open(path).unwrap_err().status();
            assert!(matches!(
                status,
                Status::NotFound | Status::PermissionDenied
            ));
        }
        assert_eq!(stub.live_handles(), 0);
    }

    #[test]
    fn test_create_then_open() {
        let (_stub, bridge) = bridge_with(StubEngine::new());
        let created = bridge.create(b"/data/db", 8).unwrap();
        let opened = bridge.open(b"/data/db").unwrap();
        assert!(created.is_live());
        assert!(opened.is_live());
    }

    #[test]
    fn test_dropped_transaction_rolls_back_exactly_once() {
        let (stub, bridge) = bridge_with(StubEngine::new());
        let db = bridge.create(b"/db", 1).unwrap();
        let txn = bridge.txn_begin(&db).unwrap();
        let clone = Arc::clone(&txn);
        drop(txn);
        assert_eq!(stub.calls(Call::TxnRollback), 0);
        drop(clone);
        assert_eq!(stub.calls(Call::TxnRollback), 1);
    }

    #[test]
    fn test_double_commit() {
        let (stub, bridge) = bridge_with(StubEngine::new());
        let db = bridge.create(b"/db", 1).unwrap();
        let txn = bridge.txn_begin(&db).unwrap();
        bridge.txn_commit(&txn).unwrap();
        let err = bridge.txn_commit(&txn).unwrap_err();
        assert_eq!(err.status(), Status::InvalidArg);
        assert!(!err.is_native());
        assert_eq!(stub.calls(Call::TxnCommit), 1);
    }

    #[test]
    fn test_exhausted_cursor_stays_exhausted() {
        let (stub, bridge) = bridge_with(StubEngine::new().with_documents(["{}"]));
        let db = bridge.create(b"/db", 1).unwrap();
        let cursor = bridge.query_execute(&db, b"SELECT *", b"{}").unwrap();
        assert!(matches!(bridge.cursor_next(&cursor), Ok(Fetch::Document(_))));
        for _ in 0..3 {
            assert_eq!(bridge.cursor_next(&cursor).unwrap(), Fetch::Exhausted);
        }
        assert_eq!(stub.calls_past_exhaustion(), 0);
    }

    #[test]
    fn test_overrun_surfaces_corruption() {
        let (stub, bridge) = bridge_with(StubEngine::new().with_documents(["{}"]));
        let db = bridge.create(b"/db", 1).unwrap();
        let cursor = bridge.query_execute(&db, b"SELECT *", b"{}").unwrap();
        stub.misreport_next_written(u64::MAX);
        assert_eq!(
            bridge.cursor_next(&cursor).unwrap_err().status(),
            Status::Corruption
        );
    }

    #[test]
    fn test_validation_happens_before_native_calls() {
        let (stub, bridge) = bridge_with(StubEngine::new());
        assert_eq!(
            bridge.open(b"").unwrap_err(),
            BridgeError::InvalidArgument("path is empty")
        );
        assert!(bridge.create(b"", 4).is_err());
        assert_eq!(stub.calls(Call::Open), 0);
        assert_eq!(stub.calls(Call::Create), 0);

        let db = bridge.create(b"/db", 1).unwrap();
        assert!(bridge.query_execute(&db, b"", b"{}").is_err());
        let err = bridge.query_execute(&db, b"SELECT *", b"{not json").unwrap_err();
        assert_eq!(err.status(), Status::InvalidArg);
        assert!(!err.is_native());
        assert_eq!(stub.calls(Call::QueryExecute), 0);
    }

    #[test]
    fn test_empty_provenance_is_forwarded() {
        let (stub, bridge) = bridge_with(StubEngine::new().with_documents(["{}"]));
        let db = bridge.create(b"/db", 1).unwrap();
        let cursor = bridge.query_execute(&db, b"SELECT *", b"").unwrap();
        assert!(matches!(bridge.cursor_next(&cursor), Ok(Fetch::Document(_))));
        assert_eq!(stub.calls(Call::QueryExecute), 1);
    }

    #[test]
    fn test_provenance_validation_can_be_disabled() {
        let stub = Arc::new(StubEngine::new());
        let bridge = Bridge::new(
            stub.clone(),
            BridgeConfig::new().with_validate_provenance(false),
        )
        .unwrap();
        let db = bridge.create(b"/db", 1).unwrap();
        assert!(bridge.query_execute(&db, b"SELECT *", b"raw").is_ok());
        assert_eq!(stub.calls(Call::QueryExecute), 1);
    }

    #[test]
    fn test_native_errors_pass_through() {
        let (stub, bridge) = bridge_with(StubEngine::new());
        stub.fail_next(Call::Create, Status::IoError);
        let err = bridge.create(b"/db", 4).unwrap_err();
        assert_eq!(err.status(), Status::IoError);
        assert!(err.is_native());
        stub.fail_next_code(Call::Create, 4242);
        assert_eq!(
            bridge.create(b"/db", 4).unwrap_err(),
            BridgeError::Native {
                status: Status::InternalError,
                code: 4242
            }
        );
        assert_eq!(stub.calls(Call::Create), 2);
    }

    #[test]
    fn test_foreign_resources_are_rejected() {
        let (_stub_a, a) = bridge_with(StubEngine::new());
        let (stub_b, b) = bridge_with(StubEngine::new());
        let db = a.create(b"/db", 1).unwrap();
        let txn = a.txn_begin(&db).unwrap();
        assert_eq!(
            b.txn_begin(&db).unwrap_err(),
            BridgeError::ForeignResource { kind: "database" }
        );
        assert_eq!(b.txn_commit(&txn).unwrap_err().status(), Status::InvalidArg);
        assert_eq!(stub_b.calls(Call::TxnCommit), 0);
    }

    #[test]
    fn test_explicit_close_and_rollback() {
        let (stub, bridge) = bridge_with(StubEngine::new().with_documents(["{}"]));
        let db = bridge.create(b"/db", 1).unwrap();
        let txn = bridge.txn_begin(&db).unwrap();
        let cursor = bridge.query_execute(&db, b"SELECT *", b"{}").unwrap();

        bridge.txn_rollback(&txn).unwrap();
        bridge.cursor_close(&cursor).unwrap();
        bridge.close(&db).unwrap();
        assert_eq!(stub.live_handles(), 0);

        assert!(bridge.close(&db).is_err());
        assert!(bridge.cursor_close(&cursor).is_err());
        assert!(bridge.txn_rollback(&txn).is_err());
        drop((cursor, txn, db));
        assert_eq!(stub.calls(Call::Close), 1);
        assert_eq!(stub.calls(Call::CursorClose), 1);
        assert_eq!(stub.calls(Call::TxnRollback), 1);
    }

    #[test]
    fn test_init_reports_status() {
        let (stub, bridge) = bridge_with(StubEngine::new());
        stub.fail_next(Call::Init, Status::OutOfMemory);
        assert_eq!(bridge.init(), Status::OutOfMemory);
        assert_eq!(bridge.init(), Status::Ok);
        bridge.cleanup();
        assert_eq!(stub.calls(Call::Cleanup), 1);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let err = Bridge::new(
            Arc::new(StubEngine::new()),
            BridgeConfig::new().with_cursor_buffer_capacity(0),
        )
        .err();
        assert_eq!(err, Some(ConfigError::CursorBufferCapacity(0)));
    }
}
