//! Transaction lifecycle.
//!
//! A transaction is `Active` while its wrapper holds the native handle and
//! `Terminated` once the handle has been committed or rolled back. A
//! transaction that is dropped while still active is rolled back by the
//! finalizer, so an abandoned transaction never stays open in the engine.

use std::sync::Arc;

use tracing::debug;

use crate::engine::NativeEngine;
use crate::error::{BridgeError, BridgeResult};
use crate::handle::{Database, Resource, TransactionKind};
use crate::status::Status;

/// Observable transaction states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Terminated,
}

/// A FormBD transaction.
///
/// Must not outlive the [`Database`] it was begun on. This is not enforced
/// here; the engine rejects handles whose database was closed.
#[derive(Debug)]
pub struct Transaction {
    resource: Resource<TransactionKind>,
}

impl Transaction {
    pub(crate) fn begin(db: &Database) -> BridgeResult<Self> {
        let db_handle = db.handle()?;
        let resource = Resource::acquire(db.engine(), "txn_begin", |engine| {
            engine.txn_begin(db_handle)
        })?
        .finalized_by(db.finalizer());
        Ok(Self { resource })
    }

    pub fn state(&self) -> TxnState {
        if self.resource.is_live() {
            TxnState::Active
        } else {
            TxnState::Terminated
        }
    }

    /// Commits the transaction.
    ///
    /// On success the handle is spent and finalization does nothing. On a
    /// native failure the handle is put back untouched and the failure is
    /// returned as-is; the transaction is then rolled back by an explicit
    /// [`rollback`](Self::rollback) or at finalization.
    pub fn commit(&self) -> BridgeResult<()> {
        let handle = self.resource.claim()?;
        let code = self.resource.engine().txn_commit(handle);
        let status = Status::from_code(code);
        if status.is_ok() {
            return Ok(());
        }
        self.resource.restore(handle);
        debug!(
            name: "txn.commit.failed",
            target: "formbd-bridge",
            status = %status,
            code,
            "Commit failed; transaction left for rollback"
        );
        Err(BridgeError::Native { status, code })
    }

    pub(crate) fn belongs_to(&self, engine: &Arc<dyn NativeEngine>) -> bool {
        self.resource.belongs_to(engine)
    }

    /// Rolls the transaction back. The handle is spent whatever the engine
    /// reports; a failed rollback is not attempted again.
    pub fn rollback(&self) -> BridgeResult<()> {
        self.resource.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{Call, StubEngine};
    use std::thread;

    fn setup() -> (Arc<StubEngine>, Database) {
        let stub = Arc::new(StubEngine::new().with_existing_path("/db"));
        let engine: Arc<dyn NativeEngine> = stub.clone();
        let db = Database::acquire(&engine, "open", |e| e.open(b"/db")).unwrap();
        (stub, db)
    }

    #[test]
    fn test_abandoned_transaction_rolls_back_once() {
        let (stub, db) = setup();
        let txn = Transaction::begin(&db).unwrap();
        assert_eq!(txn.state(), TxnState::Active);
        drop(txn);
        assert_eq!(stub.calls(Call::TxnRollback), 1);
        assert_eq!(stub.calls(Call::TxnCommit), 0);
    }

    #[test]
    fn test_second_commit_is_rejected_locally() {
        let (stub, db) = setup();
        let txn = Transaction::begin(&db).unwrap();
        txn.commit().unwrap();
        assert_eq!(txn.state(), TxnState::Terminated);
        let err = txn.commit().unwrap_err();
        assert_eq!(err, BridgeError::Released { kind: "transaction" });
        assert_eq!(err.status(), Status::InvalidArg);
        drop(txn);
        assert_eq!(stub.calls(Call::TxnCommit), 1);
        assert_eq!(stub.calls(Call::TxnRollback), 0);
    }

    #[test]
    fn test_failed_commit_keeps_handle_for_rollback() {
        let (stub, db) = setup();
        let txn = Transaction::begin(&db).unwrap();
        stub.fail_next(Call::TxnCommit, Status::Conflict);
        let err = txn.commit().unwrap_err();
        assert_eq!(err.status(), Status::Conflict);
        assert!(err.is_native());
        assert_eq!(txn.state(), TxnState::Active);
        drop(txn);
        assert_eq!(stub.calls(Call::TxnRollback), 1);
    }

    #[test]
    fn test_rollback_after_commit_is_rejected() {
        let (stub, db) = setup();
        let txn = Transaction::begin(&db).unwrap();
        txn.rollback().unwrap();
        assert!(txn.rollback().is_err());
        assert!(txn.commit().is_err());
        drop(txn);
        assert_eq!(stub.calls(Call::TxnRollback), 1);
        assert_eq!(stub.calls(Call::TxnCommit), 0);
    }

    #[test]
    fn test_failed_rollback_spends_handle() {
        let (stub, db) = setup();
        let txn = Transaction::begin(&db).unwrap();
        stub.fail_next(Call::TxnRollback, Status::IoError);
        let err = txn.rollback().unwrap_err();
        assert_eq!(err.status(), Status::IoError);
        assert!(err.is_native());
        assert_eq!(txn.state(), TxnState::Terminated);
        assert!(txn.rollback().is_err());
        drop(txn);
        assert_eq!(stub.calls(Call::TxnRollback), 1);
        assert_eq!(stub.live_handles(), 1);
    }

    #[test]
    fn test_failed_finalizer_rollback_is_not_retried() {
        let (stub, db) = setup();
        let txn = Transaction::begin(&db).unwrap();
        stub.fail_next(Call::TxnRollback, Status::Conflict);
        drop(txn);
        assert_eq!(stub.calls(Call::TxnRollback), 1);
        assert_eq!(stub.live_handles(), 1);
        assert!(db.is_live());
    }

    #[test]
    fn test_begin_on_closed_database_is_rejected() {
        let (stub, db) = setup();
        db.close().unwrap();
        let err = Transaction::begin(&db).unwrap_err();
        assert_eq!(err, BridgeError::Released { kind: "database" });
        assert_eq!(stub.calls(Call::TxnBegin), 0);
    }

    #[test]
    fn test_commit_racing_finalizer_terminates_once() {
        let (stub, db) = setup();
        for _ in 0..64 {
            let txn = Arc::new(Transaction::begin(&db).unwrap());
            let committer = {
                let txn = Arc::clone(&txn);
                thread::spawn(move || {
                    let _ = txn.commit();
                })
            };
            drop(txn);
            committer.join().unwrap();
        }
        assert_eq!(
            stub.calls(Call::TxnCommit) + stub.calls(Call::TxnRollback),
            64
        );
        assert_eq!(stub.live_handles(), 1);
    }
}
