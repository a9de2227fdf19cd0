//! Running native calls off the async scheduler.
//!
//! Every engine entry point may block on disk. [`AsyncBridge`] hands each call
//! to a dedicated blocking pool so that a slow open or commit never stalls the
//! host's async workers.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::runtime::{Builder, Handle, Runtime};
use tracing::debug;

use crate::bridge::Bridge;
use crate::config::{BridgeConfig, ConfigError};
use crate::cursor::{Cursor, Fetch};
use crate::engine::NativeEngine;
use crate::error::{BridgeError, BridgeResult};
use crate::handle::Database;
use crate::status::Status;
use crate::txn::Transaction;

/// Owns the threads native calls run on.
#[derive(Debug)]
pub struct BlockingExecutor {
    runtime: Option<Runtime>,
    pending_releases: Arc<AtomicUsize>,
}

impl BlockingExecutor {
    pub fn new(config: &BridgeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.blocking_threads)
            .thread_name(config.thread_name.clone())
            .build()
            .map_err(|e| ConfigError::Executor(e.to_string()))?;
        Ok(Self {
            runtime: Some(runtime),
            pending_releases: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Finalizer that sends releases to this executor's blocking pool.
    pub(crate) fn finalizer(&self) -> Option<Finalizer> {
        let runtime = self.runtime.as_ref()?;
        Some(Finalizer {
            runtime: runtime.handle().clone(),
            pending: Arc::clone(&self.pending_releases),
        })
    }

    fn handle(&self) -> BridgeResult<&Handle> {
        match &self.runtime {
            Some(runtime) => Ok(runtime.handle()),
            None => Err(BridgeError::TaskFailed(
                "blocking executor has shut down".to_string(),
            )),
        }
    }

    /// Runs `call` on the blocking pool and waits for it without blocking the
    /// current task. A panic inside `call` surfaces as
    /// [`BridgeError::TaskFailed`].
    pub async fn run<F, T>(&self, call: F) -> BridgeResult<T>
    where
        F: FnOnce() -> BridgeResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let task = self.handle()?.spawn_blocking(call);
        task.await.map_err(|e| {
            debug!(
                name: "executor.task.failed",
                target: "formbd-bridge",
                panicked = e.is_panic(),
                error = %e,
                "Blocking task did not complete"
            );
            BridgeError::TaskFailed(e.to_string())
        })?
    }

    /// Drives `future` to completion from a thread that is not itself running
    /// async code, such as a C caller.
    pub fn block_on<F: Future>(&self, future: F) -> BridgeResult<F::Output> {
        Ok(self.handle()?.block_on(future))
    }
}

/// Moves finalizer releases off async worker threads.
///
/// A release submitted after the executor has shut down is not lost: the
/// cancelled task drops its closure on the submitting thread, and the
/// closure's captured state performs the release there.
#[derive(Debug, Clone)]
pub(crate) struct Finalizer {
    runtime: Handle,
    pending: Arc<AtomicUsize>,
}

impl Finalizer {
    /// Runs `release` on the blocking pool when called from async code, inline
    /// otherwise.
    pub(crate) fn submit<F>(&self, release: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if Handle::try_current().is_err() {
            release();
            return;
        }
        let pending = PendingRelease::track(&self.pending);
        // Dropping the join handle detaches the task.
        drop(self.runtime.spawn_blocking(move || {
            release();
            drop(pending);
        }));
    }
}

/// Counts one submitted release until it has run or been cancelled.
struct PendingRelease(Arc<AtomicUsize>);

impl PendingRelease {
    fn track(pending: &Arc<AtomicUsize>) -> Self {
        pending.fetch_add(1, Ordering::AcqRel);
        Self(Arc::clone(pending))
    }
}

impl Drop for PendingRelease {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Drop for BlockingExecutor {
    fn drop(&mut self) {
        // Dropping a runtime from async context panics; detach instead.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

/// [`Bridge`] whose calls run on a [`BlockingExecutor`].
///
/// Same operations, same results; only the thread doing the native work
/// differs. Resources are the ones [`Bridge`] hands out and may be mixed
/// freely between the two.
#[derive(Debug)]
pub struct AsyncBridge {
    bridge: Arc<Bridge>,
    executor: BlockingExecutor,
}

impl AsyncBridge {
    pub fn new(engine: Arc<dyn NativeEngine>, config: BridgeConfig) -> Result<Self, ConfigError> {
        let executor = BlockingExecutor::new(&config)?;
        let bridge = Bridge::new(engine, config)?.with_finalizer(executor.finalizer());
        Ok(Self {
            bridge: Arc::new(bridge),
            executor,
        })
    }

    /// Async bridge over the linked `libformbd`.
    #[cfg(feature = "native")]
    pub fn linked(config: BridgeConfig) -> Result<Self, ConfigError> {
        Self::new(Arc::new(crate::engine::LinkedEngine), config)
    }

    /// The synchronous bridge underneath.
    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    pub fn executor(&self) -> &BlockingExecutor {
        &self.executor
    }

    /// Number of finalizer releases submitted to the blocking pool that have
    /// not run yet.
    pub fn pending_releases(&self) -> usize {
        self.executor.pending_releases.load(Ordering::Acquire)
    }

    /// Waits until every release submitted by a finalizer so far has reached
    /// the engine.
    pub async fn settle(&self) {
        while self.pending_releases() > 0 {
            tokio::task::yield_now().await;
        }
    }

    async fn call<F, T>(&self, call: F) -> BridgeResult<T>
    where
        F: FnOnce(&Bridge) -> BridgeResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let bridge = Arc::clone(&self.bridge);
        self.executor.run(move || call(&bridge)).await
    }

    pub async fn init(&self) -> Status {
        self.call(|bridge| Ok(bridge.init()))
            .await
            .unwrap_or_else(|e| e.status())
    }

    pub async fn cleanup(&self) -> BridgeResult<()> {
        self.call(|bridge| {
            bridge.cleanup();
            Ok(())
        })
        .await
    }

    pub async fn open(&self, path: Vec<u8>) -> BridgeResult<Arc<Database>> {
        self.call(move |bridge| bridge.open(&path)).await
    }

    pub async fn create(&self, path: Vec<u8>, block_count: u64) -> BridgeResult<Arc<Database>> {
        self.call(move |bridge| bridge.create(&path, block_count))
            .await
    }

    pub async fn close(&self, db: Arc<Database>) -> BridgeResult<()> {
        self.call(move |bridge| bridge.close(&db)).await
    }

    pub async fn txn_begin(&self, db: Arc<Database>) -> BridgeResult<Arc<Transaction>> {
        self.call(move |bridge| bridge.txn_begin(&db)).await
    }

    pub async fn txn_commit(&self, txn: Arc<Transaction>) -> BridgeResult<()> {
        self.call(move |bridge| bridge.txn_commit(&txn)).await
    }

    pub async fn txn_rollback(&self, txn: Arc<Transaction>) -> BridgeResult<()> {
        self.call(move |bridge| bridge.txn_rollback(&txn)).await
    }

    pub async fn query_execute(
        &self,
        db: Arc<Database>,
        query: Vec<u8>,
        provenance: Vec<u8>,
    ) -> BridgeResult<Arc<Cursor>> {
        self.call(move |bridge| bridge.query_execute(&db, &query, &provenance))
            .await
    }

    pub async fn cursor_next(&self, cursor: Arc<Cursor>) -> BridgeResult<Fetch> {
        self.call(move |bridge| bridge.cursor_next(&cursor)).await
    }

    pub async fn cursor_close(&self, cursor: Arc<Cursor>) -> BridgeResult<()> {
        self.call(move |bridge| bridge.cursor_close(&cursor)).await
    }
}
