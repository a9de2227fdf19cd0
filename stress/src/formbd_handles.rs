// Handle-lifecycle stress test for formbd-bridge, driven through the
// stream-based throughput tester against the in-process stub engine.
//
// Each operation begins a transaction, drains a short cursor, and then ends
// the transaction one of four ways: explicit commit, explicit rollback,
// abandonment (the finalizer rolls it back), or a commit on another task
// racing the drop of the host's own reference. At the end every transaction the
// engine began must have been committed or rolled back exactly once.
//
// Run with: cargo run --bin formbd_handles --release -- [multi|current] [concurrency] [fixed|comparison] [ops]
// Set RUST_LOG=formbd-bridge=debug to see bridge events.

use formbd_bridge::engine::testing::{Call, StubEngine};
use formbd_bridge::{AsyncBridge, BridgeConfig, BridgeError, Database, Fetch};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

mod async_throughput;
use async_throughput::{ThroughputConfig, ThroughputTest};

const DOCUMENTS_PER_QUERY: usize = 4;

fn init_logging() {
    let filter_fmt = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_filter(filter_fmt);
    tracing_subscriber::registry().with(fmt_layer).init();
}

/// One begin / query / terminate cycle. `seq` picks how the transaction ends.
async fn transaction_cycle(
    bridge: Arc<AsyncBridge>,
    db: Arc<Database>,
    seq: u64,
) -> Result<(), BridgeError> {
    let txn = bridge.txn_begin(Arc::clone(&db)).await?;

    let cursor = bridge
        .query_execute(db, b"SELECT * FROM stress".to_vec(), b"{\"actor\":\"stress\"}".to_vec())
        .await?;
    let mut seen = 0;
    while let Fetch::Document(_) = bridge.cursor_next(Arc::clone(&cursor)).await? {
        seen += 1;
    }
    debug_assert_eq!(seen, DOCUMENTS_PER_QUERY);

    match seq % 4 {
        0 => bridge.txn_commit(txn).await,
        1 => bridge.txn_rollback(txn).await,
        2 => {
            drop(txn);
            Ok(())
        }
        _ => {
            let committer = {
                let bridge = Arc::clone(&bridge);
                let txn = Arc::clone(&txn);
                tokio::spawn(async move { bridge.txn_commit(txn).await })
            };
            drop(txn);
            committer
                .await
                .map_err(|e| BridgeError::TaskFailed(e.to_string()))?
        }
    }
}

fn check_lifecycle_invariants(stub: &StubEngine) -> Result<(), String> {
    let begun = stub.calls(Call::TxnBegin);
    let committed = stub.calls(Call::TxnCommit);
    let rolled_back = stub.calls(Call::TxnRollback);
    println!(
        "\nTransactions: {} begun, {} committed, {} rolled back",
        begun, committed, rolled_back
    );
    println!(
        "Cursors: {} opened, {} closed",
        stub.calls(Call::QueryExecute),
        stub.calls(Call::CursorClose)
    );

    if begun != committed + rolled_back {
        return Err(format!(
            "{} transactions were not terminated exactly once",
            begun.abs_diff(committed + rolled_back)
        ));
    }
    if stub.calls(Call::QueryExecute) != stub.calls(Call::CursorClose) {
        return Err("some cursors were never closed".to_string());
    }
    if stub.calls_past_exhaustion() != 0 {
        return Err("cursor_next reached the engine after exhaustion".to_string());
    }
    // Only the database itself should still be open.
    if stub.live_handles() != 1 {
        return Err(format!(
            "expected only the database handle to be live, found {} (off by {})",
            stub.live_handles(),
            stub.live_handles().abs_diff(1)
        ));
    }
    println!("All handles released exactly once.");
    Ok(())
}

// Usage examples:
// # Multi-thread runtime, 100 in flight, concurrency comparison (default)
// cargo run --bin formbd_handles --release
//
// # Current-thread runtime, 500 in flight, 100k operations
// cargo run --bin formbd_handles --release -- current 500 fixed 100000
fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let args: Vec<String> = std::env::args().collect();

    let (runtime_type, args_start_idx) = if args.len() > 1 {
        match args[1].as_str() {
            "current" => ("current", 2),
            "multi" => ("multi", 2),
            _ => ("multi", 1),
        }
    } else {
        ("multi", 1)
    };

    let runtime = match runtime_type {
        "current" => {
            println!("Using Tokio current-thread runtime");
            tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?
        }
        _ => {
            println!("Using Tokio multi-thread runtime");
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?
        }
    };

    runtime.block_on(async_main(args, args_start_idx))
}

async fn async_main(
    args: Vec<String>,
    args_start_idx: usize,
) -> Result<(), Box<dyn std::error::Error>> {
    let concurrency = args
        .get(args_start_idx)
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100);
    let mode = args
        .get(args_start_idx + 1)
        .map(|s| s.as_str())
        .unwrap_or("comparison");
    let target_ops = args
        .get(args_start_idx + 2)
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(10_000);

    let documents = (0..DOCUMENTS_PER_QUERY).map(|i| format!("{{\"row\":{i}}}"));
    let stub = Arc::new(StubEngine::new().with_documents(documents));
    let bridge = Arc::new(AsyncBridge::new(stub.clone(), BridgeConfig::from_env()?)?);

    if !bridge.init().await.is_ok() {
        return Err("engine init failed".into());
    }
    let db = bridge.create(b"/stress/db".to_vec(), 1024).await?;

    let operation = {
        let bridge = Arc::clone(&bridge);
        let db = Arc::clone(&db);
        move |seq| transaction_cycle(Arc::clone(&bridge), Arc::clone(&db), seq)
    };

    match mode {
        "fixed" => {
            let config = ThroughputConfig {
                concurrency,
                target_ops,
            };
            let stats = ThroughputTest::run_fixed("FormBD Transactions", config, operation).await;
            stats.print("Final Results");
        }
        _ => {
            let concurrency_levels = vec![1, 5, 10, 50, 100, 200, 500];
            let results = ThroughputTest::run_comparison(
                "FormBD Transactions",
                &concurrency_levels,
                target_ops,
                operation,
            )
            .await;

            println!("\nSummary:");
            println!("Concurrency | Throughput (ops/sec)");
            println!("----------- | -------------------");
            for (concurrency, stats) in results {
                println!("{:11} | {:19.2}", concurrency, stats.throughput);
            }
        }
    }

    // Abandoned transactions roll back on the bridge's blocking pool.
    bridge.settle().await;
    check_lifecycle_invariants(&stub)?;

    bridge.close(db).await?;
    bridge.cleanup().await?;
    Ok(())
}
