use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Counts gathered over one run
#[derive(Clone, Debug)]
pub struct ThroughputStats {
    pub completed_ops: u64,
    pub successful_ops: u64,
    pub failed_ops: u64,
    pub duration: Duration,
    pub throughput: f64,
}

impl ThroughputStats {
    pub fn print(&self, label: &str) {
        println!(
            "{}: {} ops ({} successful, {} failed) in {:.2}s = {:.2} ops/sec",
            label,
            self.completed_ops,
            self.successful_ops,
            self.failed_ops,
            self.duration.as_secs_f64(),
            self.throughput
        );
    }
}

/// How many operations to run and how many may be in flight at once
#[derive(Clone, Copy, Debug)]
pub struct ThroughputConfig {
    pub concurrency: usize,
    pub target_ops: usize,
}

impl Default for ThroughputConfig {
    fn default() -> Self {
        Self {
            concurrency: 100,
            target_ops: 10_000,
        }
    }
}

/// Drives an async operation factory with bounded concurrency
pub struct ThroughputTest;

impl ThroughputTest {
    pub async fn run_fixed<F, Fut, T, E>(
        name: &str,
        config: ThroughputConfig,
        operation_factory: F,
    ) -> ThroughputStats
    where
        F: Fn(u64) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        println!(
            "Testing {} to run {} operations with concurrency level: {}",
            name, config.target_ops, config.concurrency
        );

        let start_time = Instant::now();
        let mut completed_ops = 0;
        let mut successful_ops = 0;
        let mut failed_ops = 0;

        let operation_factory = Arc::new(operation_factory);
        let mut operation_stream = stream::iter(0..config.target_ops as u64)
            .map(move |seq| {
                let factory = Arc::clone(&operation_factory);
                async move { factory(seq).await }
            })
            .buffer_unordered(config.concurrency);

        while let Some(result) = operation_stream.next().await {
            completed_ops += 1;
            match result {
                Ok(_) => successful_ops += 1,
                Err(e) => {
                    failed_ops += 1;
                    eprintln!("Operation failed: {}", e);
                }
            }
        }

        let duration = start_time.elapsed();
        ThroughputStats {
            completed_ops,
            successful_ops,
            failed_ops,
            duration,
            throughput: completed_ops as f64 / duration.as_secs_f64(),
        }
    }

    /// Repeats [`run_fixed`](Self::run_fixed) once per concurrency level
    pub async fn run_comparison<F, Fut, T, E>(
        name: &str,
        concurrency_levels: &[usize],
        target_ops: usize,
        operation_factory: F,
    ) -> Vec<(usize, ThroughputStats)>
    where
        F: Fn(u64) -> Fut + Send + Sync + 'static + Clone,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        T: Send + 'static,
        E: std::fmt::Display + Send + 'static,
    {
        println!("Concurrency Level Comparison for {}:", name);
        let mut results = Vec::new();

        for &concurrency in concurrency_levels {
            let config = ThroughputConfig {
                concurrency,
                target_ops,
            };
            let stats = Self::run_fixed(name, config, operation_factory.clone()).await;
            stats.print(&format!("   Concurrency {}", concurrency));
            results.push((concurrency, stats));
        }

        results
    }
}
