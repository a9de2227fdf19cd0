#[cfg(test)]
mod benchmarks {
    use crate::engine::testing::StubEngine;
    use crate::{Bridge, BridgeConfig, Fetch};
    use criterion::{BenchmarkId, Criterion, Throughput};
    use std::hint::black_box;
    use std::sync::Arc;

    const DOCUMENTS_PER_CURSOR: usize = 1_000;

    #[test]
    fn cursor_next_benchmark() {
        let mut criterion = Criterion::default()
            .sample_size(20)
            .measurement_time(std::time::Duration::from_secs(3));

        let mut group = criterion.benchmark_group("cursor_next");

        for size in [16, 1024, 32 * 1024] {
            let document = "x".repeat(size);
            let stub = Arc::new(StubEngine::new());
            let bridge = Bridge::new(stub.clone(), BridgeConfig::default()).unwrap();
            let db = bridge.create(b"/bench", 64).unwrap();

            group.throughput(Throughput::Bytes((size * DOCUMENTS_PER_CURSOR) as u64));
            group.bench_with_input(BenchmarkId::new("stub", size), &document, |b, document| {
                b.iter(|| {
                    stub.set_documents(std::iter::repeat_n(document.as_str(), DOCUMENTS_PER_CURSOR));
                    let cursor = bridge.query_execute(&db, b"SELECT *", b"{}").unwrap();
                    while let Fetch::Document(doc) = bridge.cursor_next(&cursor).unwrap() {
                        black_box(doc);
                    }
                });
            });
        }

        group.finish();
        criterion.final_summary();
    }
}
