//! End-to-end sync call benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use datasync_bench::generate_pending;
use datasync_protocol::SyncRequest;
use datasync_server::{DatasetOptions, ServerConfig, SyncServer};
use datasync_store::{DocumentStore, InMemoryStore};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn server(rt: &Runtime) -> SyncServer {
    let store: Arc<dyn DocumentStore> = Arc::new(InMemoryStore::new());
    let server = SyncServer::new(store, ServerConfig::default());
    rt.block_on(server.init("bench", DatasetOptions::default())).unwrap();
    server
}

/// Benchmark a sync call that carries no changes.
fn bench_empty_sync(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let server = server(&rt);

    c.bench_function("sync_empty", |b| {
        b.to_async(&rt).iter(|| async {
            let response = server.sync("bench", SyncRequest::new("c1")).await.unwrap();
            black_box(response);
        });
    });

    rt.block_on(server.stop_all()).unwrap();
}

/// Benchmark sync calls carrying pending changes.
fn bench_sync_with_pending(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let server = server(&rt);
    let mut group = c.benchmark_group("sync_pending");

    for count in [1, 10, 100].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let pending = generate_pending("bench", "c1", count);
            b.to_async(&rt).iter(|| async {
                let mut request = SyncRequest::new("c1");
                for change in &pending {
                    request = request.with_pending(change.clone());
                }
                black_box(server.sync("bench", request).await.unwrap());
            });
        });
    }

    group.finish();
    rt.block_on(server.stop_all()).unwrap();
}

criterion_group!(benches, bench_empty_sync, bench_sync_with_pending);

criterion_main!(benches);
