use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use replicant_core::core_sync::{
    merge_updates, IncrementalUpdate, LocalStorage, MemoryStorage, StreamConnection, SyncClient,
};
use replicant_core::test_utils::{test_context, user, ScriptedBackend, ScriptedTransport};
use std::sync::Arc;
use std::time::Duration;

const SEED: u64 = 42;

/// `count` consecutive updates starting after version 0, touching ids in
/// `0..id_space` so that changes and deletes collide.
fn update_queue(count: u64, id_space: u64) -> Vec<IncrementalUpdate> {
    let mut rng = StdRng::seed_from_u64(SEED);
    (1..=count)
        .map(|version| {
            let id = rng.random_range(0..id_space);
            if rng.random_bool(0.25) {
                IncrementalUpdate::delta(version, version).with_deleted("users", id)
            } else {
                IncrementalUpdate::delta(version, version)
                    .with_changed("users", user(id, &format!("user-{}", version)))
            }
        })
        .collect()
}

fn ndjson_body(updates: &[IncrementalUpdate]) -> Vec<u8> {
    let mut body = Vec::new();
    for update in updates {
        if let Ok(line) = serde_json::to_vec(update) {
            body.extend_from_slice(&line);
            body.push(b'\n');
        }
    }
    body
}

fn bench_stream_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream_parse");
    let body = ndjson_body(&update_queue(500, 100));
    group.throughput(Throughput::Bytes(body.len() as u64));

    for chunk_size in [64usize, 1024, 16 * 1024] {
        group.bench_with_input(
            BenchmarkId::from_parameter(chunk_size),
            &chunk_size,
            |b, &chunk_size| {
                b.iter(|| {
                    let mut connection = StreamConnection::new();
                    connection.on_header(200);
                    let mut messages = 0;
                    for chunk in body.chunks(chunk_size) {
                        messages += connection.on_data(black_box(chunk)).len();
                    }
                    black_box(messages)
                });
            },
        );
    }
    group.finish();
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge_updates");
    for count in [10u64, 100, 1000] {
        let queue = update_queue(count, 50);
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::from_parameter(count), &queue, |b, queue| {
            b.iter(|| black_box(merge_updates(black_box(queue))));
        });
    }
    group.finish();
}

fn bench_apply(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply");
    group.measurement_time(Duration::from_secs(10));
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let queue = update_queue(100, 50);

    group.bench_function("sequential_100", |b| {
        b.to_async(&runtime).iter(|| {
            let queue = queue.clone();
            async move {
                let storage: Arc<dyn LocalStorage> = Arc::new(MemoryStorage::new());
                let client = SyncClient::new(test_context(
                    Arc::new(ScriptedTransport::new()),
                    Arc::new(ScriptedBackend::new()),
                    storage,
                    Duration::ZERO,
                ));
                for update in queue {
                    client.apply(update).await.unwrap();
                }
                black_box(client.store().version())
            }
        });
    });
    group.finish();
}

criterion_group!(benches, bench_stream_parse, bench_merge, bench_apply);
criterion_main!(benches);
