use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use std::sync::Arc;
use std::time::Duration;

use batchflow_batch::{BatchJob, BatchStatus, SubmitBatch};
use batchflow_core::{ActivityId, BatchId, OrgId, WorkerId, WorkspaceId};
use batchflow_infra::batch_store::{BatchStore, InMemoryBatchStore};
use chrono::Utc;

const LEASE: Duration = Duration::from_secs(30);

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

fn activities(n: usize) -> Vec<ActivityId> {
    (0..n).map(|i| ActivityId::parse(format!("act-{i}")).unwrap()).collect()
}

async fn seed(store: &InMemoryBatchStore, n: usize) -> BatchId {
    let acts = activities(n);
    let submit = SubmitBatch::new(
        OrgId::new(),
        WorkspaceId::new(),
        acts.iter().map(|a| a.to_string()).collect(),
    );
    let job = BatchJob::pending(BatchId::new(), &submit, n as u32, Utc::now());
    store.create_batch_with_activities(job, &acts).await.unwrap()
}

/// N workers race for one free lease; exactly one wins each round.
fn bench_acquire_contention(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("acquire_lock_contention");

    for workers in [1usize, 4, 16, 64] {
        group.throughput(Throughput::Elements(workers as u64));
        group.bench_with_input(BenchmarkId::from_parameter(workers), &workers, |b, &workers| {
            let store = Arc::new(InMemoryBatchStore::new());
            let id = rt.block_on(seed(&store, 1));
            let ids: Vec<WorkerId> = (0..workers)
                .map(|i| WorkerId::parse(format!("w{i}")).unwrap())
                .collect();

            b.iter(|| {
                rt.block_on(async {
                    let mut tasks = Vec::with_capacity(workers);
                    for worker in &ids {
                        let store = store.clone();
                        let worker = worker.clone();
                        tasks.push(tokio::spawn(async move {
                            store.acquire_lock(id, &worker, LEASE).await.unwrap()
                        }));
                    }
                    let mut granted = 0;
                    for task in tasks {
                        granted += usize::from(task.await.unwrap());
                    }
                    assert_eq!(granted, 1);
                    store.release_lock(id).await.unwrap();
                    black_box(granted)
                })
            });
        });
    }
    group.finish();
}

/// Per-activity marks: ref write plus counter increment in one step.
fn bench_activity_marks(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("mark_activity");
    group.sample_size(50);

    for size in [100usize, 1000] {
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let acts = activities(size);
            b.iter(|| {
                rt.block_on(async {
                    let store = InMemoryBatchStore::new();
                    let id = seed(&store, size).await;
                    store.update_status(id, BatchStatus::Processing, None).await.unwrap();
                    for (i, activity) in acts.iter().enumerate() {
                        if i % 10 == 0 {
                            store.mark_activity_failed(id, activity, "bad factor").await.unwrap();
                        } else {
                            store.mark_activity_complete(id, activity, 1.0).await.unwrap();
                        }
                    }
                    black_box(store.get_batch(id).await.unwrap().processed())
                })
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_acquire_contention, bench_activity_marks);
criterion_main!(benches);
