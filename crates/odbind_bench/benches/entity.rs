//! Entity store benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use odbind_bench::{bench_definition, order_snapshot};
use odbind_core::{EntityStore, PayloadOptions, Record};
use odbind_sync::SavePlan;

/// Benchmark importing a snapshot into a fresh root.
fn bench_import(c: &mut Criterion) {
    let mut group = c.benchmark_group("import_snapshot");

    for lines in [10usize, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*lines as u64));
        group.bench_with_input(BenchmarkId::from_parameter(lines), lines, |b, &lines| {
            let definition = bench_definition();
            let data = order_snapshot(1, lines);

            b.iter(|| {
                let mut store = EntityStore::new();
                let root = store.create_root(definition.clone());
                store.import_snapshot(root, black_box(&data)).unwrap();
                black_box(store.node_count());
            });
        });
    }
    group.finish();
}

/// Benchmark re-syncing a loaded collection from the same records.
fn bench_resync(c: &mut Criterion) {
    let mut group = c.benchmark_group("sync_from");

    for lines in [10usize, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*lines as u64));
        group.bench_with_input(BenchmarkId::from_parameter(lines), lines, |b, &lines| {
            let definition = bench_definition();
            let data = order_snapshot(1, lines);
            let records: Vec<Record> = data["Lines"]
                .as_array()
                .unwrap()
                .iter()
                .filter_map(|value| value.as_object().cloned())
                .collect();

            let mut store = EntityStore::new();
            let root = store.create_root(definition);
            store.import_snapshot(root, &data).unwrap();
            let lines_coll = store.child(root, "Lines").unwrap();

            b.iter(|| {
                store.sync_from(lines_coll, black_box(&records)).unwrap();
                store.consolidate_collection(lines_coll).unwrap();
            });
        });
    }
    group.finish();
}

/// Benchmark building a create payload for a whole tree.
fn bench_payload(c: &mut Criterion) {
    let mut group = c.benchmark_group("request_payload");

    for lines in [10usize, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*lines as u64));
        group.bench_with_input(BenchmarkId::from_parameter(lines), lines, |b, &lines| {
            let mut store = EntityStore::new();
            let root = store.create_root(bench_definition());
            store.import_snapshot(root, &order_snapshot(1, lines)).unwrap();

            b.iter(|| {
                let payload = store
                    .request_payload(root, black_box(PayloadOptions::for_create()))
                    .unwrap();
                black_box(payload);
            });
        });
    }
    group.finish();
}

/// Benchmark planning a save where every line was edited.
fn bench_save_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("save_plan");

    for lines in [10usize, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*lines as u64));
        group.bench_with_input(BenchmarkId::from_parameter(lines), lines, |b, &lines| {
            let mut store = EntityStore::new();
            let root = store.create_root(bench_definition());
            store.import_snapshot(root, &order_snapshot(1, lines)).unwrap();
            let lines_coll = store.child(root, "Lines").unwrap();
            for (i, member) in store.entities(lines_coll).unwrap().into_iter().enumerate() {
                store.set(member, "Qty", 100 + i as i64).unwrap();
            }
            store.remove(lines_coll, 0).unwrap();
            let added = store.create(lines_coll).unwrap();
            store.set(added, "Qty", 1i64).unwrap();

            b.iter(|| {
                let plan = SavePlan::build(&store, root, black_box("bench")).unwrap();
                black_box(plan.len());
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_import,
    bench_resync,
    bench_payload,
    bench_save_plan,
);

criterion_main!(benches);
