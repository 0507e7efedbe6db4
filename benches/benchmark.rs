use activity_processor::{
    evaluator::evaluate,
    store::{AggregationRecord, AggregationStore},
};
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

fn populated_store(entities: usize) -> AggregationStore {
    let store = AggregationStore::new();
    for i in 0..entities {
        let entity = format!("t{}", i);
        store.insert_record(AggregationRecord::new(
            &entity,
            &format!("{}-count", entity),
            &format!("{}-activity", entity),
        ));
        store.index_property(&format!("{}-p", entity), &entity);
        // every other entity received values this period
        if i % 2 == 0 {
            store.record_arrival(&format!("{}-p", entity), 10);
        }
    }
    store
}

fn bench_evaluate(c: &mut Criterion) {
    c.bench_function("evaluate 10k records", |b| {
        b.iter_batched(
            || populated_store(10_000),
            |store| black_box(evaluate(&store, 0)),
            BatchSize::LargeInput,
        )
    });
}

fn bench_record_arrival(c: &mut Criterion) {
    let store = populated_store(10_000);
    c.bench_function("record_arrival", |b| {
        b.iter(|| store.record_arrival(black_box("t42-p"), 1))
    });
}

criterion_group!(benches, bench_evaluate, bench_record_arrival);
criterion_main!(benches);
