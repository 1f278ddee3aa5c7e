use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;

use flag_engine::{
    eval::{Evaluator, NoopRecorder},
    store::{DataKind, InMemoryStore, ItemDescriptor, PersistentStore, StoreGetters},
    ContextBuilder, FeatureFlag, Segment,
};

fn flag(value: serde_json::Value) -> ItemDescriptor {
    let flag: FeatureFlag = serde_json::from_value(value).unwrap();
    ItemDescriptor::flag(flag)
}

fn store() -> InMemoryStore {
    let segment: Segment = serde_json::from_value(json!({
        "key": "beta-testers",
        "version": 1,
        "included": ["user-3", "user-7"],
        "rules": [{
            "clauses": [{"attribute": "email", "op": "endsWith", "values": ["@example.com"]}],
        }],
    }))
    .unwrap();

    let variations = json!(["control", "treatment", "holdout"]);
    let store = InMemoryStore::new();
    store
        .init(vec![
            (
                DataKind::Segments,
                vec![("beta-testers".into(), ItemDescriptor::segment(segment))],
            ),
            (
                DataKind::Features,
                vec![
                    (
                        "fallthrough".into(),
                        flag(json!({
                            "key": "fallthrough",
                            "version": 1,
                            "on": true,
                            "fallthrough": {"variation": 1},
                            "variations": variations,
                        })),
                    ),
                    (
                        "rules".into(),
                        flag(json!({
                            "key": "rules",
                            "version": 1,
                            "on": true,
                            "rules": [
                                {
                                    "clauses": [{"attribute": "country", "op": "in", "values": ["FR", "DE", "NL"]}],
                                    "variation": 2,
                                },
                                {
                                    "clauses": [{"attribute": "version", "op": "semVerGreaterThan", "values": ["2.0.0"]}],
                                    "variation": 0,
                                },
                                {
                                    "clauses": [{"attribute": "", "op": "segmentMatch", "values": ["beta-testers"]}],
                                    "variation": 1,
                                },
                            ],
                            "fallthrough": {"variation": 0},
                            "variations": variations,
                        })),
                    ),
                    (
                        "rollout".into(),
                        flag(json!({
                            "key": "rollout",
                            "version": 1,
                            "on": true,
                            "salt": "c1c1b3",
                            "fallthrough": {"rollout": {"variations": [
                                {"variation": 0, "weight": 33000},
                                {"variation": 1, "weight": 33000},
                                {"variation": 2, "weight": 34000},
                            ]}},
                            "variations": variations,
                        })),
                    ),
                ],
            ),
        ])
        .unwrap();
    store
}

fn criterion_benchmark(c: &mut Criterion) {
    let store = store();
    let evaluator = Evaluator::new(StoreGetters::new(&store));
    let context = ContextBuilder::new("user-42")
        .set_value("country", json!("US"))
        .set_value("version", json!("1.4.0"))
        .set_value("email", json!("someone@example.com"))
        .build()
        .unwrap();

    for flag_key in ["fallthrough", "rules", "rollout"] {
        let flag = store
            .get(&DataKind::Features, flag_key)
            .unwrap()
            .and_then(|item| item.as_flag().cloned())
            .unwrap();

        let mut group = c.benchmark_group(flag_key);
        group.throughput(Throughput::Elements(1));
        group.bench_function("evaluate", |b| {
            b.iter(|| evaluator.evaluate(black_box(&flag), black_box(&context), &mut NoopRecorder))
        });
        group.bench_function("evaluate_key", |b| {
            b.iter(|| {
                evaluator.evaluate_key(black_box(flag_key), black_box(&context), &mut NoopRecorder)
            })
        });
        group.finish();
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
