//! Resolution throughput over a synthetic matrix.

use std::hint::black_box;
use std::sync::Arc;

use abmatrix::{
    Context, ContextValue, Identifiers, RequestedTests, Resolver, TestMatrixArtifact, TestType,
};
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use serde_json::json;

fn artifact(test_count: usize) -> Arc<TestMatrixArtifact> {
    let mut tests = serde_json::Map::new();
    for i in 0..test_count {
        let name = format!("bench{i}_tst");
        tests.insert(
            name.clone(),
            json!({
                "testType": "USER",
                "salt": name,
                "rule": "${country == 'US' || lang == 'en'}",
                "buckets": [
                    {"name": "inactive", "value": -1},
                    {"name": "control", "value": 0},
                    {"name": "active", "value": 1}
                ],
                "allocations": [
                    {"id": format!("#A{i}"), "rule": "${matrix:versionInRange(version, '1.0', '9.0')}", "ranges": [
                        {"bucketValue": -1, "length": 0.5},
                        {"bucketValue": 0, "length": 0.25},
                        {"bucketValue": 1, "length": 0.25}
                    ]},
                    {"id": format!("#B{i}"), "ranges": [{"bucketValue": 0, "length": 1.0}]}
                ]
            }),
        );
    }
    let artifact = serde_json::from_value(json!({
        "audit": {"version": "1", "updated": 0, "updatedBy": "bench"},
        "tests": tests
    }))
    .expect("valid artifact");
    Arc::new(artifact)
}

fn context() -> Context {
    let mut ctx = Context::new();
    ctx.insert("country", ContextValue::from("US"));
    ctx.insert("lang", ContextValue::from("en"));
    ctx.insert("version", ContextValue::from("2.3.1"));
    ctx
}

fn bench_resolve_all(c: &mut Criterion) {
    let resolver = Resolver::default();
    let ctx = context();
    let mut group = c.benchmark_group("resolve_all");
    for count in [10, 100, 500] {
        let artifact = artifact(count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &artifact, |b, artifact| {
            let mut i = 0u64;
            b.iter(|| {
                i += 1;
                let ids = Identifiers::new().with(TestType::User, format!("user{i}"));
                black_box(resolver.resolve(artifact, &ids, &ctx, &RequestedTests::All))
            });
        });
    }
    group.finish();
}

fn bench_resolve_named(c: &mut Criterion) {
    let resolver = Resolver::default();
    let ctx = context();
    let artifact = artifact(500);
    let requested = RequestedTests::names(["bench1_tst", "bench42_tst", "bench420_tst"]);
    let ids = Identifiers::new().with(TestType::User, "user1");
    c.bench_function("resolve_named", |b| {
        b.iter(|| black_box(resolver.resolve(&artifact, &ids, &ctx, &requested)))
    });
}

criterion_group!(benches, bench_resolve_all, bench_resolve_named);
criterion_main!(benches);
