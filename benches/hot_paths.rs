use std::collections::BTreeMap;

use chrono::{TimeZone, Utc};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use recordoor::cache::attribute_digest;
use recordoor::definitions::wildcard_match;
use recordoor::route::group_by_resource;
use recordoor::sample::Sample;
use recordoor::store::ResourceDescriptor;

fn batch(resources: usize, metrics_per: usize, samples_per: usize) -> Vec<Sample> {
    let mut out = Vec::with_capacity(resources * metrics_per * samples_per);

    for r in 0..resources {
        for m in 0..metrics_per {
            for s in 0..samples_per {
                out.push(Sample {
                    resource_id: format!("resource-{r}"),
                    counter_name: format!("metric.{m}"),
                    project_id: "tenant-1".to_string(),
                    user_id: "user-1".to_string(),
                    timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
                    counter_volume: s as f64,
                    extra: BTreeMap::new(),
                });
            }
        }
    }

    out
}

fn descriptor() -> ResourceDescriptor {
    let mut attributes = BTreeMap::new();
    for i in 0..12 {
        attributes.insert(format!("attr_{i}"), serde_json::json!(format!("value-{i}")));
    }

    ResourceDescriptor {
        id: "a1b2c3d4-e5f6-4a00-9000-000000000042".to_string(),
        user_id: "user-1".to_string(),
        project_id: "tenant-1".to_string(),
        attributes,
        metrics: BTreeMap::new(),
    }
}

fn bench_grouping(c: &mut Criterion) {
    let samples = batch(25, 8, 5);

    c.bench_function("route/group_1k_samples", |b| {
        b.iter(|| group_by_resource(black_box(samples.clone())))
    });
}

fn bench_digest(c: &mut Criterion) {
    let d = descriptor();

    c.bench_function("cache/attribute_digest", |b| {
        b.iter(|| attribute_digest(black_box(&d)))
    });
}

fn bench_wildcard(c: &mut Criterion) {
    c.bench_function("definitions/wildcard_match", |b| {
        b.iter(|| {
            wildcard_match(
                black_box("disk.device.*.rate"),
                black_box("disk.device.vda.read.rate"),
            )
        })
    });
}

fn bench_suite(c: &mut Criterion) {
    bench_grouping(c);
    bench_digest(c);
    bench_wildcard(c);
}

criterion_group!(benches, bench_suite);
criterion_main!(benches);
