use std::collections::HashMap;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use meridian::{Config, PropagationStyle, Propagator, SpanContext, TraceId};

fn full_propagator() -> Propagator {
    let styles = vec![
        PropagationStyle::Datadog,
        PropagationStyle::TraceContext,
        PropagationStyle::Baggage,
    ];
    Propagator::from_config(&Config::default().with_propagation_styles(styles.clone(), styles))
}

fn sample_context() -> SpanContext {
    let mut tags = HashMap::new();
    tags.insert("_dd.p.dm".to_string(), "-1".to_string());
    tags.insert("_dd.p.usr.id".to_string(), "baz64".to_string());
    let mut baggage = HashMap::new();
    baggage.insert("account".to_string(), "42".to_string());
    SpanContext::new_extracted(
        TraceId::new(0x1234_5678_0000_0000, 0xdead_beef_cafe_f00d),
        0x0badc0de,
        Some("synthetics".to_string()),
        Some(1.0),
        baggage,
        tags,
        None,
    )
}

fn bench_inject(c: &mut Criterion) {
    let propagator = full_propagator();
    let ctx = sample_context();
    c.bench_function("inject_all_styles", |b| {
        b.iter(|| {
            let mut headers: HashMap<String, String> = HashMap::new();
            propagator.inject(black_box(&ctx), &mut headers).unwrap();
            black_box(headers)
        })
    });
}

fn bench_extract(c: &mut Criterion) {
    let propagator = full_propagator();
    let ctx = sample_context();
    let mut headers: HashMap<String, String> = HashMap::new();
    propagator.inject(&ctx, &mut headers).unwrap();
    c.bench_function("extract_all_styles", |b| {
        b.iter(|| propagator.extract(black_box(&headers)).unwrap())
    });
}

criterion_group!(benches, bench_inject, bench_extract);
criterion_main!(benches);
