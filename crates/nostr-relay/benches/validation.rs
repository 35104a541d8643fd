use criterion::{criterion_group, criterion_main, Criterion};
use nostr::{finalize_event, generate_secret_key, EventTemplate, KIND_SHORT_TEXT_NOTE};
use nostr_relay::Filter;

fn bench_filter_matching(c: &mut Criterion) {
    let sk = generate_secret_key();
    let events: Vec<_> = (0..1_000)
        .map(|i| {
            finalize_event(
                &EventTemplate {
                    created_at: 1_700_000_000 + i,
                    kind: KIND_SHORT_TEXT_NOTE,
                    tags: vec![vec!["t".to_string(), format!("tag{}", i % 10)]],
                    content: format!("note {i}"),
                },
                &sk,
            )
            .unwrap()
        })
        .collect();

    let filter = Filter::new().kinds(vec![KIND_SHORT_TEXT_NOTE]).tag("#t", vec!["tag3".to_string()]);

    c.bench_function("filter_matches_1000_events", |b| {
        b.iter(|| events.iter().filter(|e| filter.matches(e)).count())
    });
}

criterion_group!(benches, bench_filter_matching);
criterion_main!(benches);
