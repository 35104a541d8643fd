use criterion::{criterion_group, criterion_main, Criterion};
use nostr::{finalize_event, generate_secret_key, EventTemplate, KIND_SHORT_TEXT_NOTE};
use nostr_relay::{Database, DatabaseConfig, Filter, QueryOptions};

fn bench_insert_and_query(c: &mut Criterion) {
    let db = Database::new(DatabaseConfig { path: ":memory:".into(), max_pool_size: 4 }).unwrap();
    let sk = generate_secret_key();

    c.bench_function("insert_event", |b| {
        b.iter(|| {
            let event = finalize_event(
                &EventTemplate {
                    created_at: 1_700_000_000,
                    kind: KIND_SHORT_TEXT_NOTE,
                    tags: vec![],
                    content: "benchmark note".to_string(),
                },
                &sk,
            )
            .unwrap();
            db.insert_event(&event).unwrap();
        })
    });

    for i in 0..2_000 {
        let event = finalize_event(
            &EventTemplate { created_at: 1_700_000_000 + i, kind: KIND_SHORT_TEXT_NOTE, tags: vec![], content: format!("note {i}") },
            &sk,
        )
        .unwrap();
        db.insert_event(&event).unwrap();
    }

    c.bench_function("query_events_by_kind", |b| {
        let filters = vec![Filter::new().kinds(vec![KIND_SHORT_TEXT_NOTE]).limit(100)];
        b.iter(|| db.query_events(&filters, &QueryOptions::default()).unwrap())
    });
}

criterion_group!(benches, bench_insert_and_query);
criterion_main!(benches);
