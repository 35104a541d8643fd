use criterion::{criterion_group, criterion_main, Criterion};
use nostr_client::SessionKey;

fn bench_session_key_normalization(c: &mut Criterion) {
    let pubkey = "a".repeat(64);

    c.bench_function("session_key_new_1000", |b| {
        b.iter(|| {
            for i in 0..1_000 {
                let url = format!("WSS://Relay{i}.Example.com:443/");
                let _ = SessionKey::new(&url, &pubkey);
            }
        })
    });
}

criterion_group!(benches, bench_session_key_normalization);
criterion_main!(benches);
