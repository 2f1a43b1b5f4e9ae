//! Hot-path benchmarks: plain writes, nested reads, and selector refresh.

use std::hint::black_box;

use criterion::{Criterion, criterion_group, criterion_main};
use serde_json::json;
use traitstore::{StoreOptions, TraitStore};

fn bench_set_get(c: &mut Criterion) {
    c.bench_function("set_scalar", |b| {
        let store = TraitStore::with_options(StoreOptions::default());
        let mut tick = 0i64;
        b.iter(|| {
            tick += 1;
            store.set("bench.counter", tick).unwrap();
        });
    });

    c.bench_function("get_nested", |b| {
        let store = TraitStore::with_options(StoreOptions::default());
        store
            .set("session", json!({ "user": { "name": "ada", "age": 36 } }))
            .unwrap();
        b.iter(|| black_box(store.get("session.user.name").unwrap()));
    });
}

fn bench_selector_refresh(c: &mut Criterion) {
    c.bench_function("selector_refresh", |b| {
        let store = TraitStore::with_options(StoreOptions::default());
        store.set("base", 0).unwrap();
        store
            .set_with("derived", |ctx| {
                Ok(json!(ctx.get("base")?.as_i64().unwrap_or(0) * 2))
            })
            .unwrap();
        let mut tick = 0i64;
        b.iter(|| {
            tick += 1;
            store.set("base", tick).unwrap();
            black_box(store.get("derived").unwrap());
        });
    });

    c.bench_function("broadcast_ten_subscribers", |b| {
        let store = TraitStore::with_options(StoreOptions::default());
        store.set("hot", 0).unwrap();
        let subs: Vec<_> = (0..10)
            .map(|_| store.subscribe("hot", |value| drop(black_box(value.clone()))))
            .collect::<Result<_, _>>()
            .unwrap();
        let mut tick = 0i64;
        b.iter(|| {
            tick += 1;
            store.set("hot", tick).unwrap();
        });
        for sub in &subs {
            sub.unsubscribe();
        }
    });
}

criterion_group!(benches, bench_set_get, bench_selector_refresh);
criterion_main!(benches);
