//! Statement cache benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ember_cache::StatementCache;
use ember_common::config::StatementCacheConfig;
use ember_common::{SessionId, StatementId};

fn sql(i: usize) -> String {
    format!("SELECT * FROM T WHERE ID = {}", i)
}

fn filled(n: usize) -> (StatementCache<usize>, Vec<StatementId>) {
    let cache = StatementCache::new(StatementCacheConfig::default());
    let session = SessionId::new(1);
    let ids = (0..n)
        .map(|i| {
            let id = cache.register_statement(None, &sql(i), i).unwrap();
            cache.link_session(id, session).unwrap();
            id
        })
        .collect();
    (cache, ids)
}

fn register_benchmark(c: &mut Criterion) {
    c.bench_function("statement_register_1000", |b| {
        b.iter(|| black_box(filled(1000).0.len()))
    });
}

fn lookup_benchmark(c: &mut Criterion) {
    let (cache, ids) = filled(1000);
    c.bench_function("statement_get_1000", |b| {
        b.iter(|| {
            for &id in &ids {
                black_box(cache.get_statement(id));
            }
        })
    });
}

fn sql_lookup_benchmark(c: &mut Criterion) {
    let (cache, _) = filled(1000);
    let texts: Vec<String> = (0..1000).map(sql).collect();
    c.bench_function("statement_id_by_sql_1000", |b| {
        b.iter(|| {
            for text in &texts {
                black_box(cache.get_statement_id(text));
            }
        })
    });
}

fn refresh_benchmark(c: &mut Criterion) {
    let (cache, ids) = filled(1000);
    c.bench_function("statement_reset_refresh_1000", |b| {
        b.iter(|| {
            cache.reset_statements();
            for &id in &ids {
                black_box(cache.compile_or_refresh(id, |s| Ok(s.len())).unwrap());
            }
        })
    });
}

fn session_release_benchmark(c: &mut Criterion) {
    c.bench_function("statement_remove_session_1000", |b| {
        b.iter(|| {
            let (cache, _) = filled(1000);
            cache.remove_session(SessionId::new(1));
            black_box(cache.is_empty())
        })
    });
}

criterion_group!(
    benches,
    register_benchmark,
    lookup_benchmark,
    sql_lookup_benchmark,
    refresh_benchmark,
    session_release_benchmark
);
criterion_main!(benches);
