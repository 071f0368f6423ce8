//! Many sessions sharing one statement cache.

use std::sync::Arc;
use std::thread;

use ember_cache::StatementCache;
use ember_common::config::StatementCacheConfig;
use ember_common::{SessionId, StatementId};

const SESSIONS: u64 = 8;
const STATEMENTS: usize = 50;

fn shared() -> (Arc<StatementCache<String>>, Vec<StatementId>) {
    let cache = Arc::new(StatementCache::new(StatementCacheConfig::default()));
    let ids = (0..STATEMENTS)
        .map(|i| {
            let sql = format!("SELECT {} FROM T", i);
            cache.register_statement(None, &sql, sql.clone()).unwrap()
        })
        .collect();
    (cache, ids)
}

#[test]
fn test_sessions_link_and_release_concurrently() {
    let (cache, ids) = shared();
    let ids = Arc::new(ids);

    let handles: Vec<_> = (0..SESSIONS)
        .map(|s| {
            let cache = Arc::clone(&cache);
            let ids = Arc::clone(&ids);
            thread::spawn(move || {
                let session = SessionId::new(s);
                for _ in 0..3 {
                    for &id in ids.iter() {
                        cache.link_session(id, session).unwrap();
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for &id in ids.iter() {
        assert_eq!(cache.use_count(id), SESSIONS as u32);
        assert_eq!(cache.session_use_count(id, SessionId::new(0)), 3);
    }

    let handles: Vec<_> = (0..SESSIONS)
        .map(|s| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || cache.remove_session(SessionId::new(s)))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert!(cache.is_empty());
    assert_eq!(cache.stats().removals(), STATEMENTS as u64);
}

#[test]
fn test_reset_during_lookups_recompiles_once_per_statement() {
    let (cache, ids) = shared();
    let session = SessionId::new(1);
    for &id in &ids {
        cache.link_session(id, session).unwrap();
    }
    cache.reset_statements();

    let ids = Arc::new(ids);
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let ids = Arc::clone(&ids);
            thread::spawn(move || {
                for &id in ids.iter() {
                    let plan = cache
                        .compile_or_refresh(id, |sql| Ok(format!("{} /* v2 */", sql)))
                        .unwrap();
                    assert!(plan.ends_with("/* v2 */"));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(cache.stats().recompiles(), STATEMENTS as u64);
    for &id in ids.iter() {
        assert_eq!(cache.get_sql(id).unwrap(), format!("SELECT {} FROM T", id.as_u32() - 1));
    }
}
