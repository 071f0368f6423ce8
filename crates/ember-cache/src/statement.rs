//! Compiled-statement cache.
//!
//! Maps SQL text to statement ids and ids to compiled plans, and counts
//! which sessions use each statement. A statement lives while at least one
//! session is linked to it; the last [`free_statement`] removes it.
//!
//! After a schema change [`reset_statements`] drops every plan but keeps
//! ids, SQL text and use counts, so a session can recompile a statement
//! from its text without preparing it again. Statements no session ever
//! linked are removed by the reset.
//!
//! Every operation runs under one lock held for its full duration.
//!
//! [`free_statement`]: StatementCache::free_statement
//! [`reset_statements`]: StatementCache::reset_statements

use std::collections::HashMap;
use std::sync::Arc;

use ember_common::config::StatementCacheConfig;
use ember_common::{EmberError, EmberResult, SessionId, StatementId};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::stats::CacheStats;

struct Entry<P> {
    sql: String,
    /// `None` once invalidated.
    plan: Option<Arc<P>>,
    /// Sessions linked to this statement.
    use_count: u32,
}

struct Registry<P> {
    sql_ids: HashMap<String, StatementId>,
    entries: HashMap<StatementId, Entry<P>>,
    /// Per-session link counts.
    sessions: HashMap<SessionId, HashMap<StatementId, u32>>,
    next_id: StatementId,
}

impl<P> Registry<P> {
    fn entry_mut(&mut self, id: StatementId) -> EmberResult<&mut Entry<P>> {
        self.entries
            .get_mut(&id)
            .ok_or(EmberError::StatementNotFound { id })
    }

    /// Drops one link of `session` to `id`. Returns true if the statement
    /// was removed.
    fn unlink(&mut self, id: StatementId, session: SessionId) -> bool {
        let Some(links) = self.sessions.get_mut(&session) else {
            return false;
        };
        let Some(count) = links.get_mut(&id) else {
            return false;
        };
        *count -= 1;
        if *count > 0 {
            return false;
        }
        links.remove(&id);
        if links.is_empty() {
            self.sessions.remove(&session);
        }

        let Some(entry) = self.entries.get_mut(&id) else {
            return false;
        };
        entry.use_count = entry.use_count.saturating_sub(1);
        if entry.use_count > 0 {
            return false;
        }
        if let Some(entry) = self.entries.remove(&id) {
            if self.sql_ids.get(&entry.sql) == Some(&id) {
                self.sql_ids.remove(&entry.sql);
            }
        }
        true
    }

    /// Removes statements no session is linked to. Returns how many.
    ///
    /// SQL text that mapped to a removed statement maps to the newest
    /// remaining statement with the same text, if any.
    fn prune_unlinked(&mut self) -> usize {
        let unlinked: Vec<StatementId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.use_count == 0)
            .map(|(&id, _)| id)
            .collect();
        let mut unmapped = Vec::new();
        for id in &unlinked {
            if let Some(entry) = self.entries.remove(id) {
                if self.sql_ids.get(&entry.sql) == Some(id) {
                    self.sql_ids.remove(&entry.sql);
                    unmapped.push(entry.sql);
                }
            }
        }
        for sql in unmapped {
            let newest = self
                .entries
                .iter()
                .filter(|(_, e)| e.sql == sql)
                .map(|(&id, _)| id)
                .max();
            if let Some(id) = newest {
                self.sql_ids.insert(sql, id);
            }
        }
        unlinked.len()
    }
}

/// Thread-safe registry of compiled statements.
///
/// # Example
///
/// ```rust
/// use ember_cache::StatementCache;
/// use ember_common::config::StatementCacheConfig;
/// use ember_common::SessionId;
///
/// let cache: StatementCache<String> = StatementCache::new(StatementCacheConfig::default());
/// let session = SessionId::new(1);
///
/// let sql = "SELECT * FROM T WHERE ID = ?";
/// let id = cache.register_statement(None, sql, "plan".to_string()).unwrap();
/// cache.link_session(id, session).unwrap();
/// assert_eq!(cache.get_statement_id(sql), Some(id));
///
/// cache.free_statement(id, session);
/// assert!(cache.get_statement(id).is_none());
/// ```
pub struct StatementCache<P> {
    config: StatementCacheConfig,
    registry: Mutex<Registry<P>>,
    stats: CacheStats,
}

impl<P> StatementCache<P> {
    /// Creates an empty cache.
    pub fn new(config: StatementCacheConfig) -> Self {
        Self {
            registry: Mutex::new(Registry {
                sql_ids: HashMap::new(),
                entries: HashMap::new(),
                sessions: HashMap::new(),
                next_id: StatementId::new(config.first_statement_id),
            }),
            config,
            stats: CacheStats::new(),
        }
    }

    fn key(&self, sql: &str) -> String {
        if self.config.normalize_sql {
            normalize_sql(sql)
        } else {
            sql.to_string()
        }
    }

    /// Id of the statement most recently registered for `sql`.
    pub fn get_statement_id(&self, sql: &str) -> Option<StatementId> {
        let key = self.key(sql);
        self.registry.lock().sql_ids.get(&key).copied()
    }

    /// Stores `plan` for a statement.
    ///
    /// With `id` of `None` the statement gets a new id, which `sql` then
    /// maps to. With an id, the plan of that statement is replaced.
    ///
    /// A new statement must be linked with [`link_session`](Self::link_session)
    /// before the next [`reset_statements`](Self::reset_statements), which
    /// removes unlinked statements.
    pub fn register_statement(
        &self,
        id: Option<StatementId>,
        sql: &str,
        plan: P,
    ) -> EmberResult<StatementId> {
        let mut registry = self.registry.lock();
        let plan = Some(Arc::new(plan));
        match id {
            Some(id) => {
                registry.entry_mut(id)?.plan = plan;
                Ok(id)
            }
            None => {
                let id = registry.next_id;
                registry.next_id = id.next();
                let sql = self.key(sql);
                registry.sql_ids.insert(sql.clone(), id);
                registry.entries.insert(
                    id,
                    Entry {
                        sql,
                        plan,
                        use_count: 0,
                    },
                );
                self.stats.record_registration();
                debug!(%id, "registered statement");
                Ok(id)
            }
        }
    }

    /// Records that `session` prepared statement `id`.
    ///
    /// Only the first link from a session adds to the statement's use
    /// count.
    pub fn link_session(&self, id: StatementId, session: SessionId) -> EmberResult<()> {
        let mut registry = self.registry.lock();
        if !registry.entries.contains_key(&id) {
            return Err(EmberError::StatementNotFound { id });
        }
        let count = registry
            .sessions
            .entry(session)
            .or_default()
            .entry(id)
            .or_insert(0);
        *count += 1;
        if *count == 1 {
            registry.entry_mut(id)?.use_count += 1;
        }
        Ok(())
    }

    /// Releases one link of `session` to `id`.
    ///
    /// When the session's last link goes, the statement's use count drops;
    /// at zero the statement is removed. Unknown links are ignored.
    pub fn free_statement(&self, id: StatementId, session: SessionId) {
        let removed = self.registry.lock().unlink(id, session);
        if removed {
            self.stats.record_removal();
            debug!(%id, "removed statement");
        }
    }

    /// Releases every statement `session` is linked to.
    pub fn remove_session(&self, session: SessionId) {
        let mut registry = self.registry.lock();
        let Some(links) = registry.sessions.get(&session) else {
            return;
        };
        let links: Vec<(StatementId, u32)> = links.iter().map(|(&id, &n)| (id, n)).collect();
        let mut removed = 0;
        for (id, count) in links {
            for _ in 0..count {
                if registry.unlink(id, session) {
                    removed += 1;
                }
            }
        }
        for _ in 0..removed {
            self.stats.record_removal();
        }
        debug!(session = %session, removed, "released session statements");
    }

    /// Invalidates every plan, keeping ids, SQL text and use counts of
    /// linked statements. Unlinked statements are removed.
    pub fn reset_statements(&self) {
        let mut registry = self.registry.lock();
        let pruned = registry.prune_unlinked();
        let mut count = 0;
        for entry in registry.entries.values_mut() {
            if entry.plan.take().is_some() {
                count += 1;
            }
        }
        for _ in 0..pruned {
            self.stats.record_removal();
        }
        self.stats.record_invalidations(count);
        info!(invalidated = count, pruned, "reset compiled statements");
    }

    /// Plan of statement `id`, `None` when invalidated or unknown.
    pub fn get_statement(&self, id: StatementId) -> Option<Arc<P>> {
        let plan = self
            .registry
            .lock()
            .entries
            .get(&id)
            .and_then(|e| e.plan.clone());
        self.stats.record_lookup(plan.is_some());
        plan
    }

    /// SQL text of statement `id`.
    pub fn get_sql(&self, id: StatementId) -> Option<String> {
        self.registry.lock().entries.get(&id).map(|e| e.sql.clone())
    }

    /// Plan of statement `id`, compiling it from its SQL text first if it
    /// was invalidated. The statement keeps its id.
    pub fn compile_or_refresh<F>(&self, id: StatementId, compile: F) -> EmberResult<Arc<P>>
    where
        F: FnOnce(&str) -> EmberResult<P>,
    {
        let mut registry = self.registry.lock();
        let entry = registry.entry_mut(id)?;
        if let Some(plan) = &entry.plan {
            self.stats.record_lookup(true);
            return Ok(Arc::clone(plan));
        }
        self.stats.record_lookup(false);
        let plan = Arc::new(compile(&entry.sql)?);
        entry.plan = Some(Arc::clone(&plan));
        self.stats.record_recompile();
        debug!(%id, "recompiled statement");
        Ok(plan)
    }

    /// Links `session` holds to statement `id`.
    pub fn session_use_count(&self, id: StatementId, session: SessionId) -> u32 {
        self.registry
            .lock()
            .sessions
            .get(&session)
            .and_then(|links| links.get(&id))
            .copied()
            .unwrap_or(0)
    }

    /// Sessions linked to statement `id`.
    pub fn use_count(&self, id: StatementId) -> u32 {
        self.registry
            .lock()
            .entries
            .get(&id)
            .map_or(0, |e| e.use_count)
    }

    /// Number of registered statements.
    pub fn len(&self) -> usize {
        self.registry.lock().entries.len()
    }

    /// Returns true if no statement is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns cache statistics.
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }
}

/// Collapses whitespace and lowercases SQL text.
pub fn normalize_sql(sql: &str) -> String {
    sql.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> StatementCache<String> {
        StatementCache::new(StatementCacheConfig::default())
    }

    const SQL: &str = "SELECT * FROM T";

    #[test]
    fn test_register_allocates_ids() {
        let cache = cache();
        let a = cache.register_statement(None, SQL, "a".into()).unwrap();
        let b = cache.register_statement(None, SQL, "b".into()).unwrap();
        assert_eq!(a, StatementId::new(1));
        assert_eq!(b, StatementId::new(2));
        assert_eq!(cache.get_statement_id(SQL), Some(b));

        let same = cache.register_statement(Some(a), SQL, "a2".into()).unwrap();
        assert_eq!(same, a);
        assert_eq!(*cache.get_statement(a).unwrap(), "a2");
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_register_unknown_id() {
        let cache = cache();
        let err = cache
            .register_statement(Some(StatementId::new(9)), SQL, "x".into())
            .unwrap_err();
        assert!(matches!(err, EmberError::StatementNotFound { .. }));
    }

    #[test]
    fn test_first_link_per_session_counts() {
        let cache = cache();
        let (s1, s2) = (SessionId::new(1), SessionId::new(2));
        let id = cache.register_statement(None, SQL, "p".into()).unwrap();

        cache.link_session(id, s1).unwrap();
        cache.link_session(id, s1).unwrap();
        cache.link_session(id, s2).unwrap();
        assert_eq!(cache.use_count(id), 2);
        assert_eq!(cache.session_use_count(id, s1), 2);

        cache.free_statement(id, s1);
        assert_eq!(cache.use_count(id), 2);
        cache.free_statement(id, s1);
        assert_eq!(cache.use_count(id), 1);
        assert_eq!(cache.session_use_count(id, s1), 0);

        cache.free_statement(id, s2);
        assert!(cache.is_empty());
        assert_eq!(cache.get_statement_id(SQL), None);
        assert_eq!(cache.get_sql(id), None);
        assert_eq!(cache.stats().removals(), 1);
    }

    #[test]
    fn test_free_older_id_keeps_newer_mapping() {
        let cache = cache();
        let s = SessionId::new(1);
        let old = cache.register_statement(None, SQL, "old".into()).unwrap();
        let new = cache.register_statement(None, SQL, "new".into()).unwrap();
        cache.link_session(old, s).unwrap();
        cache.link_session(new, s).unwrap();

        cache.free_statement(old, s);
        assert_eq!(cache.get_statement_id(SQL), Some(new));
    }

    #[test]
    fn test_remove_session() {
        let cache = cache();
        let (s1, s2) = (SessionId::new(1), SessionId::new(2));
        let a = cache.register_statement(None, "A", "a".into()).unwrap();
        let b = cache.register_statement(None, "B", "b".into()).unwrap();
        cache.link_session(a, s1).unwrap();
        cache.link_session(a, s1).unwrap();
        cache.link_session(b, s1).unwrap();
        cache.link_session(b, s2).unwrap();

        cache.remove_session(s1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get_sql(a).is_none());
        assert_eq!(cache.use_count(b), 1);
        cache.remove_session(s1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_reset_keeps_ids_and_sql() {
        let cache = cache();
        let s = SessionId::new(1);
        let id = cache.register_statement(None, SQL, "p".into()).unwrap();
        cache.link_session(id, s).unwrap();

        cache.reset_statements();
        assert!(cache.get_statement(id).is_none());
        assert_eq!(cache.get_sql(id).as_deref(), Some(SQL));
        assert_eq!(cache.get_statement_id(SQL), Some(id));
        assert_eq!(cache.use_count(id), 1);

        let plan = cache
            .compile_or_refresh(id, |sql| Ok(format!("compiled {}", sql)))
            .unwrap();
        assert_eq!(*plan, "compiled SELECT * FROM T");
        assert_eq!(*cache.get_statement(id).unwrap(), "compiled SELECT * FROM T");
        assert_eq!(cache.stats().recompiles(), 1);
        assert_eq!(cache.stats().invalidations(), 1);
    }

    #[test]
    fn test_refresh_failure_keeps_invalidated() {
        let cache = cache();
        let id = cache.register_statement(None, SQL, "p".into()).unwrap();
        cache.link_session(id, SessionId::new(1)).unwrap();
        cache.reset_statements();
        let err = cache
            .compile_or_refresh(id, |_| Err(EmberError::TableNotFound { table: "T".into() }))
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(cache.get_statement(id).is_none());
    }

    #[test]
    fn test_reset_removes_unlinked_statements() {
        let cache = cache();
        let s = SessionId::new(1);
        let linked = cache.register_statement(None, "A", "a".into()).unwrap();
        cache.link_session(linked, s).unwrap();
        let orphan = cache.register_statement(None, "B", "b".into()).unwrap();
        let newer = cache.register_statement(None, "A", "a2".into()).unwrap();
        assert_eq!(cache.get_statement_id("A"), Some(newer));
        assert_eq!(cache.len(), 3);

        cache.reset_statements();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_sql(orphan), None);
        assert_eq!(cache.get_statement_id("B"), None);
        assert_eq!(cache.get_sql(newer), None);
        assert_eq!(cache.get_statement_id("A"), Some(linked));
        assert_eq!(cache.stats().removals(), 2);
        assert_eq!(cache.stats().invalidations(), 1);
        assert!(matches!(
            cache.link_session(orphan, s),
            Err(EmberError::StatementNotFound { .. })
        ));
    }

    #[test]
    fn test_normalized_lookup() {
        let cache: StatementCache<String> = StatementCache::new(StatementCacheConfig {
            normalize_sql: true,
            ..StatementCacheConfig::default()
        });
        let id = cache.register_statement(None, "SELECT  *\nFROM t", "p".into()).unwrap();
        assert_eq!(cache.get_statement_id("select * from T"), Some(id));
        assert_eq!(cache.get_statement_id("SELECT * FROM T").unwrap(), id);
    }

    #[test]
    fn test_exact_lookup_by_default() {
        let cache = cache();
        cache.register_statement(None, SQL, "p".into()).unwrap();
        assert_eq!(cache.get_statement_id("select * from t"), None);
    }

    #[test]
    fn test_normalize_sql() {
        assert_eq!(
            normalize_sql("SELECT  *  FROM   users  WHERE  id = 1"),
            "select * from users where id = 1"
        );
    }
}
