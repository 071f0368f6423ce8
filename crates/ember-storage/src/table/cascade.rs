//! Referential actions across tables.
//!
//! Deletes and updates run in two phases. The first phase walks every
//! foreign key that references the affected rows and fails on a blocking
//! `NO ACTION` reference before anything is changed. The second phase
//! performs cascaded deletes directly and collects `SET NULL`,
//! `SET DEFAULT` and `CASCADE` updates per table in [`UpdateLists`], which
//! are applied as whole-row replacements at the end.
//!
//! Every change of the second phase is recorded in a [`Journal`]. If any
//! step fails, for example a replacement that violates a unique
//! constraint, the journal is undone in reverse order and the statement
//! leaves all tables as they were.
//!
//! Recursion follows foreign keys from referenced to referencing table. A
//! [`CascadePath`] records the constraints on the current recursion path;
//! a constraint already on the path is not entered again, so rings of
//! mutually referencing tables terminate.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use ember_common::{CompareOptions, ConstraintId, EmberError, EmberResult, TableId, Value};
use tracing::{debug, trace, warn};

use super::{AppliedRows, ConstraintCore, ConstraintType, ReferentialAction, Table};
use crate::row::RowRef;

/// Every table of a database by id.
pub type TableMap = BTreeMap<TableId, Table>;

/// Pending row replacements per table.
pub type UpdateLists = BTreeMap<TableId, RowUpdateSet>;

/// Ordered set of row replacements for one table, keyed by row.
#[derive(Debug, Clone, Default)]
pub struct RowUpdateSet {
    entries: Vec<(RowRef, Vec<Value>)>,
    positions: HashMap<RowRef, usize>,
}

impl RowUpdateSet {
    /// Number of rows in the set.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns true if `row` has a pending replacement.
    pub fn contains(&self, row: RowRef) -> bool {
        self.positions.contains_key(&row)
    }

    /// Pending data for `row`.
    pub fn get(&self, row: RowRef) -> Option<&[Value]> {
        self.positions
            .get(&row)
            .map(|&i| self.entries[i].1.as_slice())
    }

    /// Adds `row` or replaces its pending data.
    pub fn put(&mut self, row: RowRef, data: Vec<Value>) {
        match self.positions.get(&row) {
            Some(&i) => self.entries[i].1 = data,
            None => {
                self.positions.insert(row, self.entries.len());
                self.entries.push((row, data));
            }
        }
    }

    /// Iterates in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (RowRef, &[Value])> {
        self.entries.iter().map(|(r, d)| (*r, d.as_slice()))
    }

    pub(crate) fn values_mut(&mut self) -> impl Iterator<Item = &mut Vec<Value>> {
        self.entries.iter_mut().map(|(_, d)| d)
    }

    /// Consumes the set, yielding rows in insertion order.
    pub fn into_entries(self) -> Vec<(RowRef, Vec<Value>)> {
        self.entries
    }

    /// Merges a triggered change into a previous one for the same row.
    ///
    /// Only `cols` are taken from `new_data` when the row is already
    /// present; otherwise `new_data` is added whole.
    pub fn merge_update(&mut self, row: RowRef, new_data: Vec<Value>, cols: &[usize]) {
        match self.positions.get(&row) {
            Some(&i) => {
                let data = &mut self.entries[i].1;
                for &c in cols {
                    data[c] = new_data[c].clone();
                }
            }
            None => self.put(row, new_data),
        }
    }

    /// Merges a full triggered change with the statement's own change to
    /// the same row.
    ///
    /// The changes conflict when, on `cols`, `triggered` differs from both
    /// the `original` row and the pending data. Otherwise the merged row is
    /// `triggered` with the pending values written over `cols`. Returns
    /// false on conflict and leaves the set unchanged.
    pub fn merge_keep_update(
        &mut self,
        row: RowRef,
        cols: &[usize],
        mut triggered: Vec<Value>,
        original: &[Value],
        options: &CompareOptions,
    ) -> bool {
        let Some(&i) = self.positions.get(&row) else {
            self.put(row, triggered);
            return true;
        };
        let pending = &self.entries[i].1;
        let same = |a: &[Value], b: &[Value]| cols.iter().all(|&c| a[c].compare(&b[c], options).is_eq());
        if !same(original, &triggered[..]) && !same(&triggered[..], &pending[..]) {
            return false;
        }
        for &c in cols {
            triggered[c] = pending[c].clone();
        }
        self.entries[i].1 = triggered;
        true
    }
}

/// Constraints and rows on the current cascade recursion path.
#[derive(Debug, Default)]
pub struct CascadePath {
    /// Foreign keys currently being followed.
    pub visited: HashSet<ConstraintId>,
    /// Rows whose delete is currently being cascaded.
    pub rows: HashSet<(TableId, RowRef)>,
}

impl CascadePath {
    /// Forgets everything, for the next top-level row.
    pub fn clear(&mut self) {
        self.visited.clear();
        self.rows.clear();
    }
}

pub(crate) fn table_ref(tables: &TableMap, id: TableId) -> EmberResult<&Table> {
    tables
        .get(&id)
        .ok_or(EmberError::TableIdNotFound { table_id: id })
}

pub(crate) fn table_mut(tables: &mut TableMap, id: TableId) -> EmberResult<&mut Table> {
    tables
        .get_mut(&id)
        .ok_or(EmberError::TableIdNotFound { table_id: id })
}

fn cores_of(table: &Table, kind: ConstraintType) -> Vec<Arc<ConstraintCore>> {
    table
        .constraints()
        .iter()
        .filter(|c| c.constraint_type() == kind)
        .filter_map(|c| c.core().cloned())
        .collect()
}

fn integrity_violation(tables: &TableMap, core: &ConstraintCore, table: TableId) -> EmberError {
    EmberError::IntegrityViolation {
        constraint: core.fk_name.clone(),
        table: tables
            .get(&table)
            .map_or_else(|| table.to_string(), |t| t.name().to_string()),
    }
}

/// Verifies that `data`, a row of the referencing table, finds its parent.
///
/// Rows with a NULL in the foreign key columns and rows that reference
/// themselves pass.
pub(crate) fn check_referenced_row(
    tables: &TableMap,
    core: &ConstraintCore,
    data: &[Value],
) -> EmberResult<()> {
    if core.ref_columns.iter().any(|&c| data[c].is_null()) {
        return Ok(());
    }
    let main = table_ref(tables, core.main_table)?;
    if main.find_referenced_row(core, data)?.is_some()
        || core.references_own_row(data, main.store().compare_options())
    {
        return Ok(());
    }
    Err(integrity_violation(tables, core, core.main_table))
}

/// Checks every foreign key of `table_id` against a new row.
pub(crate) fn check_foreign_keys(tables: &TableMap, table_id: TableId, data: &[Value]) -> EmberResult<()> {
    let table = table_ref(tables, table_id)?;
    for core in cores_of(table, ConstraintType::ForeignKey) {
        check_referenced_row(tables, &core, data)?;
    }
    Ok(())
}

/// Changes applied by one delete or update statement, in order.
#[derive(Default)]
pub(crate) struct Journal {
    entries: Vec<JournalEntry>,
}

enum JournalEntry {
    Deleted { table: TableId, data: Vec<Value> },
    Replaced { table: TableId, applied: AppliedRows },
}

impl Journal {
    /// Deletes `row` of `table`, recording its data.
    fn delete(&mut self, tables: &mut TableMap, table: TableId, row: RowRef) -> EmberResult<()> {
        let data = table_mut(tables, table)?.delete_no_check(row)?;
        self.entries.push(JournalEntry::Deleted { table, data });
        Ok(())
    }

    /// Applies a row replacement set to `table`, recording what it replaced.
    fn replace(
        &mut self,
        tables: &mut TableMap,
        table: TableId,
        set: RowUpdateSet,
        nodelete: bool,
    ) -> EmberResult<usize> {
        let applied = table_mut(tables, table)?.apply_row_set(set, nodelete)?;
        let count = applied.len();
        self.entries.push(JournalEntry::Replaced { table, applied });
        Ok(count)
    }

    /// Undoes every recorded change, newest first.
    fn rollback(self, tables: &mut TableMap) -> EmberResult<()> {
        let undone = self.entries.len();
        for entry in self.entries.into_iter().rev() {
            match entry {
                JournalEntry::Deleted { table, data } => {
                    table_mut(tables, table)?.insert_no_check(data)?;
                }
                JournalEntry::Replaced { table, applied } => {
                    table_mut(tables, table)?.undo_row_set(applied)?;
                }
            }
        }
        for table in tables.values_mut() {
            table.sync()?;
        }
        debug!(undone, "rolled back statement");
        Ok(())
    }
}

/// Syncs every table when `result` is a success, otherwise undoes
/// `journal` and returns the original error.
fn finish<T>(tables: &mut TableMap, journal: Journal, result: EmberResult<T>) -> EmberResult<T> {
    match result {
        Ok(value) => {
            for table in tables.values_mut() {
                table.sync()?;
            }
            Ok(value)
        }
        Err(e) => {
            if let Err(undo) = journal.rollback(tables) {
                warn!(error = %undo, cause = %e, "rollback failed");
                return Err(undo);
            }
            Err(e)
        }
    }
}

/// Checks, and with a `journal` performs, the referential actions for
/// deleting `row` of `table_id`.
///
/// `SET NULL` and `SET DEFAULT` changes are merged into `lists`. Cascaded
/// deletes happen immediately, and are recorded, when a journal is given.
pub(crate) fn check_cascade_delete(
    tables: &mut TableMap,
    table_id: TableId,
    lists: &mut UpdateLists,
    row: RowRef,
    mut journal: Option<&mut Journal>,
    path: &mut CascadePath,
) -> EmberResult<()> {
    let delete = journal.is_some();
    let (cores, data) = {
        let table = table_ref(tables, table_id)?;
        if !table.contains(row) {
            return Ok(());
        }
        (cores_of(table, ConstraintType::Main), table.row_data(row)?.to_vec())
    };

    path.rows.insert((table_id, row));
    for core in cores {
        if core.main_columns.iter().any(|&c| data[c].is_null()) {
            continue;
        }
        let ref_id = core.ref_table;
        let self_ref = ref_id == table_id;
        let (refs, has_ref) = {
            let reftable = table_ref(tables, ref_id)?;
            (reftable.find_fk_rows(&core, &data)?, reftable.has_main_constraints())
        };
        if refs.is_empty() {
            continue;
        }

        let action = core.delete_action;
        if action.is_no_action() {
            if refs.iter().any(|&r| !(self_ref && r == row)) {
                return Err(integrity_violation(tables, &core, ref_id));
            }
            continue;
        }
        if !delete && !has_ref {
            continue;
        }
        trace!(constraint = %core.fk_name, rows = refs.len(), %action, delete, "cascading delete");

        for refrow in refs {
            if !table_ref(tables, ref_id)?.contains(refrow) {
                continue;
            }

            if action.is_update() {
                let new_data = {
                    let reftable = table_ref(tables, ref_id)?;
                    let mut d = reftable.row_data(refrow)?.to_vec();
                    for &c in &core.ref_columns {
                        d[c] = match action {
                            ReferentialAction::SetNull => Value::Null,
                            _ => reftable.columns()[c].default.clone(),
                        };
                    }
                    d
                };
                if has_ref && path.visited.insert(core.id) {
                    check_cascade_update(
                        tables,
                        ref_id,
                        lists,
                        refrow,
                        &new_data,
                        &core.ref_columns,
                        None,
                        path,
                    )?;
                    path.visited.remove(&core.id);
                }
                if delete && !(self_ref && refrow == row) {
                    lists
                        .entry(ref_id)
                        .or_default()
                        .merge_update(refrow, new_data, &core.ref_columns);
                }
                continue;
            }

            if has_ref {
                if !self_ref {
                    if path.visited.insert(core.id) {
                        check_cascade_delete(
                            tables,
                            ref_id,
                            lists,
                            refrow,
                            journal.as_deref_mut(),
                            path,
                        )?;
                        path.visited.remove(&core.id);
                    }
                } else if !path.rows.contains(&(ref_id, refrow)) {
                    check_cascade_delete(
                        tables,
                        ref_id,
                        lists,
                        refrow,
                        journal.as_deref_mut(),
                        path,
                    )?;
                }
            }

            if let Some(journal) = journal.as_deref_mut() {
                if table_ref(tables, ref_id)?.contains(refrow) {
                    journal.delete(tables, ref_id, refrow)?;
                }
            }
        }
    }
    path.rows.remove(&(table_id, row));
    Ok(())
}

/// Checks the referential actions for replacing `orow` of `table_id` with
/// `ndata`, where `cols` are the changed columns.
///
/// Foreign keys of the table itself are checked against the new data,
/// except the one leading back to `from`, the table whose change triggered
/// this one. Referencing rows get their new data merged into `lists`.
#[allow(clippy::too_many_arguments)]
pub(crate) fn check_cascade_update(
    tables: &mut TableMap,
    table_id: TableId,
    lists: &mut UpdateLists,
    orow: RowRef,
    ndata: &[Value],
    cols: &[usize],
    from: Option<TableId>,
    path: &mut CascadePath,
) -> EmberResult<()> {
    let (fks, mains, odata, options) = {
        let table = table_ref(tables, table_id)?;
        if !table.contains(orow) {
            return Ok(());
        }
        (
            cores_of(table, ConstraintType::ForeignKey),
            cores_of(table, ConstraintType::Main),
            table.row_data(orow)?.to_vec(),
            *table.store().compare_options(),
        )
    };

    for core in fks {
        if from == Some(core.main_table) {
            continue;
        }
        if !cols.iter().any(|c| core.ref_columns.contains(c)) {
            continue;
        }
        check_referenced_row(tables, &core, ndata)?;
    }

    for core in mains {
        let changed_ref: Vec<usize> = core
            .main_columns
            .iter()
            .zip(&core.ref_columns)
            .filter(|(m, _)| cols.contains(m))
            .map(|(_, &r)| r)
            .collect();
        if changed_ref.is_empty() {
            continue;
        }
        let unchanged = core
            .main_columns
            .iter()
            .all(|&c| odata[c].compare(&ndata[c], &options).is_eq());
        if unchanged || core.main_columns.iter().any(|&c| odata[c].is_null()) {
            continue;
        }

        let ref_id = core.ref_table;
        let refs = table_ref(tables, ref_id)?.find_fk_rows(&core, &odata)?;
        if refs.is_empty() {
            continue;
        }
        let action = core.update_action;
        if action.is_no_action() {
            return Err(integrity_violation(tables, &core, ref_id));
        }
        trace!(constraint = %core.fk_name, rows = refs.len(), %action, "cascading update");

        for refrow in refs {
            let rnd = {
                let reftable = table_ref(tables, ref_id)?;
                if !reftable.contains(refrow) {
                    continue;
                }
                let mut d = reftable.row_data(refrow)?.to_vec();
                match action {
                    ReferentialAction::SetNull => {
                        for &c in &core.ref_columns {
                            d[c] = Value::Null;
                        }
                    }
                    ReferentialAction::SetDefault => {
                        for &c in &core.ref_columns {
                            d[c] = reftable.columns()[c].default.clone();
                        }
                    }
                    _ => {
                        for (&m, &r) in core.main_columns.iter().zip(&core.ref_columns) {
                            d[r] = ndata[m].clone();
                        }
                    }
                }
                d
            };

            match action {
                ReferentialAction::SetNull => {}
                ReferentialAction::SetDefault => {
                    if path.visited.insert(core.id) {
                        check_cascade_update(
                            tables,
                            ref_id,
                            lists,
                            refrow,
                            &rnd,
                            &core.ref_columns,
                            None,
                            path,
                        )?;
                        path.visited.remove(&core.id);
                    }
                }
                _ => {
                    if path.visited.insert(core.id) {
                        check_cascade_update(
                            tables,
                            ref_id,
                            lists,
                            refrow,
                            &rnd,
                            &changed_ref,
                            Some(table_id),
                            path,
                        )?;
                        path.visited.remove(&core.id);
                    }
                }
            }

            lists
                .entry(ref_id)
                .or_default()
                .merge_update(refrow, rnd, &core.ref_columns);
        }
    }
    Ok(())
}

/// Deletes `rows` of `table_id` with all referential actions.
pub(crate) fn delete_rows(tables: &mut TableMap, table_id: TableId, rows: &[RowRef]) -> EmberResult<usize> {
    {
        let table = table_ref(tables, table_id)?;
        if rows.iter().any(|&r| !table.contains(r)) {
            return Err(EmberError::RowDeleted {
                table: table.name().to_string(),
            });
        }
    }

    let mut lists = UpdateLists::new();
    let mut path = CascadePath::default();
    for &row in rows {
        path.clear();
        check_cascade_delete(tables, table_id, &mut lists, row, None, &mut path)?;
    }

    let mut journal = Journal::default();
    let result = apply_delete(tables, table_id, rows, lists, &mut path, &mut journal);
    finish(tables, journal, result).map(|()| rows.len())
}

fn apply_delete(
    tables: &mut TableMap,
    table_id: TableId,
    rows: &[RowRef],
    mut lists: UpdateLists,
    path: &mut CascadePath,
    journal: &mut Journal,
) -> EmberResult<()> {
    for &row in rows {
        path.clear();
        check_cascade_delete(tables, table_id, &mut lists, row, Some(&mut *journal), path)?;
    }
    for &row in rows {
        if table_ref(tables, table_id)?.contains(row) {
            journal.delete(tables, table_id, row)?;
        }
    }
    for (id, set) in lists {
        journal.replace(tables, id, set, false)?;
    }
    Ok(())
}

/// Replaces the rows of `updates` in `table_id`, where `cols` are the
/// columns the statement sets, with all referential actions.
pub(crate) fn update_rows(
    tables: &mut TableMap,
    table_id: TableId,
    mut updates: RowUpdateSet,
    cols: &[usize],
) -> EmberResult<usize> {
    {
        let table = table_mut(tables, table_id)?;
        for (row, _) in updates.iter() {
            if !table.contains(row) {
                return Err(EmberError::RowDeleted {
                    table: table.name().to_string(),
                });
            }
        }
        for data in updates.values_mut() {
            table.prepare_update(data, cols)?;
        }
    }

    let mut lists = UpdateLists::new();
    let mut path = CascadePath::default();
    let pending: Vec<(RowRef, Vec<Value>)> = updates.iter().map(|(r, d)| (r, d.to_vec())).collect();
    for (row, data) in &pending {
        path.clear();
        check_cascade_update(tables, table_id, &mut lists, *row, data, cols, None, &mut path)?;
    }

    if let Some(triggered) = lists.remove(&table_id) {
        let table = table_ref(tables, table_id)?;
        let options = *table.store().compare_options();
        for (row, data) in triggered.into_entries() {
            let original = table.row_data(row)?;
            if !updates.merge_keep_update(row, cols, data, &original, &options) {
                return Err(EmberError::TriggeredDataChange {
                    table: table.name().to_string(),
                });
            }
        }
    }

    for (id, set) in lists.iter().chain(std::iter::once((&table_id, &updates))) {
        let table = table_ref(tables, *id)?;
        for (_, data) in set.iter() {
            table.check_row_constraints(data)?;
        }
    }

    let mut journal = Journal::default();
    let result = apply_update(tables, table_id, updates, lists, &mut journal);
    finish(tables, journal, result)
}

fn apply_update(
    tables: &mut TableMap,
    table_id: TableId,
    updates: RowUpdateSet,
    lists: UpdateLists,
    journal: &mut Journal,
) -> EmberResult<usize> {
    for (id, set) in lists {
        journal.replace(tables, id, set, false)?;
    }
    journal.replace(tables, table_id, updates, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{RowStorage, RowStore};

    fn rows(n: usize) -> Vec<RowRef> {
        let mut store = RowStore::new(CompareOptions::default());
        (0..n)
            .map(|i| {
                store
                    .insert_row(vec![Value::Integer(i as i32)], 1, RowStorage::InMemory)
                    .unwrap()
            })
            .collect()
    }

    fn ints(v: &[i32]) -> Vec<Value> {
        v.iter().map(|&i| Value::Integer(i)).collect()
    }

    #[test]
    fn test_merge_update_takes_only_columns() {
        let r = rows(1);
        let mut set = RowUpdateSet::default();
        set.merge_update(r[0], ints(&[1, 2, 3]), &[0]);
        set.merge_update(r[0], ints(&[9, 9, 9]), &[2]);
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(r[0]).unwrap(), ints(&[1, 2, 9]).as_slice());
    }

    #[test]
    fn test_merge_keep_update() {
        let r = rows(2);
        let opts = CompareOptions::default();
        let original = ints(&[1, 10, 100]);

        // statement sets column 1; cascade leaves column 1 as it was
        let mut set = RowUpdateSet::default();
        set.put(r[0], ints(&[1, 20, 100]));
        assert!(set.merge_keep_update(r[0], &[1], ints(&[1, 10, 555]), &original, &opts));
        assert_eq!(set.get(r[0]).unwrap(), ints(&[1, 20, 555]).as_slice());

        // cascade agrees with the statement on column 1
        let mut set = RowUpdateSet::default();
        set.put(r[0], ints(&[1, 20, 100]));
        assert!(set.merge_keep_update(r[0], &[1], ints(&[7, 20, 100]), &original, &opts));
        assert_eq!(set.get(r[0]).unwrap(), ints(&[7, 20, 100]).as_slice());

        // cascade sets column 1 to a third value
        let mut set = RowUpdateSet::default();
        set.put(r[0], ints(&[1, 20, 100]));
        assert!(!set.merge_keep_update(r[0], &[1], ints(&[1, 30, 100]), &original, &opts));
        assert_eq!(set.get(r[0]).unwrap(), ints(&[1, 20, 100]).as_slice());

        // rows the statement does not touch are added whole
        assert!(set.merge_keep_update(r[1], &[1], ints(&[2, 2, 2]), &original, &opts));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_set_keeps_insertion_order() {
        let r = rows(3);
        let mut set = RowUpdateSet::default();
        set.put(r[2], ints(&[2]));
        set.put(r[0], ints(&[0]));
        set.put(r[2], ints(&[22]));
        let order: Vec<RowRef> = set.iter().map(|(row, _)| row).collect();
        assert_eq!(order, vec![r[2], r[0]]);
        assert_eq!(set.into_entries()[0].1, ints(&[22]));
    }
}
