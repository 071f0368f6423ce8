//! Tables: schema, index list, constraints and row lifecycle.
//!
//! A table owns its rows in a [`RowStore`] and keeps one [`Index`] per
//! entry of its index list. Index 0 is always the primary index; the rest
//! follow in a fixed precedence:
//!
//! ```text
//!   [0] primary key
//!   [.] unique constraint indexes     (order 0)
//!   [.] foreign key indexes           (order 1)
//!   [.] user indexes                  (order 2)
//!   [.] forward foreign key indexes   (order 4)
//! ```
//!
//! Every live row has exactly one node per index, at the same ordinal as
//! the index. Row insertion is all-or-none across the index list.
//!
//! Operations that span tables (foreign key checks and cascades) live in
//! [`crate::database::Database`]; the methods here only touch this table.

mod alter;
pub(crate) mod cascade;
mod constraint;
mod persist;

use std::sync::Arc;

use ember_common::config::StorageConfig;
use ember_common::{DataType, DiskKey, EmberError, EmberResult, TableId, Value};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::DataFileCache;
use crate::index::{Index, IndexDef, IndexIter};
use crate::row::{RowData, RowLoader, RowRef, RowStorage, RowStore};

pub use alter::TableChange;
pub use cascade::{CascadePath, RowUpdateSet, TableMap, UpdateLists};
pub use constraint::{
    CheckCondition, Constraint, ConstraintBody, ConstraintCore, ConstraintType, ReferentialAction,
};
pub use persist::parse_roots;

/// Name of the synthetic key column added to tables without a primary key.
pub const HIDDEN_COLUMN_NAME: &str = "SYS_ROW_ID";

/// Where a table keeps its rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TableKind {
    /// Rows live only in memory.
    #[default]
    Memory,
    /// Rows are persisted in the database data file.
    Disk,
}

/// A column definition.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// Column name.
    pub name: String,
    /// Declared type.
    pub data_type: DataType,
    /// Whether NULL is accepted.
    pub nullable: bool,
    /// Value used by SET DEFAULT actions and when a column is added.
    pub default: Value,
    /// Values are generated when NULL is supplied.
    pub identity: bool,
}

impl Column {
    /// A nullable column without default.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable: true,
            default: Value::Null,
            identity: false,
        }
    }

    /// Marks the column NOT NULL.
    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Sets the default value.
    #[must_use]
    pub fn with_default(mut self, default: Value) -> Self {
        self.default = default;
        self
    }

    /// Marks the column as an identity column.
    #[must_use]
    pub fn identity(mut self) -> Self {
        self.identity = true;
        self
    }
}

/// Declared shape of a table.
#[derive(Debug, Clone, Default)]
pub struct TableDef {
    /// Table name.
    pub name: String,
    /// Columns in order.
    pub columns: Vec<Column>,
    /// Primary key columns. Empty means a hidden row id is used.
    pub primary_key: Vec<usize>,
    /// Storage kind.
    pub kind: TableKind,
}

impl TableDef {
    /// Starts a table definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Appends a column.
    #[must_use]
    pub fn column(mut self, column: Column) -> Self {
        self.columns.push(column);
        self
    }

    /// Sets the primary key.
    #[must_use]
    pub fn primary_key(mut self, columns: Vec<usize>) -> Self {
        self.primary_key = columns;
        self
    }

    /// Sets the storage kind.
    #[must_use]
    pub fn kind(mut self, kind: TableKind) -> Self {
        self.kind = kind;
        self
    }
}

/// A table and its rows.
pub struct Table {
    id: TableId,
    name: String,
    kind: TableKind,
    /// All columns, the hidden row id last when present.
    columns: Vec<Column>,
    types: Vec<DataType>,
    primary_key: Vec<usize>,
    has_hidden_key: bool,
    indexes: Vec<Index>,
    constraints: Vec<Constraint>,
    store: RowStore,
    identity_column: Option<usize>,
    next_identity: i64,
    next_row_id: i64,
    strict_column_size: bool,
    cache: Option<Arc<Mutex<DataFileCache>>>,
}

impl Table {
    /// Creates an empty table with its primary index.
    pub fn new(
        id: TableId,
        def: TableDef,
        config: &StorageConfig,
        cache: Option<Arc<Mutex<DataFileCache>>>,
    ) -> EmberResult<Self> {
        let TableDef {
            name,
            mut columns,
            primary_key,
            kind,
        } = def;

        if columns.is_empty() {
            return Err(EmberError::invalid_argument(format!(
                "table {} has no columns",
                name
            )));
        }
        for (i, column) in columns.iter().enumerate() {
            if columns[..i].iter().any(|c| c.name == column.name) {
                return Err(EmberError::AlreadyExists {
                    kind: "column",
                    name: column.name.clone(),
                });
            }
        }
        for &col in &primary_key {
            match columns.get_mut(col) {
                Some(column) => column.nullable = false,
                None => {
                    return Err(EmberError::ColumnNotFound {
                        column: col.to_string(),
                        table: name,
                    })
                }
            }
        }

        let identities: Vec<usize> = columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.identity)
            .map(|(i, _)| i)
            .collect();
        if identities.len() > 1 {
            return Err(EmberError::invalid_argument(format!(
                "table {} has more than one identity column",
                name
            )));
        }

        let has_hidden_key = primary_key.is_empty();
        if has_hidden_key {
            columns.push(Column::new(HIDDEN_COLUMN_NAME, DataType::BigInt).not_null());
        }

        let cache = match (kind, cache) {
            (TableKind::Disk, Some(cache)) => Some(cache),
            (TableKind::Disk, None) => {
                return Err(EmberError::invalid_argument(format!(
                    "disk table {} requires a data file",
                    name
                )))
            }
            (TableKind::Memory, _) => None,
        };

        let types: Vec<DataType> = columns.iter().map(|c| c.data_type).collect();
        let pk_columns = if has_hidden_key {
            vec![columns.len() - 1]
        } else {
            primary_key.clone()
        };
        let pk_types = pk_columns.iter().map(|&c| types[c]).collect();
        let pk_def = IndexDef::new(format!("SYS_IDX_PK_{}", name), primary_key.clone())
            .unique(true)
            .constraint(true);

        let mut store =
            RowStore::new(config.compare_options()).with_change_tracking(kind == TableKind::Disk);
        if let Some(cache) = &cache {
            store = store.with_loader(RowLoader::new(
                Arc::clone(cache),
                types.clone(),
                config.max_cached_rows,
            ));
        }

        debug!(table = %name, id = %id, columns = columns.len(), ?kind, "created table");

        Ok(Self {
            id,
            kind,
            types,
            primary_key,
            has_hidden_key,
            indexes: vec![Index::new(pk_def, pk_columns, pk_types, 0)],
            constraints: Vec::new(),
            store,
            identity_column: identities.first().copied(),
            next_identity: 1,
            next_row_id: 1,
            strict_column_size: config.strict_column_size,
            cache,
            columns,
            name,
        })
    }

    // =========================================================================
    // Schema accessors
    // =========================================================================

    /// Table id.
    #[inline]
    pub fn id(&self) -> TableId {
        self.id
    }

    /// Table name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Storage kind.
    pub fn kind(&self) -> TableKind {
        self.kind
    }

    /// Returns true for disk tables.
    pub fn is_disk(&self) -> bool {
        self.kind == TableKind::Disk
    }

    /// All columns, including the hidden row id.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Columns declared by the user.
    pub fn visible_columns(&self) -> &[Column] {
        &self.columns[..self.visible_column_count()]
    }

    /// Number of declared columns.
    pub fn visible_column_count(&self) -> usize {
        self.columns.len() - usize::from(self.has_hidden_key)
    }

    /// Total number of row fields.
    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Types of all row fields.
    pub fn column_types(&self) -> &[DataType] {
        &self.types
    }

    /// Position of the column called `name`.
    pub fn column_index(&self, name: &str) -> EmberResult<usize> {
        self.columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| EmberError::ColumnNotFound {
                column: name.to_string(),
                table: self.name.clone(),
            })
    }

    /// Declared primary key columns. Empty with a hidden row id.
    pub fn primary_key(&self) -> &[usize] {
        &self.primary_key
    }

    /// Returns true if the table uses a hidden row id as its key.
    pub fn has_hidden_key(&self) -> bool {
        self.has_hidden_key
    }

    /// Columns the primary index is built on, hidden row id included.
    pub(crate) fn key_columns(&self) -> Vec<usize> {
        if self.has_hidden_key {
            vec![self.columns.len() - 1]
        } else {
            self.primary_key.clone()
        }
    }

    /// The row arena.
    pub fn store(&self) -> &RowStore {
        &self.store
    }

    // =========================================================================
    // Indexes
    // =========================================================================

    /// The index list in order.
    pub fn indexes(&self) -> &[Index] {
        &self.indexes
    }

    /// The primary index.
    pub fn primary_index(&self) -> &Index {
        &self.indexes[0]
    }

    /// Index called `name`, if any.
    pub fn index_by_name(&self, name: &str) -> Option<&Index> {
        self.indexes.iter().find(|i| i.name() == name)
    }

    /// Position of the index called `name`.
    pub fn index_position(&self, name: &str) -> EmberResult<usize> {
        self.indexes
            .iter()
            .position(|i| i.name() == name)
            .ok_or_else(|| EmberError::IndexNotFound {
                index: name.to_string(),
            })
    }

    /// Unique index whose visible columns are exactly `columns`.
    pub fn unique_index_for(&self, columns: &[usize]) -> Option<&Index> {
        self.indexes
            .iter()
            .find(|i| i.is_unique() && i.visible_count() > 0 && i.visible_columns() == columns)
    }

    /// Builds an index for this table, appending the key suffix.
    fn build_index(&self, def: IndexDef, position: usize) -> EmberResult<Index> {
        for (i, &col) in def.columns.iter().enumerate() {
            if col >= self.columns.len() {
                return Err(EmberError::ColumnNotFound {
                    column: col.to_string(),
                    table: self.name.clone(),
                });
            }
            if def.columns[..i].contains(&col) {
                return Err(EmberError::invalid_argument(format!(
                    "column {} repeated in index {}",
                    col, def.name
                )));
            }
        }
        let mut columns = def.columns.clone();
        for col in self.key_columns() {
            if !columns.contains(&col) {
                columns.push(col);
            }
        }
        let types = columns.iter().map(|&c| self.types[c]).collect();
        Ok(Index::new(def, columns, types, position))
    }

    /// Position a new index takes in the index list.
    fn index_insert_position(&self, def: &IndexDef) -> usize {
        let order = def.order_value();
        (1..self.indexes.len())
            .find(|&i| order < self.indexes[i].def().order_value())
            .unwrap_or(self.indexes.len())
    }

    /// Adds an index and links every existing row into it.
    ///
    /// On a unique violation the partially built index is removed again.
    /// Disk tables only accept new indexes while empty; populated disk
    /// tables are rebuilt through [`move_definition`](Self::move_definition).
    pub(crate) fn attach_index(&mut self, def: IndexDef) -> EmberResult<usize> {
        if self.index_by_name(&def.name).is_some() {
            return Err(EmberError::AlreadyExists {
                kind: "index",
                name: def.name,
            });
        }
        if self.is_disk() && !self.store.is_empty() {
            return Err(EmberError::not_supported("in place index change on a disk table"));
        }

        let position = self.index_insert_position(&def);
        let index = self.build_index(def, position)?;
        let rows = self.rows()?;

        self.store.insert_chain_position(position)?;
        for later in &mut self.indexes[position..] {
            later.set_position(later.position() + 1);
        }
        self.indexes.insert(position, index);

        for (k, &row) in rows.iter().enumerate() {
            if let Err(e) = self.indexes[position].insert(&mut self.store, row) {
                for &done in &rows[..k] {
                    self.indexes[position].delete(&mut self.store, done)?;
                }
                self.remove_index_at(position)?;
                return Err(e);
            }
        }

        debug!(
            table = %self.name,
            index = self.indexes[position].name(),
            position,
            rows = rows.len(),
            "created index"
        );
        Ok(position)
    }

    /// Removes the index called `name` and its node from every row.
    pub(crate) fn detach_index(&mut self, name: &str) -> EmberResult<Index> {
        let position = self.index_position(name)?;
        if position == 0 {
            return Err(EmberError::IndexInUse {
                index: name.to_string(),
            });
        }
        if self.is_disk() && !self.store.is_empty() {
            return Err(EmberError::not_supported("in place index change on a disk table"));
        }
        let index = self.remove_index_at(position)?;
        debug!(table = %self.name, index = name, "dropped index");
        Ok(index)
    }

    fn remove_index_at(&mut self, position: usize) -> EmberResult<Index> {
        self.store.remove_chain_position(position)?;
        let index = self.indexes.remove(position);
        for later in &mut self.indexes[position..] {
            later.set_position(later.position() - 1);
        }
        Ok(index)
    }

    /// Verifies that the index called `name` may be dropped.
    ///
    /// The primary index and indexes backing constraints are refused.
    pub fn check_drop_index(&self, name: &str) -> EmberResult<usize> {
        let position = self.index_position(name)?;
        let in_use = position == 0
            || self
                .constraints
                .iter()
                .any(|c| c.index_name() == Some(name));
        if in_use {
            return Err(EmberError::IndexInUse {
                index: name.to_string(),
            });
        }
        Ok(position)
    }

    // =========================================================================
    // Constraints
    // =========================================================================

    /// The constraint list.
    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    /// Constraint called `name`, if any.
    pub fn constraint(&self, name: &str) -> Option<&Constraint> {
        self.constraints.iter().find(|c| c.name() == name)
    }

    /// Returns true if another table's foreign key references this table.
    pub fn has_main_constraints(&self) -> bool {
        self.constraints
            .iter()
            .any(|c| c.constraint_type() == ConstraintType::Main)
    }

    pub(crate) fn add_constraint(&mut self, constraint: Constraint) {
        self.constraints.push(constraint);
    }

    pub(crate) fn remove_constraint(&mut self, name: &str) -> Option<Constraint> {
        let i = self.constraints.iter().position(|c| c.name() == name)?;
        Some(self.constraints.remove(i))
    }

    /// Installs `core` in the foreign key half that shares its id.
    pub(crate) fn replace_core(&mut self, core: &Arc<ConstraintCore>) {
        for c in &mut self.constraints {
            if c.core().map_or(false, |old| old.id == core.id) {
                c.set_core(Arc::clone(core));
            }
        }
    }

    /// Evaluates every CHECK constraint against `data`.
    pub fn check_row_constraints(&self, data: &[Value]) -> EmberResult<()> {
        for c in &self.constraints {
            c.check_row(data, &self.name)?;
        }
        Ok(())
    }

    // =========================================================================
    // Rows
    // =========================================================================

    /// Number of live rows.
    pub fn row_count(&self) -> usize {
        self.store.len()
    }

    /// Field values of `row`, read back from the data file if evicted.
    pub fn row_data(&self, row: RowRef) -> EmberResult<RowData> {
        self.store.data(row)
    }

    /// Returns true while `row` is live.
    pub fn contains(&self, row: RowRef) -> bool {
        self.store.contains(row)
    }

    /// Rows in primary key order.
    pub fn iter_rows(&self) -> IndexIter<'_> {
        self.indexes[0].first_row(&self.store)
    }

    /// Collects the rows in primary key order.
    pub fn rows(&self) -> EmberResult<Vec<RowRef>> {
        self.iter_rows().collect()
    }

    /// Finds a row by its declared primary key.
    pub fn find_row(&self, key: &[Value]) -> EmberResult<Option<RowRef>> {
        let pk = &self.indexes[0];
        if pk.visible_count() == 0 || key.len() != pk.visible_count() {
            return Err(EmberError::invalid_argument(format!(
                "table {} takes a key of {} values",
                self.name,
                pk.visible_count()
            )));
        }
        let map: Vec<usize> = (0..key.len()).collect();
        pk.find_not_null(&self.store, key, &map)?
            .map(|n| self.store.row_of(n))
            .transpose()
    }

    /// Rows of this (referencing) table that match `parent` through `core`.
    pub fn find_fk_rows(&self, core: &ConstraintCore, parent: &[Value]) -> EmberResult<Vec<RowRef>> {
        let index = self.index_by_name(&core.ref_index).ok_or_else(|| EmberError::IndexNotFound {
            index: core.ref_index.clone(),
        })?;
        index.find_rows(&self.store, parent, &core.main_columns)
    }

    /// Row of this (referenced) table that `child` points at through `core`.
    pub fn find_referenced_row(
        &self,
        core: &ConstraintCore,
        child: &[Value],
    ) -> EmberResult<Option<RowRef>> {
        let index = self
            .index_by_name(&core.main_index)
            .ok_or_else(|| EmberError::IndexNotFound {
                index: core.main_index.clone(),
            })?;
        index
            .find_not_null(&self.store, child, &core.ref_columns)?
            .map(|n| self.store.row_of(n))
            .transpose()
    }

    /// Fills generated values and enforces column limits and NOT NULL.
    ///
    /// A row of a table with a hidden key may omit the hidden field.
    pub fn prepare_row(&mut self, mut data: Vec<Value>) -> EmberResult<Vec<Value>> {
        if self.has_hidden_key && data.len() + 1 == self.columns.len() {
            data.push(Value::Null);
        }
        if data.len() != self.columns.len() {
            return Err(EmberError::invalid_argument(format!(
                "table {} has {} columns, row has {}",
                self.name,
                self.visible_column_count(),
                data.len()
            )));
        }
        self.set_identity(&mut data)?;
        self.enforce_field_limits(&mut data, None)?;
        self.enforce_not_null(&data)?;
        Ok(data)
    }

    /// Prepares the new data of an updated row.
    ///
    /// Only `cols` are converted and size checked; NOT NULL is checked on
    /// the whole row.
    pub(crate) fn prepare_update(&mut self, data: &mut Vec<Value>, cols: &[usize]) -> EmberResult<()> {
        if data.len() != self.columns.len() {
            return Err(EmberError::invalid_argument(format!(
                "table {} has {} fields, update has {}",
                self.name,
                self.columns.len(),
                data.len()
            )));
        }
        if let Some(&col) = cols.iter().find(|&&c| c >= self.columns.len()) {
            return Err(EmberError::ColumnNotFound {
                column: col.to_string(),
                table: self.name.clone(),
            });
        }
        self.set_identity(data)?;
        self.enforce_field_limits(data, Some(cols))?;
        self.enforce_not_null(data)
    }

    fn set_identity(&mut self, data: &mut [Value]) -> EmberResult<()> {
        if self.has_hidden_key {
            let hidden = self.columns.len() - 1;
            match data[hidden].to_i64() {
                Some(v) => self.next_row_id = self.next_row_id.max(self.successor(v, "row id")?),
                None => {
                    let next = self.successor(self.next_row_id, "row id")?;
                    data[hidden] = Value::BigInt(self.next_row_id);
                    self.next_row_id = next;
                }
            }
        }
        if let Some(col) = self.identity_column {
            if data[col].is_null() {
                let next = self.successor(self.next_identity, "identity")?;
                data[col] = Value::BigInt(self.next_identity).convert_to(&self.types[col])?;
                self.next_identity = next;
            } else if let Some(v) = data[col].to_i64() {
                self.next_identity = self.next_identity.max(self.successor(v, "identity")?);
            }
        }
        Ok(())
    }

    /// Counter value following `v`.
    fn successor(&self, v: i64, sequence: &'static str) -> EmberResult<i64> {
        v.checked_add(1).ok_or_else(|| EmberError::SequenceExhausted {
            sequence,
            table: self.name.clone(),
        })
    }

    /// Converts values to their column types and applies size limits.
    ///
    /// CHAR values are padded to their length. Over-long character values
    /// are truncated, or rejected in strict mode. With `cols` only those
    /// positions are checked.
    pub fn enforce_field_limits(&self, data: &mut [Value], cols: Option<&[usize]>) -> EmberResult<()> {
        let all: Vec<usize>;
        let cols = match cols {
            Some(cols) => cols,
            None => {
                all = (0..self.columns.len()).collect();
                &all
            }
        };

        for &col in cols {
            let column = &self.columns[col];
            let mut value = data[col].convert_to(&column.data_type)?;
            if let (Value::String(s), Some(max)) = (&mut value, column.data_type.max_length()) {
                let length = s.chars().count();
                if length > max {
                    if self.strict_column_size {
                        return Err(EmberError::StringTruncation {
                            column: column.name.clone(),
                            table: self.name.clone(),
                            length,
                            max,
                        });
                    }
                    *s = s.chars().take(max).collect();
                } else if matches!(column.data_type, DataType::Char(_)) && length < max {
                    s.extend(std::iter::repeat(' ').take(max - length));
                }
            }
            data[col] = value;
        }
        Ok(())
    }

    fn enforce_not_null(&self, data: &[Value]) -> EmberResult<()> {
        for (column, value) in self.columns.iter().zip(data) {
            if !column.nullable && value.is_null() {
                return Err(EmberError::NullViolation {
                    column: column.name.clone(),
                    table: self.name.clone(),
                });
            }
        }
        Ok(())
    }

    /// Inserts a row after local checks.
    ///
    /// Foreign keys are not checked here; use
    /// [`Database::insert`](crate::database::Database::insert) for that.
    pub fn insert(&mut self, data: Vec<Value>) -> EmberResult<RowRef> {
        let data = self.prepare_row(data)?;
        self.insert_prepared(data)
    }

    /// Checks CHECK constraints on a prepared row and inserts it.
    pub(crate) fn insert_prepared(&mut self, data: Vec<Value>) -> EmberResult<RowRef> {
        self.check_row_constraints(&data)?;
        let row = self.insert_no_check(data)?;
        self.sync()?;
        Ok(row)
    }

    /// Creates a row and links it into every index, or into none.
    pub fn insert_no_check(&mut self, data: Vec<Value>) -> EmberResult<RowRef> {
        let node_count = self.indexes.len();
        let (storage, disk) = match &self.cache {
            Some(cache) => {
                let mut cache = cache.lock();
                let size = cache.row_size(&data, &self.types, node_count)?;
                let pos = cache.allocate(size)?;
                let key = DiskKey::new(pos, cache.generation());
                (RowStorage::disk(key, cache.is_mapped()), Some((pos, size)))
            }
            None => (RowStorage::InMemory, None),
        };

        let row = match self.store.insert_row(data, node_count, storage) {
            Ok(row) => row,
            Err(e) => {
                self.free_disk(disk);
                return Err(e);
            }
        };

        if let Err(e) = self.index_row(row) {
            self.store.remove_row(row);
            self.free_disk(disk);
            return Err(e);
        }
        Ok(row)
    }

    fn free_disk(&self, disk: Option<(u64, usize)>) {
        if let (Some(cache), Some((pos, size))) = (&self.cache, disk) {
            cache.lock().free(pos, size);
        }
    }

    /// Links `row` into every index in order, unwinding on failure.
    fn index_row(&mut self, row: RowRef) -> EmberResult<()> {
        for i in 0..self.indexes.len() {
            if let Err(e) = self.indexes[i].insert(&mut self.store, row) {
                for j in (0..i).rev() {
                    self.indexes[j].delete(&mut self.store, row)?;
                }
                return Err(self.unique_violation(e));
            }
        }
        Ok(())
    }

    /// Names the constraint behind a unique index violation.
    fn unique_violation(&self, error: EmberError) -> EmberError {
        match error {
            EmberError::UniqueIndexViolation { index } => {
                let constraint = self
                    .constraints
                    .iter()
                    .find(|c| c.index_name() == Some(index.as_str()))
                    .map(|c| c.name().to_string())
                    .unwrap_or(index);
                EmberError::UniqueViolation {
                    constraint,
                    table: self.name.clone(),
                }
            }
            other => other,
        }
    }

    /// Unlinks `row` from every index and releases it.
    ///
    /// No constraint is consulted. Returns the row's field values.
    pub fn delete_no_check(&mut self, row: RowRef) -> EmberResult<Vec<Value>> {
        let data = self.store.data(row)?.to_vec();
        for index in &mut self.indexes {
            index.delete(&mut self.store, row)?;
        }
        let removed = self
            .store
            .remove_row(row)
            .ok_or_else(|| EmberError::RowDeleted {
                table: self.name.clone(),
            })?;

        if let (Some(cache), Some(key)) = (&self.cache, removed.key()) {
            let mut cache = cache.lock();
            let size = cache.row_size(&data, &self.types, self.indexes.len())?;
            cache.free(key.offset(), size);
        }
        Ok(data)
    }

    /// Replaces every row of `set` with its new data.
    ///
    /// All rows are deleted first, then all new rows inserted. A row of the
    /// set that is no longer live fails the call with `TriggeredDataChange`
    /// when `nodelete` is set and is skipped otherwise. If an insert fails,
    /// the rows inserted so far are removed and the old data reinserted.
    pub fn update_row_set(&mut self, set: RowUpdateSet, nodelete: bool) -> EmberResult<usize> {
        self.apply_row_set(set, nodelete).map(|applied| applied.len())
    }

    /// Like [`update_row_set`](Self::update_row_set), returning what is
    /// needed to undo the replacement later.
    pub(crate) fn apply_row_set(
        &mut self,
        set: RowUpdateSet,
        nodelete: bool,
    ) -> EmberResult<AppliedRows> {
        let mut entries = Vec::with_capacity(set.len());
        for (row, mut data) in set.into_entries() {
            if !self.store.contains(row) {
                if nodelete {
                    return Err(EmberError::TriggeredDataChange {
                        table: self.name.clone(),
                    });
                }
                continue;
            }
            self.enforce_field_limits(&mut data, None)?;
            self.enforce_not_null(&data)?;
            self.check_row_constraints(&data)?;
            entries.push((row, data));
        }

        let mut applied = AppliedRows {
            inserted: Vec::with_capacity(entries.len()),
            old: Vec::with_capacity(entries.len()),
        };
        for (row, _) in entries.iter().rev() {
            applied.old.push(self.delete_no_check(*row)?);
        }
        for (_, data) in entries {
            match self.insert_no_check(data) {
                Ok(row) => applied.inserted.push(row),
                Err(e) => {
                    self.undo_row_set(applied)?;
                    return Err(e);
                }
            }
        }
        self.sync()?;
        Ok(applied)
    }

    /// Removes the rows a replacement inserted and reinserts the rows it
    /// deleted.
    pub(crate) fn undo_row_set(&mut self, applied: AppliedRows) -> EmberResult<()> {
        for row in applied.inserted {
            if self.store.contains(row) {
                self.delete_no_check(row)?;
            }
        }
        for data in applied.old {
            self.insert_no_check(data)?;
        }
        self.sync()
    }

    /// Deletes every row, releasing its disk space.
    pub(crate) fn release_storage(&mut self) -> EmberResult<()> {
        if let Some(cache) = &self.cache {
            let mut saved = Vec::new();
            for (handle, row) in self.store.rows() {
                if let Some(key) = row.key() {
                    saved.push((key, self.store.data(handle)?));
                }
            }
            let mut cache = cache.lock();
            let node_count = self.indexes.len();
            for (key, data) in saved {
                let size = cache.row_size(&data, &self.types, node_count)?;
                cache.free(key.offset(), size);
            }
        }
        self.store.clear();
        for index in &mut self.indexes {
            index.clear();
        }
        Ok(())
    }
}

/// Rows replaced by one [`Table::apply_row_set`].
#[derive(Debug, Default)]
pub(crate) struct AppliedRows {
    inserted: Vec<RowRef>,
    old: Vec<Vec<Value>>,
}

impl AppliedRows {
    /// Number of replaced rows.
    pub(crate) fn len(&self) -> usize {
        self.inserted.len()
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("columns", &self.columns.len())
            .field("indexes", &self.indexes.len())
            .field("rows", &self.store.len())
            .finish()
    }
}
