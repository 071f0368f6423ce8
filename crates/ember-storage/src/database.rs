//! The database registry.
//!
//! [`Database`] owns every table of one database, keyed by [`TableId`], and
//! the shared data file cache of its disk tables. Schema changes that touch
//! more than one table (foreign keys, table rebuilds) and all row changes
//! that may cascade go through it.
//!
//! # Example
//!
//! ```rust,no_run
//! use ember_common::config::DatabaseConfig;
//! use ember_common::{DataType, Value};
//! use ember_storage::database::Database;
//! use ember_storage::table::{Column, TableDef};
//!
//! fn example() -> ember_common::EmberResult<()> {
//!     let mut db = Database::open(DatabaseConfig::for_testing())?;
//!     let id = db.create_table(
//!         TableDef::new("T")
//!             .column(Column::new("ID", DataType::Integer))
//!             .primary_key(vec![0]),
//!     )?;
//!     db.insert(id, vec![Value::Integer(1)])?;
//!     assert_eq!(db.table(id)?.row_count(), 1);
//!     Ok(())
//! }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use ember_common::config::DatabaseConfig;
use ember_common::{ConstraintId, EmberError, EmberResult, TableId, Value};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cache::DataFileCache;
use crate::codec::ProviderRegistry;
use crate::defrag::{self, DefragResult, DefragTable};
use crate::index::IndexDef;
use crate::row::RowRef;
use crate::table::cascade::{self, table_mut, table_ref};
use crate::table::{
    parse_roots, CheckCondition, Column, Constraint, ConstraintBody, ConstraintCore, ConstraintType,
    ReferentialAction, RowUpdateSet, Table, TableChange, TableDef, TableKind, TableMap,
};

/// Definition of a foreign key.
#[derive(Debug, Clone)]
pub struct ForeignKeyDef {
    /// Constraint name.
    pub name: String,
    /// Referencing (child) table.
    pub table: TableId,
    /// Referencing columns.
    pub columns: Vec<usize>,
    /// Referenced (parent) table.
    pub ref_table: TableId,
    /// Referenced columns, parallel to `columns`.
    pub ref_columns: Vec<usize>,
    /// Action on delete of a parent row.
    pub on_delete: ReferentialAction,
    /// Action on update of parent key columns.
    pub on_update: ReferentialAction,
}

impl ForeignKeyDef {
    /// Creates a NO ACTION foreign key.
    pub fn new(
        name: impl Into<String>,
        table: TableId,
        columns: Vec<usize>,
        ref_table: TableId,
        ref_columns: Vec<usize>,
    ) -> Self {
        Self {
            name: name.into(),
            table,
            columns,
            ref_table,
            ref_columns,
            on_delete: ReferentialAction::NoAction,
            on_update: ReferentialAction::NoAction,
        }
    }

    /// Sets the delete action.
    #[must_use]
    pub fn on_delete(mut self, action: ReferentialAction) -> Self {
        self.on_delete = action;
        self
    }

    /// Sets the update action.
    #[must_use]
    pub fn on_update(mut self, action: ReferentialAction) -> Self {
        self.on_update = action;
        self
    }
}

/// All tables of one database.
pub struct Database {
    config: DatabaseConfig,
    registry: ProviderRegistry,
    tables: TableMap,
    names: HashMap<String, TableId>,
    next_table_id: u32,
    next_constraint_id: ConstraintId,
    cache: Option<Arc<Mutex<DataFileCache>>>,
}

impl Database {
    /// Opens a database with the default row formats.
    ///
    /// The data file is created or opened when the first disk table is.
    pub fn open(config: DatabaseConfig) -> EmberResult<Self> {
        Self::with_registry(config, ProviderRegistry::with_defaults())
    }

    /// Opens a database that picks its row format from `registry`.
    pub fn with_registry(config: DatabaseConfig, registry: ProviderRegistry) -> EmberResult<Self> {
        config
            .validate()
            .map_err(|message| EmberError::InvalidConfig { message })?;
        info!(name = %config.name, dir = %config.data_dir.display(), "opened database");
        Ok(Self {
            config,
            registry,
            tables: TableMap::new(),
            names: HashMap::new(),
            next_table_id: 1,
            next_constraint_id: ConstraintId::new(1),
            cache: None,
        })
    }

    /// The configuration.
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// The shared data file cache, opening it on first use.
    fn data_file(&mut self) -> EmberResult<Arc<Mutex<DataFileCache>>> {
        if let Some(cache) = &self.cache {
            return Ok(Arc::clone(cache));
        }
        std::fs::create_dir_all(&self.config.data_dir)?;
        let cache = DataFileCache::open(
            self.config.data_file_path(),
            &self.config.storage,
            &self.registry,
        )?;
        let cache = Arc::new(Mutex::new(cache));
        self.cache = Some(Arc::clone(&cache));
        Ok(cache)
    }

    /// The data file cache, if a disk table has opened it.
    pub fn data_file_cache(&self) -> Option<&Arc<Mutex<DataFileCache>>> {
        self.cache.as_ref()
    }

    fn next_constraint_id(&mut self) -> ConstraintId {
        let id = self.next_constraint_id;
        self.next_constraint_id = id.next();
        id
    }

    // =========================================================================
    // Tables
    // =========================================================================

    /// Id of the table called `name`.
    pub fn table_id(&self, name: &str) -> EmberResult<TableId> {
        self.names
            .get(name)
            .copied()
            .ok_or_else(|| EmberError::TableNotFound {
                table: name.to_string(),
            })
    }

    /// Table by id.
    pub fn table(&self, id: TableId) -> EmberResult<&Table> {
        table_ref(&self.tables, id)
    }

    /// Table by name.
    pub fn table_by_name(&self, name: &str) -> EmberResult<&Table> {
        self.table(self.table_id(name)?)
    }

    /// Every table in id order.
    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    /// Creates a table and returns its id.
    pub fn create_table(&mut self, def: TableDef) -> EmberResult<TableId> {
        if self.names.contains_key(&def.name) {
            return Err(EmberError::AlreadyExists {
                kind: "table",
                name: def.name,
            });
        }
        let cache = match def.kind {
            TableKind::Disk => Some(self.data_file()?),
            TableKind::Memory => None,
        };
        let id = TableId::new(self.next_table_id);
        let name = def.name.clone();
        let table = Table::new(id, def, &self.config.storage, cache)?;
        self.next_table_id += 1;
        self.names.insert(name, id);
        self.tables.insert(id, table);
        Ok(id)
    }

    /// Drops a table that no other table references.
    ///
    /// Its own foreign keys are removed from the tables they reference.
    pub fn drop_table(&mut self, id: TableId) -> EmberResult<()> {
        let table = self.table(id)?;
        for c in table.constraints() {
            if let (ConstraintType::Main, Some(core)) = (c.constraint_type(), c.core()) {
                if core.ref_table != id {
                    return Err(EmberError::IntegrityViolation {
                        constraint: core.fk_name.clone(),
                        table: table.name().to_string(),
                    });
                }
            }
        }
        let outgoing: Vec<Arc<ConstraintCore>> = table
            .constraints()
            .iter()
            .filter(|c| c.constraint_type() == ConstraintType::ForeignKey)
            .filter_map(|c| c.core().cloned())
            .filter(|core| core.main_table != id)
            .collect();
        for core in outgoing {
            table_mut(&mut self.tables, core.main_table)?.remove_constraint(&core.main_name);
        }

        let mut table = self
            .tables
            .remove(&id)
            .ok_or(EmberError::TableIdNotFound { table_id: id })?;
        self.names.remove(table.name());
        table.release_storage()?;
        info!(table = %table.name(), "dropped table");
        Ok(())
    }

    fn check_index_name(&self, name: &str) -> EmberResult<()> {
        if self.tables.values().any(|t| t.index_by_name(name).is_some()) {
            return Err(EmberError::AlreadyExists {
                kind: "index",
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn check_constraint_name(&self, name: &str) -> EmberResult<()> {
        if self.tables.values().any(|t| t.constraint(name).is_some()) {
            return Err(EmberError::AlreadyExists {
                kind: "constraint",
                name: name.to_string(),
            });
        }
        Ok(())
    }

    /// Creates an index over existing rows.
    ///
    /// A populated disk table is rebuilt with the new index.
    pub fn create_index(&mut self, id: TableId, def: IndexDef) -> EmberResult<()> {
        self.check_index_name(&def.name)?;
        let table = table_mut(&mut self.tables, id)?;
        if table.is_disk() && table.row_count() > 0 {
            return self.alter_table(id, TableChange::AddIndex(def));
        }
        table.attach_index(def)?;
        Ok(())
    }

    /// Drops an index that backs no constraint.
    pub fn drop_index(&mut self, id: TableId, name: &str) -> EmberResult<()> {
        let table = table_mut(&mut self.tables, id)?;
        table.check_drop_index(name)?;
        if table.is_disk() && table.row_count() > 0 {
            return self.alter_table(id, TableChange::DropIndex(name.to_string()));
        }
        table.detach_index(name)?;
        Ok(())
    }

    /// Adds a column at `position`, filling existing rows with its default.
    pub fn add_column(&mut self, id: TableId, column: Column, position: usize) -> EmberResult<()> {
        self.alter_table(id, TableChange::AddColumn { column, position })
    }

    /// Drops the declared column at `col`.
    pub fn drop_column(&mut self, id: TableId, col: usize) -> EmberResult<()> {
        self.table(id)?.check_drop_column(col)?;
        self.alter_table(id, TableChange::DropColumn(col))
    }

    /// Rebuilds table `id` with `change` applied and swaps it in.
    ///
    /// On failure the old table stays in place unchanged.
    fn alter_table(&mut self, id: TableId, change: TableChange) -> EmberResult<()> {
        let old = self.table(id)?;
        let mut new = old.move_definition(&change, &self.config.storage)?;
        new.move_data(old, &change)?;

        let cores: Vec<Arc<ConstraintCore>> = new
            .constraints()
            .iter()
            .filter_map(|c| c.core().cloned())
            .collect();
        for core in &cores {
            for other in [core.main_table, core.ref_table] {
                if other != id {
                    table_mut(&mut self.tables, other)?.replace_core(core);
                }
            }
        }

        let mut old = self
            .tables
            .insert(id, new)
            .ok_or(EmberError::TableIdNotFound { table_id: id })?;
        old.release_storage()?;
        debug!(table = %old.name(), ?change, "replaced table definition");
        Ok(())
    }

    // =========================================================================
    // Constraints
    // =========================================================================

    /// Adds a UNIQUE constraint backed by a new unique index.
    pub fn create_unique_constraint(
        &mut self,
        id: TableId,
        name: &str,
        columns: Vec<usize>,
    ) -> EmberResult<()> {
        self.check_constraint_name(name)?;
        let index = format!("SYS_IDX_{}", name);
        let def = IndexDef::new(index.clone(), columns.clone())
            .unique(true)
            .constraint(true);
        let table_name = self.table(id)?.name().to_string();
        self.create_index(id, def).map_err(|e| match e {
            EmberError::UniqueIndexViolation { .. } | EmberError::UniqueViolation { .. } => {
                EmberError::UniqueViolation {
                    constraint: name.to_string(),
                    table: table_name,
                }
            }
            e => e,
        })?;
        let cid = self.next_constraint_id();
        table_mut(&mut self.tables, id)?.add_constraint(Constraint::new(
            cid,
            name,
            ConstraintBody::Unique { columns, index },
        ));
        Ok(())
    }

    /// Adds a foreign key.
    ///
    /// The referenced columns need a unique index. Existing rows of the
    /// referencing table must all find their parent.
    pub fn create_foreign_key(&mut self, def: ForeignKeyDef) -> EmberResult<()> {
        self.check_constraint_name(&def.name)?;
        if def.columns.is_empty() || def.columns.len() != def.ref_columns.len() {
            return Err(EmberError::invalid_argument(format!(
                "foreign key {} has mismatched column lists",
                def.name
            )));
        }
        let parent = self.table(def.ref_table)?;
        let main_index = parent
            .unique_index_for(&def.ref_columns)
            .ok_or_else(|| EmberError::UniqueConstraintRequired {
                table: parent.name().to_string(),
            })?
            .name()
            .to_string();
        let child = self.table(def.table)?;
        for &col in &def.columns {
            let column = child
                .visible_columns()
                .get(col)
                .ok_or_else(|| EmberError::ColumnNotFound {
                    column: col.to_string(),
                    table: child.name().to_string(),
                })?;
            let sets_null = def.on_delete == ReferentialAction::SetNull
                || def.on_update == ReferentialAction::SetNull;
            if sets_null && !column.nullable {
                return Err(EmberError::invalid_argument(format!(
                    "SET NULL on NOT NULL column {} of {}",
                    column.name,
                    child.name()
                )));
            }
        }

        let cid = self.next_constraint_id;
        let ref_index = format!("SYS_IDX_{}", def.name);
        let core = Arc::new(ConstraintCore {
            id: cid,
            fk_name: def.name.clone(),
            main_name: format!("SYS_REF_{}", def.name),
            main_table: def.ref_table,
            main_columns: def.ref_columns.clone(),
            main_index,
            ref_table: def.table,
            ref_columns: def.columns.clone(),
            ref_index: ref_index.clone(),
            delete_action: def.on_delete,
            update_action: def.on_update,
        });

        for row in child.rows()? {
            cascade::check_referenced_row(&self.tables, &core, &child.row_data(row)?)?;
        }
        self.next_constraint_id = cid.next();

        let index = IndexDef::new(ref_index, def.columns.clone())
            .constraint(true)
            .forward(def.ref_table > def.table);
        self.create_index(def.table, index)?;
        table_mut(&mut self.tables, def.table)?.add_constraint(Constraint::new(
            cid,
            def.name.clone(),
            ConstraintBody::ForeignKey(Arc::clone(&core)),
        ));
        table_mut(&mut self.tables, def.ref_table)?.add_constraint(Constraint::new(
            cid,
            core.main_name.clone(),
            ConstraintBody::Main(Arc::clone(&core)),
        ));
        debug!(
            constraint = %def.name,
            on_delete = %def.on_delete,
            on_update = %def.on_update,
            "created foreign key"
        );
        Ok(())
    }

    /// Adds a CHECK constraint that every existing row satisfies.
    pub fn create_check_constraint(
        &mut self,
        id: TableId,
        name: &str,
        columns: Vec<usize>,
        condition: Arc<dyn CheckCondition>,
    ) -> EmberResult<()> {
        self.check_constraint_name(name)?;
        let cid = self.next_constraint_id();
        let table = table_mut(&mut self.tables, id)?;
        if let Some(&col) = columns.iter().find(|&&c| c >= table.visible_column_count()) {
            return Err(EmberError::ColumnNotFound {
                column: col.to_string(),
                table: table.name().to_string(),
            });
        }
        let constraint = Constraint::new(cid, name, ConstraintBody::Check { columns, condition });
        for row in table.rows()? {
            constraint.check_row(&table.row_data(row)?, table.name())?;
        }
        table.add_constraint(constraint);
        Ok(())
    }

    /// Drops a constraint.
    ///
    /// Dropping a foreign key also drops its index and the referenced
    /// table's half. The referenced half can't be dropped on its own.
    pub fn drop_constraint(&mut self, id: TableId, name: &str) -> EmberResult<()> {
        let table = self.table(id)?;
        let constraint = table
            .constraint(name)
            .ok_or_else(|| EmberError::ConstraintNotFound {
                name: name.to_string(),
                table: table.name().to_string(),
            })?
            .clone();
        match constraint.body() {
            ConstraintBody::Main(_) => {
                return Err(EmberError::DropSystemConstraint {
                    name: name.to_string(),
                })
            }
            ConstraintBody::Unique { index, .. } => {
                let used = self.tables.values().any(|t| {
                    t.constraints().iter().any(|c| {
                        c.constraint_type() == ConstraintType::ForeignKey
                            && c.core().map_or(false, |core| {
                                core.main_table == id && &core.main_index == index
                            })
                    })
                });
                if used {
                    return Err(EmberError::IndexInUse {
                        index: index.clone(),
                    });
                }
                let index = index.clone();
                table_mut(&mut self.tables, id)?.remove_constraint(name);
                self.drop_index(id, &index)?;
            }
            ConstraintBody::ForeignKey(core) => {
                table_mut(&mut self.tables, core.main_table)?.remove_constraint(&core.main_name);
                table_mut(&mut self.tables, id)?.remove_constraint(name);
                self.drop_index(id, &core.ref_index)?;
            }
            ConstraintBody::Check { .. } => {
                table_mut(&mut self.tables, id)?.remove_constraint(name);
            }
        }
        debug!(constraint = name, "dropped constraint");
        Ok(())
    }

    // =========================================================================
    // Rows
    // =========================================================================

    /// Inserts a row after checking its foreign keys.
    pub fn insert(&mut self, id: TableId, data: Vec<Value>) -> EmberResult<RowRef> {
        let data = table_mut(&mut self.tables, id)?.prepare_row(data)?;
        cascade::check_foreign_keys(&self.tables, id, &data)?;
        let table = table_mut(&mut self.tables, id)?;
        let row = table.insert_prepared(data)?;
        table.sync()?;
        Ok(row)
    }

    /// Deletes rows with all referential actions. Returns the number of
    /// rows of `id` deleted.
    pub fn delete(&mut self, id: TableId, rows: &[RowRef]) -> EmberResult<usize> {
        cascade::delete_rows(&mut self.tables, id, rows)
    }

    /// Applies `updates`, each the full new data of a row, where `cols` are
    /// the columns the statement sets.
    pub fn update_set(&mut self, id: TableId, updates: RowUpdateSet, cols: &[usize]) -> EmberResult<usize> {
        cascade::update_rows(&mut self.tables, id, updates, cols)
    }

    /// Sets `cols` to `values` in every row of `rows`.
    pub fn update(
        &mut self,
        id: TableId,
        rows: &[RowRef],
        cols: &[usize],
        values: &[Value],
    ) -> EmberResult<usize> {
        if cols.len() != values.len() {
            return Err(EmberError::invalid_argument("update columns and values differ in length"));
        }
        let table = self.table(id)?;
        let mut set = RowUpdateSet::default();
        for &row in rows {
            if !table.contains(row) {
                return Err(EmberError::RowDeleted {
                    table: table.name().to_string(),
                });
            }
            let mut data = table.row_data(row)?.to_vec();
            for (&c, v) in cols.iter().zip(values) {
                let slot = data.get_mut(c).ok_or_else(|| EmberError::ColumnNotFound {
                    column: c.to_string(),
                    table: table.name().to_string(),
                })?;
                *slot = v.clone();
            }
            set.put(row, data);
        }
        self.update_set(id, set, cols)
    }

    /// Finds a row by primary key.
    pub fn find_row(&self, id: TableId, key: &[Value]) -> EmberResult<Option<RowRef>> {
        self.table(id)?.find_row(key)
    }

    /// Data of every row in primary key order.
    pub fn rows(&self, id: TableId) -> EmberResult<Vec<Vec<Value>>> {
        let table = self.table(id)?;
        table
            .iter_rows()
            .map(|row| Ok(table.row_data(row?)?.to_vec()))
            .collect()
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    /// Writes every changed disk row and the file header.
    ///
    /// Returns the index roots of each disk table, to be handed back to
    /// [`load_table`](Self::load_table) after a restart.
    pub fn checkpoint(&mut self) -> EmberResult<BTreeMap<TableId, String>> {
        let mut roots = BTreeMap::new();
        for table in self.tables.values_mut().filter(|t| t.is_disk()) {
            table.sync()?;
            roots.insert(table.id(), table.index_roots()?);
        }
        if let Some(cache) = &self.cache {
            cache.lock().save_all()?;
        }
        Ok(roots)
    }

    /// Loads the rows of an empty disk table from the data file.
    pub fn load_table(&mut self, id: TableId, roots: &str) -> EmberResult<usize> {
        let count = table_mut(&mut self.tables, id)?.load(roots)?;
        info!(table = %id, rows = count, "loaded table");
        Ok(count)
    }

    /// Compacts the data file and re-keys every disk row.
    ///
    /// A database without disk tables has nothing to do.
    pub fn defrag(&mut self) -> EmberResult<DefragResult> {
        let Some(cache) = self.cache.clone() else {
            return Ok(DefragResult::default());
        };
        let mut targets = Vec::new();
        for table in self.tables.values_mut().filter(|t| t.is_disk()) {
            table.sync()?;
            targets.push(DefragTable {
                id: table.id(),
                roots: parse_roots(&table.index_roots()?)?,
            });
        }

        let result = {
            let mut guard = cache.lock();
            let path = guard.path().to_path_buf();
            let generation = guard.generation();
            guard.close()?;
            let result = defrag::run(&path, &self.config.storage, &targets, generation);
            *guard = DataFileCache::open(&path, &self.config.storage, &self.registry)?;
            result?
        };

        let mapped = cache.lock().is_mapped();
        for target in &targets {
            table_mut(&mut self.tables, target.id)?.rekey(&result.lookup, mapped)?;
        }
        Ok(result)
    }

    /// Checkpoints and closes the data file.
    pub fn close(&mut self) -> EmberResult<BTreeMap<TableId, String>> {
        let roots = self.checkpoint()?;
        if let Some(cache) = self.cache.take() {
            if let Err(e) = cache.lock().close() {
                warn!(error = %e, "closing data file failed");
                return Err(e);
            }
        }
        info!(name = %self.config.name, "closed database");
        Ok(roots)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.config.name)
            .field("tables", &self.tables.len())
            .field("data_file", &self.cache.is_some())
            .finish()
    }
}
