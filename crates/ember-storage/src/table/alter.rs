//! Structural table changes by rebuild.
//!
//! Adding or dropping a column, and changing the indexes of a populated
//! disk table, build a new [`Table`] with the changed definition and copy
//! every row into it in primary key order. The caller swaps the new table
//! in under the same id and releases the old one.

use ember_common::config::StorageConfig;
use ember_common::{EmberError, EmberResult};
use tracing::info;

use super::{Column, Table, TableDef};
use crate::index::IndexDef;

/// A change applied by [`Table::move_definition`].
#[derive(Debug, Clone)]
pub enum TableChange {
    /// Insert `column` at `position` among the declared columns.
    AddColumn {
        /// The new column.
        column: Column,
        /// Its position.
        position: usize,
    },
    /// Remove the declared column at this position.
    DropColumn(usize),
    /// Add an index.
    AddIndex(IndexDef),
    /// Remove the index with this name.
    DropIndex(String),
}

impl TableChange {
    /// New position of old column `col`, `None` for a dropped column.
    fn map_column(&self, col: usize) -> Option<usize> {
        match *self {
            Self::AddColumn { position, .. } if col >= position => Some(col + 1),
            Self::DropColumn(dropped) if col == dropped => None,
            Self::DropColumn(dropped) if col > dropped => Some(col - 1),
            _ => Some(col),
        }
    }

    fn remap(&self, cols: &[usize]) -> Vec<usize> {
        cols.iter().filter_map(|&c| self.map_column(c)).collect()
    }
}

impl Table {
    /// Verifies that the declared column `col` may be dropped.
    pub fn check_drop_column(&self, col: usize) -> EmberResult<()> {
        let column = self
            .visible_columns()
            .get(col)
            .ok_or_else(|| EmberError::ColumnNotFound {
                column: col.to_string(),
                table: self.name.clone(),
            })?;
        if self.visible_column_count() == 1 {
            return Err(EmberError::invalid_argument(format!(
                "cannot drop the only column of table {}",
                self.name
            )));
        }
        if self.primary_key.contains(&col) {
            return Err(EmberError::ColumnInPrimaryKey {
                column: column.name.clone(),
                table: self.name.clone(),
            });
        }
        if let Some(c) = self.constraints.iter().find(|c| c.covers_column(col)) {
            return Err(EmberError::ColumnInConstraint {
                column: column.name.clone(),
                constraint: c.name().to_string(),
            });
        }
        if let Some(index) = self.indexes[1..]
            .iter()
            .find(|i| i.visible_columns().contains(&col))
        {
            return Err(EmberError::ColumnInIndex {
                column: column.name.clone(),
                index: index.name().to_string(),
            });
        }
        Ok(())
    }

    /// Builds an empty table with `change` applied to this definition.
    ///
    /// Indexes keep their names and relative order. Constraints are carried
    /// over with their columns remapped; foreign key halves get a new
    /// shared core which the caller installs in the other table.
    pub fn move_definition(&self, change: &TableChange, config: &StorageConfig) -> EmberResult<Table> {
        let mut columns = self.visible_columns().to_vec();
        match change {
            TableChange::AddColumn { column, position } => {
                if *position > columns.len() {
                    return Err(EmberError::invalid_argument(format!(
                        "column position {} past the end of table {}",
                        position, self.name
                    )));
                }
                if columns.iter().any(|c| c.name == column.name) {
                    return Err(EmberError::AlreadyExists {
                        kind: "column",
                        name: column.name.clone(),
                    });
                }
                if column.identity && self.identity_column.is_some() {
                    return Err(EmberError::invalid_argument(format!(
                        "table {} already has an identity column",
                        self.name
                    )));
                }
                columns.insert(*position, column.clone());
            }
            TableChange::DropColumn(col) => {
                self.check_drop_column(*col)?;
                columns.remove(*col);
            }
            TableChange::AddIndex(_) | TableChange::DropIndex(_) => {}
        }

        let def = TableDef {
            name: self.name.clone(),
            columns,
            primary_key: change.remap(&self.primary_key),
            kind: self.kind,
        };
        let mut table = Table::new(self.id, def, config, self.cache.clone())?;

        let dropped = match change {
            TableChange::DropIndex(name) => {
                self.check_drop_index(name)?;
                Some(name.as_str())
            }
            _ => None,
        };
        for index in &self.indexes[1..] {
            if Some(index.name()) == dropped {
                continue;
            }
            let mut def = index.def().clone();
            def.columns = change.remap(&def.columns);
            table.attach_index(def)?;
        }
        if let TableChange::AddIndex(def) = change {
            table.attach_index(def.clone())?;
        }

        for constraint in &self.constraints {
            let mut constraint = constraint.clone();
            constraint.remap_columns(self.id, &|c| change.map_column(c).unwrap_or(c));
            table.constraints.push(constraint);
        }

        table.next_identity = self.next_identity;
        table.next_row_id = self.next_row_id;
        Ok(table)
    }

    /// Copies every row of `from` into this freshly built table.
    ///
    /// An added column is filled with its default. On failure every row
    /// copied so far is released again.
    pub fn move_data(&mut self, from: &Table, change: &TableChange) -> EmberResult<usize> {
        let result = self.copy_rows(from, change);
        if result.is_err() {
            self.release_storage()?;
        }
        let count = result?;
        info!(table = %self.name, rows = count, ?change, "moved table data");
        Ok(count)
    }

    fn copy_rows(&mut self, from: &Table, change: &TableChange) -> EmberResult<usize> {
        let mut count = 0;
        for row in from.iter_rows() {
            let mut data = from.row_data(row?)?.to_vec();
            match change {
                TableChange::AddColumn { column, position } => {
                    data.insert(*position, column.default.clone());
                    self.set_identity(&mut data)?;
                    self.enforce_field_limits(&mut data, Some(&[*position]))?;
                    self.enforce_not_null(&data)?;
                }
                TableChange::DropColumn(col) => {
                    data.remove(*col);
                }
                TableChange::AddIndex(_) | TableChange::DropIndex(_) => {}
            }
            self.insert_no_check(data)?;
            count += 1;
        }
        self.sync()?;
        Ok(count)
    }
}
