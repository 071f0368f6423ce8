//! Table constraints.
//!
//! A foreign key is stored twice: as a `ForeignKey` constraint on the
//! referencing (child) table and as a `Main` constraint on the referenced
//! (parent) table. Both halves share one [`ConstraintCore`].

use std::fmt;
use std::sync::Arc;

use ember_common::{CompareOptions, ConstraintId, EmberError, EmberResult, TableId, Value};
use serde::{Deserialize, Serialize};

/// Kind of a constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintType {
    /// UNIQUE over a column set, backed by a unique index.
    Unique,
    /// Referencing half of a foreign key.
    ForeignKey,
    /// Referenced half of a foreign key.
    Main,
    /// CHECK predicate.
    Check,
}

/// Action taken on referencing rows when a referenced row changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ReferentialAction {
    /// Apply the same change to the referencing rows.
    Cascade = 0,
    /// Refuse the change.
    Restrict = 1,
    /// Set the referencing columns to NULL.
    SetNull = 2,
    /// Refuse the change if referencing rows exist.
    #[default]
    NoAction = 3,
    /// Set the referencing columns to their defaults.
    SetDefault = 4,
}

impl ReferentialAction {
    /// Returns true if the action refuses changes to referenced rows.
    pub fn is_no_action(self) -> bool {
        matches!(self, Self::NoAction | Self::Restrict)
    }

    /// Returns true if the action rewrites referencing rows in place.
    pub fn is_update(self) -> bool {
        matches!(self, Self::SetNull | Self::SetDefault)
    }
}

impl fmt::Display for ReferentialAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cascade => "CASCADE",
            Self::Restrict => "RESTRICT",
            Self::SetNull => "SET NULL",
            Self::NoAction => "NO ACTION",
            Self::SetDefault => "SET DEFAULT",
        };
        f.write_str(s)
    }
}

/// The shared description of a foreign key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintCore {
    /// Id of the `ForeignKey` half, also used to mark cascade paths.
    pub id: ConstraintId,
    /// Name of the `ForeignKey` half.
    pub fk_name: String,
    /// Name of the `Main` half.
    pub main_name: String,
    /// Referenced table.
    pub main_table: TableId,
    /// Referenced columns.
    pub main_columns: Vec<usize>,
    /// Unique index over the referenced columns.
    pub main_index: String,
    /// Referencing table.
    pub ref_table: TableId,
    /// Referencing columns, parallel to `main_columns`.
    pub ref_columns: Vec<usize>,
    /// Index over the referencing columns.
    pub ref_index: String,
    /// Action on delete of a referenced row.
    pub delete_action: ReferentialAction,
    /// Action on update of referenced columns.
    pub update_action: ReferentialAction,
}

impl ConstraintCore {
    /// Returns true when the foreign key references its own table.
    pub fn is_self_referencing(&self) -> bool {
        self.main_table == self.ref_table
    }

    /// Returns true if `data` points at itself through this foreign key.
    pub fn references_own_row(&self, data: &[Value], options: &CompareOptions) -> bool {
        self.is_self_referencing()
            && self
                .ref_columns
                .iter()
                .zip(&self.main_columns)
                .all(|(&r, &m)| data[r].compare(&data[m], options).is_eq())
    }
}

/// A CHECK predicate over a fixed set of columns.
///
/// `test` receives the checked column values in declaration order. A
/// predicate that cannot be decided (for example because of a NULL) should
/// return `true`.
pub trait CheckCondition: Send + Sync {
    /// Evaluates the predicate.
    fn test(&self, values: &[Value]) -> EmberResult<bool>;
}

impl<F> CheckCondition for F
where
    F: Fn(&[Value]) -> EmberResult<bool> + Send + Sync,
{
    fn test(&self, values: &[Value]) -> EmberResult<bool> {
        self(values)
    }
}

/// Constraint payload by kind.
#[derive(Clone)]
pub enum ConstraintBody {
    /// UNIQUE constraint.
    Unique {
        /// Constrained columns.
        columns: Vec<usize>,
        /// Backing unique index.
        index: String,
    },
    /// Referencing half of a foreign key.
    ForeignKey(Arc<ConstraintCore>),
    /// Referenced half of a foreign key.
    Main(Arc<ConstraintCore>),
    /// CHECK constraint.
    Check {
        /// Columns passed to the condition.
        columns: Vec<usize>,
        /// The predicate.
        condition: Arc<dyn CheckCondition>,
    },
}

/// A named constraint attached to one table.
#[derive(Clone)]
pub struct Constraint {
    id: ConstraintId,
    name: String,
    body: ConstraintBody,
}

impl Constraint {
    /// Creates a constraint.
    pub fn new(id: ConstraintId, name: impl Into<String>, body: ConstraintBody) -> Self {
        Self {
            id,
            name: name.into(),
            body,
        }
    }

    /// Constraint id.
    pub fn id(&self) -> ConstraintId {
        self.id
    }

    /// Constraint name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Constraint payload.
    pub fn body(&self) -> &ConstraintBody {
        &self.body
    }

    /// Kind of the constraint.
    pub fn constraint_type(&self) -> ConstraintType {
        match self.body {
            ConstraintBody::Unique { .. } => ConstraintType::Unique,
            ConstraintBody::ForeignKey(_) => ConstraintType::ForeignKey,
            ConstraintBody::Main(_) => ConstraintType::Main,
            ConstraintBody::Check { .. } => ConstraintType::Check,
        }
    }

    /// Foreign key core of a `ForeignKey` or `Main` constraint.
    pub fn core(&self) -> Option<&Arc<ConstraintCore>> {
        match &self.body {
            ConstraintBody::ForeignKey(core) | ConstraintBody::Main(core) => Some(core),
            _ => None,
        }
    }

    /// Columns of the owning table this constraint covers.
    pub fn columns(&self) -> &[usize] {
        match &self.body {
            ConstraintBody::Unique { columns, .. } | ConstraintBody::Check { columns, .. } => columns,
            ConstraintBody::ForeignKey(core) => &core.ref_columns,
            ConstraintBody::Main(core) => &core.main_columns,
        }
    }

    /// Index of the owning table that backs this constraint.
    pub fn index_name(&self) -> Option<&str> {
        match &self.body {
            ConstraintBody::Unique { index, .. } => Some(index),
            ConstraintBody::ForeignKey(core) => Some(&core.ref_index),
            ConstraintBody::Main(core) => Some(&core.main_index),
            ConstraintBody::Check { .. } => None,
        }
    }

    /// Returns true if the constraint covers column `col` of its table.
    pub fn covers_column(&self, col: usize) -> bool {
        self.columns().contains(&col)
    }

    /// Evaluates a CHECK constraint against a full row.
    ///
    /// Other kinds always pass.
    pub fn check_row(&self, data: &[Value], table: &str) -> EmberResult<()> {
        if let ConstraintBody::Check { columns, condition } = &self.body {
            let values: Vec<Value> = columns.iter().map(|&c| data[c].clone()).collect();
            if !condition.test(&values)? {
                return Err(EmberError::CheckViolation {
                    constraint: self.name.clone(),
                    table: table.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Replaces the shared core of a foreign key half.
    pub(crate) fn set_core(&mut self, new_core: Arc<ConstraintCore>) {
        match &mut self.body {
            ConstraintBody::ForeignKey(core) | ConstraintBody::Main(core) => *core = new_core,
            _ => {}
        }
    }

    /// Rewrites the column positions of this constraint for `table`.
    ///
    /// For foreign keys a new core is built; the caller installs it in the
    /// other half too.
    pub(crate) fn remap_columns(&mut self, table: TableId, map: &dyn Fn(usize) -> usize) {
        let remap = |cols: &[usize]| cols.iter().map(|&c| map(c)).collect::<Vec<_>>();
        match &mut self.body {
            ConstraintBody::Unique { columns, .. } | ConstraintBody::Check { columns, .. } => {
                *columns = remap(columns);
            }
            ConstraintBody::ForeignKey(core) | ConstraintBody::Main(core) => {
                let mut new_core = ConstraintCore::clone(core);
                if new_core.ref_table == table {
                    new_core.ref_columns = remap(&new_core.ref_columns);
                }
                if new_core.main_table == table {
                    new_core.main_columns = remap(&new_core.main_columns);
                }
                *core = Arc::new(new_core);
            }
        }
    }
}

impl fmt::Debug for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Constraint")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("type", &self.constraint_type())
            .field("columns", &self.columns())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core() -> ConstraintCore {
        ConstraintCore {
            id: ConstraintId::new(1),
            fk_name: "FK_CHILD".into(),
            main_name: "SYS_REF_FK_CHILD".into(),
            main_table: TableId::new(1),
            main_columns: vec![0],
            main_index: "SYS_PK_PARENT".into(),
            ref_table: TableId::new(1),
            ref_columns: vec![2],
            ref_index: "SYS_IDX_FK_CHILD".into(),
            delete_action: ReferentialAction::Cascade,
            update_action: ReferentialAction::NoAction,
        }
    }

    #[test]
    fn test_action_classes() {
        assert!(ReferentialAction::NoAction.is_no_action());
        assert!(ReferentialAction::Restrict.is_no_action());
        assert!(ReferentialAction::SetDefault.is_update());
        assert!(!ReferentialAction::Cascade.is_update());
        assert_eq!(ReferentialAction::SetNull as u8, 2);
        assert_eq!(ReferentialAction::SetNull.to_string(), "SET NULL");
    }

    #[test]
    fn test_check_row() {
        let positive = |v: &[Value]| -> EmberResult<bool> {
            Ok(v[0].to_i64().map_or(true, |n| n > 0))
        };
        let c = Constraint::new(
            ConstraintId::new(3),
            "CK_POSITIVE",
            ConstraintBody::Check {
                columns: vec![1],
                condition: Arc::new(positive),
            },
        );
        assert!(c.check_row(&[Value::Null, Value::Integer(4)], "T").is_ok());
        assert!(c.check_row(&[Value::Null, Value::Null], "T").is_ok());
        let err = c.check_row(&[Value::Null, Value::Integer(-1)], "T").unwrap_err();
        assert!(matches!(err, EmberError::CheckViolation { .. }));
        assert_eq!(c.constraint_type(), ConstraintType::Check);
        assert!(c.index_name().is_none());
    }

    #[test]
    fn test_self_reference() {
        let core = core();
        let opts = CompareOptions::default();
        let own = vec![Value::Integer(1), Value::Null, Value::Integer(1)];
        let other = vec![Value::Integer(1), Value::Null, Value::Integer(2)];
        assert!(core.references_own_row(&own, &opts));
        assert!(!core.references_own_row(&other, &opts));
    }

    #[test]
    fn test_remap_self_referencing_core() {
        let mut fk = Constraint::new(
            ConstraintId::new(1),
            "FK_CHILD",
            ConstraintBody::ForeignKey(Arc::new(core())),
        );
        fk.remap_columns(TableId::new(1), &|c| if c >= 1 { c + 1 } else { c });
        let core = fk.core().unwrap();
        assert_eq!(core.ref_columns, vec![3]);
        assert_eq!(core.main_columns, vec![0]);
        assert!(fk.covers_column(3));
    }
}
