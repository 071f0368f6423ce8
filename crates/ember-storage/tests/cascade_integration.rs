//! Referential integrity scenarios across several tables.

use ember_common::config::DatabaseConfig;
use ember_common::{DataType, EmberError, TableId, Value};
use ember_storage::database::{Database, ForeignKeyDef};
use ember_storage::index::IndexDef;
use ember_storage::row::RowRef;
use ember_storage::table::{Column, ReferentialAction, TableDef, TableKind};
use tempfile::TempDir;

fn open() -> (TempDir, Database) {
    let dir = tempfile::tempdir().unwrap();
    let config = DatabaseConfig {
        data_dir: dir.path().to_path_buf(),
        ..DatabaseConfig::for_testing()
    };
    (dir, Database::open(config).unwrap())
}

fn ints(values: &[i32]) -> Vec<Value> {
    values.iter().map(|&v| Value::Integer(v)).collect()
}

fn row(db: &Database, table: TableId, key: i32) -> RowRef {
    db.find_row(table, &[Value::Integer(key)]).unwrap().unwrap()
}

/// Table `name` with an integer primary key `ID` and a nullable integer `REF`.
fn keyed(db: &mut Database, name: &str) -> TableId {
    db.create_table(
        TableDef::new(name)
            .column(Column::new("ID", DataType::Integer))
            .column(Column::new("REF", DataType::Integer))
            .primary_key(vec![0]),
    )
    .unwrap()
}

/// Table `name` with only an integer primary key `ID`.
fn parent(db: &mut Database, name: &str, kind: TableKind) -> TableId {
    db.create_table(
        TableDef::new(name)
            .column(Column::new("ID", DataType::Integer))
            .primary_key(vec![0])
            .kind(kind),
    )
    .unwrap()
}

/// Table `name` with primary key `ID` and an integer `REF` defaulting to 0.
fn child(db: &mut Database, name: &str, kind: TableKind) -> TableId {
    db.create_table(
        TableDef::new(name)
            .column(Column::new("ID", DataType::Integer))
            .column(Column::new("REF", DataType::Integer).with_default(Value::Integer(0)))
            .primary_key(vec![0])
            .kind(kind),
    )
    .unwrap()
}

#[test]
fn test_delete_cascades_to_children() {
    let (_dir, mut db) = open();
    let b = keyed(&mut db, "B");
    let a = keyed(&mut db, "A");
    db.create_foreign_key(
        ForeignKeyDef::new("FK_A_B", a, vec![1], b, vec![0]).on_delete(ReferentialAction::Cascade),
    )
    .unwrap();

    db.insert(b, ints(&[1, 0])).unwrap();
    db.insert(b, ints(&[2, 0])).unwrap();
    db.insert(a, ints(&[10, 1])).unwrap();
    db.insert(a, ints(&[11, 1])).unwrap();
    db.insert(a, ints(&[12, 2])).unwrap();

    assert_eq!(db.delete(b, &[row(&db, b, 1)]).unwrap(), 1);
    assert_eq!(db.rows(b).unwrap(), vec![ints(&[2, 0])]);
    assert_eq!(db.rows(a).unwrap(), vec![ints(&[12, 2])]);
}

#[test]
fn test_delete_refused_by_no_action() {
    let (_dir, mut db) = open();
    let b = keyed(&mut db, "B");
    let a = keyed(&mut db, "A");
    db.create_foreign_key(ForeignKeyDef::new("FK_A_B", a, vec![1], b, vec![0]))
        .unwrap();
    db.insert(b, ints(&[1, 0])).unwrap();
    db.insert(a, ints(&[10, 1])).unwrap();

    let err = db.delete(b, &[row(&db, b, 1)]).unwrap_err();
    assert!(matches!(err, EmberError::IntegrityViolation { ref constraint, ref table }
        if constraint == "FK_A_B" && table == "A"));
    assert_eq!(db.table(b).unwrap().row_count(), 1);
    assert_eq!(db.table(a).unwrap().row_count(), 1);
}

#[test]
fn test_delete_sets_null() {
    let (_dir, mut db) = open();
    let b = keyed(&mut db, "B");
    let a = keyed(&mut db, "A");
    db.create_foreign_key(
        ForeignKeyDef::new("FK_A_B", a, vec![1], b, vec![0]).on_delete(ReferentialAction::SetNull),
    )
    .unwrap();
    db.insert(b, ints(&[1, 0])).unwrap();
    db.insert(a, ints(&[10, 1])).unwrap();
    db.insert(a, ints(&[11, 1])).unwrap();

    db.delete(b, &[row(&db, b, 1)]).unwrap();
    assert_eq!(
        db.rows(a).unwrap(),
        vec![
            vec![Value::Integer(10), Value::Null],
            vec![Value::Integer(11), Value::Null]
        ]
    );
}

#[test]
fn test_cyclic_cascade_terminates() {
    let (_dir, mut db) = open();
    let a = keyed(&mut db, "A");
    let b = keyed(&mut db, "B");
    db.create_foreign_key(
        ForeignKeyDef::new("FK_A_B", a, vec![1], b, vec![0]).on_delete(ReferentialAction::Cascade),
    )
    .unwrap();
    db.create_foreign_key(
        ForeignKeyDef::new("FK_B_A", b, vec![1], a, vec![0]).on_delete(ReferentialAction::Cascade),
    )
    .unwrap();

    db.insert(a, vec![Value::Integer(1), Value::Null]).unwrap();
    db.insert(b, ints(&[1, 1])).unwrap();
    let a1 = row(&db, a, 1);
    db.update(a, &[a1], &[1], &[Value::Integer(1)]).unwrap();

    let a1 = row(&db, a, 1);
    assert_eq!(db.delete(a, &[a1]).unwrap(), 1);
    assert_eq!(db.table(a).unwrap().row_count(), 0);
    assert_eq!(db.table(b).unwrap().row_count(), 0);
}

#[test]
fn test_self_referencing_cascade_delete() {
    let (_dir, mut db) = open();
    let t = keyed(&mut db, "TREE");
    db.create_foreign_key(
        ForeignKeyDef::new("FK_TREE_PARENT", t, vec![1], t, vec![0])
            .on_delete(ReferentialAction::Cascade),
    )
    .unwrap();

    // a row may reference itself
    db.insert(t, ints(&[1, 1])).unwrap();
    db.insert(t, ints(&[2, 1])).unwrap();
    db.insert(t, ints(&[3, 2])).unwrap();
    db.insert(t, ints(&[4, 4])).unwrap();

    db.delete(t, &[row(&db, t, 1)]).unwrap();
    assert_eq!(db.rows(t).unwrap(), vec![ints(&[4, 4])]);
}

#[test]
fn test_update_cascades_key_change() {
    let (_dir, mut db) = open();
    let p = keyed(&mut db, "P");
    let c = keyed(&mut db, "C");
    db.create_foreign_key(
        ForeignKeyDef::new("FK_C_P", c, vec![1], p, vec![0]).on_update(ReferentialAction::Cascade),
    )
    .unwrap();
    db.insert(p, ints(&[1, 0])).unwrap();
    db.insert(c, ints(&[10, 1])).unwrap();
    db.insert(c, ints(&[11, 1])).unwrap();

    db.update(p, &[row(&db, p, 1)], &[0], &[Value::Integer(2)]).unwrap();
    assert_eq!(db.rows(p).unwrap(), vec![ints(&[2, 0])]);
    assert_eq!(db.rows(c).unwrap(), vec![ints(&[10, 2]), ints(&[11, 2])]);
}

#[test]
fn test_update_refused_by_no_action() {
    let (_dir, mut db) = open();
    let p = keyed(&mut db, "P");
    let c = keyed(&mut db, "C");
    db.create_foreign_key(ForeignKeyDef::new("FK_C_P", c, vec![1], p, vec![0]))
        .unwrap();
    db.insert(p, ints(&[1, 0])).unwrap();
    db.insert(c, ints(&[10, 1])).unwrap();

    let err = db
        .update(p, &[row(&db, p, 1)], &[0], &[Value::Integer(2)])
        .unwrap_err();
    assert!(err.is_integrity());

    // changing a non-key column is fine
    db.update(p, &[row(&db, p, 1)], &[1], &[Value::Integer(5)]).unwrap();
    assert_eq!(db.rows(p).unwrap(), vec![ints(&[1, 5])]);

    // a child must still find its parent
    let err = db
        .update(c, &[row(&db, c, 10)], &[1], &[Value::Integer(9)])
        .unwrap_err();
    assert!(matches!(err, EmberError::IntegrityViolation { .. }));
}

#[test]
fn test_update_of_own_triggered_row_merges() {
    let (_dir, mut db) = open();
    let t = keyed(&mut db, "TREE");
    db.create_foreign_key(
        ForeignKeyDef::new("FK_TREE_PARENT", t, vec![1], t, vec![0])
            .on_update(ReferentialAction::Cascade),
    )
    .unwrap();
    db.insert(t, vec![Value::Integer(1), Value::Null]).unwrap();
    db.insert(t, ints(&[2, 1])).unwrap();

    // renumber both rows; the cascade rewrites the child's parent column
    let rows = [row(&db, t, 1), row(&db, t, 2)];
    let mut set = ember_storage::table::RowUpdateSet::default();
    set.put(rows[0], vec![Value::Integer(10), Value::Null]);
    set.put(rows[1], ints(&[20, 1]));
    assert_eq!(db.update_set(t, set, &[0]).unwrap(), 2);
    assert_eq!(
        db.rows(t).unwrap(),
        vec![vec![Value::Integer(10), Value::Null], ints(&[20, 10])]
    );
}

#[test]
fn test_update_of_own_triggered_row_conflicts() {
    let (_dir, mut db) = open();
    let t = keyed(&mut db, "TREE");
    db.create_foreign_key(
        ForeignKeyDef::new("FK_TREE_PARENT", t, vec![1], t, vec![0])
            .on_update(ReferentialAction::Cascade),
    )
    .unwrap();
    db.insert(t, vec![Value::Integer(1), Value::Null]).unwrap();
    db.insert(t, ints(&[2, 1])).unwrap();

    // the statement pins the child's parent column, the cascade moves it
    let rows = [row(&db, t, 1), row(&db, t, 2)];
    let mut set = ember_storage::table::RowUpdateSet::default();
    set.put(rows[0], vec![Value::Integer(10), Value::Null]);
    set.put(rows[1], ints(&[20, 1]));
    let err = db.update_set(t, set, &[0, 1]).unwrap_err();
    assert!(matches!(err, EmberError::TriggeredDataChange { .. }));
    assert_eq!(
        db.rows(t).unwrap(),
        vec![vec![Value::Integer(1), Value::Null], ints(&[2, 1])]
    );
}

#[test]
fn test_failed_insert_leaves_no_index_entries() {
    let (_dir, mut db) = open();
    let t = keyed(&mut db, "T");
    db.create_index(t, IndexDef::new("UQ_T_REF", vec![1]).unique(true))
        .unwrap();
    db.insert(t, ints(&[1, 100])).unwrap();

    let err = db.insert(t, ints(&[2, 100])).unwrap_err();
    assert!(matches!(err, EmberError::UniqueViolation { ref constraint, .. } if constraint == "UQ_T_REF"));
    let table = db.table(t).unwrap();
    assert_eq!(table.row_count(), 1);
    for index in table.indexes() {
        assert_eq!(index.size(table.store()).unwrap(), 1);
        assert_eq!(index.check_balanced(table.store()).unwrap(), 1);
    }
    assert!(db.find_row(t, &[Value::Integer(2)]).unwrap().is_none());
}

#[test]
fn test_delete_sets_default() {
    let (_dir, mut db) = open();
    let p = parent(&mut db, "P", TableKind::Memory);
    let c = child(&mut db, "C", TableKind::Memory);
    db.create_foreign_key(
        ForeignKeyDef::new("FK_C_P", c, vec![1], p, vec![0]).on_delete(ReferentialAction::SetDefault),
    )
    .unwrap();
    db.insert(p, ints(&[0])).unwrap();
    db.insert(p, ints(&[1])).unwrap();
    db.insert(c, ints(&[10, 1])).unwrap();
    db.insert(c, ints(&[11, 1])).unwrap();
    db.insert(c, ints(&[12, 0])).unwrap();

    assert_eq!(db.delete(p, &[row(&db, p, 1)]).unwrap(), 1);
    assert_eq!(db.rows(p).unwrap(), vec![ints(&[0])]);
    assert_eq!(
        db.rows(c).unwrap(),
        vec![ints(&[10, 0]), ints(&[11, 0]), ints(&[12, 0])]
    );
}

#[test]
fn test_update_sets_null() {
    let (_dir, mut db) = open();
    let p = parent(&mut db, "P", TableKind::Memory);
    let c = child(&mut db, "C", TableKind::Memory);
    db.create_foreign_key(
        ForeignKeyDef::new("FK_C_P", c, vec![1], p, vec![0]).on_update(ReferentialAction::SetNull),
    )
    .unwrap();
    db.insert(p, ints(&[1])).unwrap();
    db.insert(p, ints(&[3])).unwrap();
    db.insert(c, ints(&[10, 1])).unwrap();
    db.insert(c, ints(&[11, 1])).unwrap();
    db.insert(c, ints(&[12, 3])).unwrap();

    db.update(p, &[row(&db, p, 1)], &[0], &[Value::Integer(2)]).unwrap();
    assert_eq!(db.rows(p).unwrap(), vec![ints(&[2]), ints(&[3])]);
    assert_eq!(
        db.rows(c).unwrap(),
        vec![
            vec![Value::Integer(10), Value::Null],
            vec![Value::Integer(11), Value::Null],
            ints(&[12, 3])
        ]
    );
}

#[test]
fn test_update_sets_default() {
    let (_dir, mut db) = open();
    let p = parent(&mut db, "P", TableKind::Memory);
    let c = child(&mut db, "C", TableKind::Memory);
    db.create_foreign_key(
        ForeignKeyDef::new("FK_C_P", c, vec![1], p, vec![0]).on_update(ReferentialAction::SetDefault),
    )
    .unwrap();
    db.insert(p, ints(&[0])).unwrap();
    db.insert(p, ints(&[1])).unwrap();
    db.insert(c, ints(&[10, 1])).unwrap();

    db.update(p, &[row(&db, p, 1)], &[0], &[Value::Integer(5)]).unwrap();
    assert_eq!(db.rows(p).unwrap(), vec![ints(&[0]), ints(&[5])]);
    assert_eq!(db.rows(c).unwrap(), vec![ints(&[10, 0])]);
}

/// A SET DEFAULT that collides with a unique constraint of the child must
/// leave both tables untouched.
fn check_failed_set_default_keeps_rows(kind: TableKind) {
    let (_dir, mut db) = open();
    let p = parent(&mut db, "P", kind);
    let c = child(&mut db, "C", kind);
    db.create_unique_constraint(c, "U_REF", vec![1]).unwrap();
    db.create_foreign_key(
        ForeignKeyDef::new("FK_C_P", c, vec![1], p, vec![0]).on_delete(ReferentialAction::SetDefault),
    )
    .unwrap();
    db.insert(p, ints(&[0])).unwrap();
    db.insert(p, ints(&[1])).unwrap();
    db.insert(c, ints(&[10, 0])).unwrap();
    db.insert(c, ints(&[11, 1])).unwrap();

    let err = db.delete(p, &[row(&db, p, 1)]).unwrap_err();
    assert!(matches!(err, EmberError::UniqueViolation { ref constraint, ref table }
        if constraint == "U_REF" && table == "C"));
    assert_eq!(db.rows(p).unwrap(), vec![ints(&[0]), ints(&[1])]);
    assert_eq!(db.rows(c).unwrap(), vec![ints(&[10, 0]), ints(&[11, 1])]);

    for id in [p, c] {
        let table = db.table(id).unwrap();
        for index in table.indexes() {
            assert_eq!(index.size(table.store()).unwrap(), table.row_count());
            index.check_balanced(table.store()).unwrap();
        }
    }

    // the parent row is live again and still protected
    db.delete(c, &[row(&db, c, 11)]).unwrap();
    db.delete(p, &[row(&db, p, 1)]).unwrap();
    assert_eq!(db.rows(p).unwrap(), vec![ints(&[0])]);
}

#[test]
fn test_failed_set_default_delete_keeps_rows() {
    check_failed_set_default_keeps_rows(TableKind::Memory);
}

#[test]
fn test_failed_set_default_delete_keeps_disk_rows() {
    check_failed_set_default_keeps_rows(TableKind::Disk);
}

#[test]
fn test_failed_key_update_restores_cascaded_children() {
    let (_dir, mut db) = open();
    let p = parent(&mut db, "P", TableKind::Memory);
    let c = child(&mut db, "C", TableKind::Memory);
    db.create_foreign_key(
        ForeignKeyDef::new("FK_C_P", c, vec![1], p, vec![0]).on_update(ReferentialAction::Cascade),
    )
    .unwrap();
    db.insert(p, ints(&[1])).unwrap();
    db.insert(p, ints(&[2])).unwrap();
    db.insert(c, ints(&[10, 1])).unwrap();
    db.insert(c, ints(&[11, 1])).unwrap();

    // the children move to 2 before the parent's own key collides
    let err = db
        .update(p, &[row(&db, p, 1)], &[0], &[Value::Integer(2)])
        .unwrap_err();
    assert!(matches!(err, EmberError::UniqueViolation { ref table, .. } if table == "P"));
    assert_eq!(db.rows(p).unwrap(), vec![ints(&[1]), ints(&[2])]);
    assert_eq!(db.rows(c).unwrap(), vec![ints(&[10, 1]), ints(&[11, 1])]);
}
