//! SQLite schema definitions for the param catalog database.
//!
//! Parent tables use integer rowids as primary key with a unique text UUID for
//! lookups. Child field tables reference the parent rowid with `ON DELETE RESTRICT`;
//! deleting a parent removes its fields explicitly inside the same transaction.
//! Dates are stored as `YYYY-MM-DD` text.

use crate::sqlite_column;
use crate::sqlite_persistence::{
    Column, ForeignKey, ForeignKeyOnChange, SqlType, Table, VersionedSchema,
};

// =============================================================================
// Datasources
// =============================================================================

const DATASOURCES_TABLE: Table = Table {
    name: "datasources",
    columns: &[
        sqlite_column!("rowid", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("id", &SqlType::Text, non_null = true, is_unique = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("author", &SqlType::Text, non_null = true),
        sqlite_column!(
            "active",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("json", &SqlType::Text),
        sqlite_column!("blockly", &SqlType::Text),
        sqlite_column!("config", &SqlType::Text),
        sqlite_column!("config_blockly", &SqlType::Text),
        sqlite_column!("mapping", &SqlType::Text),
        sqlite_column!("creation_date", &SqlType::Text, non_null = true),
        sqlite_column!("modification_date", &SqlType::Text, non_null = true),
        sqlite_column!("version", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_datasources_name", "name")],
};

const DATASOURCE_FK: ForeignKey = ForeignKey {
    foreign_table: "datasources",
    foreign_column: "rowid",
    on_delete: ForeignKeyOnChange::Restrict,
};

const DATASOURCE_FIELDS_TABLE: Table = Table {
    name: "datasource_fields",
    columns: &[
        sqlite_column!("rowid", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("id", &SqlType::Text, non_null = true, is_unique = true),
        sqlite_column!(
            "datasource_rowid",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&DATASOURCE_FK)
        ),
        sqlite_column!("position", &SqlType::Integer, non_null = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("field_type", &SqlType::Text, non_null = true),
        sqlite_column!("validations", &SqlType::Text),
        sqlite_column!("version", &SqlType::Integer, non_null = true),
    ],
    indices: &[(
        "idx_datasource_fields_parent",
        "datasource_rowid, position",
    )],
};

// =============================================================================
// Templates
// =============================================================================

const TEMPLATES_TABLE: Table = Table {
    name: "templates",
    columns: &[
        sqlite_column!("rowid", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("id", &SqlType::Text, non_null = true, is_unique = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!(
            "file_repo",
            &SqlType::Text,
            non_null = true,
            default_value = Some("''")
        ),
        sqlite_column!("destination", &SqlType::Text), // Email, Reporte, SMS, Web, Otro, NoDefinido
        sqlite_column!("json", &SqlType::Text),
        sqlite_column!("blockly", &SqlType::Text),
        sqlite_column!("author", &SqlType::Text, non_null = true),
        sqlite_column!(
            "active",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("creation_date", &SqlType::Text, non_null = true),
        sqlite_column!("modification_date", &SqlType::Text, non_null = true),
        sqlite_column!("version", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_templates_name", "name")],
};

const TEMPLATE_FK: ForeignKey = ForeignKey {
    foreign_table: "templates",
    foreign_column: "rowid",
    on_delete: ForeignKeyOnChange::Restrict,
};

const TEMPLATE_FIELDS_TABLE: Table = Table {
    name: "template_fields",
    columns: &[
        sqlite_column!("rowid", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("id", &SqlType::Text, non_null = true, is_unique = true),
        sqlite_column!(
            "template_rowid",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&TEMPLATE_FK)
        ),
        sqlite_column!("position", &SqlType::Integer, non_null = true),
        sqlite_column!("name", &SqlType::Text, non_null = true),
        sqlite_column!("field_type", &SqlType::Text, non_null = true),
        sqlite_column!("default_value", &SqlType::Text),
        sqlite_column!("version", &SqlType::Integer, non_null = true),
    ],
    indices: &[("idx_template_fields_parent", "template_rowid, position")],
};

// =============================================================================
// Change outbox
// =============================================================================

/// Pending change events, written in the same transaction as the entity change.
/// `seq` gives the global order; delivery order is enforced per `partition_key`.
const CHANGE_OUTBOX_TABLE: Table = Table {
    name: "change_outbox",
    columns: &[
        sqlite_column!("seq", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("entity_type", &SqlType::Text, non_null = true),
        sqlite_column!("entity_id", &SqlType::Text, non_null = true),
        sqlite_column!("partition_key", &SqlType::Text, non_null = true),
        sqlite_column!("operation", &SqlType::Text, non_null = true),
        sqlite_column!("version", &SqlType::Integer, non_null = true),
        sqlite_column!("changed_fields", &SqlType::Text), // JSON array, UPDATED only
        sqlite_column!(
            "status",
            &SqlType::Text,
            non_null = true,
            default_value = Some("'pending'")
        ), // pending, parked, published, dead_letter
        sqlite_column!(
            "attempts",
            &SqlType::Integer,
            non_null = true,
            default_value = Some("0")
        ),
        sqlite_column!("next_attempt_at", &SqlType::Integer, non_null = true), // unix ms
        sqlite_column!("last_error", &SqlType::Text),
        sqlite_column!("created_at", &SqlType::Integer, non_null = true), // unix ms
        sqlite_column!("published_at", &SqlType::Integer),
    ],
    indices: &[
        ("idx_change_outbox_status", "status"),
        ("idx_change_outbox_partition", "partition_key, seq"),
    ],
};

// =============================================================================
// Versioned Schema
// =============================================================================

pub const CATALOG_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[
        DATASOURCES_TABLE,
        DATASOURCE_FIELDS_TABLE,
        TEMPLATES_TABLE,
        TEMPLATE_FIELDS_TABLE,
        CHANGE_OUTBOX_TABLE,
    ],
    migration: None,
}];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sqlite_persistence::{migrate_if_needed, BASE_DB_VERSION};
    use rusqlite::Connection;

    fn latest() -> &'static VersionedSchema {
        CATALOG_VERSIONED_SCHEMAS.last().unwrap()
    }

    #[test]
    fn test_latest_schema_creates_and_validates() {
        let conn = Connection::open_in_memory().unwrap();
        latest().create(&conn).unwrap();
        latest().validate(&conn).unwrap();
    }

    #[test]
    fn test_empty_database_gets_latest_schema() {
        let mut conn = Connection::open_in_memory().unwrap();
        migrate_if_needed(&mut conn, CATALOG_VERSIONED_SCHEMAS).unwrap();

        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version as usize, BASE_DB_VERSION + latest().version);
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM change_outbox", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);

        // An existing database at the latest version only gets validated.
        migrate_if_needed(&mut conn, CATALOG_VERSIONED_SCHEMAS).unwrap();
    }

    #[test]
    fn test_parent_with_fields_cannot_be_deleted_implicitly() {
        let conn = Connection::open_in_memory().unwrap();
        latest().create(&conn).unwrap();

        conn.execute(
            "INSERT INTO datasources (id, name, author, creation_date, modification_date, version)
             VALUES ('ds1', 'Clientes', 'rlh', '2020-01-01', '2020-01-01', 1)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO datasource_fields (id, datasource_rowid, position, name, field_type, version)
             VALUES ('f1', 1, 0, 'rfc', 'Texto', 1)",
            [],
        )
        .unwrap();

        let result = conn.execute("DELETE FROM datasources WHERE id = 'ds1'", []);
        assert!(result.is_err());

        conn.execute("DELETE FROM datasource_fields WHERE datasource_rowid = 1", [])
            .unwrap();
        conn.execute("DELETE FROM datasources WHERE id = 'ds1'", [])
            .unwrap();
    }

    #[test]
    fn test_entity_ids_are_unique() {
        let conn = Connection::open_in_memory().unwrap();
        latest().create(&conn).unwrap();

        let insert = "INSERT INTO templates (id, name, author, creation_date, modification_date, version)
                      VALUES ('t1', 'Aviso', 'rlh', '2020-01-01', '2020-01-01', 1)";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());
    }
}
