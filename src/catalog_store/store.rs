//! SQLite-backed catalog store.
//!
//! One write connection serializes all mutations with `BEGIN IMMEDIATE`; reads are
//! spread round-robin over a pool of read-only connections. The change outbox
//! lives in the same database so entity rows and their events share a transaction.

use super::error::{CatalogError, CatalogResult};
use super::filter::{Page, PageRequest, Predicate, SqlParam, DB_DATE_FORMAT};
use super::models::*;
use super::schema::CATALOG_VERSIONED_SCHEMAS;
use super::trait_def::{CatalogStore, CatalogTransaction, TransactionWork};
use crate::change_events::{
    unix_millis_now, NewChangeEvent, OutboxCounts, OutboxRecord, OutboxStatus, OutboxStore,
    RequeueOutcome,
};
use crate::sqlite_persistence::migrate_if_needed;
use anyhow::Context;
use chrono::NaiveDate;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

const DATASOURCE_COLUMNS: &str = "rowid, id, name, author, active, json, blockly, config, \
     config_blockly, mapping, creation_date, modification_date, version";

const DATASOURCE_FIELD_COLUMNS: &str = "id, name, field_type, validations, version";

const TEMPLATE_COLUMNS: &str = "rowid, id, name, file_repo, destination, json, blockly, author, \
     active, creation_date, modification_date, version";

const TEMPLATE_FIELD_COLUMNS: &str = "id, name, field_type, default_value, version";

const OUTBOX_COLUMNS: &str = "seq, entity_type, entity_id, partition_key, operation, version, \
     changed_fields, status, attempts, next_attempt_at, last_error, created_at, published_at";

/// SQLite-backed catalog store.
#[derive(Clone)]
pub struct SqliteCatalogStore {
    read_pool: Vec<Arc<Mutex<Connection>>>,
    write_conn: Arc<Mutex<Connection>>,
    read_index: Arc<AtomicUsize>,
}

/// Registers `casefold(text)`, the Unicode-aware lowercase used by text filters.
fn register_functions(conn: &Connection) -> rusqlite::Result<()> {
    conn.create_scalar_function(
        "casefold",
        1,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let value: Option<String> = ctx.get(0)?;
            Ok(value.map(|s| s.to_lowercase()))
        },
    )
}

impl SqliteCatalogStore {
    /// Open (or create) the catalog database at `db_path`.
    ///
    /// # Arguments
    /// * `db_path` - Path to the SQLite database file
    /// * `read_pool_size` - Number of connections for concurrent reads (at least 1)
    pub fn new<P: AsRef<Path>>(db_path: P, read_pool_size: usize) -> anyhow::Result<Self> {
        let db_path_ref = db_path.as_ref();

        let mut write_conn = Connection::open_with_flags(
            db_path_ref,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_URI
                | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .context("Failed to open catalog database")?;

        migrate_if_needed(&mut write_conn, CATALOG_VERSIONED_SCHEMAS)
            .context("Catalog database schema check failed")?;

        write_conn.pragma_update(None, "journal_mode", "WAL")?;
        write_conn.pragma_update(None, "foreign_keys", "ON")?;
        register_functions(&write_conn)?;

        let datasource_count: i64 =
            write_conn.query_row("SELECT COUNT(*) FROM datasources", [], |r| r.get(0))?;
        let template_count: i64 =
            write_conn.query_row("SELECT COUNT(*) FROM templates", [], |r| r.get(0))?;
        let pending_count: i64 = write_conn.query_row(
            "SELECT COUNT(*) FROM change_outbox WHERE status IN ('pending', 'parked')",
            [],
            |r| r.get(0),
        )?;
        info!(
            "Opened param catalog: {} datasources, {} templates, {} undelivered events",
            datasource_count, template_count, pending_count
        );

        let read_pool_size = read_pool_size.max(1);
        let mut read_pool = Vec::with_capacity(read_pool_size);
        for _ in 0..read_pool_size {
            let read_conn = Connection::open_with_flags(
                db_path_ref,
                rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY
                    | rusqlite::OpenFlags::SQLITE_OPEN_URI
                    | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
            )?;
            register_functions(&read_conn)?;
            read_pool.push(Arc::new(Mutex::new(read_conn)));
        }

        Ok(SqliteCatalogStore {
            write_conn: Arc::new(Mutex::new(write_conn)),
            read_pool,
            read_index: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn read_conn(&self) -> Arc<Mutex<Connection>> {
        let index = self.read_index.fetch_add(1, Ordering::SeqCst) % self.read_pool.len();
        self.read_pool[index].clone()
    }

    fn lock_write(&self) -> CatalogResult<MutexGuard<'_, Connection>> {
        self.write_conn
            .lock()
            .map_err(|_| CatalogError::Store(anyhow::anyhow!("Catalog write lock poisoned")))
    }
}

fn lock_read(conn: &Mutex<Connection>) -> CatalogResult<MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|_| CatalogError::Store(anyhow::anyhow!("Catalog read lock poisoned")))
}

/// Run every statement of `read` against one WAL snapshot, so a page and its
/// total count (or a parent and its fields) agree with each other.
fn read_snapshot<T>(
    conn: &Connection,
    read: impl FnOnce(&Connection) -> CatalogResult<T>,
) -> CatalogResult<T> {
    conn.execute_batch("BEGIN DEFERRED")?;
    match read(conn) {
        Ok(value) => {
            if let Err(e) = conn.execute_batch("COMMIT") {
                let _ = conn.execute_batch("ROLLBACK");
                return Err(e.into());
            }
            Ok(value)
        }
        Err(e) => {
            let _ = conn.execute_batch("ROLLBACK");
            Err(e)
        }
    }
}

// =============================================================================
// Row mapping
// =============================================================================

fn conversion_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, message.into())
}

fn uuid_at(row: &Row<'_>, index: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(index)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_error(index, format!("{}: {}", raw, e)))
}

fn date_at(row: &Row<'_>, index: usize) -> rusqlite::Result<NaiveDate> {
    let raw: String = row.get(index)?;
    NaiveDate::parse_from_str(&raw, DB_DATE_FORMAT)
        .map_err(|e| conversion_error(index, format!("{}: {}", raw, e)))
}

fn field_type_at(row: &Row<'_>, index: usize) -> rusqlite::Result<FieldType> {
    let raw: String = row.get(index)?;
    FieldType::from_db_str(&raw)
        .ok_or_else(|| conversion_error(index, format!("Unknown field type '{}'", raw)))
}

fn date_str(date: NaiveDate) -> String {
    date.format(DB_DATE_FORMAT).to_string()
}

fn datasource_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, Datasource)> {
    Ok((
        row.get(0)?,
        Datasource {
            id: uuid_at(row, 1)?,
            nombre: row.get(2)?,
            autor: row.get(3)?,
            activo: row.get::<_, i64>(4)? != 0,
            json: row.get(5)?,
            blockly: row.get(6)?,
            config: row.get(7)?,
            config_blockly: row.get(8)?,
            mapping: row.get(9)?,
            fecha_creacion: date_at(row, 10)?,
            fecha_modificacion: date_at(row, 11)?,
            version: row.get::<_, i64>(12)? as u64,
            campos: vec![],
        },
    ))
}

fn datasource_field_from_row(row: &Row<'_>) -> rusqlite::Result<DatasourceField> {
    Ok(DatasourceField {
        id: uuid_at(row, 0)?,
        nombre: row.get(1)?,
        tipo: field_type_at(row, 2)?,
        validaciones: row.get(3)?,
        version: row.get::<_, i64>(4)? as u64,
    })
}

fn template_from_row(row: &Row<'_>) -> rusqlite::Result<(i64, Template)> {
    let destination: Option<String> = row.get(4)?;
    let destino = match destination {
        Some(raw) => Some(
            Destino::from_db_str(&raw)
                .ok_or_else(|| conversion_error(4, format!("Unknown destino '{}'", raw)))?,
        ),
        None => None,
    };
    Ok((
        row.get(0)?,
        Template {
            id: uuid_at(row, 1)?,
            nombre: row.get(2)?,
            file_repo: row.get(3)?,
            destino,
            json: row.get(5)?,
            blockly: row.get(6)?,
            autor: row.get(7)?,
            activo: row.get::<_, i64>(8)? != 0,
            fecha_creacion: date_at(row, 9)?,
            fecha_modificacion: date_at(row, 10)?,
            version: row.get::<_, i64>(11)? as u64,
            campos: vec![],
        },
    ))
}

fn template_field_from_row(row: &Row<'_>) -> rusqlite::Result<TemplateField> {
    Ok(TemplateField {
        id: uuid_at(row, 0)?,
        nombre: row.get(1)?,
        tipo: field_type_at(row, 2)?,
        valor_default: row.get(3)?,
        version: row.get::<_, i64>(4)? as u64,
    })
}

fn outbox_record_from_row(row: &Row<'_>) -> rusqlite::Result<OutboxRecord> {
    let status: String = row.get(7)?;
    Ok(OutboxRecord {
        seq: row.get(0)?,
        entity_type: row.get(1)?,
        entity_id: row.get(2)?,
        partition_key: row.get(3)?,
        operation: row.get(4)?,
        version: row.get(5)?,
        changed_fields: row.get(6)?,
        status: OutboxStatus::from_db_str(&status)
            .ok_or_else(|| conversion_error(7, format!("Unknown outbox status '{}'", status)))?,
        attempts: row.get::<_, i64>(8)? as u32,
        next_attempt_at: row.get(9)?,
        last_error: row.get(10)?,
        created_at: row.get(11)?,
        published_at: row.get(12)?,
    })
}

// =============================================================================
// Shared queries (read connections and the write transaction)
// =============================================================================

fn load_datasource_fields(conn: &Connection, rowid: i64) -> CatalogResult<Vec<DatasourceField>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM datasource_fields WHERE datasource_rowid = ?1 ORDER BY position",
        DATASOURCE_FIELD_COLUMNS
    ))?;
    let fields = stmt
        .query_map(params![rowid], datasource_field_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(fields)
}

fn load_template_fields(conn: &Connection, rowid: i64) -> CatalogResult<Vec<TemplateField>> {
    let mut stmt = conn.prepare_cached(&format!(
        "SELECT {} FROM template_fields WHERE template_rowid = ?1 ORDER BY position",
        TEMPLATE_FIELD_COLUMNS
    ))?;
    let fields = stmt
        .query_map(params![rowid], template_field_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(fields)
}

fn with_datasource_fields(
    conn: &Connection,
    rows: Vec<(i64, Datasource)>,
) -> CatalogResult<Vec<Datasource>> {
    rows.into_iter()
        .map(|(rowid, mut datasource)| {
            datasource.campos = load_datasource_fields(conn, rowid)?;
            Ok(datasource)
        })
        .collect()
}

fn with_template_fields(
    conn: &Connection,
    rows: Vec<(i64, Template)>,
) -> CatalogResult<Vec<Template>> {
    rows.into_iter()
        .map(|(rowid, mut template)| {
            template.campos = load_template_fields(conn, rowid)?;
            Ok(template)
        })
        .collect()
}

fn query_datasource(conn: &Connection, id: Uuid) -> CatalogResult<Option<Datasource>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM datasources WHERE id = ?1", DATASOURCE_COLUMNS),
            params![id.to_string()],
            datasource_from_row,
        )
        .optional()?;
    match row {
        Some(row) => Ok(with_datasource_fields(conn, vec![row])?.pop()),
        None => Ok(None),
    }
}

fn query_template(conn: &Connection, id: Uuid) -> CatalogResult<Option<Template>> {
    let row = conn
        .query_row(
            &format!("SELECT {} FROM templates WHERE id = ?1", TEMPLATE_COLUMNS),
            params![id.to_string()],
            template_from_row,
        )
        .optional()?;
    match row {
        Some(row) => Ok(with_template_fields(conn, vec![row])?.pop()),
        None => Ok(None),
    }
}

/// Filtered, paginated rows of `table` in insertion order, plus the total match count.
fn query_page<T>(
    conn: &Connection,
    table: &str,
    columns: &str,
    predicate: &Predicate,
    page: PageRequest,
    map_row: fn(&Row<'_>) -> rusqlite::Result<(i64, T)>,
) -> CatalogResult<(Vec<(i64, T)>, u64)> {
    let sql_predicate = predicate.to_sql(1);

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM {} WHERE {}", table, sql_predicate.clause),
        params_from_iter(sql_predicate.params.iter()),
        |r| r.get(0),
    )?;

    let next = sql_predicate.params.len() + 1;
    let sql = format!(
        "SELECT {} FROM {} WHERE {} ORDER BY rowid LIMIT ?{} OFFSET ?{}",
        columns,
        table,
        sql_predicate.clause,
        next,
        next + 1
    );
    let mut bound = sql_predicate.params;
    bound.push(SqlParam::Integer(page.size() as i64));
    bound.push(SqlParam::Integer(page.offset() as i64));

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params_from_iter(bound.iter()), map_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok((rows, total as u64))
}

fn query_by_name<T>(
    conn: &Connection,
    table: &str,
    columns: &str,
    nombre: &str,
    map_row: fn(&Row<'_>) -> rusqlite::Result<(i64, T)>,
) -> CatalogResult<Vec<(i64, T)>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM {} WHERE name = ?1 ORDER BY rowid",
        columns, table
    ))?;
    let rows = stmt
        .query_map(params![nombre], map_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

// =============================================================================
// Reads
// =============================================================================

impl CatalogStore for SqliteCatalogStore {
    fn get_datasource(&self, id: Uuid) -> CatalogResult<Option<Datasource>> {
        let read_conn = self.read_conn();
        let conn = lock_read(&read_conn)?;
        read_snapshot(&conn, |conn| query_datasource(conn, id))
    }

    fn list_datasources(
        &self,
        predicate: &Predicate,
        page: PageRequest,
    ) -> CatalogResult<Page<Datasource>> {
        let read_conn = self.read_conn();
        let conn = lock_read(&read_conn)?;
        read_snapshot(&conn, |conn| {
            let (rows, total) = query_page(
                conn,
                "datasources",
                DATASOURCE_COLUMNS,
                predicate,
                page,
                datasource_from_row,
            )?;
            Ok(Page::new(with_datasource_fields(conn, rows)?, page, total))
        })
    }

    fn find_datasources_by_nombre(&self, nombre: &str) -> CatalogResult<Vec<Datasource>> {
        let read_conn = self.read_conn();
        let conn = lock_read(&read_conn)?;
        read_snapshot(&conn, |conn| {
            let rows = query_by_name(
                conn,
                "datasources",
                DATASOURCE_COLUMNS,
                nombre,
                datasource_from_row,
            )?;
            with_datasource_fields(conn, rows)
        })
    }

    fn get_template(&self, id: Uuid) -> CatalogResult<Option<Template>> {
        let read_conn = self.read_conn();
        let conn = lock_read(&read_conn)?;
        read_snapshot(&conn, |conn| query_template(conn, id))
    }

    fn list_templates(
        &self,
        predicate: &Predicate,
        page: PageRequest,
    ) -> CatalogResult<Page<Template>> {
        let read_conn = self.read_conn();
        let conn = lock_read(&read_conn)?;
        read_snapshot(&conn, |conn| {
            let (rows, total) = query_page(
                conn,
                "templates",
                TEMPLATE_COLUMNS,
                predicate,
                page,
                template_from_row,
            )?;
            Ok(Page::new(with_template_fields(conn, rows)?, page, total))
        })
    }

    fn find_templates_by_nombre(&self, nombre: &str) -> CatalogResult<Vec<Template>> {
        let read_conn = self.read_conn();
        let conn = lock_read(&read_conn)?;
        read_snapshot(&conn, |conn| {
            let rows =
                query_by_name(conn, "templates", TEMPLATE_COLUMNS, nombre, template_from_row)?;
            with_template_fields(conn, rows)
        })
    }

    fn run_in_transaction(&self, work: TransactionWork<'_>) -> CatalogResult<()> {
        let conn = self.lock_write()?;
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = {
            let mut tx = SqliteCatalogTransaction { conn: &conn };
            work(&mut tx)
        };

        match result {
            Ok(()) => {
                if let Err(e) = conn.execute("COMMIT", []) {
                    let _ = conn.execute("ROLLBACK", []);
                    return Err(e.into());
                }
                Ok(())
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                debug!("Catalog transaction rolled back: {}", e);
                Err(e)
            }
        }
    }
}

// =============================================================================
// Writes
// =============================================================================

struct SqliteCatalogTransaction<'a> {
    conn: &'a Connection,
}

impl SqliteCatalogTransaction<'_> {
    fn rowid_of(&self, table: &str, id: Uuid) -> CatalogResult<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT rowid FROM {} WHERE id = ?1", table),
                params![id.to_string()],
                |r| r.get(0),
            )
            .optional()?)
    }

    fn version_of(&self, table: &str, id: Uuid) -> CatalogResult<Option<u64>> {
        let version: Option<i64> = self
            .conn
            .query_row(
                &format!("SELECT version FROM {} WHERE id = ?1", table),
                params![id.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(version.map(|v| v as u64))
    }

    /// Turn a zero-row versioned update into NotFound or Conflict.
    fn update_miss(
        &self,
        table: &str,
        entity_type: EntityType,
        id: Uuid,
        expected: u64,
    ) -> CatalogError {
        match self.version_of(table, id) {
            Ok(Some(actual)) => CatalogError::Conflict {
                entity_type,
                id,
                expected,
                actual,
            },
            Ok(None) => CatalogError::not_found(entity_type, id),
            Err(e) => e,
        }
    }

    /// Version of a field, only if it belongs to the given parent.
    fn child_version(
        &self,
        child_table: &str,
        parent_table: &str,
        parent_column: &str,
        parent_id: Uuid,
        field_id: Uuid,
    ) -> CatalogResult<Option<u64>> {
        let version: Option<i64> = self
            .conn
            .query_row(
                &format!(
                    "SELECT f.version FROM {} f JOIN {} p ON f.{} = p.rowid
                     WHERE f.id = ?1 AND p.id = ?2",
                    child_table, parent_table, parent_column
                ),
                params![field_id.to_string(), parent_id.to_string()],
                |r| r.get(0),
            )
            .optional()?;
        Ok(version.map(|v| v as u64))
    }

    fn next_position(
        &self,
        child_table: &str,
        parent_column: &str,
        parent_rowid: i64,
    ) -> CatalogResult<i64> {
        Ok(self.conn.query_row(
            &format!(
                "SELECT COALESCE(MAX(position) + 1, 0) FROM {} WHERE {} = ?1",
                child_table, parent_column
            ),
            params![parent_rowid],
            |r| r.get(0),
        )?)
    }

    fn insert_datasource_field_row(
        &self,
        parent_rowid: i64,
        position: i64,
        field: &DatasourceField,
    ) -> CatalogResult<()> {
        self.conn.execute(
            "INSERT INTO datasource_fields (id, datasource_rowid, position, name, field_type, validations, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                field.id.to_string(),
                parent_rowid,
                position,
                field.nombre,
                field.tipo.to_db_str(),
                field.validaciones,
                field.version as i64,
            ],
        )?;
        Ok(())
    }

    fn insert_template_field_row(
        &self,
        parent_rowid: i64,
        position: i64,
        field: &TemplateField,
    ) -> CatalogResult<()> {
        self.conn.execute(
            "INSERT INTO template_fields (id, template_rowid, position, name, field_type, default_value, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                field.id.to_string(),
                parent_rowid,
                position,
                field.nombre,
                field.tipo.to_db_str(),
                field.valor_default,
                field.version as i64,
            ],
        )?;
        Ok(())
    }

    fn touch(
        &self,
        table: &str,
        entity_type: EntityType,
        id: Uuid,
        date: NaiveDate,
    ) -> CatalogResult<()> {
        let updated = self.conn.execute(
            &format!("UPDATE {} SET modification_date = ?1 WHERE id = ?2", table),
            params![date_str(date), id.to_string()],
        )?;
        if updated == 0 {
            return Err(CatalogError::not_found(entity_type, id));
        }
        Ok(())
    }

    /// Explicit cascade: children first, then the parent row.
    fn delete_parent(
        &self,
        table: &str,
        child_table: &str,
        parent_column: &str,
        entity_type: EntityType,
        id: Uuid,
    ) -> CatalogResult<usize> {
        let rowid = self
            .rowid_of(table, id)?
            .ok_or_else(|| CatalogError::not_found(entity_type, id))?;
        let fields_deleted = self.conn.execute(
            &format!("DELETE FROM {} WHERE {} = ?1", child_table, parent_column),
            params![rowid],
        )?;
        self.conn
            .execute(&format!("DELETE FROM {} WHERE rowid = ?1", table), params![rowid])?;
        Ok(fields_deleted)
    }

    fn delete_child(
        &self,
        child_table: &str,
        parent_table: &str,
        parent_column: &str,
        entity_type: EntityType,
        parent_id: Uuid,
        field_id: Uuid,
    ) -> CatalogResult<()> {
        let deleted = self.conn.execute(
            &format!(
                "DELETE FROM {} WHERE id = ?1 AND {} = (SELECT rowid FROM {} WHERE id = ?2)",
                child_table, parent_column, parent_table
            ),
            params![field_id.to_string(), parent_id.to_string()],
        )?;
        if deleted == 0 {
            return Err(CatalogError::not_found(entity_type, field_id));
        }
        Ok(())
    }
}

impl CatalogTransaction for SqliteCatalogTransaction<'_> {
    fn get_datasource(&mut self, id: Uuid) -> CatalogResult<Option<Datasource>> {
        query_datasource(self.conn, id)
    }

    fn insert_datasource(&mut self, datasource: &Datasource) -> CatalogResult<()> {
        self.conn.execute(
            "INSERT INTO datasources (id, name, author, active, json, blockly, config, config_blockly,
                                      mapping, creation_date, modification_date, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                datasource.id.to_string(),
                datasource.nombre,
                datasource.autor,
                datasource.activo as i64,
                datasource.json,
                datasource.blockly,
                datasource.config,
                datasource.config_blockly,
                datasource.mapping,
                date_str(datasource.fecha_creacion),
                date_str(datasource.fecha_modificacion),
                datasource.version as i64,
            ],
        )?;
        let rowid = self.conn.last_insert_rowid();
        for (position, field) in datasource.campos.iter().enumerate() {
            self.insert_datasource_field_row(rowid, position as i64, field)?;
        }
        Ok(())
    }

    fn update_datasource(
        &mut self,
        datasource: &Datasource,
        expected_version: u64,
    ) -> CatalogResult<()> {
        let updated = self.conn.execute(
            "UPDATE datasources SET name = ?1, author = ?2, active = ?3, json = ?4, blockly = ?5,
                    config = ?6, config_blockly = ?7, mapping = ?8, modification_date = ?9,
                    version = ?10
             WHERE id = ?11 AND version = ?12",
            params![
                datasource.nombre,
                datasource.autor,
                datasource.activo as i64,
                datasource.json,
                datasource.blockly,
                datasource.config,
                datasource.config_blockly,
                datasource.mapping,
                date_str(datasource.fecha_modificacion),
                datasource.version as i64,
                datasource.id.to_string(),
                expected_version as i64,
            ],
        )?;
        if updated == 0 {
            return Err(self.update_miss(
                "datasources",
                EntityType::Datasource,
                datasource.id,
                expected_version,
            ));
        }
        Ok(())
    }

    fn touch_datasource(&mut self, id: Uuid, date: NaiveDate) -> CatalogResult<()> {
        self.touch("datasources", EntityType::Datasource, id, date)
    }

    fn delete_datasource(&mut self, id: Uuid) -> CatalogResult<usize> {
        self.delete_parent(
            "datasources",
            "datasource_fields",
            "datasource_rowid",
            EntityType::Datasource,
            id,
        )
    }

    fn insert_datasource_field(
        &mut self,
        datasource_id: Uuid,
        field: &DatasourceField,
    ) -> CatalogResult<()> {
        let rowid = self
            .rowid_of("datasources", datasource_id)?
            .ok_or_else(|| CatalogError::not_found(EntityType::Datasource, datasource_id))?;
        let position = self.next_position("datasource_fields", "datasource_rowid", rowid)?;
        self.insert_datasource_field_row(rowid, position, field)
    }

    fn update_datasource_field(
        &mut self,
        datasource_id: Uuid,
        field: &DatasourceField,
        expected_version: u64,
    ) -> CatalogResult<()> {
        let updated = self.conn.execute(
            "UPDATE datasource_fields SET name = ?1, field_type = ?2, validations = ?3, version = ?4
             WHERE id = ?5 AND version = ?6
               AND datasource_rowid = (SELECT rowid FROM datasources WHERE id = ?7)",
            params![
                field.nombre,
                field.tipo.to_db_str(),
                field.validaciones,
                field.version as i64,
                field.id.to_string(),
                expected_version as i64,
                datasource_id.to_string(),
            ],
        )?;
        if updated == 0 {
            return match self.child_version(
                "datasource_fields",
                "datasources",
                "datasource_rowid",
                datasource_id,
                field.id,
            )? {
                Some(actual) => Err(CatalogError::Conflict {
                    entity_type: EntityType::DatasourceField,
                    id: field.id,
                    expected: expected_version,
                    actual,
                }),
                None => Err(CatalogError::not_found(EntityType::DatasourceField, field.id)),
            };
        }
        Ok(())
    }

    fn delete_datasource_field(
        &mut self,
        datasource_id: Uuid,
        field_id: Uuid,
    ) -> CatalogResult<()> {
        self.delete_child(
            "datasource_fields",
            "datasources",
            "datasource_rowid",
            EntityType::DatasourceField,
            datasource_id,
            field_id,
        )
    }

    fn get_template(&mut self, id: Uuid) -> CatalogResult<Option<Template>> {
        query_template(self.conn, id)
    }

    fn insert_template(&mut self, template: &Template) -> CatalogResult<()> {
        self.conn.execute(
            "INSERT INTO templates (id, name, file_repo, destination, json, blockly, author, active,
                                    creation_date, modification_date, version)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                template.id.to_string(),
                template.nombre,
                template.file_repo,
                template.destino.map(|d| d.to_db_str()),
                template.json,
                template.blockly,
                template.autor,
                template.activo as i64,
                date_str(template.fecha_creacion),
                date_str(template.fecha_modificacion),
                template.version as i64,
            ],
        )?;
        let rowid = self.conn.last_insert_rowid();
        for (position, field) in template.campos.iter().enumerate() {
            self.insert_template_field_row(rowid, position as i64, field)?;
        }
        Ok(())
    }

    fn update_template(&mut self, template: &Template, expected_version: u64) -> CatalogResult<()> {
        let updated = self.conn.execute(
            "UPDATE templates SET name = ?1, file_repo = ?2, destination = ?3, json = ?4,
                    blockly = ?5, author = ?6, active = ?7, modification_date = ?8, version = ?9
             WHERE id = ?10 AND version = ?11",
            params![
                template.nombre,
                template.file_repo,
                template.destino.map(|d| d.to_db_str()),
                template.json,
                template.blockly,
                template.autor,
                template.activo as i64,
                date_str(template.fecha_modificacion),
                template.version as i64,
                template.id.to_string(),
                expected_version as i64,
            ],
        )?;
        if updated == 0 {
            return Err(self.update_miss(
                "templates",
                EntityType::Template,
                template.id,
                expected_version,
            ));
        }
        Ok(())
    }

    fn touch_template(&mut self, id: Uuid, date: NaiveDate) -> CatalogResult<()> {
        self.touch("templates", EntityType::Template, id, date)
    }

    fn delete_template(&mut self, id: Uuid) -> CatalogResult<usize> {
        self.delete_parent(
            "templates",
            "template_fields",
            "template_rowid",
            EntityType::Template,
            id,
        )
    }

    fn insert_template_field(
        &mut self,
        template_id: Uuid,
        field: &TemplateField,
    ) -> CatalogResult<()> {
        let rowid = self
            .rowid_of("templates", template_id)?
            .ok_or_else(|| CatalogError::not_found(EntityType::Template, template_id))?;
        let position = self.next_position("template_fields", "template_rowid", rowid)?;
        self.insert_template_field_row(rowid, position, field)
    }

    fn update_template_field(
        &mut self,
        template_id: Uuid,
        field: &TemplateField,
        expected_version: u64,
    ) -> CatalogResult<()> {
        let updated = self.conn.execute(
            "UPDATE template_fields SET name = ?1, field_type = ?2, default_value = ?3, version = ?4
             WHERE id = ?5 AND version = ?6
               AND template_rowid = (SELECT rowid FROM templates WHERE id = ?7)",
            params![
                field.nombre,
                field.tipo.to_db_str(),
                field.valor_default,
                field.version as i64,
                field.id.to_string(),
                expected_version as i64,
                template_id.to_string(),
            ],
        )?;
        if updated == 0 {
            return match self.child_version(
                "template_fields",
                "templates",
                "template_rowid",
                template_id,
                field.id,
            )? {
                Some(actual) => Err(CatalogError::Conflict {
                    entity_type: EntityType::TemplateField,
                    id: field.id,
                    expected: expected_version,
                    actual,
                }),
                None => Err(CatalogError::not_found(EntityType::TemplateField, field.id)),
            };
        }
        Ok(())
    }

    fn delete_template_field(&mut self, template_id: Uuid, field_id: Uuid) -> CatalogResult<()> {
        self.delete_child(
            "template_fields",
            "templates",
            "template_rowid",
            EntityType::TemplateField,
            template_id,
            field_id,
        )
    }

    fn enqueue_event(&mut self, event: &NewChangeEvent) -> CatalogResult<()> {
        let record = OutboxRecord::from_new_event(0, event, unix_millis_now())?;
        self.conn.execute(
            "INSERT INTO change_outbox (entity_type, entity_id, partition_key, operation, version,
                                        changed_fields, status, attempts, next_attempt_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9)",
            params![
                record.entity_type,
                record.entity_id,
                record.partition_key,
                record.operation,
                record.version,
                record.changed_fields,
                OutboxStatus::Pending.to_db_str(),
                record.next_attempt_at,
                record.created_at,
            ],
        )?;
        Ok(())
    }
}

// =============================================================================
// Outbox
// =============================================================================

impl OutboxStore for SqliteCatalogStore {
    fn fetch_due(&self, now_ms: i64, limit: usize) -> anyhow::Result<Vec<OutboxRecord>> {
        let conn = self.lock_write()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM change_outbox o
             WHERE o.status IN ('pending', 'parked')
               AND o.seq = (SELECT MIN(h.seq) FROM change_outbox h
                            WHERE h.partition_key = o.partition_key
                              AND h.status IN ('pending', 'parked'))
               AND o.next_attempt_at <= ?1
             ORDER BY o.seq
             LIMIT ?2",
            OUTBOX_COLUMNS
        ))?;
        let records = stmt
            .query_map(params![now_ms, limit as i64], outbox_record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn mark_published(&self, seq: i64, now_ms: i64) -> anyhow::Result<()> {
        let conn = self.lock_write()?;
        conn.execute(
            "UPDATE change_outbox SET status = 'published', published_at = ?1, last_error = NULL
             WHERE seq = ?2",
            params![now_ms, seq],
        )?;
        Ok(())
    }

    fn mark_retry(
        &self,
        seq: i64,
        attempts: u32,
        next_attempt_at: i64,
        error: &str,
        parked: bool,
    ) -> anyhow::Result<()> {
        let status = if parked {
            OutboxStatus::Parked
        } else {
            OutboxStatus::Pending
        };
        let conn = self.lock_write()?;
        conn.execute(
            "UPDATE change_outbox SET status = ?1, attempts = ?2, next_attempt_at = ?3, last_error = ?4
             WHERE seq = ?5",
            params![status.to_db_str(), attempts as i64, next_attempt_at, error, seq],
        )?;
        Ok(())
    }

    fn mark_dead_letter(&self, seq: i64, attempts: u32, error: &str) -> anyhow::Result<()> {
        let conn = self.lock_write()?;
        conn.execute(
            "UPDATE change_outbox SET status = 'dead_letter', attempts = ?1, last_error = ?2
             WHERE seq = ?3",
            params![attempts as i64, error, seq],
        )?;
        Ok(())
    }

    fn list_dead_letters(&self, limit: usize) -> anyhow::Result<Vec<OutboxRecord>> {
        let conn = self.lock_write()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM change_outbox WHERE status = 'dead_letter' ORDER BY seq LIMIT ?1",
            OUTBOX_COLUMNS
        ))?;
        let records = stmt
            .query_map(params![limit as i64], outbox_record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    fn requeue_dead_letter(&self, seq: i64, now_ms: i64) -> anyhow::Result<RequeueOutcome> {
        let conn = self.lock_write()?;
        let partition_key: Option<String> = conn
            .query_row(
                "SELECT partition_key FROM change_outbox WHERE seq = ?1 AND status = 'dead_letter'",
                params![seq],
                |r| r.get(0),
            )
            .optional()?;
        let Some(partition_key) = partition_key else {
            return Ok(RequeueOutcome::NotDeadLetter);
        };

        let published_seq: Option<i64> = conn.query_row(
            "SELECT MAX(seq) FROM change_outbox
             WHERE partition_key = ?1 AND seq > ?2 AND status = 'published'",
            params![partition_key, seq],
            |r| r.get(0),
        )?;
        if let Some(published_seq) = published_seq {
            return Ok(RequeueOutcome::Superseded { published_seq });
        }

        conn.execute(
            "UPDATE change_outbox SET status = 'pending', attempts = 0, next_attempt_at = ?1
             WHERE seq = ?2",
            params![now_ms, seq],
        )?;
        Ok(RequeueOutcome::Requeued)
    }

    fn status_counts(&self) -> anyhow::Result<OutboxCounts> {
        let conn = self.lock_write()?;
        let mut stmt =
            conn.prepare_cached("SELECT status, COUNT(*) FROM change_outbox GROUP BY status")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut counts = OutboxCounts::default();
        for (status, count) in rows {
            let status = OutboxStatus::from_db_str(&status)
                .with_context(|| format!("Unknown outbox status '{}'", status))?;
            counts.add(status, count as u64);
        }
        Ok(counts)
    }

    fn prune_published_before(&self, cutoff_ms: i64) -> anyhow::Result<usize> {
        let conn = self.lock_write()?;
        let deleted = conn.execute(
            "DELETE FROM change_outbox
             WHERE status = 'published' AND published_at < ?1
               AND NOT EXISTS (SELECT 1 FROM change_outbox d
                               WHERE d.partition_key = change_outbox.partition_key
                                 AND d.status = 'dead_letter'
                                 AND d.seq < change_outbox.seq)",
            params![cutoff_ms],
        )?;
        Ok(deleted)
    }

    fn partition_events(&self, partition_key: &str) -> anyhow::Result<Vec<OutboxRecord>> {
        let conn = self.lock_write()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {} FROM change_outbox WHERE partition_key = ?1 ORDER BY seq",
            OUTBOX_COLUMNS
        ))?;
        let records = stmt
            .query_map(params![partition_key], outbox_record_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog_store::filter::CatalogFilter;
    use crate::catalog_store::trait_def::in_transaction;
    use tempfile::TempDir;

    fn create_test_store() -> (SqliteCatalogStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("catalog.db");
        let store = SqliteCatalogStore::new(&db_path, 2).unwrap();
        (store, temp_dir)
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn make_datasource(nombre: &str, created: NaiveDate, field_names: &[&str]) -> Datasource {
        Datasource {
            id: Uuid::new_v4(),
            nombre: nombre.to_string(),
            autor: "rlh".to_string(),
            activo: true,
            json: Some("{}".to_string()),
            blockly: None,
            config: None,
            config_blockly: None,
            mapping: None,
            fecha_creacion: created,
            fecha_modificacion: created,
            version: 1,
            campos: field_names
                .iter()
                .map(|name| DatasourceField {
                    id: Uuid::new_v4(),
                    nombre: name.to_string(),
                    tipo: FieldType::Texto,
                    validaciones: None,
                    version: 1,
                })
                .collect(),
        }
    }

    fn insert(store: &SqliteCatalogStore, datasource: &Datasource) {
        in_transaction(store, |tx| {
            tx.insert_datasource(datasource)?;
            tx.enqueue_event(&NewChangeEvent::created(
                EntityType::Datasource,
                datasource.id,
                datasource.id,
            ))
        })
        .unwrap();
    }

    fn count_rows(store: &SqliteCatalogStore, table: &str) -> i64 {
        let conn = store.write_conn.lock().unwrap();
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |r| r.get(0))
            .unwrap()
    }

    #[test]
    fn test_insert_and_get_preserves_field_order() {
        let (store, _temp_dir) = create_test_store();
        let datasource = make_datasource("Clientes", date(2020, 1, 1), &["rfc", "nombre", "email"]);
        insert(&store, &datasource);

        let loaded = store.get_datasource(datasource.id).unwrap().unwrap();
        assert_eq!(loaded, datasource);
        assert!(store.get_datasource(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_template_with_destino_round_trips() {
        let (store, _temp_dir) = create_test_store();
        let template = Template {
            id: Uuid::new_v4(),
            nombre: "Aviso de pago".to_string(),
            file_repo: "repo/aviso.ftl".to_string(),
            destino: Some(Destino::Sms),
            json: None,
            blockly: None,
            autor: "rlh".to_string(),
            activo: false,
            fecha_creacion: date(2019, 6, 1),
            fecha_modificacion: date(2019, 6, 2),
            version: 1,
            campos: vec![TemplateField {
                id: Uuid::new_v4(),
                nombre: "monto".to_string(),
                tipo: FieldType::Real,
                valor_default: Some("0.0".to_string()),
                version: 1,
            }],
        };
        in_transaction(&store, |tx| tx.insert_template(&template)).unwrap();

        assert_eq!(store.get_template(template.id).unwrap(), Some(template));
    }

    #[test]
    fn test_update_is_guarded_by_version() {
        let (store, _temp_dir) = create_test_store();
        let datasource = make_datasource("Clientes", date(2020, 1, 1), &[]);
        insert(&store, &datasource);

        let mut first = datasource.clone();
        first.nombre = "Clientes VIP".to_string();
        first.version = 2;
        in_transaction(&store, |tx| tx.update_datasource(&first, 1)).unwrap();

        let mut stale = datasource.clone();
        stale.autor = "otro".to_string();
        stale.version = 2;
        let err = in_transaction(&store, |tx| tx.update_datasource(&stale, 1)).unwrap_err();
        match err {
            CatalogError::Conflict {
                expected, actual, ..
            } => {
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
            }
            other => panic!("expected conflict, got {:?}", other),
        }

        let missing = make_datasource("Nadie", date(2020, 1, 1), &[]);
        let err = in_transaction(&store, |tx| tx.update_datasource(&missing, 1)).unwrap_err();
        assert!(err.is_not_found());

        let loaded = store.get_datasource(datasource.id).unwrap().unwrap();
        assert_eq!(loaded.nombre, "Clientes VIP");
        assert_eq!(loaded.autor, "rlh");
    }

    #[test]
    fn test_delete_removes_fields_explicitly() {
        let (store, _temp_dir) = create_test_store();
        let keep = make_datasource("Otro", date(2020, 1, 1), &["a"]);
        let datasource = make_datasource("Clientes", date(2020, 1, 1), &["rfc", "email"]);
        insert(&store, &keep);
        insert(&store, &datasource);

        let removed = in_transaction(&store, |tx| tx.delete_datasource(datasource.id)).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(count_rows(&store, "datasource_fields"), 1);
        assert!(store.get_datasource(datasource.id).unwrap().is_none());

        let err = in_transaction(&store, |tx| tx.delete_datasource(datasource.id)).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_rollback_discards_entity_and_event() {
        let (store, _temp_dir) = create_test_store();
        let datasource = make_datasource("Clientes", date(2020, 1, 1), &["rfc"]);

        let result: CatalogResult<()> = in_transaction(&store, |tx| {
            tx.insert_datasource(&datasource)?;
            tx.enqueue_event(&NewChangeEvent::created(
                EntityType::Datasource,
                datasource.id,
                datasource.id,
            ))?;
            Err(CatalogError::validation("late failure"))
        });

        assert!(result.unwrap_err().is_validation());
        assert!(store.get_datasource(datasource.id).unwrap().is_none());
        assert_eq!(count_rows(&store, "change_outbox"), 0);
        assert_eq!(count_rows(&store, "datasource_fields"), 0);
    }

    #[test]
    fn test_field_operations_check_parent() {
        let (store, _temp_dir) = create_test_store();
        let a = make_datasource("A", date(2020, 1, 1), &["uno"]);
        let b = make_datasource("B", date(2020, 1, 1), &[]);
        insert(&store, &a);
        insert(&store, &b);

        let extra = DatasourceField {
            id: Uuid::new_v4(),
            nombre: "dos".to_string(),
            tipo: FieldType::Entero,
            validaciones: Some("min:0".to_string()),
            version: 1,
        };
        in_transaction(&store, |tx| tx.insert_datasource_field(a.id, &extra)).unwrap();
        let loaded = store.get_datasource(a.id).unwrap().unwrap();
        assert_eq!(
            loaded.campos.iter().map(|f| f.nombre.as_str()).collect::<Vec<_>>(),
            vec!["uno", "dos"]
        );

        // The field belongs to A, not B.
        let err =
            in_transaction(&store, |tx| tx.delete_datasource_field(b.id, extra.id)).unwrap_err();
        assert!(err.is_not_found());

        let mut renamed = extra.clone();
        renamed.nombre = "tres".to_string();
        renamed.version = 2;
        let err = in_transaction(&store, |tx| tx.update_datasource_field(b.id, &renamed, 1))
            .unwrap_err();
        assert!(err.is_not_found());
        in_transaction(&store, |tx| tx.update_datasource_field(a.id, &renamed, 1)).unwrap();
        let err = in_transaction(&store, |tx| tx.update_datasource_field(a.id, &renamed, 1))
            .unwrap_err();
        assert!(err.is_conflict());

        in_transaction(&store, |tx| tx.delete_datasource_field(a.id, extra.id)).unwrap();
        assert_eq!(store.get_datasource(a.id).unwrap().unwrap().campos.len(), 1);
    }

    #[test]
    fn test_list_filters_case_insensitively() {
        let (store, _temp_dir) = create_test_store();
        for nombre in ["Email Básico", "MAILING", "Reporte", "Ñandú Mail"] {
            insert(&store, &make_datasource(nombre, date(2020, 1, 1), &[]));
        }

        let predicate = CatalogFilter::default().with_nombre("mail").predicate();
        let page = store
            .list_datasources(&predicate, PageRequest::default())
            .unwrap();
        let names: Vec<_> = page.items.iter().map(|d| d.nombre.as_str()).collect();
        assert_eq!(names, vec!["Email Básico", "MAILING", "Ñandú Mail"]);
        assert_eq!(page.total_count, 3);

        let predicate = CatalogFilter::default().with_nombre("ÑANDÚ").predicate();
        let page = store
            .list_datasources(&predicate, PageRequest::default())
            .unwrap();
        assert_eq!(page.items.len(), 1);
    }

    #[test]
    fn test_list_filters_by_inclusive_date_range() {
        let (store, _temp_dir) = create_test_store();
        insert(&store, &make_datasource("mail 2016", date(2016, 12, 31), &[]));
        insert(&store, &make_datasource("mail start", date(2017, 1, 1), &[]));
        insert(&store, &make_datasource("mail end", date(2017, 12, 31), &[]));
        insert(&store, &make_datasource("mail 2018", date(2018, 1, 1), &[]));

        let range =
            crate::catalog_store::DateRange::new(date(2017, 1, 1), date(2017, 12, 31)).unwrap();
        let predicate = CatalogFilter::default()
            .with_nombre("mail")
            .with_fecha_creacion(range)
            .predicate();
        let page = store
            .list_datasources(&predicate, PageRequest::default())
            .unwrap();
        let names: Vec<_> = page.items.iter().map(|d| d.nombre.as_str()).collect();
        assert_eq!(names, vec!["mail start", "mail end"]);
    }

    #[test]
    fn test_list_paginates_in_insertion_order() {
        let (store, _temp_dir) = create_test_store();
        for i in 0..5 {
            insert(&store, &make_datasource(&format!("ds{}", i), date(2020, 1, 1), &["f"]));
        }

        let page = store
            .list_datasources(&Predicate::always(), PageRequest::new(1, 2).unwrap())
            .unwrap();
        let names: Vec<_> = page.items.iter().map(|d| d.nombre.as_str()).collect();
        assert_eq!(names, vec!["ds2", "ds3"]);
        assert_eq!(page.total_count, 5);
        assert_eq!(page.items[0].campos.len(), 1);

        let empty = store
            .list_datasources(&Predicate::always(), PageRequest::new(9, 2).unwrap())
            .unwrap();
        assert!(empty.items.is_empty());
        assert_eq!(empty.total_count, 5);
    }

    #[test]
    fn test_page_and_total_come_from_one_snapshot() {
        let (store, _temp_dir) = create_test_store();
        insert(&store, &make_datasource("A", date(2020, 1, 1), &["f"]));

        let read_conn = store.read_conn();
        let conn = lock_read(&read_conn).unwrap();
        let (rows, total) = read_snapshot(&conn, |conn| {
            let before: i64 =
                conn.query_row("SELECT COUNT(*) FROM datasources", [], |r| r.get(0))?;
            assert_eq!(before, 1);

            // Committed after the snapshot was taken
            insert(&store, &make_datasource("B", date(2020, 1, 2), &["f"]));

            query_page(
                conn,
                "datasources",
                DATASOURCE_COLUMNS,
                &Predicate::always(),
                PageRequest::new(0, 10).unwrap(),
                datasource_from_row,
            )
        })
        .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(total, 1);
        drop(conn);

        let page = store
            .list_datasources(&Predicate::always(), PageRequest::new(0, 10).unwrap())
            .unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.total_count, 2);
    }

    #[test]
    fn test_find_by_nombre_is_exact() {
        let (store, _temp_dir) = create_test_store();
        insert(&store, &make_datasource("Clientes", date(2020, 1, 1), &[]));
        insert(&store, &make_datasource("Clientes VIP", date(2020, 1, 1), &[]));

        assert_eq!(store.find_datasources_by_nombre("Clientes").unwrap().len(), 1);
        assert!(store.find_datasources_by_nombre("clientes").unwrap().is_empty());
    }

    #[test]
    fn test_fetch_due_returns_one_head_per_partition() {
        let (store, _temp_dir) = create_test_store();
        let a = make_datasource("A", date(2020, 1, 1), &[]);
        let b = make_datasource("B", date(2020, 1, 1), &[]);
        insert(&store, &a);
        insert(&store, &b);
        in_transaction(&store, |tx| {
            tx.enqueue_event(&NewChangeEvent::updated(
                EntityType::Datasource,
                a.id,
                a.id,
                2,
                vec!["nombre".to_string()],
            ))
        })
        .unwrap();

        let now = unix_millis_now();
        let due = store.fetch_due(now, 10).unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].entity_id, a.id.to_string());
        assert_eq!(due[0].version, 1);
        assert_eq!(due[1].entity_id, b.id.to_string());

        // A backing-off head holds back its own partition only.
        store
            .mark_retry(due[0].seq, 1, now + 60_000, "bus down", false)
            .unwrap();
        let due_now = store.fetch_due(now, 10).unwrap();
        assert_eq!(due_now.len(), 1);
        assert_eq!(due_now[0].entity_id, b.id.to_string());

        // Once the head is delivered, the next event of the partition becomes due.
        store.mark_published(due[0].seq, now).unwrap();
        let due_after = store.fetch_due(now, 10).unwrap();
        assert_eq!(due_after.len(), 2);
        let a_head = due_after
            .iter()
            .find(|r| r.entity_id == a.id.to_string())
            .unwrap();
        assert_eq!(a_head.version, 2);
        assert_eq!(
            a_head.envelope().unwrap().changed_fields,
            Some(vec!["nombre".to_string()])
        );
    }

    #[test]
    fn test_dead_letter_unblocks_partition_and_can_be_requeued() {
        let (store, _temp_dir) = create_test_store();
        let a = make_datasource("A", date(2020, 1, 1), &[]);
        insert(&store, &a);
        in_transaction(&store, |tx| {
            tx.enqueue_event(&NewChangeEvent::deleted(EntityType::Datasource, a.id, a.id, 2))
        })
        .unwrap();

        let now = unix_millis_now();
        let head = store.fetch_due(now, 10).unwrap().remove(0);
        store.mark_dead_letter(head.seq, 1, "rejected").unwrap();

        let due = store.fetch_due(now, 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].operation, "DELETED");

        let dead = store.list_dead_letters(10).unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].last_error.as_deref(), Some("rejected"));

        assert_eq!(
            store.requeue_dead_letter(head.seq, now).unwrap(),
            RequeueOutcome::Requeued
        );
        assert_eq!(
            store.requeue_dead_letter(head.seq, now).unwrap(),
            RequeueOutcome::NotDeadLetter
        );
        let counts = store.status_counts().unwrap();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.dead_letter, 0);
    }

    #[test]
    fn test_dead_letter_superseded_by_published_event_is_not_requeued() {
        let (store, _temp_dir) = create_test_store();
        let a = make_datasource("A", date(2020, 1, 1), &[]);
        insert(&store, &a);
        in_transaction(&store, |tx| {
            tx.enqueue_event(&NewChangeEvent::updated(
                EntityType::Datasource,
                a.id,
                a.id,
                2,
                vec!["nombre".to_string()],
            ))
        })
        .unwrap();

        let now = unix_millis_now();
        let created = store.fetch_due(now, 10).unwrap().remove(0);
        store.mark_dead_letter(created.seq, 1, "rejected").unwrap();
        let updated = store.fetch_due(now, 10).unwrap().remove(0);
        store.mark_published(updated.seq, 1_000).unwrap();

        assert_eq!(
            store.requeue_dead_letter(created.seq, now).unwrap(),
            RequeueOutcome::Superseded {
                published_seq: updated.seq
            }
        );
        assert_eq!(store.status_counts().unwrap().dead_letter, 1);

        // The published row stays while it shadows the dead letter.
        assert_eq!(store.prune_published_before(2_000).unwrap(), 0);
        assert_eq!(
            store.requeue_dead_letter(created.seq, now).unwrap(),
            RequeueOutcome::Superseded {
                published_seq: updated.seq
            }
        );
    }

    #[test]
    fn test_prune_only_removes_old_published_rows() {
        let (store, _temp_dir) = create_test_store();
        insert(&store, &make_datasource("A", date(2020, 1, 1), &[]));
        insert(&store, &make_datasource("B", date(2020, 1, 1), &[]));

        let due = store.fetch_due(unix_millis_now(), 10).unwrap();
        store.mark_published(due[0].seq, 1_000).unwrap();

        assert_eq!(store.prune_published_before(500).unwrap(), 0);
        assert_eq!(store.prune_published_before(2_000).unwrap(), 1);
        let counts = store.status_counts().unwrap();
        assert_eq!(counts.published, 0);
        assert_eq!(counts.pending, 1);
    }

    #[test]
    fn test_reopen_existing_database() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("catalog.db");
        let datasource = make_datasource("Persistente", date(2020, 1, 1), &["x"]);
        {
            let store = SqliteCatalogStore::new(&db_path, 1).unwrap();
            insert(&store, &datasource);
        }

        let store = SqliteCatalogStore::new(&db_path, 1).unwrap();
        assert_eq!(store.get_datasource(datasource.id).unwrap(), Some(datasource));
        assert_eq!(store.status_counts().unwrap().pending, 1);
    }
}
