// Thin driver layer over the relational backend.
//
// One `Database` wraps exactly one connection; connections are opened per
// worker and never shared across threads. The embedded backend is SQLite;
// the client/server dialects are carried as `DbType` so the query builder
// and schema initializer can emit their SQL, and plug in behind this seam.

use anyhow::{Context, Result as AnyResult};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::types::{ToSqlOutput, ValueRef};
use rusqlite::{Connection, OpenFlags, ToSql};
use std::path::Path;
use tracing::debug;

use crate::error::{Error, Result, StorageOp};

/// SQL dialect of the backend behind the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DbType {
    #[default]
    Sqlite,
    MySql,
    PostgreSql,
}

impl DbType {
    pub fn from_driver_name(name: &str) -> Option<Self> {
        match name {
            "Sqlite" | "QSQLITE" => Some(DbType::Sqlite),
            "MySql" | "QMYSQL" => Some(DbType::MySql),
            "PostgreSql" | "QPSQL" => Some(DbType::PostgreSql),
            _ => None,
        }
    }

    /// Statement probing for an existing index; backend-specific.
    pub fn has_index_query(self, table: &str, index: &str) -> String {
        match self {
            DbType::Sqlite => format!(
                "SELECT name FROM sqlite_master WHERE type='index' AND tbl_name='{table}' AND name='{index}'"
            ),
            DbType::MySql => {
                format!("SHOW INDEXES FROM {table} WHERE `Key_name` = '{index}'")
            }
            DbType::PostgreSql => format!(
                "SELECT indexname FROM pg_catalog.pg_indexes WHERE tablename ilike '{table}' AND indexname ilike '{index}'"
            ),
        }
    }

    /// SQL column type for one of our schema column types.
    pub fn sql_type(self, column: ColumnType) -> &'static str {
        match (self, column) {
            (DbType::PostgreSql, ColumnType::Int64) => "int8",
            (_, ColumnType::Int64) => "BIGINT",
            (_, ColumnType::Int32) => "INTEGER",
            (_, ColumnType::Bool) => "BOOL",
            (DbType::MySql, ColumnType::Text) => "VARCHAR(255)",
            (_, ColumnType::Text) => "TEXT",
            (DbType::PostgreSql, ColumnType::Blob) => "BYTEA",
            (DbType::MySql, ColumnType::Blob) => "LONGBLOB",
            (_, ColumnType::Blob) => "BLOB",
            (_, ColumnType::DateTime) => "TIMESTAMP",
        }
    }

    /// Clause appended to the primary key column to auto-assign ids.
    pub fn autoincrement_clause(self) -> &'static str {
        match self {
            DbType::Sqlite => "PRIMARY KEY AUTOINCREMENT",
            DbType::MySql => "PRIMARY KEY AUTO_INCREMENT",
            DbType::PostgreSql => "PRIMARY KEY", // column type is SERIAL-style int8 + sequence
        }
    }
}

/// Abstract column type used by the schema description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int64,
    Int32,
    Bool,
    Text,
    Blob,
    DateTime,
}

/// A parameter or result value travelling through the driver.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Double(f64),
    Text(String),
    Blob(Vec<u8>),
    DateTime(DateTime<Utc>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            Value::Int(v) => *v,
            _ => 0,
        }
    }

    pub fn as_opt_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> bool {
        matches!(self, Value::Int(v) if *v != 0)
    }

    pub fn as_string(&self) -> String {
        match self {
            Value::Text(s) => s.clone(),
            Value::Blob(b) => String::from_utf8_lossy(b).into_owned(),
            Value::Int(v) => v.to_string(),
            _ => String::new(),
        }
    }

    pub fn as_opt_string(&self) -> Option<String> {
        match self {
            Value::Null => None,
            other => Some(other.as_string()),
        }
    }

    pub fn as_blob(&self) -> Vec<u8> {
        match self {
            Value::Blob(b) => b.clone(),
            Value::Text(s) => s.clone().into_bytes(),
            _ => Vec::new(),
        }
    }

    /// Datetimes come back as the driver's text form.
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::DateTime(dt) => Some(*dt),
            Value::Text(s) => DateTime::parse_from_rfc3339(s)
                .map(|dt| dt.with_timezone(&Utc))
                .ok(),
            Value::Int(secs) => Utc.timestamp_opt(*secs, 0).single(),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Int(v as i64)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Blob(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::DateTime(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(inner) => inner.into(),
            None => Value::Null,
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            Value::Null => Ok(ToSqlOutput::Owned(rusqlite::types::Value::Null)),
            Value::Int(v) => v.to_sql(),
            Value::Double(v) => v.to_sql(),
            Value::Text(v) => v.to_sql(),
            Value::Blob(v) => v.to_sql(),
            Value::DateTime(v) => v.to_sql(),
        }
    }
}

fn value_from_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(v) => Value::Int(v),
        ValueRef::Real(v) => Value::Double(v),
        ValueRef::Text(v) => Value::Text(String::from_utf8_lossy(v).into_owned()),
        ValueRef::Blob(v) => Value::Blob(v.to_vec()),
    }
}

/// One result row, by projection order.
pub type Row = Vec<Value>;

/// One open backend connection plus its dialect. The connection belongs
/// to a single session or worker; the mutex exists so the handle can be
/// held across that task's suspension points, not for sharing.
pub struct Database {
    conn: Mutex<Connection>,
    db_type: DbType,
}

impl Database {
    /// Open (and create if needed) the embedded database file.
    pub fn open(path: &Path) -> AnyResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create data directory {}", parent.display()))?;
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .with_context(|| format!("Failed to open database {}", path.display()))?;
        Self::from_connection(conn)
    }

    /// Private in-memory database, used by tests and tooling.
    pub fn open_in_memory() -> AnyResult<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> AnyResult<Self> {
        // Statement cache is process-wide policy: bounded LRU per connection.
        conn.set_prepared_statement_cache_capacity(128);
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;\n\
             PRAGMA journal_mode = WAL;\n\
             PRAGMA synchronous = NORMAL;\n\
             PRAGMA busy_timeout = 5000;",
        )
        .context("Failed to apply connection pragmas")?;
        Ok(Self {
            conn: Mutex::new(conn),
            db_type: DbType::Sqlite,
        })
    }

    pub fn db_type(&self) -> DbType {
        self.db_type
    }

    /// Execute a non-SELECT statement, returning affected row count.
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<usize> {
        debug!(target: "pimstore::storage", sql, "execute");
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(sql)
            .map_err(|e| Error::storage(StorageOp::Prepare, sql, e))?;
        stmt.execute(rusqlite::params_from_iter(params.iter()))
            .map_err(|e| Error::storage(StorageOp::Exec, sql, e))
    }

    /// Execute a SELECT, materializing all rows.
    pub fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        debug!(target: "pimstore::storage", sql, "query");
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare_cached(sql)
            .map_err(|e| Error::storage(StorageOp::Prepare, sql, e))?;
        let column_count = stmt.column_count();
        let mut rows = stmt
            .query(rusqlite::params_from_iter(params.iter()))
            .map_err(|e| Error::storage(StorageOp::Bind, sql, e))?;
        let mut result = Vec::new();
        loop {
            match rows.next() {
                Ok(Some(row)) => {
                    let mut values = Vec::with_capacity(column_count);
                    for i in 0..column_count {
                        let value = row
                            .get_ref(i)
                            .map_err(|e| Error::storage(StorageOp::Exec, sql, e))?;
                        values.push(value_from_ref(value));
                    }
                    result.push(values);
                }
                Ok(None) => break,
                Err(e) => return Err(Error::storage(StorageOp::Exec, sql, e)),
            }
        }
        Ok(result)
    }

    /// Id assigned by the most recent insert on this connection.
    pub fn last_insert_id(&self) -> i64 {
        self.conn.lock().last_insert_rowid()
    }

    pub fn begin(&self) -> Result<()> {
        self.execute_simple("BEGIN")
    }

    pub fn commit(&self) -> Result<()> {
        self.execute_simple("COMMIT")
    }

    pub fn rollback(&self) -> Result<()> {
        self.execute_simple("ROLLBACK")
    }

    fn execute_simple(&self, sql: &str) -> Result<()> {
        self.conn
            .lock()
            .execute_batch(sql)
            .map_err(|e| Error::storage(StorageOp::Exec, sql, e))
    }

    pub fn has_table(&self, table: &str) -> Result<bool> {
        let sql = "SELECT name FROM sqlite_master WHERE type='table' AND name=?1";
        Ok(!self.query(sql, &[Value::Text(table.to_string())])?.is_empty())
    }

    pub fn has_index(&self, table: &str, index: &str) -> Result<bool> {
        let sql = self.db_type.has_index_query(table, index);
        Ok(!self.query(&sql, &[])?.is_empty())
    }

    pub fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        let sql = format!("PRAGMA table_info({table})");
        let rows = self.query(&sql, &[])?;
        Ok(rows.iter().map(|row| row[1].as_string()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_and_query_roundtrip() {
        let db = Database::open_in_memory().unwrap();
        db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT, data BLOB)", &[])
            .unwrap();
        db.execute(
            "INSERT INTO t (name, data) VALUES (?1, ?2)",
            &[Value::from("alpha"), Value::from(b"raw".to_vec())],
        )
        .unwrap();
        assert_eq!(db.last_insert_id(), 1);
        let rows = db.query("SELECT id, name, data FROM t", &[]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0].as_i64(), 1);
        assert_eq!(rows[0][1].as_string(), "alpha");
        assert_eq!(rows[0][2].as_blob(), b"raw");
    }

    #[test]
    fn prepare_failure_reports_statement() {
        let db = Database::open_in_memory().unwrap();
        let err = db.execute("NOT A STATEMENT", &[]).unwrap_err();
        match err {
            Error::Storage { op, sql, .. } => {
                assert_eq!(op, StorageOp::Prepare);
                assert_eq!(sql, "NOT A STATEMENT");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn datetime_values_roundtrip_through_text() {
        let db = Database::open_in_memory().unwrap();
        db.execute("CREATE TABLE t (ts TIMESTAMP)", &[]).unwrap();
        let now = Utc::now();
        db.execute("INSERT INTO t (ts) VALUES (?1)", &[Value::from(now)])
            .unwrap();
        let rows = db.query("SELECT ts FROM t", &[]).unwrap();
        let read = rows[0][0].as_datetime().unwrap();
        assert_eq!(read.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn introspection_sees_tables_and_indexes() {
        let db = Database::open_in_memory().unwrap();
        db.execute("CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT)", &[])
            .unwrap();
        db.execute("CREATE INDEX t_name_idx ON t (name)", &[]).unwrap();
        assert!(db.has_table("t").unwrap());
        assert!(!db.has_table("missing").unwrap());
        assert!(db.has_index("t", "t_name_idx").unwrap());
        assert!(!db.has_index("t", "other_idx").unwrap());
        assert_eq!(db.table_columns("t").unwrap(), vec!["id", "name"]);
    }
}
