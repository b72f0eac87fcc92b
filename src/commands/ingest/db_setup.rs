use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use rusqlite::Connection;
use tracing::warn;

use crate::util::{ensure_directory, now_utc_string};

use super::DB_SCHEMA_VERSION;

/// Opens (creating if needed) the store and applies connection pragmas.
pub(crate) fn open_store(db_path: &Path, busy_timeout: Duration) -> Result<Connection> {
    if let Some(parent) = db_path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        ensure_directory(parent)?;
    }

    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    configure_connection(&connection, busy_timeout)?;
    Ok(connection)
}

pub(crate) fn configure_connection(connection: &Connection, busy_timeout: Duration) -> Result<()> {
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to set journal_mode=WAL")?;
    connection
        .pragma_update(None, "synchronous", "NORMAL")
        .context("failed to set synchronous=NORMAL")?;
    connection
        .busy_timeout(busy_timeout)
        .context("failed to set busy timeout")?;
    Ok(())
}

pub(crate) fn ensure_schema(connection: &Connection) -> Result<()> {
    connection
        .execute_batch(
            "
            CREATE TABLE IF NOT EXISTS metadata (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS Lot_info (
              LotId TEXT,
              Recipe TEXT,
              AllowSizeNull TEXT,
              CountUniqueBarcodesOnly TEXT,
              Size INTEGER,
              CarrierIndex INTEGER,
              TrayId TEXT,
              TrayState INTEGER,
              TrayCode TEXT,
              UnitId TEXT,
              UnitState INTEGER,
              UnitCode TEXT,
              UnitIdx INTEGER,
              source_filename TEXT,
              UNIQUE(LotId, TrayId, UnitIdx)
            );

            CREATE TABLE IF NOT EXISTS Void_results (
              BoardBarcode TEXT,
              ModuleIndex TEXT,
              JointType TEXT,
              Pin TEXT,
              TotalVoidRatio TEXT,
              LargestVoidRatio TEXT,
              SpreadX TEXT,
              SpreadY TEXT,
              GVMean TEXT,
              DefectCode TEXT,
              SystemDefect TEXT,
              PinStatus TEXT,
              Lot TEXT,
              ModuleStatus TEXT,
              DeviceStatus TEXT,
              source_filename TEXT,
              UNIQUE(BoardBarcode, ModuleIndex, JointType, Pin)
            );

            CREATE TABLE IF NOT EXISTS file_state (
              stream TEXT NOT NULL,
              file_path TEXT NOT NULL,
              mtime_ns INTEGER NOT NULL,
              size INTEGER NOT NULL,
              status TEXT NOT NULL,
              processed_at TEXT NOT NULL,
              checksum TEXT,
              failed_attempts INTEGER NOT NULL DEFAULT 0,
              PRIMARY KEY (stream, file_path)
            );
            ",
        )
        .context("failed to create ingest tables")?;

    // Stores written by the earliest pipeline revision lack the filename column.
    ensure_column_exists(connection, "Lot_info", "source_filename TEXT")?;
    ensure_column_exists(connection, "Void_results", "source_filename TEXT")?;

    ensure_key_index(
        connection,
        "ux_lot_info_key",
        "Lot_info",
        &["LotId", "TrayId", "UnitIdx"],
    )?;
    ensure_key_index(
        connection,
        "ux_void_results_key",
        "Void_results",
        &["BoardBarcode", "ModuleIndex", "JointType", "Pin"],
    )?;

    connection.execute_batch(
        "
        CREATE INDEX IF NOT EXISTS idx_file_state_status ON file_state(stream, status);
        CREATE INDEX IF NOT EXISTS idx_void_results_lot ON Void_results(Lot);
        ",
    )?;

    let now = now_utc_string();
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_schema_version', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [DB_SCHEMA_VERSION],
    )?;
    connection.execute(
        "INSERT INTO metadata(key, value) VALUES('db_updated_at', ?1)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
        [now],
    )?;

    Ok(())
}

/// Unique index over `key_columns` with NULL folded to `''`, so rows with an
/// absent key part still collide on insert-or-ignore.
///
/// A store that already holds rows colliding under that rule keeps working
/// without the index.
fn ensure_key_index(
    connection: &Connection,
    index_name: &str,
    table_name: &str,
    key_columns: &[&str],
) -> Result<()> {
    let key = key_columns
        .iter()
        .map(|column| format!("IFNULL({column}, '')"))
        .collect::<Vec<_>>()
        .join(", ");

    let existing = count_rows(
        connection,
        &format!("SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = '{index_name}'"),
    )?;
    if existing > 0 {
        return Ok(());
    }

    let collisions = count_rows(
        connection,
        &format!(
            "SELECT COUNT(*) FROM (SELECT 1 FROM {table_name} GROUP BY {key} HAVING COUNT(*) > 1)"
        ),
    )?;
    if collisions > 0 {
        warn!(
            table = table_name,
            index = index_name,
            collisions,
            "existing rows share a key with NULL parts, skipping key index"
        );
        return Ok(());
    }

    connection
        .execute_batch(&format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {index_name} ON {table_name}({key})"
        ))
        .with_context(|| format!("failed to create index {index_name}"))?;

    Ok(())
}

pub(crate) fn ensure_column_exists(
    connection: &Connection,
    table_name: &str,
    column_definition: &str,
) -> Result<()> {
    let Some(column_name) = column_definition.split_whitespace().next() else {
        bail!("invalid column definition: {column_definition}");
    };

    if table_columns(connection, "main", table_name)?
        .iter()
        .any(|existing| existing.eq_ignore_ascii_case(column_name))
    {
        return Ok(());
    }

    let alter_sql = format!("ALTER TABLE {table_name} ADD COLUMN {column_definition}");
    connection
        .execute(&alter_sql, [])
        .with_context(|| format!("failed to add column {column_name} on {table_name}"))?;

    Ok(())
}

/// Column names of `table_name` in the attached database `schema`.
pub(crate) fn table_columns(
    connection: &Connection,
    schema: &str,
    table_name: &str,
) -> Result<Vec<String>> {
    let pragma_sql = format!("PRAGMA {schema}.table_info({table_name})");
    let mut statement = connection
        .prepare(&pragma_sql)
        .with_context(|| format!("failed to inspect schema for table {schema}.{table_name}"))?;

    let mut columns = Vec::new();
    let mut rows = statement.query([])?;
    while let Some(row) = rows.next()? {
        columns.push(row.get::<_, String>(1)?);
    }

    Ok(columns)
}

pub(crate) fn count_rows(connection: &Connection, sql: &str) -> Result<i64> {
    let count = connection
        .query_row(sql, [], |row| row.get(0))
        .with_context(|| format!("failed to run count query: {sql}"))?;
    Ok(count)
}
