use std::path::Path;

use anyhow::{Context, Result, bail};
use rusqlite::{Connection, Transaction};
use tracing::{info, warn};

use crate::cli::MergeArgs;
use crate::commands::ingest::{StoredRecord, count_rows, ensure_schema, open_store, table_columns};
use crate::config::{PipelineConfig, default_db_path};
use crate::model::{LotRecord, MeasurementRecord};

const SOURCE_SCHEMA: &str = "source";

#[derive(Debug, Clone)]
pub struct TableMerge {
    pub table: &'static str,
    pub source_rows: i64,
    pub rows_inserted: usize,
    pub skipped: bool,
}

pub fn run(args: MergeArgs) -> Result<()> {
    let db_path = args
        .db_path
        .clone()
        .unwrap_or_else(|| default_db_path(&args.data_root));

    if !args.source_db.is_file() {
        bail!("source store not found: {}", args.source_db.display());
    }

    info!(
        source = %args.source_db.display(),
        destination = %db_path.display(),
        "merging record tables"
    );

    let mut connection = open_store(&db_path, PipelineConfig::default().busy_timeout())?;
    ensure_schema(&connection)?;

    let merges = merge_store(&mut connection, &args.source_db)?;
    for merge in &merges {
        info!(
            table = merge.table,
            source_rows = merge.source_rows,
            rows_inserted = merge.rows_inserted,
            skipped = merge.skipped,
            "table merged"
        );
    }

    Ok(())
}

/// Copies both record tables from the store at `source` with insert-or-ignore.
///
/// Tracker entries are not merged. Tables the source lacks are reported as
/// skipped; columns the source lacks are left NULL.
pub fn merge_store(connection: &mut Connection, source: &Path) -> Result<Vec<TableMerge>> {
    connection
        .execute(
            &format!("ATTACH DATABASE ?1 AS {SOURCE_SCHEMA}"),
            [source.to_string_lossy().into_owned()],
        )
        .with_context(|| format!("failed to attach {}", source.display()))?;

    let merged = merge_attached(connection);

    connection
        .execute_batch(&format!("DETACH DATABASE {SOURCE_SCHEMA}"))
        .context("failed to detach source store")?;

    merged
}

fn merge_attached(connection: &mut Connection) -> Result<Vec<TableMerge>> {
    let tx = connection
        .transaction()
        .context("failed to begin merge transaction")?;

    let merges = vec![
        merge_table::<LotRecord>(&tx)?,
        merge_table::<MeasurementRecord>(&tx)?,
    ];

    tx.commit().context("failed to commit merge")?;
    Ok(merges)
}

fn merge_table<R: StoredRecord>(tx: &Transaction<'_>) -> Result<TableMerge> {
    let source_columns = table_columns(tx, SOURCE_SCHEMA, R::TABLE)?;
    if source_columns.is_empty() {
        warn!(table = R::TABLE, "table missing in source store, skipping");
        return Ok(TableMerge {
            table: R::TABLE,
            source_rows: 0,
            rows_inserted: 0,
            skipped: true,
        });
    }

    let shared: Vec<&str> = R::COLUMNS
        .iter()
        .copied()
        .filter(|column| {
            source_columns
                .iter()
                .any(|source_column| source_column.eq_ignore_ascii_case(column))
        })
        .collect();
    if shared.is_empty() {
        warn!(table = R::TABLE, "source table shares no columns, skipping");
        return Ok(TableMerge {
            table: R::TABLE,
            source_rows: 0,
            rows_inserted: 0,
            skipped: true,
        });
    }

    let source_rows = count_rows(
        tx,
        &format!("SELECT COUNT(*) FROM {SOURCE_SCHEMA}.{}", R::TABLE),
    )?;

    let column_list = shared.join(", ");
    let rows_inserted = tx
        .execute(
            &format!(
                "INSERT OR IGNORE INTO main.{table}({column_list}) SELECT {column_list} FROM {SOURCE_SCHEMA}.{table}",
                table = R::TABLE
            ),
            [],
        )
        .with_context(|| format!("failed to merge {}", R::TABLE))?;

    Ok(TableMerge {
        table: R::TABLE,
        source_rows,
        rows_inserted,
        skipped: false,
    })
}
