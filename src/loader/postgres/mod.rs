//! The reference `Loader` backend, built directly on the `postgres` crate
//! (not Diesel) so native `COPY ... FROM STDIN` is reachable. See
//! DESIGN.md for why this crate drops Diesel entirely.

mod ddl;
#[cfg(test)]
mod tests;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use postgres::error::SqlState;
use postgres::NoTls;
use r2d2::Pool;
use r2d2_postgres::PostgresConnectionManager;
use tracing::{info, instrument, warn};

use crate::errors::LoadError;
use crate::model::{FileStatus, LoadMode, SchemaType, TableSpec, ETL_FILE_HISTORY, ICSR_AUDIT, ICSR_MASTER, NORMALIZED_TABLES};
use crate::transformer::normalized::NormalizedOutput;
use crate::transformer::CsvBuffer;

use super::merge::build_upsert_sql;
use super::{FileContext, LoadOutcome, Loader};

pub type PgPool = Pool<PostgresConnectionManager<NoTls>>;

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

pub struct PostgresLoader {
    pool: PgPool,
}

pub fn register() {
    super::register_backend("postgres", factory);
}

pub fn factory(dsn: &str) -> Result<Arc<dyn Loader>, LoadError> {
    let config: postgres::Config = dsn.parse()?;
    let manager = PostgresConnectionManager::new(config, NoTls);
    let pool = Pool::builder().build(manager)?;
    Ok(Arc::new(PostgresLoader { pool }))
}

impl PostgresLoader {
    pub fn from_pool(pool: PgPool) -> Self {
        PostgresLoader { pool }
    }

    fn conn(&self) -> Result<r2d2::PooledConnection<PostgresConnectionManager<NoTls>>, LoadError> {
        Ok(self.pool.get()?)
    }
}

impl Loader for PostgresLoader {
    fn create_all_tables(&self, schema: SchemaType) -> Result<(), LoadError> {
        let mut conn = self.conn()?;
        conn.batch_execute(ddl::statements_for(schema))?;
        conn.batch_execute(ddl::FILE_HISTORY_DDL)?;
        Ok(())
    }

    fn validate_schema(&self, schema: SchemaType) -> Result<(), LoadError> {
        let mut conn = self.conn()?;
        let tables: Vec<&TableSpec> = match schema {
            SchemaType::Normalized => NORMALIZED_TABLES.iter().collect(),
            SchemaType::Audit => vec![&ICSR_AUDIT],
        };

        for table in tables {
            let rows = conn.query(
                "SELECT column_name FROM information_schema.columns WHERE table_name = $1",
                &[&table.name],
            )?;
            if rows.is_empty() {
                return Err(LoadError::SchemaMismatch(format!("table {} does not exist", table.name)));
            }
            let found: HashSet<String> = rows.iter().map(|row| row.get(0)).collect();
            for expected in table.columns {
                if !found.contains(*expected) {
                    return Err(LoadError::SchemaMismatch(format!(
                        "table {} is missing column {}",
                        table.name, expected
                    )));
                }
            }
        }
        Ok(())
    }

    fn get_completed_file_hashes(&self) -> Result<HashSet<String>, LoadError> {
        let mut conn = self.conn()?;
        let rows = conn.query(
            "SELECT file_hash FROM etl_file_history WHERE status = $1",
            &[&"completed"],
        )?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    /// Truncates every target table exactly once, ahead of the worker pool.
    /// Per-file transactions must never do this themselves: a `full` run
    /// processes many files concurrently, and a `TRUNCATE` inside one
    /// file's transaction would wipe rows another worker already committed.
    fn prepare_full_load(&self, schema: SchemaType) -> Result<(), LoadError> {
        let mut conn = self.conn()?;
        let tables: Vec<&TableSpec> = match schema {
            SchemaType::Normalized => NORMALIZED_TABLES.iter().collect(),
            SchemaType::Audit => vec![&ICSR_AUDIT],
        };

        let mut txn = conn.transaction()?;
        for table in tables {
            txn.execute(&format!("TRUNCATE TABLE {} CASCADE", table.name), &[])?;
        }
        txn.commit()?;
        Ok(())
    }

    #[instrument(skip(self, data), fields(file = %ctx.filename, hash = %ctx.file_hash))]
    fn load_normalized_data(&self, ctx: &FileContext, mut data: NormalizedOutput) -> Result<LoadOutcome, LoadError> {
        let mut conn = self.conn()?;
        let result = (|| -> Result<LoadOutcome, LoadError> {
            let mut txn = conn.transaction()?;
            apply_statement_timeout(&mut txn, ctx.timeout_secs)?;
            record_pending(&mut txn, ctx)?;
            let mut outcome = LoadOutcome::default();

            let mut staging_names = std::collections::HashMap::new();
            for table in NORMALIZED_TABLES {
                let target = prepare_load(&mut txn, table, ctx.mode)?;
                staging_names.insert(table.name, target);
            }

            for table in NORMALIZED_TABLES {
                let target = staging_names.get(table.name).expect("prepared above");
                if let Some(buffer) = data.buffers.get_mut(table.name) {
                    bulk_load_native(&mut txn, target, table, buffer)?;
                }
            }

            if ctx.mode == LoadMode::Delta {
                let master_staging = staging_names.get(ICSR_MASTER.name).expect("prepared above");
                let superseded = handle_master_upsert(&mut txn, master_staging, ctx.timeout_secs)?;
                if !superseded.is_empty() {
                    for table in NORMALIZED_TABLES.iter().filter(|t| t.name != ICSR_MASTER.name) {
                        delete_superseded_children(&mut txn, table, &superseded, ctx.timeout_secs)?;
                    }
                }
                for table in NORMALIZED_TABLES.iter().filter(|t| t.name != ICSR_MASTER.name) {
                    let staging = staging_names.get(table.name).expect("prepared above");
                    handle_upsert(&mut txn, staging, table, ctx.timeout_secs)?;
                }
            }

            for table in NORMALIZED_TABLES {
                outcome
                    .rows_by_table
                    .insert(table.name.to_string(), *data.row_counts.get(table.name).unwrap_or(&0));
            }

            record_history(&mut txn, ctx, FileStatus::Completed.as_db_str(), outcome.total_rows())?;
            txn.commit()?;
            info!(rows = outcome.total_rows(), "normalized load committed");
            Ok(outcome)
        })();

        if result.is_err() {
            if let Err(history_err) = record_failure(&self.pool, ctx) {
                warn!(error = %history_err, "could not record failed file history");
            }
        }
        result
    }

    #[instrument(skip(self, buffer), fields(file = %ctx.filename, hash = %ctx.file_hash))]
    fn load_audit_data(&self, ctx: &FileContext, mut buffer: CsvBuffer, row_count: usize) -> Result<LoadOutcome, LoadError> {
        let mut conn = self.conn()?;
        let result = (|| -> Result<LoadOutcome, LoadError> {
            let mut txn = conn.transaction()?;
            apply_statement_timeout(&mut txn, ctx.timeout_secs)?;
            record_pending(&mut txn, ctx)?;
            let target = prepare_load(&mut txn, &ICSR_AUDIT, ctx.mode)?;
            bulk_load_native(&mut txn, &target, &ICSR_AUDIT, &mut buffer)?;

            if ctx.mode == LoadMode::Delta {
                handle_upsert(&mut txn, &target, &ICSR_AUDIT, ctx.timeout_secs)?;
            }

            record_history(&mut txn, ctx, FileStatus::Completed.as_db_str(), row_count)?;
            txn.commit()?;

            let mut outcome = LoadOutcome::default();
            outcome.rows_by_table.insert(ICSR_AUDIT.name.to_string(), row_count);
            info!(rows = row_count, "audit load committed");
            Ok(outcome)
        })();

        if result.is_err() {
            if let Err(history_err) = record_failure(&self.pool, ctx) {
                warn!(error = %history_err, "could not record failed file history");
            }
        }
        result
    }
}

/// For `full` mode, loads straight into the target (already truncated once
/// for the whole run by [`Loader::prepare_full_load`]) and returns its own
/// name. For `delta` mode, creates a session-scoped staging table shaped
/// like the target and returns its generated name.
fn prepare_load(txn: &mut postgres::Transaction, table: &TableSpec, mode: LoadMode) -> Result<String, LoadError> {
    match mode {
        LoadMode::Full => Ok(table.name.to_string()),
        LoadMode::Delta => {
            let token = STAGING_COUNTER.fetch_add(1, Ordering::Relaxed);
            let staging = format!("{}_staging_{}", table.name, token);
            txn.batch_execute(&format!(
                "CREATE TEMPORARY TABLE {staging} (LIKE {target} INCLUDING DEFAULTS) ON COMMIT DROP",
                staging = staging,
                target = table.name,
            ))?;
            Ok(staging)
        }
    }
}

/// Streams an already-rewound CSV buffer into Postgres's native COPY
/// protocol. No row is ever parsed on the Rust side.
fn bulk_load_native(
    txn: &mut postgres::Transaction,
    target: &str,
    table: &TableSpec,
    buffer: &mut CsvBuffer,
) -> Result<u64, LoadError> {
    let columns = table.load_columns().join(", ");
    let sql = format!("COPY {target} ({columns}) FROM STDIN WITH (FORMAT csv, HEADER true)");
    let mut writer = txn.copy_in(&sql)?;
    std::io::copy(buffer, &mut writer).map_err(|e| LoadError::Transient(e.to_string()))?;
    let rows = writer.finish()?;
    Ok(rows)
}

fn handle_upsert(txn: &mut postgres::Transaction, staging: &str, table: &TableSpec, timeout_secs: u64) -> Result<(), LoadError> {
    let sql = build_upsert_sql(staging, table);
    txn.execute(&sql, &[]).map_err(|e| timeout_aware(e.into(), timeout_secs))?;
    Ok(())
}

/// Upserts the master table and returns the `safetyreportid`s that the
/// version gate actually let through. Those are the reports whose child
/// rows (drugs, reactions, ...) are now stale and must be replaced, since
/// the child tables' own upserts are plain `DO NOTHING` on conflict.
fn handle_master_upsert(txn: &mut postgres::Transaction, staging: &str, timeout_secs: u64) -> Result<Vec<String>, LoadError> {
    let sql = build_upsert_sql(staging, &ICSR_MASTER);
    let rows = txn.query(&sql, &[]).map_err(|e| timeout_aware(e.into(), timeout_secs))?;
    Ok(rows.iter().map(|row| row.get(0)).collect())
}

/// Deletes rows belonging to superseded `safetyreportid`s from a child
/// table before its staging data is upserted in, so the subsequent
/// `ON CONFLICT DO NOTHING` insert doesn't leave rows from the previous
/// version of the report behind.
fn delete_superseded_children(
    txn: &mut postgres::Transaction,
    table: &TableSpec,
    safetyreportids: &[String],
    timeout_secs: u64,
) -> Result<(), LoadError> {
    txn.execute(
        &format!("DELETE FROM {table} WHERE safetyreportid = ANY($1)", table = table.name),
        &[&safetyreportids],
    )
    .map_err(|e| timeout_aware(e.into(), timeout_secs))?;
    Ok(())
}

/// Sets a session-local statement timeout for the rest of the transaction.
/// `0` means "no timeout", matching the config knob's documented meaning.
fn apply_statement_timeout(txn: &mut postgres::Transaction, timeout_secs: u64) -> Result<(), LoadError> {
    if timeout_secs == 0 {
        return Ok(());
    }
    txn.batch_execute(&format!("SET LOCAL statement_timeout = {}", timeout_secs * 1000))?;
    Ok(())
}

/// Postgres reports a timed-out statement as a generic `QUERY_CANCELED`
/// error; translate it into the typed [`LoadError::Timeout`] the rest of
/// the pipeline matches on.
fn timeout_aware(err: LoadError, timeout_secs: u64) -> LoadError {
    if let LoadError::Db(db_err) = &err {
        if db_err.code() == Some(&SqlState::QUERY_CANCELED) {
            return LoadError::Timeout(Duration::from_secs(timeout_secs));
        }
    }
    err
}

fn record_pending(txn: &mut postgres::Transaction, ctx: &FileContext) -> Result<(), LoadError> {
    record_history(txn, ctx, FileStatus::Pending.as_db_str(), 0)
}

fn record_history(txn: &mut postgres::Transaction, ctx: &FileContext, status: &str, rows: usize) -> Result<(), LoadError> {
    txn.execute(
        &format!(
            "INSERT INTO {table} (filename, file_hash, status, rows_processed) VALUES ($1, $2, $3, $4)
             ON CONFLICT (file_hash) DO UPDATE SET status = EXCLUDED.status, rows_processed = EXCLUDED.rows_processed, load_timestamp = now()",
            table = ETL_FILE_HISTORY.name,
        ),
        &[&ctx.filename, &ctx.file_hash, &status, &(rows as i64)],
    )?;
    Ok(())
}

fn record_failure(pool: &PgPool, ctx: &FileContext) -> Result<(), LoadError> {
    let mut conn = pool.get()?;
    let mut txn = conn.transaction()?;
    txn.execute(
        &format!(
            "INSERT INTO {table} (filename, file_hash, status, rows_processed) VALUES ($1, $2, 'failed', 0)
             ON CONFLICT (file_hash) DO UPDATE SET status = 'failed', load_timestamp = now()",
            table = ETL_FILE_HISTORY.name,
        ),
        &[&ctx.filename, &ctx.file_hash],
    )?;
    txn.commit()?;
    Ok(())
}
