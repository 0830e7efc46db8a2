//! The loader capability interface and the backend registry.
//!
//! A `Loader` is deliberately coarse-grained: one call per file, one
//! transaction per file. The staging/COPY/merge steps a concrete backend
//! takes to satisfy that call are its own private business (see
//! `postgres::load_normalized_data` for the reference implementation) —
//! keeping them off the trait keeps `Loader` object-safe across backends
//! whose transaction types have nothing in common.

pub mod merge;
pub mod postgres;

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;

use crate::errors::LoadError;
use crate::model::{LoadMode, SchemaType};
use crate::transformer::normalized::NormalizedOutput;
use crate::transformer::CsvBuffer;

#[derive(Debug, Clone)]
pub struct FileContext {
    pub filename: String,
    pub file_hash: String,
    pub mode: LoadMode,
    /// Per-file soft deadline. `0` means no timeout is enforced.
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default)]
pub struct LoadOutcome {
    pub rows_by_table: HashMap<String, usize>,
}

impl LoadOutcome {
    pub fn total_rows(&self) -> usize {
        self.rows_by_table.values().sum()
    }
}

pub trait Loader: Send + Sync {
    fn create_all_tables(&self, schema: SchemaType) -> Result<(), LoadError>;
    fn validate_schema(&self, schema: SchemaType) -> Result<(), LoadError>;
    fn get_completed_file_hashes(&self) -> Result<HashSet<String>, LoadError>;
    /// Resets the target tables once, before any file of a `full` run is
    /// dispatched to the worker pool. A per-file transaction must never
    /// truncate shared tables itself, or concurrent workers wipe each
    /// other's committed rows.
    fn prepare_full_load(&self, schema: SchemaType) -> Result<(), LoadError>;
    fn load_normalized_data(&self, ctx: &FileContext, data: NormalizedOutput) -> Result<LoadOutcome, LoadError>;
    fn load_audit_data(&self, ctx: &FileContext, buffer: CsvBuffer, row_count: usize) -> Result<LoadOutcome, LoadError>;
}

pub type LoaderFactory = fn(&str) -> Result<Arc<dyn Loader>, LoadError>;

static REGISTRY: Lazy<Mutex<HashMap<&'static str, LoaderFactory>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Registers a backend under a dialect name. Called once per backend from
/// `main` before any dispatch happens; new backends are added without
/// touching this module.
pub fn register_backend(dialect: &'static str, factory: LoaderFactory) {
    REGISTRY
        .lock()
        .expect("loader registry mutex poisoned")
        .insert(dialect, factory);
}

pub fn build_loader(dialect: &str, dsn: &str) -> Result<Arc<dyn Loader>, LoadError> {
    let registry = REGISTRY.lock().expect("loader registry mutex poisoned");
    let factory = registry
        .get(dialect)
        .ok_or_else(|| LoadError::UnknownDialect(dialect.to_string()))?;
    factory(dsn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_dialect_is_rejected() {
        let result = build_loader("does-not-exist", "postgres://x");
        assert!(matches!(result, Err(LoadError::UnknownDialect(_))));
    }
}
