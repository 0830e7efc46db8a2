use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Extract(#[from] ExtractError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("could not read config file {0:?}")]
    FileNotFound(PathBuf),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

/// Listing or opening a file source failed.
#[derive(thiserror::Error, Debug)]
pub enum SourceError {
    #[error("source is unavailable: {0}")]
    Unavailable(String),

    #[error("could not open file {path:?}: {reason}")]
    OpenFailed { path: PathBuf, reason: String },

    #[error("unsupported source uri scheme: {0}")]
    UnsupportedScheme(String),
}

/// A batch-level XML problem. Per-record problems are carried as
/// [`crate::extractor::RecordError`] values in the record stream instead,
/// since a bad ICSR must not abort the rest of the file.
#[derive(thiserror::Error, Debug)]
pub enum ExtractError {
    #[error("xml batch is not well-formed: {0}")]
    NotWellFormed(String),

    #[error(transparent)]
    Xml(#[from] quick_xml::Error),

    #[error(transparent)]
    Encoding(#[from] quick_xml::encoding::EncodingError),

    #[error("xsd schema could not be loaded: {0}")]
    SchemaInvalid(String),
}

#[derive(thiserror::Error, Debug)]
pub enum TransformError {
    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    #[error(transparent)]
    Db(#[from] postgres::Error),

    #[error(transparent)]
    Pool(#[from] r2d2::Error),

    #[error("database schema does not match the expected definition: {0}")]
    SchemaMismatch(String),

    #[error("database connection dropped or deadlocked: {0}")]
    Transient(String),

    #[error("a database constraint was violated: {0}")]
    ConstraintViolated(String),

    #[error("unknown database dialect: {0}")]
    UnknownDialect(String),

    #[error("per-file load timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("load was cancelled")]
    Cancelled,
}
