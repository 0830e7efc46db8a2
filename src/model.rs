//! Table definitions shared by the transformer and the loader.
//!
//! Each target table is described once as a [`TableSpec`] so that DDL
//! generation, CSV column ordering, and the generic version-gated merge
//! statement builder all agree on the same shape.

/// Static description of one target table's shape for bulk load and merge.
#[derive(Debug, Clone, Copy)]
pub struct TableSpec {
    pub name: &'static str,
    pub columns: &'static [&'static str],
    pub primary_key: &'static [&'static str],
    /// Column compared with `>` to decide whether a staged row supersedes
    /// an existing one. `None` means the table has no version gate and
    /// upserts apply unconditionally do-nothing on conflict.
    pub version_key: Option<&'static str>,
    /// Column that, when true on the staged row, always applies regardless
    /// of the version gate (nullification).
    pub nullify_flag: Option<&'static str>,
}

/// Columns the database fills in with a server-side default rather than
/// ones the transformer ever writes into a CSV buffer.
const SERVER_DEFAULTED_COLUMNS: &[&str] = &["etl_load_timestamp", "load_timestamp"];

impl TableSpec {
    /// Columns the transformer actually populates, in COPY order.
    pub fn load_columns(&self) -> Vec<&'static str> {
        self.columns
            .iter()
            .copied()
            .filter(|c| !SERVER_DEFAULTED_COLUMNS.contains(c))
            .collect()
    }
}

pub const ICSR_MASTER: TableSpec = TableSpec {
    name: "icsr_master",
    columns: &[
        "safetyreportid",
        "receiptdate",
        "date_of_most_recent_info",
        "is_nullified",
        "senderidentifier",
        "receiveridentifier",
        "reportercountry",
        "qualification",
    ],
    primary_key: &["safetyreportid"],
    version_key: Some("date_of_most_recent_info"),
    nullify_flag: Some("is_nullified"),
};

pub const PATIENT_CHARACTERISTICS: TableSpec = TableSpec {
    name: "patient_characteristics",
    columns: &["safetyreportid", "initials", "onset_age", "sex"],
    primary_key: &["safetyreportid"],
    version_key: None,
    nullify_flag: None,
};

pub const REACTIONS: TableSpec = TableSpec {
    name: "reactions",
    columns: &["safetyreportid", "primarysourcereaction", "reactionmeddrapt"],
    primary_key: &["safetyreportid", "primarysourcereaction"],
    version_key: None,
    nullify_flag: None,
};

pub const DRUGS: TableSpec = TableSpec {
    name: "drugs",
    columns: &[
        "safetyreportid",
        "drug_seq",
        "characterization",
        "medicinalproduct",
        "drugdosagetext",
    ],
    primary_key: &["safetyreportid", "drug_seq"],
    version_key: None,
    nullify_flag: None,
};

pub const DRUG_SUBSTANCES: TableSpec = TableSpec {
    name: "drug_substances",
    columns: &["safetyreportid", "drug_seq", "activesubstancename"],
    primary_key: &["safetyreportid", "drug_seq", "activesubstancename"],
    version_key: None,
    nullify_flag: None,
};

pub const TESTS_PROCEDURES: TableSpec = TableSpec {
    name: "tests_procedures",
    columns: &["safetyreportid", "testname", "testdate", "testresult"],
    primary_key: &["safetyreportid", "testname"],
    version_key: None,
    nullify_flag: None,
};

pub const CASE_SUMMARY_NARRATIVE: TableSpec = TableSpec {
    name: "case_summary_narrative",
    columns: &["safetyreportid", "narrative"],
    primary_key: &["safetyreportid"],
    version_key: None,
    nullify_flag: None,
};

pub const ICSR_AUDIT: TableSpec = TableSpec {
    name: "icsr_audit",
    columns: &["safetyreportid", "receiptdate", "icsr_payload", "etl_load_timestamp"],
    primary_key: &["safetyreportid"],
    version_key: Some("receiptdate"),
    nullify_flag: None,
};

pub const ETL_FILE_HISTORY: TableSpec = TableSpec {
    name: "etl_file_history",
    columns: &["filename", "file_hash", "status", "rows_processed", "load_timestamp"],
    primary_key: &["file_hash"],
    version_key: None,
    nullify_flag: None,
};

/// All normalized-schema target tables, in dependency order (parents
/// before the children that reference their safetyreportid).
pub const NORMALIZED_TABLES: &[TableSpec] = &[
    ICSR_MASTER,
    PATIENT_CHARACTERISTICS,
    REACTIONS,
    DRUGS,
    DRUG_SUBSTANCES,
    TESTS_PROCEDURES,
    CASE_SUMMARY_NARRATIVE,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaType {
    Normalized,
    Audit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    Full,
    Delta,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Pending,
    Completed,
    Failed,
}

impl FileStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            FileStatus::Pending => "pending",
            FileStatus::Completed => "completed",
            FileStatus::Failed => "failed",
        }
    }
}
