use crate::model::SchemaType;

pub const NORMALIZED_DDL: &str = "
CREATE TABLE IF NOT EXISTS icsr_master (
    safetyreportid TEXT PRIMARY KEY,
    receiptdate DATE,
    date_of_most_recent_info DATE,
    is_nullified BOOLEAN NOT NULL DEFAULT FALSE,
    senderidentifier TEXT,
    receiveridentifier TEXT,
    reportercountry TEXT,
    qualification TEXT
);

CREATE TABLE IF NOT EXISTS patient_characteristics (
    safetyreportid TEXT PRIMARY KEY REFERENCES icsr_master(safetyreportid) ON DELETE CASCADE,
    initials TEXT,
    onset_age TEXT,
    sex TEXT
);

CREATE TABLE IF NOT EXISTS reactions (
    safetyreportid TEXT REFERENCES icsr_master(safetyreportid) ON DELETE CASCADE,
    primarysourcereaction TEXT NOT NULL DEFAULT '',
    reactionmeddrapt TEXT,
    PRIMARY KEY (safetyreportid, primarysourcereaction)
);

CREATE TABLE IF NOT EXISTS drugs (
    safetyreportid TEXT REFERENCES icsr_master(safetyreportid) ON DELETE CASCADE,
    drug_seq INTEGER NOT NULL,
    characterization TEXT,
    medicinalproduct TEXT,
    drugdosagetext TEXT,
    PRIMARY KEY (safetyreportid, drug_seq)
);

CREATE TABLE IF NOT EXISTS drug_substances (
    safetyreportid TEXT NOT NULL,
    drug_seq INTEGER NOT NULL,
    activesubstancename TEXT NOT NULL,
    PRIMARY KEY (safetyreportid, drug_seq, activesubstancename),
    FOREIGN KEY (safetyreportid, drug_seq) REFERENCES drugs(safetyreportid, drug_seq) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS tests_procedures (
    safetyreportid TEXT REFERENCES icsr_master(safetyreportid) ON DELETE CASCADE,
    testname TEXT NOT NULL DEFAULT '',
    testdate TEXT,
    testresult TEXT,
    PRIMARY KEY (safetyreportid, testname)
);

CREATE TABLE IF NOT EXISTS case_summary_narrative (
    safetyreportid TEXT PRIMARY KEY REFERENCES icsr_master(safetyreportid) ON DELETE CASCADE,
    narrative TEXT
);
";

pub const AUDIT_DDL: &str = "
CREATE TABLE IF NOT EXISTS icsr_audit (
    safetyreportid TEXT PRIMARY KEY,
    receiptdate DATE,
    icsr_payload JSONB,
    etl_load_timestamp TIMESTAMPTZ NOT NULL DEFAULT now()
);
";

pub const FILE_HISTORY_DDL: &str = "
CREATE TABLE IF NOT EXISTS etl_file_history (
    filename TEXT NOT NULL,
    file_hash TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    rows_processed BIGINT,
    load_timestamp TIMESTAMPTZ NOT NULL DEFAULT now()
);
";

pub fn statements_for(schema: SchemaType) -> &'static str {
    match schema {
        SchemaType::Normalized => NORMALIZED_DDL,
        SchemaType::Audit => AUDIT_DDL,
    }
}
