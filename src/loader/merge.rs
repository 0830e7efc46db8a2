//! Builds the version-gated `INSERT ... ON CONFLICT` statement that merges
//! a staging table into its target, mechanically from a [`TableSpec`].
//! Pure string building, no database access, so it is unit-tested directly.

use crate::model::TableSpec;

/// Builds the merge statement for one table. For tables with no version
/// key (pure junction tables), conflicting rows are left untouched.
pub fn build_upsert_sql(staging_table: &str, table: &TableSpec) -> String {
    let columns = table.load_columns();
    let column_list = columns.join(", ");
    let conflict_columns = table.primary_key.join(", ");

    match table.version_key {
        None => format!(
            "INSERT INTO {target} ({cols}) SELECT {cols} FROM {staging} ON CONFLICT ({pk}) DO NOTHING",
            target = table.name,
            cols = column_list,
            staging = staging_table,
            pk = conflict_columns,
        ),
        Some(version_key) => {
            let set_clause = columns
                .iter()
                .filter(|c| !table.primary_key.contains(c))
                .map(|c| format!("{c} = EXCLUDED.{c}"))
                .collect::<Vec<_>>()
                .join(", ");

            let mut predicate = format!("EXCLUDED.{version_key} > {target}.{version_key}", target = table.name);
            if let Some(flag) = table.nullify_flag {
                predicate = format!("EXCLUDED.{flag} IS TRUE OR {predicate}");
            }

            format!(
                "INSERT INTO {target} ({cols}) SELECT {cols} FROM {staging} ON CONFLICT ({pk}) DO UPDATE SET {set} WHERE {predicate} RETURNING {pk}",
                target = table.name,
                cols = column_list,
                staging = staging_table,
                pk = conflict_columns,
                set = set_clause,
                predicate = predicate,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DRUG_SUBSTANCES, ICSR_AUDIT, ICSR_MASTER, REACTIONS};

    #[test]
    fn junction_table_does_nothing_on_conflict() {
        let sql = build_upsert_sql("reactions_staging_1", &REACTIONS);
        assert!(sql.contains("ON CONFLICT (safetyreportid, primarysourcereaction) DO NOTHING"));
        assert!(!sql.contains("WHERE"));
    }

    #[test]
    fn drug_substances_also_does_nothing_on_conflict() {
        let sql = build_upsert_sql("drug_substances_staging_1", &DRUG_SUBSTANCES);
        assert!(sql.contains("DO NOTHING"));
    }

    #[test]
    fn versioned_table_gates_on_version_key_and_nullification() {
        let sql = build_upsert_sql("icsr_master_staging_1", &ICSR_MASTER);
        assert!(sql.contains("ON CONFLICT (safetyreportid) DO UPDATE SET"));
        assert!(sql.contains("WHERE EXCLUDED.is_nullified IS TRUE OR EXCLUDED.date_of_most_recent_info > icsr_master.date_of_most_recent_info"));
        assert!(!sql.contains("safetyreportid = EXCLUDED.safetyreportid"));
    }

    #[test]
    fn audit_table_gates_on_receiptdate_with_no_nullify_flag() {
        let sql = build_upsert_sql("icsr_audit_staging_1", &ICSR_AUDIT);
        assert!(sql.contains("WHERE EXCLUDED.receiptdate > icsr_audit.receiptdate"));
        assert!(!sql.contains("IS_NULLIFIED"));
    }
}
