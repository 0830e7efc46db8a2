use std::collections::HashMap;

use crate::errors::TransformError;
use crate::extractor::IcsrFields;
use crate::model::{
    CASE_SUMMARY_NARRATIVE, DRUGS, DRUG_SUBSTANCES, ICSR_MASTER, PATIENT_CHARACTERISTICS, REACTIONS,
    TESTS_PROCEDURES,
};

use super::{csv_writer, rewind, CsvBuffer};

pub struct NormalizedOutput {
    pub buffers: HashMap<&'static str, CsvBuffer>,
    pub row_counts: HashMap<&'static str, usize>,
}

fn opt<'a>(value: &'a Option<String>) -> &'a str {
    value.as_deref().unwrap_or("")
}

/// Builds one CSV buffer per target table out of a batch of normalized
/// records, in the column order `TableSpec` declares for each table.
pub fn transform(records: &[IcsrFields]) -> Result<NormalizedOutput, TransformError> {
    let mut buffers: HashMap<&'static str, CsvBuffer> = HashMap::new();
    let mut row_counts: HashMap<&'static str, usize> = HashMap::new();

    for table in [
        ICSR_MASTER,
        PATIENT_CHARACTERISTICS,
        REACTIONS,
        DRUGS,
        DRUG_SUBSTANCES,
        TESTS_PROCEDURES,
        CASE_SUMMARY_NARRATIVE,
    ] {
        let mut buffer = CsvBuffer::new(Vec::new());
        {
            let mut writer = csv_writer(&mut buffer);
            writer.write_record(table.load_columns())?;
        }
        buffers.insert(table.name, buffer);
        row_counts.insert(table.name, 0);
    }

    for fields in records {
        write_row(
            buffers.get_mut(ICSR_MASTER.name).expect("table registered above"),
            &[
                &fields.safetyreportid,
                opt(&fields.receiptdate),
                opt(&fields.date_of_most_recent_info),
                if fields.is_nullified { "true" } else { "false" },
                opt(&fields.senderidentifier),
                opt(&fields.receiveridentifier),
                opt(&fields.reportercountry),
                opt(&fields.qualification),
            ],
        )?;
        *row_counts.get_mut(ICSR_MASTER.name).unwrap() += 1;

        if let Some(patient) = &fields.patient {
            write_row(
                buffers.get_mut(PATIENT_CHARACTERISTICS.name).expect("table registered above"),
                &[
                    &fields.safetyreportid,
                    opt(&patient.initials),
                    opt(&patient.onset_age),
                    opt(&patient.sex),
                ],
            )?;
            *row_counts.get_mut(PATIENT_CHARACTERISTICS.name).unwrap() += 1;
        }

        for reaction in &fields.reactions {
            write_row(
                buffers.get_mut(REACTIONS.name).expect("table registered above"),
                &[
                    &fields.safetyreportid,
                    opt(&reaction.primarysourcereaction),
                    opt(&reaction.reactionmeddrapt),
                ],
            )?;
            *row_counts.get_mut(REACTIONS.name).unwrap() += 1;
        }

        for drug in &fields.drugs {
            let seq = drug.drug_seq.to_string();
            write_row(
                buffers.get_mut(DRUGS.name).expect("table registered above"),
                &[
                    &fields.safetyreportid,
                    &seq,
                    opt(&drug.characterization),
                    opt(&drug.medicinalproduct),
                    opt(&drug.drugdosagetext),
                ],
            )?;
            *row_counts.get_mut(DRUGS.name).unwrap() += 1;

            for substance in &drug.substances {
                write_row(
                    buffers.get_mut(DRUG_SUBSTANCES.name).expect("table registered above"),
                    &[&fields.safetyreportid, &seq, substance],
                )?;
                *row_counts.get_mut(DRUG_SUBSTANCES.name).unwrap() += 1;
            }
        }

        for test in &fields.tests {
            write_row(
                buffers.get_mut(TESTS_PROCEDURES.name).expect("table registered above"),
                &[
                    &fields.safetyreportid,
                    opt(&test.testname),
                    opt(&test.testdate),
                    opt(&test.testresult),
                ],
            )?;
            *row_counts.get_mut(TESTS_PROCEDURES.name).unwrap() += 1;
        }

        if let Some(narrative) = &fields.narrative {
            write_row(
                buffers.get_mut(CASE_SUMMARY_NARRATIVE.name).expect("table registered above"),
                &[&fields.safetyreportid, narrative],
            )?;
            *row_counts.get_mut(CASE_SUMMARY_NARRATIVE.name).unwrap() += 1;
        }
    }

    for buffer in buffers.values_mut() {
        rewind(buffer)?;
    }

    Ok(NormalizedOutput { buffers, row_counts })
}

fn write_row(buffer: &mut CsvBuffer, fields: &[&str]) -> Result<(), TransformError> {
    let mut writer = csv_writer(buffer);
    writer.write_record(fields)?;
    writer.flush().map_err(|e| TransformError::Csv(csv::Error::from(e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::{Drug, PatientCharacteristics, Reaction};

    fn buffer_text(buffers: &mut HashMap<&'static str, CsvBuffer>, table: &str) -> String {
        String::from_utf8(buffers.get(table).unwrap().get_ref().clone()).unwrap()
    }

    #[test]
    fn writes_one_master_row_per_record() {
        let records = vec![
            IcsrFields {
                safetyreportid: "A1".to_string(),
                receiptdate: Some("2024-01-01".to_string()),
                ..Default::default()
            },
            IcsrFields {
                safetyreportid: "A2".to_string(),
                is_nullified: true,
                ..Default::default()
            },
        ];

        let mut out = transform(&records).unwrap();
        assert_eq!(out.row_counts[ICSR_MASTER.name], 2);
        let text = buffer_text(&mut out.buffers, ICSR_MASTER.name);
        assert!(text.starts_with("safetyreportid,"));
        assert!(text.contains("A1,2024-01-01"));
        assert!(text.contains("A2,,,true"));
    }

    #[test]
    fn fans_out_drugs_and_substances() {
        let records = vec![IcsrFields {
            safetyreportid: "A1".to_string(),
            drugs: vec![Drug {
                drug_seq: 1,
                medicinalproduct: Some("X".to_string()),
                substances: vec!["X-ACTIVE".to_string(), "Y-ACTIVE".to_string()],
                ..Default::default()
            }],
            ..Default::default()
        }];

        let out = transform(&records).unwrap();
        assert_eq!(out.row_counts[DRUGS.name], 1);
        assert_eq!(out.row_counts[DRUG_SUBSTANCES.name], 2);
    }

    #[test]
    fn quotes_fields_containing_commas() {
        let records = vec![IcsrFields {
            safetyreportid: "A1".to_string(),
            patient: Some(PatientCharacteristics {
                initials: Some("J,D".to_string()),
                ..Default::default()
            }),
            ..Default::default()
        }];

        let mut out = transform(&records).unwrap();
        let text = buffer_text(&mut out.buffers, PATIENT_CHARACTERISTICS.name);
        assert!(text.contains("\"J,D\""));
    }

    #[test]
    fn skips_reactions_when_none_present() {
        let records = vec![IcsrFields {
            safetyreportid: "A1".to_string(),
            reactions: vec![],
            ..Default::default()
        }];
        let out = transform(&records).unwrap();
        assert_eq!(out.row_counts[REACTIONS.name], 0);
    }

    #[test]
    fn multiple_reactions_produce_multiple_rows() {
        let records = vec![IcsrFields {
            safetyreportid: "A1".to_string(),
            reactions: vec![
                Reaction {
                    reactionmeddrapt: Some("Nausea".to_string()),
                    ..Default::default()
                },
                Reaction {
                    reactionmeddrapt: Some("Headache".to_string()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }];
        let out = transform(&records).unwrap();
        assert_eq!(out.row_counts[REACTIONS.name], 2);
    }
}
