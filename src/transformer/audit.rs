use std::collections::BTreeMap;

use serde_json::Value;

use crate::errors::TransformError;
use crate::extractor::AuditIcsr;
use crate::model::ICSR_AUDIT;

use super::{csv_writer, rewind, CsvBuffer};

/// Serializes a batch of audit records into a single CSV buffer, keeping
/// only the newest row per `safetyreportid` within the batch. "Newest"
/// means the lexicographically greatest `receiptdate`; a tie keeps
/// whichever record appeared later in the batch.
pub fn transform(records: &[AuditIcsr]) -> Result<(CsvBuffer, usize), TransformError> {
    let mut latest: BTreeMap<String, &AuditIcsr> = BTreeMap::new();

    for record in records {
        match latest.get(&record.safetyreportid) {
            Some(existing) if existing.receiptdate > record.receiptdate => {}
            _ => {
                latest.insert(record.safetyreportid.clone(), record);
            }
        }
    }

    let mut buffer = CsvBuffer::new(Vec::new());
    {
        let mut writer = csv_writer(&mut buffer);
        writer.write_record(ICSR_AUDIT.load_columns())?;

        for record in latest.values() {
            let payload = stable_json(record.tree.clone().into_json());
            let serialized = serde_json::to_string(&payload)?;
            writer.write_record([&record.safetyreportid, &record.receiptdate, &serialized])?;
        }
        writer.flush().map_err(|e| TransformError::Csv(csv::Error::from(e)))?;
    }

    let count = latest.len();
    rewind(&mut buffer)?;
    Ok((buffer, count))
}

/// Recursively re-keys JSON objects through a `BTreeMap` so serialization
/// produces a stable key order regardless of the order fields were seen in
/// the source XML.
fn stable_json(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let ordered: BTreeMap<String, Value> = map.into_iter().map(|(k, v)| (k, stable_json(v))).collect();
            serde_json::to_value(ordered).expect("BTreeMap<String, Value> always serializes")
        }
        Value::Array(items) => Value::Array(items.into_iter().map(stable_json).collect()),
        other => other,
    }
}
