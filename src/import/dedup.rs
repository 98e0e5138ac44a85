use std::collections::HashMap;

use serde_json::Value;

use super::record::MemberRecord;
use super::ImportWarning;

/// Keeps the first row for each membership number, preserving input order.
pub fn dedupe(
    rows: Vec<(usize, MemberRecord)>,
    warnings: &mut Vec<ImportWarning>,
) -> Vec<MemberRecord> {
    let mut first_seen: HashMap<String, usize> = HashMap::new();
    let mut kept = Vec::with_capacity(rows.len());
    for (row, record) in rows {
        if let Some(first) = first_seen.get(&record.membership_no) {
            warnings.push(
                ImportWarning::new(
                    row,
                    "membership_no",
                    format!(
                        "duplicate membership_no {} (first seen at row {first}); keeping the first",
                        record.membership_no
                    ),
                )
                .with_value(Value::from(record.membership_no)),
            );
            continue;
        }
        first_seen.insert(record.membership_no.clone(), row);
        kept.push(record);
    }
    kept
}
