use serde_json::Value;

use super::normalize::MemberDraft;
use super::record::MemberRecord;
use super::ImportWarning;
use crate::config::ImportLimits;

/// Applies the mandatory-field and length rules to one normalized row.
///
/// Identity defects (missing key or name, oversized key) reject the row.
/// An oversized mobile is repaired by truncation and the row survives.
/// Every defect leaves a warning behind in `warnings`.
pub fn validate(
    draft: MemberDraft,
    row: usize,
    limits: &ImportLimits,
    warnings: &mut Vec<ImportWarning>,
) -> Option<MemberRecord> {
    if draft.membership_no.is_none() {
        warnings.push(ImportWarning::new(row, "membership_no", "missing membership_no"));
    }
    if draft.name.is_none() {
        warnings.push(ImportWarning::new(row, "name", "missing name"));
    }
    let (Some(membership_no), Some(name)) = (draft.membership_no, draft.name) else {
        return None;
    };

    let key_len = membership_no.chars().count();
    if key_len > limits.membership_no_max {
        warnings.push(
            ImportWarning::new(
                row,
                "membership_no",
                format!(
                    "membership_no is {key_len} characters long; maximum is {}",
                    limits.membership_no_max
                ),
            )
            .with_value(Value::from(membership_no)),
        );
        return None;
    }

    let mobile = draft.mobile.map(|mobile| {
        let len = mobile.chars().count();
        if len <= limits.mobile_max {
            return mobile;
        }
        let truncated: String = mobile.chars().take(limits.mobile_max).collect();
        warnings.push(
            ImportWarning::new(
                row,
                "mobile",
                format!(
                    "mobile has {len} digits; truncated to the first {}",
                    limits.mobile_max
                ),
            )
            .with_value(Value::from(mobile)),
        );
        truncated
    });

    Some(MemberRecord {
        membership_no,
        name,
        mobile,
        male: draft.male,
        female: draft.female,
        district: draft.district,
        taluka: draft.taluka,
        panchayat: draft.panchayat,
        village: draft.village,
        head_gender: draft.head_gender,
        aadhar_no: draft.aadhar_no,
        address: draft.address,
        family_members: draft.family_members,
    })
}
