use serde_json::{Map, Number, Value};
use tracing::debug;

use super::record::FamilyMember;

/// Loosely typed input row: column or field name to raw scalar.
pub type RawRow = Map<String, Value>;

/// Normalized but not yet validated member row. Every field may be absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberDraft {
    pub membership_no: Option<String>,
    pub name: Option<String>,
    pub mobile: Option<String>,
    pub male: Option<u32>,
    pub female: Option<u32>,
    pub district: Option<String>,
    pub taluka: Option<String>,
    pub panchayat: Option<String>,
    pub village: Option<String>,
    pub head_gender: Option<String>,
    pub aadhar_no: Option<String>,
    pub address: Option<String>,
    pub family_members: Option<Vec<FamilyMember>>,
}

pub fn normalize_row(raw: &RawRow) -> MemberDraft {
    MemberDraft {
        membership_no: field(raw, "membership_no", text),
        name: field(raw, "name", text),
        mobile: field(raw, "mobile", digits),
        male: field(raw, "male", count),
        female: field(raw, "female", count),
        district: field(raw, "district", text),
        taluka: field(raw, "taluka", text),
        panchayat: field(raw, "panchayat", text),
        village: field(raw, "village", text),
        head_gender: field(raw, "head_gender", text),
        aadhar_no: field(raw, "aadhar_no", text),
        address: field(raw, "address", text),
        family_members: field(raw, "family_members", family),
    }
}

/// Normalizes `key` as written, falling back to its camelCase alias when the
/// snake_case value is missing or normalizes to absent.
fn field<T>(raw: &RawRow, key: &str, normalize: fn(Option<&Value>) -> Option<T>) -> Option<T> {
    normalize(raw.get(key)).or_else(|| normalize(raw.get(&camel_case(key))))
}

fn camel_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper = false;
    for ch in key.chars() {
        if ch == '_' {
            upper = true;
        } else if upper {
            out.extend(ch.to_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    out
}

fn scalar_text(v: Option<&Value>) -> Option<String> {
    match v? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(number_text(n)),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

// Spreadsheets hand digit strings back as floats; drop the ".0".
fn number_text(n: &Number) -> String {
    if let Some(i) = n.as_i64() {
        return i.to_string();
    }
    if let Some(u) = n.as_u64() {
        return u.to_string();
    }
    match n.as_f64() {
        Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 => {
            format!("{}", f as i64)
        }
        Some(f) => f.to_string(),
        None => n.to_string(),
    }
}

fn text(v: Option<&Value>) -> Option<String> {
    let s = scalar_text(v)?;
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn digits(v: Option<&Value>) -> Option<String> {
    let s = scalar_text(v)?;
    let only: String = s.chars().filter(|c| c.is_ascii_digit()).collect();
    if only.is_empty() {
        None
    } else {
        Some(only)
    }
}

fn integral(f: f64) -> Option<u32> {
    if f.is_finite() && f.fract() == 0.0 && f >= 0.0 && f <= u32::MAX as f64 {
        Some(f as u32)
    } else {
        None
    }
}

fn count(v: Option<&Value>) -> Option<u32> {
    match v? {
        Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                return u32::try_from(u).ok();
            }
            integral(n.as_f64()?)
        }
        Value::String(s) => {
            let t = s.trim();
            if t.is_empty() {
                return None;
            }
            t.parse::<u32>()
                .ok()
                .or_else(|| t.parse::<f64>().ok().and_then(integral))
        }
        _ => None,
    }
}

fn family(v: Option<&Value>) -> Option<Vec<FamilyMember>> {
    match v? {
        Value::Null => None,
        Value::String(s) => {
            let t = s.trim();
            if t.is_empty() {
                return None;
            }
            match serde_json::from_str::<Value>(t) {
                Ok(Value::Array(items)) => Some(family_list(&items)),
                Ok(_) => {
                    debug!("family_members is not a list; storing an empty list");
                    Some(Vec::new())
                }
                Err(e) => {
                    debug!("family_members did not parse ({e}); storing an empty list");
                    Some(Vec::new())
                }
            }
        }
        Value::Array(items) => Some(family_list(items)),
        _ => Some(Vec::new()),
    }
}

fn family_list(items: &[Value]) -> Vec<FamilyMember> {
    items
        .iter()
        .filter_map(|item| item.as_object())
        .map(|obj| FamilyMember {
            name: text(obj.get("name")),
            relation: text(obj.get("relation")),
            age: count(obj.get("age")),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(v: Value) -> RawRow {
        v.as_object().cloned().expect("object")
    }

    #[test]
    fn strings_are_trimmed_and_blank_becomes_absent() {
        let d = normalize_row(&raw(json!({
            "membership_no": "  M7 ",
            "name": "Asha",
            "district": "   ",
            "village": ""
        })));
        assert_eq!(d.membership_no.as_deref(), Some("M7"));
        assert_eq!(d.district, None);
        assert_eq!(d.village, None);
    }

    #[test]
    fn mobile_keeps_only_digits() {
        let d = normalize_row(&raw(json!({ "mobile": "+91 98-765 43210" })));
        assert_eq!(d.mobile.as_deref(), Some("919876543210"));

        let d = normalize_row(&raw(json!({ "mobile": "n/a" })));
        assert_eq!(d.mobile, None);

        let d = normalize_row(&raw(json!({ "mobile": 9876543210.0 })));
        assert_eq!(d.mobile.as_deref(), Some("9876543210"));
    }

    #[test]
    fn counts_are_absent_unless_non_negative_integers() {
        let d = normalize_row(&raw(json!({ "male": "3", "female": "" })));
        assert_eq!(d.male, Some(3));
        assert_eq!(d.female, None);

        let d = normalize_row(&raw(json!({ "male": 2.0, "female": "abc" })));
        assert_eq!(d.male, Some(2));
        assert_eq!(d.female, None);

        let d = normalize_row(&raw(json!({ "male": -1, "female": " 4 " })));
        assert_eq!(d.male, None);
        assert_eq!(d.female, Some(4));
    }

    #[test]
    fn fractional_counts_are_treated_as_unparsable() {
        let d = normalize_row(&raw(json!({ "male": 2.5, "female": "1.5" })));
        assert_eq!(d.male, None);
        assert_eq!(d.female, None);
    }

    #[test]
    fn camel_case_aliases_are_accepted() {
        let d = normalize_row(&raw(json!({
            "membershipNo": "K1",
            "name": "Bina",
            "headGender": "F",
            "aadharNo": " 1234 5678 "
        })));
        assert_eq!(d.membership_no.as_deref(), Some("K1"));
        assert_eq!(d.head_gender.as_deref(), Some("F"));
        assert_eq!(d.aadhar_no.as_deref(), Some("1234 5678"));
    }

    #[test]
    fn blank_snake_case_key_falls_back_to_camel_case_alias() {
        let d = normalize_row(&raw(json!({
            "membership_no": "",
            "membershipNo": "K1",
            "head_gender": null,
            "headGender": "F",
            "male": "",
        })));
        assert_eq!(d.membership_no.as_deref(), Some("K1"));
        assert_eq!(d.head_gender.as_deref(), Some("F"));
        assert_eq!(d.male, None);
    }

    #[test]
    fn family_members_accepts_json_text_or_list() {
        let d = normalize_row(&raw(json!({
            "family_members": "[{\"name\":\" Ravi \",\"relation\":\"son\",\"age\":\"12\"}]"
        })));
        assert_eq!(
            d.family_members,
            Some(vec![FamilyMember {
                name: Some("Ravi".into()),
                relation: Some("son".into()),
                age: Some(12),
            }])
        );

        let d = normalize_row(&raw(json!({
            "familyMembers": [{ "name": "Mira", "relation": "wife" }]
        })));
        assert_eq!(d.family_members.as_ref().map(|v| v.len()), Some(1));
    }

    #[test]
    fn malformed_family_json_becomes_empty_list() {
        let d = normalize_row(&raw(json!({ "family_members": "[{oops" })));
        assert_eq!(d.family_members, Some(Vec::new()));

        let d = normalize_row(&raw(json!({ "family_members": "" })));
        assert_eq!(d.family_members, None);
    }
}
