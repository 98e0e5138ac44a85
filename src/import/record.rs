use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One household member attached to a registry entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FamilyMember {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub age: Option<u32>,
}

/// A registry row that passed validation. Key and name are always present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberRecord {
    pub membership_no: String,
    pub name: String,
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

pub const MEMBER_SELECT: &str = "SELECT membership_no, name, mobile, male, female,
       district, taluka, panchayat, village,
       head_gender, aadhar_no, address, family_members
     FROM members";

pub fn member_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemberRecord> {
    let family_json: Option<String> = row.get(12)?;
    let family_members = match family_json {
        Some(text) => Some(serde_json::from_str(&text).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(12, rusqlite::types::Type::Text, Box::new(e))
        })?),
        None => None,
    };
    Ok(MemberRecord {
        membership_no: row.get(0)?,
        name: row.get(1)?,
        mobile: row.get(2)?,
        male: row.get(3)?,
        female: row.get(4)?,
        district: row.get(5)?,
        taluka: row.get(6)?,
        panchayat: row.get(7)?,
        village: row.get(8)?,
        head_gender: row.get(9)?,
        aadhar_no: row.get(10)?,
        address: row.get(11)?,
        family_members,
    })
}

impl MemberRecord {
    /// Re-express a stored record in the raw row shape the normalizer reads,
    /// so single-row edits go through the same rules as imports.
    pub fn to_raw_row(&self) -> Map<String, Value> {
        let mut raw = Map::new();
        let mut put = |key: &str, v: Value| {
            if !v.is_null() {
                raw.insert(key.to_string(), v);
            }
        };
        put("membership_no", Value::from(self.membership_no.clone()));
        put("name", Value::from(self.name.clone()));
        put("mobile", Value::from(self.mobile.clone()));
        put("male", Value::from(self.male));
        put("female", Value::from(self.female));
        put("district", Value::from(self.district.clone()));
        put("taluka", Value::from(self.taluka.clone()));
        put("panchayat", Value::from(self.panchayat.clone()));
        put("village", Value::from(self.village.clone()));
        put("head_gender", Value::from(self.head_gender.clone()));
        put("aadhar_no", Value::from(self.aadhar_no.clone()));
        put("address", Value::from(self.address.clone()));
        if let Some(family) = &self.family_members {
            put(
                "family_members",
                serde_json::to_value(family).unwrap_or(Value::Null),
            );
        }
        raw
    }
}
