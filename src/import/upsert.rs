use rusqlite::{params, Connection, Transaction};
use uuid::Uuid;

use super::record::MemberRecord;

const UPSERT_SQL: &str = "INSERT INTO members(
       id, membership_no, name, mobile, male, female,
       district, taluka, panchayat, village,
       head_gender, aadhar_no, address, family_members, created_at)
     VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
     ON CONFLICT(membership_no) DO UPDATE SET
       name = excluded.name,
       mobile = excluded.mobile,
       male = excluded.male,
       female = excluded.female,
       district = excluded.district,
       taluka = excluded.taluka,
       panchayat = excluded.panchayat,
       village = excluded.village,
       head_gender = excluded.head_gender,
       aadhar_no = excluded.aadhar_no,
       address = excluded.address,
       family_members = excluded.family_members";

/// Writes the batch in one transaction. Returns the number of rows submitted.
///
/// An empty batch returns 0 without touching the database. Any failure rolls
/// the whole batch back and is returned unchanged.
pub fn upsert_members(conn: &Connection, records: &[MemberRecord]) -> rusqlite::Result<usize> {
    if records.is_empty() {
        return Ok(0);
    }

    let tx = conn.unchecked_transaction()?;
    match write_batch(&tx, records) {
        Ok(n) => {
            tx.commit()?;
            Ok(n)
        }
        Err(e) => {
            let _ = tx.rollback();
            Err(e)
        }
    }
}

fn write_batch(tx: &Transaction<'_>, records: &[MemberRecord]) -> rusqlite::Result<usize> {
    let created_at = chrono::Utc::now().to_rfc3339();
    let mut stmt = tx.prepare(UPSERT_SQL)?;
    for r in records {
        let family_json = match &r.family_members {
            Some(list) => Some(
                serde_json::to_string(list)
                    .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?,
            ),
            None => None,
        };
        stmt.execute(params![
            Uuid::new_v4().to_string(),
            r.membership_no,
            r.name,
            r.mobile,
            r.male,
            r.female,
            r.district,
            r.taluka,
            r.panchayat,
            r.village,
            r.head_gender,
            r.aadhar_no,
            r.address,
            family_json,
            created_at,
        ])?;
    }
    Ok(records.len())
}
