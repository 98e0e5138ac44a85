//! Member bulk import: raw rows → normalize → validate → dedupe → upsert.
//!
//! Both entry points (an uploaded workbook and a JSON array of row objects)
//! funnel into [`MemberImporter::run`]. Row-level defects never fail the
//! batch; they become [`ImportWarning`]s and the row is skipped or repaired.
//! Storage failures abort the whole batch.

mod dedup;
mod normalize;
mod record;
mod upsert;
mod validate;

use std::path::Path;

use rusqlite::Connection;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::ImportLimits;
use crate::staging::StagedUpload;
use crate::xlsx::{self, Cell, XlsxError};

pub use dedup::dedupe;
pub use normalize::{normalize_row, MemberDraft, RawRow};
pub use record::{member_from_row, FamilyMember, MemberRecord, MEMBER_SELECT};
pub use upsert::upsert_members;
pub use validate::validate;

/// Fixed column order of the member workbook, A through M.
pub const SHEET_COLUMNS: [&str; 13] = [
    "membership_no",
    "name",
    "mobile",
    "male",
    "female",
    "district",
    "taluka",
    "panchayat",
    "village",
    "head_gender",
    "aadhar_no",
    "address",
    "family_members",
];

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportWarning {
    pub row: usize,
    pub field: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl ImportWarning {
    pub fn new(row: usize, field: &str, reason: impl Into<String>) -> Self {
        Self {
            row,
            field: field.to_string(),
            reason: reason.into(),
            value: None,
        }
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportSummary {
    pub imported: usize,
    pub warnings: Vec<ImportWarning>,
}

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("No rows supplied")]
    NoRows,
    #[error("rows must be a JSON array")]
    NotAnArray,
    #[error("could not read spreadsheet: {0}")]
    Spreadsheet(#[from] XlsxError),
    #[error("storage failure: {0}")]
    Storage(#[from] rusqlite::Error),
}

/// Rows that survived validation and deduplication, plus everything noticed
/// on the way.
#[derive(Debug, Default)]
pub struct PreparedBatch {
    pub records: Vec<MemberRecord>,
    pub warnings: Vec<ImportWarning>,
}

pub struct MemberImporter {
    limits: ImportLimits,
}

impl MemberImporter {
    pub fn new(limits: ImportLimits) -> Self {
        Self { limits }
    }

    /// Runs the in-memory stages. `rows` carries each raw row with its
    /// 1-based source row number.
    pub fn prepare<I>(&self, rows: I) -> PreparedBatch
    where
        I: IntoIterator<Item = (usize, RawRow)>,
    {
        let mut warnings = Vec::new();
        let accepted: Vec<(usize, MemberRecord)> = rows
            .into_iter()
            .filter_map(|(row, raw)| {
                let draft = normalize_row(&raw);
                validate(draft, row, &self.limits, &mut warnings).map(|rec| (row, rec))
            })
            .collect();
        let records = dedupe(accepted, &mut warnings);
        PreparedBatch { records, warnings }
    }

    pub fn run<I>(&self, conn: &Connection, rows: I) -> Result<ImportSummary, ImportError>
    where
        I: IntoIterator<Item = (usize, RawRow)>,
    {
        let batch = self.prepare(rows);
        debug!(
            accepted = batch.records.len(),
            warnings = batch.warnings.len(),
            "member batch prepared"
        );
        let imported = upsert_members(conn, &batch.records)?;
        info!(imported, warnings = batch.warnings.len(), "member import committed");
        Ok(ImportSummary {
            imported,
            warnings: batch.warnings,
        })
    }

    /// JSON entry point. `rows` is the request's `rows` value.
    pub fn import_json(
        &self,
        conn: &Connection,
        rows: Option<&Value>,
    ) -> Result<ImportSummary, ImportError> {
        let items = match rows {
            Some(Value::Array(items)) => items,
            _ => return Err(ImportError::NotAnArray),
        };
        if items.is_empty() {
            return Err(ImportError::NoRows);
        }
        // Row numbers count a notional header row, matching the workbook path.
        let raw_rows = items.iter().enumerate().map(|(i, item)| {
            let raw = item.as_object().cloned().unwrap_or_default();
            (i + 2, raw)
        });
        self.run(conn, raw_rows)
    }

    /// Workbook entry point. The staged file is removed when this returns,
    /// on success and on failure alike.
    pub fn import_spreadsheet(
        &self,
        conn: &Connection,
        upload: StagedUpload,
    ) -> Result<ImportSummary, ImportError> {
        let rows = read_sheet_rows(upload.path())?;
        drop(upload);
        if rows.is_empty() {
            return Err(ImportError::NoRows);
        }
        self.run(conn, rows)
    }
}

/// Reads the first worksheet, drops the header row and blank rows, and keys
/// each cell by its fixed column position.
fn read_sheet_rows(path: &Path) -> Result<Vec<(usize, RawRow)>, XlsxError> {
    let sheet = xlsx::read_first_sheet(path)?;
    Ok(sheet
        .into_iter()
        .skip(1)
        .filter(|r| !r.is_blank())
        .map(|r| (r.number, sheet_row_to_raw(&r.cells)))
        .collect())
}

fn sheet_row_to_raw(cells: &[Cell]) -> RawRow {
    let mut raw = Map::new();
    for (name, cell) in SHEET_COLUMNS.iter().zip(cells) {
        if !matches!(cell, Cell::Empty) {
            raw.insert((*name).to_string(), cell.to_json());
        }
    }
    raw
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(values: Vec<Value>) -> Vec<(usize, RawRow)> {
        values
            .into_iter()
            .enumerate()
            .map(|(i, v)| (i + 2, v.as_object().cloned().expect("object")))
            .collect()
    }

    fn memory_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        crate::db::create_schema(&conn).expect("schema");
        conn
    }

    #[test]
    fn duplicate_key_scenario_keeps_first_and_strips_mobile() {
        let importer = MemberImporter::new(ImportLimits::default());
        let batch = importer.prepare(rows(vec![
            json!({ "membership_no": "M1", "name": "Asha", "mobile": "98-765 43210" }),
            json!({ "membership_no": "M1", "name": "Asha Dup", "mobile": "111" }),
        ]));
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].mobile.as_deref(), Some("9876543210"));
        assert_eq!(batch.warnings.len(), 1);
        assert_eq!(batch.warnings[0].row, 3);
        assert_eq!(batch.warnings[0].value, Some(json!("M1")));
    }

    #[test]
    fn blank_key_is_missing() {
        let importer = MemberImporter::new(ImportLimits::default());
        let batch = importer.prepare(rows(vec![json!({ "membership_no": "", "name": "Bina" })]));
        assert!(batch.records.is_empty());
        assert_eq!(batch.warnings.len(), 1);
        assert_eq!(batch.warnings[0].reason, "missing membership_no");
    }

    #[test]
    fn json_entry_rejects_bad_shapes_before_running() {
        let conn = memory_db();
        let importer = MemberImporter::new(ImportLimits::default());
        assert!(matches!(
            importer.import_json(&conn, Some(&json!([]))),
            Err(ImportError::NoRows)
        ));
        assert!(matches!(
            importer.import_json(&conn, Some(&json!({ "membership_no": "M1" }))),
            Err(ImportError::NotAnArray)
        ));
        assert!(matches!(
            importer.import_json(&conn, None),
            Err(ImportError::NotAnArray)
        ));
    }

    #[test]
    fn upsert_overwrites_and_is_idempotent() {
        let conn = memory_db();
        let importer = MemberImporter::new(ImportLimits::default());
        let first = json!([
            { "membership_no": "M1", "name": "Asha", "male": "3", "female": "" },
            { "membership_no": "M2", "name": "Bina", "district": "Puri" }
        ]);
        let s = importer.import_json(&conn, Some(&first)).expect("import");
        assert_eq!(s.imported, 2);

        let snapshot = |conn: &Connection| -> Vec<MemberRecord> {
            let mut stmt = conn
                .prepare(&format!("{MEMBER_SELECT} ORDER BY membership_no"))
                .expect("prepare");
            let out = stmt
                .query_map([], member_from_row)
                .expect("query")
                .collect::<Result<Vec<_>, _>>()
                .expect("rows");
            out
        };
        let before = snapshot(&conn);
        assert_eq!(before[0].male, Some(3));
        assert_eq!(before[0].female, None);

        importer.import_json(&conn, Some(&first)).expect("reimport");
        assert_eq!(snapshot(&conn), before);

        let renamed = json!([{ "membership_no": "M2", "name": "Bina Devi" }]);
        importer.import_json(&conn, Some(&renamed)).expect("update");
        let after = snapshot(&conn);
        assert_eq!(after.len(), 2);
        assert_eq!(after[1].name, "Bina Devi");
        assert_eq!(after[1].district, None);
    }

    #[test]
    fn empty_batch_after_filtering_imports_nothing() {
        let conn = memory_db();
        let importer = MemberImporter::new(ImportLimits::default());
        let s = importer
            .import_json(&conn, Some(&json!([{ "name": "No Key" }])))
            .expect("import");
        assert_eq!(s.imported, 0);
        assert_eq!(s.warnings.len(), 1);
    }

    #[test]
    fn storage_failure_rolls_back_whole_batch() {
        let conn = memory_db();
        conn.execute_batch(
            "CREATE TRIGGER reject_m3 BEFORE INSERT ON members
             WHEN NEW.membership_no = 'M3'
             BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
        )
        .expect("trigger");
        let importer = MemberImporter::new(ImportLimits::default());
        let res = importer.import_json(
            &conn,
            Some(&json!([
                { "membership_no": "M1", "name": "A" },
                { "membership_no": "M3", "name": "C" }
            ])),
        );
        assert!(matches!(res, Err(ImportError::Storage(_))));
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM members", [], |r| r.get(0))
            .expect("count");
        assert_eq!(n, 0);
    }

    #[test]
    fn sheet_cells_map_by_position() {
        let raw = sheet_row_to_raw(&[
            Cell::Text("M5".into()),
            Cell::Text("Chitra".into()),
            Cell::Number(9876543210.0),
            Cell::Number(2.0),
            Cell::Empty,
        ]);
        let draft = normalize_row(&raw);
        assert_eq!(draft.membership_no.as_deref(), Some("M5"));
        assert_eq!(draft.mobile.as_deref(), Some("9876543210"));
        assert_eq!(draft.male, Some(2));
        assert_eq!(draft.female, None);
    }
}
