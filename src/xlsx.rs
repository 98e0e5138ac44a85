//! Just enough SpreadsheetML to move member rows in and out of `.xlsx` files.
//!
//! Reading takes the first worksheet of a workbook and yields its non-empty
//! rows with their sheet row numbers. Shared strings, inline strings, numbers
//! and booleans are understood; styles and formulas are ignored (formula cells
//! contribute their cached value).
//!
//! Writing streams rows straight into the zip entry, so an export never holds
//! the whole table in memory.

use std::fs::File;
use std::io::{Read, Seek, Write};
use std::path::Path;

use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::Value;
use thiserror::Error;
use zip::result::ZipError;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

const FALLBACK_SHEET_PART: &str = "xl/worksheets/sheet1.xml";

/// Zero-based index of column `XFD`, the widest a worksheet can be.
const MAX_COLUMN_INDEX: usize = 16_383;

#[derive(Debug, Error)]
pub enum XlsxError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a readable xlsx container: {0}")]
    Zip(#[from] ZipError),
    #[error("malformed workbook xml: {0}")]
    Xml(String),
    #[error("workbook part missing: {0}")]
    MissingPart(String),
    #[error("bad cell reference {0:?}")]
    BadCellRef(String),
    #[error("shared string index {0} out of range")]
    BadSharedString(usize),
}

fn xml_err(e: impl std::fmt::Display) -> XlsxError {
    XlsxError::Xml(e.to_string())
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Empty,
    Text(String),
    Number(f64),
    Bool(bool),
}

impl Cell {
    pub fn is_blank(&self) -> bool {
        match self {
            Cell::Empty => true,
            Cell::Text(s) => s.trim().is_empty(),
            Cell::Number(_) | Cell::Bool(_) => false,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            Cell::Empty => Value::Null,
            Cell::Text(s) => Value::String(s.clone()),
            Cell::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Cell::Bool(b) => Value::Bool(*b),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SheetRow {
    /// 1-based row number as it appears in the sheet.
    pub number: usize,
    pub cells: Vec<Cell>,
}

impl SheetRow {
    pub fn is_blank(&self) -> bool {
        self.cells.iter().all(Cell::is_blank)
    }
}

pub fn read_first_sheet(path: &Path) -> Result<Vec<SheetRow>, XlsxError> {
    read_first_sheet_from(File::open(path)?)
}

pub fn read_first_sheet_from<R: Read + Seek>(reader: R) -> Result<Vec<SheetRow>, XlsxError> {
    let mut archive = ZipArchive::new(reader)?;
    let shared = match read_part(&mut archive, "xl/sharedStrings.xml")? {
        Some(xml) => parse_shared_strings(&xml)?,
        None => Vec::new(),
    };
    let part = first_sheet_part(&mut archive)?;
    let xml = read_part(&mut archive, &part)?.ok_or(XlsxError::MissingPart(part))?;
    parse_sheet(&xml, &shared)
}

fn read_part<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    name: &str,
) -> Result<Option<String>, XlsxError> {
    let mut entry = match archive.by_name(name) {
        Ok(e) => e,
        Err(ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let mut out = String::new();
    entry.read_to_string(&mut out)?;
    Ok(Some(out))
}

fn attr(e: &BytesStart<'_>, local: &[u8]) -> Result<Option<String>, XlsxError> {
    for a in e.attributes().flatten() {
        if a.key.local_name().as_ref() == local {
            return Ok(Some(a.unescape_value().map_err(xml_err)?.into_owned()));
        }
    }
    Ok(None)
}

/// Resolves the part name of the first `<sheet>` in workbook order.
fn first_sheet_part<R: Read + Seek>(archive: &mut ZipArchive<R>) -> Result<String, XlsxError> {
    let Some(workbook) = read_part(archive, "xl/workbook.xml")? else {
        return Ok(FALLBACK_SHEET_PART.to_string());
    };
    let Some(rel_id) = first_sheet_rel_id(&workbook)? else {
        return Ok(FALLBACK_SHEET_PART.to_string());
    };
    let Some(rels) = read_part(archive, "xl/_rels/workbook.xml.rels")? else {
        return Ok(FALLBACK_SHEET_PART.to_string());
    };
    let target = relationship_target(&rels, &rel_id)?;
    Ok(match target {
        Some(t) if t.starts_with('/') => t.trim_start_matches('/').to_string(),
        Some(t) => format!("xl/{t}"),
        None => FALLBACK_SHEET_PART.to_string(),
    })
}

fn first_sheet_rel_id(workbook: &str) -> Result<Option<String>, XlsxError> {
    let mut reader = Reader::from_str(workbook);
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(ref e) | Event::Empty(ref e) if e.local_name().as_ref() == b"sheet" => {
                return attr(e, b"id");
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

fn relationship_target(rels: &str, rel_id: &str) -> Result<Option<String>, XlsxError> {
    let mut reader = Reader::from_str(rels);
    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(ref e) | Event::Empty(ref e)
                if e.local_name().as_ref() == b"Relationship" =>
            {
                if attr(e, b"Id")?.as_deref() == Some(rel_id) {
                    return attr(e, b"Target");
                }
            }
            Event::Eof => return Ok(None),
            _ => {}
        }
    }
}

fn parse_shared_strings(xml: &str) -> Result<Vec<String>, XlsxError> {
    let mut reader = Reader::from_str(xml);
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_si = false;
    let mut in_t = false;
    // Phonetic runs carry their own <t> elements that are not part of the value.
    let mut in_rph = false;

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(ref e) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = true;
                    current.clear();
                }
                b"t" => in_t = true,
                b"rPh" => in_rph = true,
                _ => {}
            },
            Event::Empty(ref e) if e.local_name().as_ref() == b"si" => out.push(String::new()),
            Event::Text(ref t) => {
                if in_si && in_t && !in_rph {
                    current.push_str(&t.unescape().map_err(xml_err)?);
                }
            }
            Event::End(ref e) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = false;
                    out.push(std::mem::take(&mut current));
                }
                b"t" => in_t = false,
                b"rPh" => in_rph = false,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(out)
}

fn column_index(cell_ref: &str) -> Result<usize, XlsxError> {
    let letters: Vec<u8> = cell_ref
        .bytes()
        .take_while(|b| b.is_ascii_alphabetic())
        .map(|b| b.to_ascii_uppercase())
        .collect();
    if letters.is_empty() {
        return Err(XlsxError::BadCellRef(cell_ref.to_string()));
    }
    let n = letters
        .iter()
        .try_fold(0usize, |acc, b| {
            acc.checked_mul(26)?.checked_add((b - b'A' + 1) as usize)
        })
        .filter(|n| *n - 1 <= MAX_COLUMN_INDEX)
        .ok_or_else(|| XlsxError::BadCellRef(cell_ref.to_string()))?;
    Ok(n - 1)
}

fn column_name(mut index: usize) -> String {
    let mut buf = Vec::new();
    loop {
        buf.push(b'A' + (index % 26) as u8);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    buf.reverse();
    String::from_utf8_lossy(&buf).into_owned()
}

struct PendingCell {
    col: usize,
    kind: Option<String>,
    text: String,
}

fn resolve_cell(p: &PendingCell, shared: &[String]) -> Result<Cell, XlsxError> {
    let raw = p.text.as_str();
    Ok(match p.kind.as_deref() {
        Some("s") => {
            let idx = raw
                .trim()
                .parse::<usize>()
                .map_err(|_| XlsxError::Xml(format!("bad shared string index {raw:?}")))?;
            let s = shared.get(idx).ok_or(XlsxError::BadSharedString(idx))?;
            Cell::Text(s.clone())
        }
        Some("inlineStr") | Some("str") | Some("d") => Cell::Text(raw.to_string()),
        Some("b") => Cell::Bool(raw.trim() == "1"),
        Some("e") => Cell::Empty,
        _ => {
            let t = raw.trim();
            if t.is_empty() {
                Cell::Empty
            } else {
                match t.parse::<f64>() {
                    Ok(n) => Cell::Number(n),
                    Err(_) => Cell::Text(raw.to_string()),
                }
            }
        }
    })
}

fn parse_sheet(xml: &str, shared: &[String]) -> Result<Vec<SheetRow>, XlsxError> {
    let mut reader = Reader::from_str(xml);
    let mut rows = Vec::new();
    let mut row_no = 0usize;
    let mut cells: Vec<Cell> = Vec::new();
    let mut next_col = 0usize;
    let mut pending: Option<PendingCell> = None;
    let mut capture = false;

    loop {
        match reader.read_event().map_err(xml_err)? {
            Event::Start(ref e) => match e.local_name().as_ref() {
                b"row" => {
                    row_no = row_number(e, row_no)?;
                    cells.clear();
                    next_col = 0;
                }
                b"c" => {
                    let col = match attr(e, b"r")? {
                        Some(r) => column_index(&r)?,
                        None if next_col <= MAX_COLUMN_INDEX => next_col,
                        None => return Err(XlsxError::BadCellRef(format!("row {row_no}"))),
                    };
                    pending = Some(PendingCell {
                        col,
                        kind: attr(e, b"t")?,
                        text: String::new(),
                    });
                }
                b"v" | b"t" if pending.is_some() => capture = true,
                _ => {}
            },
            Event::Empty(ref e) => match e.local_name().as_ref() {
                b"row" => row_no = row_number(e, row_no)?,
                b"c" => {
                    next_col = match attr(e, b"r")? {
                        Some(r) => column_index(&r)? + 1,
                        None => next_col + 1,
                    };
                }
                _ => {}
            },
            Event::Text(ref t) => {
                if capture {
                    if let Some(p) = pending.as_mut() {
                        p.text.push_str(&t.unescape().map_err(xml_err)?);
                    }
                }
            }
            Event::End(ref e) => match e.local_name().as_ref() {
                b"v" | b"t" => capture = false,
                b"c" => {
                    if let Some(p) = pending.take() {
                        let cell = resolve_cell(&p, shared)?;
                        if cells.len() <= p.col {
                            cells.resize(p.col + 1, Cell::Empty);
                        }
                        cells[p.col] = cell;
                        next_col = p.col + 1;
                    }
                }
                b"row" => {
                    if !cells.is_empty() {
                        rows.push(SheetRow {
                            number: row_no,
                            cells: std::mem::take(&mut cells),
                        });
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(rows)
}

fn row_number(e: &BytesStart<'_>, previous: usize) -> Result<usize, XlsxError> {
    match attr(e, b"r")? {
        Some(r) => r
            .trim()
            .parse::<usize>()
            .map_err(|_| XlsxError::Xml(format!("bad row number {r:?}"))),
        None => previous
            .checked_add(1)
            .ok_or_else(|| XlsxError::Xml("row number overflow".to_string())),
    }
}

const CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/></Types>"#;

const ROOT_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>"#;

const WORKBOOK_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/></Relationships>"#;

const SHEET_HEAD: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>"#;

const SHEET_TAIL: &str = "</sheetData></worksheet>";

fn workbook_xml(sheet_name: &str) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="{}" sheetId="1" r:id="rId1"/></sheets></workbook>"#,
        escape(sheet_name)
    )
}

/// Single-sheet workbook writer. Rows are appended in order and flushed
/// into the compressed sheet entry as they arrive.
pub struct SheetWriter<W: Write + Seek> {
    zip: ZipWriter<W>,
    rows_written: usize,
}

impl<W: Write + Seek> SheetWriter<W> {
    pub fn create(inner: W, sheet_name: &str) -> Result<Self, XlsxError> {
        let mut zip = ZipWriter::new(inner);
        let opts = FileOptions::default().compression_method(CompressionMethod::Deflated);

        let static_parts = [
            ("[Content_Types].xml", CONTENT_TYPES.to_string()),
            ("_rels/.rels", ROOT_RELS.to_string()),
            ("xl/workbook.xml", workbook_xml(sheet_name)),
            ("xl/_rels/workbook.xml.rels", WORKBOOK_RELS.to_string()),
        ];
        for (name, body) in static_parts {
            zip.start_file(name, opts)?;
            zip.write_all(body.as_bytes())?;
        }

        zip.start_file(FALLBACK_SHEET_PART, opts)?;
        zip.write_all(SHEET_HEAD.as_bytes())?;
        Ok(Self {
            zip,
            rows_written: 0,
        })
    }

    pub fn write_row(&mut self, cells: &[Cell]) -> Result<(), XlsxError> {
        let row_no = self.rows_written + 1;
        let mut xml = format!("<row r=\"{row_no}\">");
        for (i, cell) in cells.iter().enumerate() {
            let r = format!("{}{}", column_name(i), row_no);
            match cell {
                Cell::Empty => {}
                Cell::Text(s) => xml.push_str(&format!(
                    "<c r=\"{r}\" t=\"inlineStr\"><is><t xml:space=\"preserve\">{}</t></is></c>",
                    escape(s.as_str())
                )),
                Cell::Number(n) if n.is_finite() => {
                    xml.push_str(&format!("<c r=\"{r}\"><v>{n}</v></c>"))
                }
                Cell::Number(_) => {}
                Cell::Bool(b) => xml.push_str(&format!(
                    "<c r=\"{r}\" t=\"b\"><v>{}</v></c>",
                    u8::from(*b)
                )),
            }
        }
        xml.push_str("</row>");
        self.zip.write_all(xml.as_bytes())?;
        self.rows_written += 1;
        Ok(())
    }

    /// Closes the sheet and the container. Returns the sink and the row count.
    pub fn finish(mut self) -> Result<(W, usize), XlsxError> {
        self.zip.write_all(SHEET_TAIL.as_bytes())?;
        let inner = self.zip.finish()?;
        Ok((inner, self.rows_written))
    }
}
