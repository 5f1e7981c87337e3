//! Workbook reading and row normalization for generation spreadsheets.

use std::io::Cursor;

use calamine::{open_workbook_auto_from_rs, Data, Reader};
use ccm_core::{MissionaryRecord, RawCell, RawRow};
use chrono::{NaiveDate, NaiveDateTime, TimeDelta};
use thiserror::Error;
use tracing::warn;

pub const CRATE_NAME: &str = "ccm-ingest";

/// Text date formats tried in order; the first that parses wins.
pub const DATE_FORMATS: [&str; 9] = [
    "%Y-%m-%d",
    "%d/%m/%Y",
    "%Y/%m/%d",
    "%d-%m-%Y",
    "%m/%d/%Y",
    "%d-%b-%Y",
    "%d-%b-%y",
    "%d %b %Y",
    COMPACT_DATE_FORMAT,
];

/// Narrower list for the in-person arrival column, day-first before ISO.
pub const PRESENCIAL_DATE_FORMATS: [&str; 4] = ["%d/%m/%Y", "%d-%m-%Y", "%Y-%m-%d", "%m/%d/%Y"];

const COMPACT_DATE_FORMAT: &str = "%Y%m%d";

const TRUTHY: [&str; 7] = ["1", "true", "verdadero", "sí", "si", "x", "yes"];

/// Why a row was discarded or flagged during normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowIssue {
    RowWithoutId,
    MissingId,
    InvalidId,
    MissingNombreMisionero,
}

impl RowIssue {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RowWithoutId => "row_without_id",
            Self::MissingId => "missing_id",
            Self::InvalidId => "invalid_id",
            Self::MissingNombreMisionero => "missing_nombre_misionero",
        }
    }
}

static EMPTY: RawCell = RawCell::Empty;

fn cell(row: &[RawCell], index: usize) -> &RawCell {
    row.get(index).unwrap_or(&EMPTY)
}

/// Null-ish check shared by every coercion: absent, blank text, `nan`, NaN.
pub fn is_blank(cell: &RawCell) -> bool {
    match cell {
        RawCell::Empty => true,
        RawCell::Text(text) => {
            let trimmed = text.trim();
            trimmed.is_empty() || trimmed.eq_ignore_ascii_case("nan")
        }
        RawCell::Float(value) => value.is_nan(),
        _ => false,
    }
}

fn integral(value: f64) -> Option<i64> {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < i64::MAX as f64 {
        Some(value as i64)
    } else {
        None
    }
}

pub fn to_text(cell: &RawCell) -> Option<String> {
    if is_blank(cell) {
        return None;
    }
    let text = match cell {
        RawCell::Empty => return None,
        RawCell::Text(text) => text.trim().to_string(),
        RawCell::Int(value) => value.to_string(),
        RawCell::Float(value) => match integral(*value) {
            Some(whole) => whole.to_string(),
            None => value.to_string(),
        },
        RawCell::Bool(true) => "True".to_string(),
        RawCell::Bool(false) => "False".to_string(),
        RawCell::Date(date) => date.format("%Y-%m-%d").to_string(),
        RawCell::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
    };
    Some(text)
}

pub fn to_int(cell: &RawCell) -> Option<i64> {
    match cell {
        RawCell::Int(value) => Some(*value),
        RawCell::Float(value) => integral(*value),
        RawCell::Text(text) => text.trim().parse().ok(),
        _ => None,
    }
}

pub fn to_bool(cell: &RawCell) -> bool {
    if let RawCell::Bool(value) = cell {
        return *value;
    }
    to_text(cell)
        .map(|text| TRUTHY.contains(&text.to_lowercase().as_str()))
        .unwrap_or(false)
}

pub fn to_date(cell: &RawCell) -> Option<NaiveDate> {
    coerce_date(cell, &DATE_FORMATS)
}

pub fn to_presencial_date(cell: &RawCell) -> Option<NaiveDate> {
    coerce_date(cell, &PRESENCIAL_DATE_FORMATS)
}

fn coerce_date(cell: &RawCell, formats: &[&str]) -> Option<NaiveDate> {
    if is_blank(cell) {
        return None;
    }
    match cell {
        RawCell::Date(date) => Some(*date),
        RawCell::DateTime(dt) => Some(dt.date()),
        RawCell::Int(days) => serial_to_datetime(*days as f64).map(|dt| dt.date()),
        RawCell::Float(days) => serial_to_datetime(*days).map(|dt| dt.date()),
        RawCell::Text(text) => parse_text_date(text.trim(), formats),
        RawCell::Bool(_) | RawCell::Empty => None,
    }
}

fn parse_text_date(text: &str, formats: &[&str]) -> Option<NaiveDate> {
    formats.iter().find_map(|fmt| {
        if *fmt == COMPACT_DATE_FORMAT {
            parse_compact_date(text)
        } else if year_width_matches(text, fmt) {
            NaiveDate::parse_from_str(text, fmt).ok()
        } else {
            None
        }
    })
}

// chrono's %Y also takes 2 or 5+ digit years; only a 4-digit year may match it.
fn year_width_matches(text: &str, fmt: &str) -> bool {
    if fmt.starts_with("%Y") {
        text.chars().take_while(char::is_ascii_digit).count() == 4
    } else if fmt.ends_with("%Y") {
        text.chars().rev().take_while(char::is_ascii_digit).count() == 4
    } else {
        true
    }
}

// chrono's %Y is unbounded, so YYYYMMDD is split by hand.
fn parse_compact_date(text: &str) -> Option<NaiveDate> {
    if text.len() != 8 || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let year = text[0..4].parse().ok()?;
    let month = text[4..6].parse().ok()?;
    let day = text[6..8].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Spreadsheet serial day count (1899-12-30 epoch) to a timestamp.
pub fn serial_to_datetime(days: f64) -> Option<NaiveDateTime> {
    if !days.is_finite() || days.abs() > 3_000_000.0 {
        return None;
    }
    let epoch = NaiveDate::from_ymd_opt(1899, 12, 30)?.and_hms_opt(0, 0, 0)?;
    let millis = (days * 86_400_000.0).round() as i64;
    epoch.checked_add_signed(TimeDelta::try_milliseconds(millis)?)
}

/// Capitalizes the first letter of every alphabetic run and lowercases the rest.
pub fn title_case(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut previous_alpha = false;
    for ch in text.chars() {
        if ch.is_alphabetic() {
            if previous_alpha {
                out.extend(ch.to_lowercase());
            } else {
                out.extend(ch.to_uppercase());
            }
            previous_alpha = true;
        } else {
            out.push(ch);
            previous_alpha = false;
        }
    }
    out
}

/// Reads the identifier column. Only positive integers are accepted.
pub fn identifier(row: &[RawCell]) -> Result<i64, RowIssue> {
    let Some(first) = row.first() else {
        return Err(RowIssue::RowWithoutId);
    };
    if is_blank(first) {
        return Err(RowIssue::MissingId);
    }
    match to_int(first) {
        Some(id) if id > 0 => Ok(id),
        _ => Err(RowIssue::InvalidId),
    }
}

/// Builds a record from one positional worksheet row, or discards it.
pub fn normalize_row(row: &[RawCell], row_index: usize, file_id: &str) -> Option<MissionaryRecord> {
    let id = match identifier(row) {
        Ok(id) => id,
        Err(issue) => {
            warn!(
                stage = "normalize",
                excel_file_id = file_id,
                row_index,
                reason = issue.as_str(),
                "row discarded"
            );
            return None;
        }
    };

    let text = |index| to_text(cell(row, index));
    let int = |index| to_int(cell(row, index));
    let flag = |index| to_bool(cell(row, index));
    let date = |index| to_date(cell(row, index));

    let record = MissionaryRecord {
        id,
        id_distrito: text(1),
        tipo: text(2),
        rama: int(3),
        distrito: text(4),
        pais: text(5).map(|pais| title_case(&pais)),
        numero_lista: int(6),
        numero_companerismo: int(7),
        tratamiento: None,
        nombre_misionero: text(8).unwrap_or_default(),
        companero: text(9),
        mision_asignada: text(10),
        estaca: text(11),
        hospedaje: text(12),
        foto: text(13),
        fecha_llegada: date(14),
        fecha_salida: date(15),
        fecha_generacion: date(16),
        comentarios: text(17),
        investido: flag(18),
        fecha_nacimiento: date(19),
        foto_tomada: flag(20),
        pasaporte: flag(21),
        folio_pasaporte: text(22),
        fm: text(23),
        ipad: flag(24),
        closet: text(25),
        llegada_secundaria: text(26),
        pday: text(27),
        host: flag(28),
        tres_semanas: flag(29),
        device: flag(30),
        correo_misional: text(31),
        correo_personal: text(32),
        fecha_presencial: to_presencial_date(cell(row, 33)),
        activo: true,
    };

    if record.nombre_misionero.is_empty() {
        warn!(
            stage = "normalize",
            excel_file_id = file_id,
            row_index,
            reason = RowIssue::MissingNombreMisionero.as_str(),
            missionary_id = id,
            "record kept without a name"
        );
    }

    Some(record)
}

#[derive(Debug, Error)]
pub enum WorkbookError {
    #[error("opening workbook: {0}")]
    Open(#[source] calamine::Error),
    #[error("reading first worksheet: {0}")]
    Worksheet(#[source] calamine::Error),
}

/// Rows of the first worksheet, anchored at A1 so column positions match the sheet.
pub fn read_rows(bytes: &[u8]) -> Result<Vec<RawRow>, WorkbookError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes)).map_err(WorkbookError::Open)?;
    let range = match workbook.worksheet_range_at(0) {
        None => return Ok(Vec::new()),
        Some(range) => range.map_err(WorkbookError::Worksheet)?,
    };

    let (start_row, start_col) = range.start().unwrap_or((0, 0));
    let mut rows: Vec<RawRow> = (0..start_row).map(|_| Vec::new()).collect();
    for sheet_row in range.rows() {
        let mut row = vec![RawCell::Empty; start_col as usize];
        row.extend(sheet_row.iter().map(convert_cell));
        rows.push(row);
    }
    Ok(rows)
}

pub fn convert_cell(data: &Data) -> RawCell {
    match data {
        Data::Empty | Data::Error(_) => RawCell::Empty,
        Data::String(text) => RawCell::Text(text.clone()),
        Data::Int(value) => RawCell::Int(*value),
        Data::Float(value) => RawCell::Float(*value),
        Data::Bool(value) => RawCell::Bool(*value),
        Data::DateTime(dt) => {
            let serial = dt.as_f64();
            serial_to_datetime(serial)
                .map(RawCell::DateTime)
                .unwrap_or(RawCell::Float(serial))
        }
        Data::DateTimeIso(text) => NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
            .map(RawCell::DateTime)
            .or_else(|_| NaiveDate::parse_from_str(text, "%Y-%m-%d").map(RawCell::Date))
            .unwrap_or_else(|_| RawCell::Text(text.clone())),
        Data::DurationIso(text) => RawCell::Text(text.clone()),
    }
}

/// Normalizes every data row; the first row is the header and data rows are
/// numbered from 2 as they appear in the sheet.
pub fn normalize_rows(rows: &[RawRow], file_id: &str) -> Vec<MissionaryRecord> {
    if rows.len() < 2 {
        return Vec::new();
    }
    rows.iter()
        .enumerate()
        .skip(1)
        .filter_map(|(index, row)| normalize_row(row, index + 1, file_id))
        .collect()
}

/// Turns downloaded file bytes into positional rows.
pub trait RowDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<Vec<RawRow>, WorkbookError>;
}

/// xlsx/xls/ods decoding through calamine.
#[derive(Debug, Default, Clone, Copy)]
pub struct WorkbookDecoder;

impl RowDecoder for WorkbookDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<Vec<RawRow>, WorkbookError> {
        read_rows(bytes)
    }
}
