//! Core domain model for CCM generation ingestion.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "ccm-core";

/// MIME types accepted when listing a generation folder.
pub const EXCEL_MIME_TYPES: [&str; 2] = [
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "application/vnd.ms-excel",
];

/// One cell as it came out of a worksheet, before any coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum RawCell {
    Empty,
    Text(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
}

impl RawCell {
    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }
}

/// Positional cells of one worksheet row.
pub type RawRow = Vec<RawCell>;

/// File metadata returned by a folder listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_filename")]
    pub name: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub modified_time: Option<DateTime<Utc>>,
}

fn default_filename() -> String {
    "archivo.xlsx".to_string()
}

/// Normalized row ready to be inserted into `ccm_generaciones`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MissionaryRecord {
    pub id: i64,
    pub id_distrito: Option<String>,
    pub tipo: Option<String>,
    pub rama: Option<i64>,
    pub distrito: Option<String>,
    pub pais: Option<String>,
    pub numero_lista: Option<i64>,
    pub numero_companerismo: Option<i64>,
    pub tratamiento: Option<String>,
    pub nombre_misionero: String,
    pub companero: Option<String>,
    pub mision_asignada: Option<String>,
    pub estaca: Option<String>,
    pub hospedaje: Option<String>,
    pub foto: Option<String>,
    pub fecha_llegada: Option<NaiveDate>,
    pub fecha_salida: Option<NaiveDate>,
    pub fecha_generacion: Option<NaiveDate>,
    pub comentarios: Option<String>,
    pub investido: bool,
    pub fecha_nacimiento: Option<NaiveDate>,
    pub foto_tomada: bool,
    pub pasaporte: bool,
    pub folio_pasaporte: Option<String>,
    pub fm: Option<String>,
    pub ipad: bool,
    pub closet: Option<String>,
    pub llegada_secundaria: Option<String>,
    pub pday: Option<String>,
    pub host: bool,
    pub tres_semanas: bool,
    pub device: bool,
    pub correo_misional: Option<String>,
    pub correo_personal: Option<String>,
    pub fecha_presencial: Option<NaiveDate>,
    pub activo: bool,
}

impl MissionaryRecord {
    /// Record with only the identifier and name set; every other field at its default.
    pub fn new(id: i64, nombre_misionero: impl Into<String>) -> Self {
        Self {
            id,
            id_distrito: None,
            tipo: None,
            rama: None,
            distrito: None,
            pais: None,
            numero_lista: None,
            numero_companerismo: None,
            tratamiento: None,
            nombre_misionero: nombre_misionero.into(),
            companero: None,
            mision_asignada: None,
            estaca: None,
            hospedaje: None,
            foto: None,
            fecha_llegada: None,
            fecha_salida: None,
            fecha_generacion: None,
            comentarios: None,
            investido: false,
            fecha_nacimiento: None,
            foto_tomada: false,
            pasaporte: false,
            folio_pasaporte: None,
            fm: None,
            ipad: false,
            closet: None,
            llegada_secundaria: None,
            pday: None,
            host: false,
            tres_semanas: false,
            device: false,
            correo_misional: None,
            correo_personal: None,
            fecha_presencial: None,
            activo: true,
        }
    }
}

/// Resume position of one source folder.
///
/// `ResumeAfter` is the watermark left by a fully committed file; `RetryFrom`
/// names a file that was in flight when a run halted and must be processed
/// again before anything after it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SyncState {
    #[default]
    Idle,
    ResumeAfter(String),
    RetryFrom(String),
}

impl SyncState {
    /// Builds a state from the two persisted markers. A continuation token wins
    /// over a watermark when both are present.
    pub fn from_markers(
        last_processed_file_id: Option<String>,
        continuation_token: Option<String>,
    ) -> Self {
        match (continuation_token, last_processed_file_id) {
            (Some(token), _) if !token.is_empty() => Self::RetryFrom(token),
            (_, Some(last)) if !last.is_empty() => Self::ResumeAfter(last),
            _ => Self::Idle,
        }
    }

    pub fn last_processed_file_id(&self) -> Option<&str> {
        match self {
            Self::ResumeAfter(file_id) => Some(file_id),
            _ => None,
        }
    }

    pub fn continuation_token(&self) -> Option<&str> {
        match self {
            Self::RetryFrom(file_id) => Some(file_id),
            _ => None,
        }
    }

    /// File id the state points at, whichever kind of marker it is.
    pub fn marker(&self) -> Option<&str> {
        match self {
            Self::Idle => None,
            Self::ResumeAfter(file_id) | Self::RetryFrom(file_id) => Some(file_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    DriveListingFailed,
    DriveDownloadFailed,
    ExcelReadFailed,
    DbInsertFailed,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DriveListingFailed => "drive_listing_failed",
            Self::DriveDownloadFailed => "drive_download_failed",
            Self::ExcelReadFailed => "excel_read_failed",
            Self::DbInsertFailed => "db_insert_failed",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error surfaced to callers of a sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
}

impl SyncError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            file_id: None,
        }
    }

    pub fn for_file(code: ErrorCode, message: impl Into<String>, file_id: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            file_id: Some(file_id.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedFile {
    pub file_id: String,
    pub filename: String,
    pub inserted: usize,
    pub skipped: usize,
    pub rows_total: usize,
}

/// Result of one generation sync run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    #[serde(rename = "fecha_generacion")]
    pub generation_key: String,
    #[serde(rename = "drive_folder_id")]
    pub folder_id: String,
    pub processed_files: Vec<ProcessedFile>,
    pub inserted_count: usize,
    pub skipped_count: usize,
    pub errors: Vec<SyncError>,
    pub duration_seconds: f64,
    pub continuation_token: Option<String>,
}

impl SyncReport {
    pub fn new(generation_key: impl Into<String>, folder_id: impl Into<String>) -> Self {
        Self {
            generation_key: generation_key.into(),
            folder_id: folder_id.into(),
            processed_files: Vec::new(),
            inserted_count: 0,
            skipped_count: 0,
            errors: Vec::new(),
            duration_seconds: 0.0,
            continuation_token: None,
        }
    }

    pub fn record_file(&mut self, file: ProcessedFile) {
        self.inserted_count += file.inserted;
        self.skipped_count += file.skipped;
        self.processed_files.push(file);
    }

    pub fn was_processed(&self, file_id: &str) -> bool {
        self.processed_files.iter().any(|f| f.file_id == file_id)
    }
}
