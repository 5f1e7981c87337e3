//! Resumable folder-to-table sync run.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use ccm_core::{
    DriveFile, ErrorCode, ProcessedFile, SyncError, SyncReport, SyncState, EXCEL_MIME_TYPES,
};
use ccm_ingest::{normalize_rows, RowDecoder, WorkbookDecoder};
use ccm_storage::{FileStore, StateStore, StateStoreError};
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Instrument};

use crate::persist::{BatchPersister, MissionaryTable};

/// Where a run starts in the sorted listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResumePlan {
    Everything,
    /// Reprocess this file, then everything after it.
    RetryFrom(String),
    /// Skip through this file.
    ResumeAfter(String),
}

impl ResumePlan {
    pub fn from_state(state: SyncState, force: bool) -> Self {
        if force {
            return Self::Everything;
        }
        match state {
            SyncState::Idle => Self::Everything,
            SyncState::RetryFrom(file_id) => Self::RetryFrom(file_id),
            SyncState::ResumeAfter(file_id) => Self::ResumeAfter(file_id),
        }
    }
}

/// Drops entries without an id and orders by (modified time, name).
pub fn order_files(mut files: Vec<DriveFile>) -> Vec<DriveFile> {
    files.retain(|f| !f.id.is_empty());
    files.sort_by(|a, b| {
        a.modified_time
            .cmp(&b.modified_time)
            .then_with(|| a.name.cmp(&b.name))
    });
    files
}

/// Files the run must visit, in order. A marker that no longer appears in the
/// listing falls back to visiting every file.
pub fn select_files(files: Vec<DriveFile>, plan: &ResumePlan) -> Vec<DriveFile> {
    let (marker, offset) = match plan {
        ResumePlan::Everything => return files,
        ResumePlan::RetryFrom(file_id) => (file_id, 0),
        ResumePlan::ResumeAfter(file_id) => (file_id, 1),
    };
    match files.iter().position(|f| &f.id == marker) {
        Some(index) => files.into_iter().skip(index + offset).collect(),
        // An unknown marker reprocesses the whole folder instead of skipping
        // it; ids already stored are deduplicated by the persister.
        None => {
            warn!(marker = %marker, "resume marker not in listing; processing every file");
            files
        }
    }
}

/// Drives one generation sync. Files are handled strictly one after another,
/// and runs for the same folder are serialized.
pub struct SyncOrchestrator {
    files: Arc<dyn FileStore>,
    persister: BatchPersister,
    state: Arc<dyn StateStore>,
    decoder: Box<dyn RowDecoder>,
    folder_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

enum FileStep {
    Continue,
    Halt,
}

impl SyncOrchestrator {
    pub fn new(
        files: Arc<dyn FileStore>,
        table: Arc<dyn MissionaryTable>,
        state: Arc<dyn StateStore>,
    ) -> Self {
        Self {
            files,
            persister: BatchPersister::new(table),
            state,
            decoder: Box::new(WorkbookDecoder),
            folder_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_decoder(mut self, decoder: Box<dyn RowDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    async fn folder_lock(&self, folder_id: &str) -> Arc<Mutex<()>> {
        let mut map = self.folder_locks.lock().await;
        map.entry(folder_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Forgets the folder's lock once no other run holds or awaits it.
    async fn release_folder_lock(&self, folder_id: &str, lock: Arc<Mutex<()>>) {
        let mut map = self.folder_locks.lock().await;
        // One reference in the map, one held here.
        if Arc::strong_count(&lock) == 2 {
            map.remove(folder_id);
        }
    }

    pub async fn sync(&self, generation_key: &str, folder_id: &str, force: bool) -> SyncReport {
        let span = info_span!(
            "sync_generation",
            fecha_generacion = generation_key,
            drive_folder_id = folder_id,
            force
        );
        async {
            let lock = self.folder_lock(folder_id).await;
            let report = {
                let _running = lock.lock().await;
                self.run(generation_key, folder_id, force).await
            };
            self.release_folder_lock(folder_id, lock).await;
            report
        }
        .instrument(span)
        .await
    }

    async fn run(&self, generation_key: &str, folder_id: &str, force: bool) -> SyncReport {
        let started = Instant::now();
        let mut report = SyncReport::new(generation_key, folder_id);
        info!(stage = "start", "starting generation sync");

        let plan = ResumePlan::from_state(self.state.load(folder_id).await, force);

        let listing = match self.files.list_files(folder_id, &EXCEL_MIME_TYPES).await {
            Ok(listing) => listing,
            Err(err) => {
                error!(
                    stage = "drive_list",
                    error = %err,
                    error_code = ErrorCode::DriveListingFailed.as_str(),
                    "listing drive folder failed"
                );
                report
                    .errors
                    .push(SyncError::new(ErrorCode::DriveListingFailed, err.to_string()));
                report.continuation_token = match &plan {
                    ResumePlan::Everything => None,
                    ResumePlan::RetryFrom(id) | ResumePlan::ResumeAfter(id) => Some(id.clone()),
                };
                report.duration_seconds = started.elapsed().as_secs_f64();
                return report;
            }
        };

        let pending = select_files(order_files(listing), &plan);
        let mut halted = false;
        for file in &pending {
            if let FileStep::Halt = self.process_file(folder_id, file, &mut report).await {
                halted = true;
                break;
            }
        }

        if !halted {
            self.record_state_write(folder_id, None, self.state.clear(folder_id).await);
        }

        report.duration_seconds = started.elapsed().as_secs_f64();
        info!(
            stage = "finish",
            inserted_count = report.inserted_count,
            skipped_count = report.skipped_count,
            duration_seconds = report.duration_seconds,
            continuation_token = report.continuation_token.as_deref(),
            "generation sync finished"
        );
        report
    }

    async fn process_file(&self, folder_id: &str, file: &DriveFile, report: &mut SyncReport) -> FileStep {
        let file_id = file.id.as_str();
        info!(
            stage = "download",
            excel_file_id = file_id,
            excel_filename = %file.name,
            "downloading generation file"
        );

        let bytes = match self.files.download_file(file_id).await {
            Ok(bytes) => bytes,
            Err(err) => {
                error!(
                    stage = "download",
                    excel_file_id = file_id,
                    error = %err,
                    error_code = ErrorCode::DriveDownloadFailed.as_str(),
                    "downloading drive file failed"
                );
                return self
                    .halt(folder_id, file_id, ErrorCode::DriveDownloadFailed, err.to_string(), report)
                    .await;
            }
        };

        let records = match self.decoder.decode(&bytes) {
            Ok(rows) => normalize_rows(&rows, file_id),
            Err(err) => {
                warn!(
                    stage = "parse",
                    excel_file_id = file_id,
                    error = %err,
                    error_code = ErrorCode::ExcelReadFailed.as_str(),
                    "workbook unreadable; skipping file"
                );
                report.errors.push(SyncError::for_file(
                    ErrorCode::ExcelReadFailed,
                    err.to_string(),
                    file_id,
                ));
                Vec::new()
            }
        };

        if records.is_empty() {
            info!(stage = "parse", excel_file_id = file_id, table_rows = 0, "file has no records");
            report.record_file(ProcessedFile {
                file_id: file_id.to_string(),
                filename: file.name.clone(),
                inserted: 0,
                skipped: 0,
                rows_total: 0,
            });
            self.mark_processed(folder_id, file_id).await;
            return FileStep::Continue;
        }

        let outcome = match self.persister.persist(&records).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(
                    stage = "insert",
                    excel_file_id = file_id,
                    error = %err,
                    error_code = ErrorCode::DbInsertFailed.as_str(),
                    "inserting records failed"
                );
                return self
                    .halt(folder_id, file_id, ErrorCode::DbInsertFailed, err.to_string(), report)
                    .await;
            }
        };

        info!(
            stage = "insert",
            excel_file_id = file_id,
            records_processed = outcome.inserted,
            records_skipped = outcome.skipped,
            table_rows = records.len(),
            "file processed"
        );
        report.record_file(ProcessedFile {
            file_id: file_id.to_string(),
            filename: file.name.clone(),
            inserted: outcome.inserted,
            skipped: outcome.skipped,
            rows_total: records.len(),
        });
        self.mark_processed(folder_id, file_id).await;
        FileStep::Continue
    }

    async fn halt(
        &self,
        folder_id: &str,
        file_id: &str,
        code: ErrorCode,
        message: String,
        report: &mut SyncReport,
    ) -> FileStep {
        report.errors.push(SyncError::for_file(code, message, file_id));
        report.continuation_token = Some(file_id.to_string());
        let result = self.state.mark_interrupted(folder_id, file_id).await;
        self.record_state_write(folder_id, Some(file_id), result);
        FileStep::Halt
    }

    async fn mark_processed(&self, folder_id: &str, file_id: &str) {
        let result = self.state.mark_processed(folder_id, file_id).await;
        self.record_state_write(folder_id, Some(file_id), result);
    }

    // State write failures never change the run outcome.
    fn record_state_write(
        &self,
        folder_id: &str,
        file_id: Option<&str>,
        result: Result<(), StateStoreError>,
    ) {
        if let Err(err) = result {
            error!(
                stage = "state",
                drive_folder_id = folder_id,
                excel_file_id = file_id,
                error = %err,
                "persisting sync state failed"
            );
        }
    }
}
