// Instrument install orchestration
//
// One upload moves through:
//   Received -> DuplicateChecked -> FilePlaced -> SqlGenerated -> [manual install: stop] -> SqlApplied -> Done
// and can exit early at every gate. No step is retried; the registry row is written by the applied SQL
// itself, so a failed apply leaves the registry untouched.

use log::{error, info, warn};
use serde::Serialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

use crate::database::schema_inspector::{SchemaInspector, REGISTRY_TABLE};
use crate::installation::capability::{InstallCapability, NOT_WRITABLE_FEEDBACK};
use crate::installation::files::{InstrumentFiles, PlaceOutcome};
use crate::installation::tools::{SqlApplier, SqlGenerator};
use crate::instrument::definition::{parse_definition, Definition, DEFINITION_EXTENSION};
use crate::utils::validation::{instrument_name_from_upload, is_valid_instrument_name};

/// Form value that marks a request as an install request.
pub const INSTALL_TRIGGER: &str = "Install Instrument";

#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub trigger: String,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl InstallRequest {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            trigger: INSTALL_TRIGGER.to_string(),
            file_name: file_name.into(),
            bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InstallState {
    Received,
    DuplicateChecked,
    FilePlaced,
    SqlGenerated,
    SqlApplied,
    Done,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallReport {
    pub instrument: String,
    pub correlation_id: String,
    pub final_state: InstallState,
    pub status_code: u16,
    /// User-facing feedback; `None` for a silent success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("{}", NOT_WRITABLE_FEEDBACK)]
    NotWritable,
    #[error("No installation was requested.")]
    NotRequested,
    #[error("{0}")]
    InvalidUpload(String),
    #[error("Instrument '{0}' already exists in the test battery!")]
    AlreadyRegistered(String),
    #[error("'{0}.linst' has already been uploaded. Please contact your administrator to install the instrument.")]
    AlreadyUploaded(String),
    #[error("Instrument '{0}' is already being installed. Please try again later.")]
    InProgress(String),
    #[error("'{name}.linst' is not a valid instrument definition: {reason}")]
    Malformed { name: String, reason: String },
    /// Display is the user message only; `details` is for the operator log.
    #[error("The installation of {table}.sql failed. Please contact your administrator.")]
    ApplyFailed {
        table: String,
        exit_code: Option<i32>,
        details: String,
    },
    #[error("The instrument file could not be saved. Please contact your administrator.")]
    Storage(#[source] anyhow::Error),
    #[error("The instrument registry could not be checked. Please contact your administrator.")]
    Lookup(#[source] anyhow::Error),
}

impl InstallError {
    /// HTTP-equivalent status for the response.
    pub fn status_code(&self) -> u16 {
        match self {
            InstallError::NotWritable => 503,
            InstallError::NotRequested | InstallError::InvalidUpload(_) => 400,
            InstallError::AlreadyRegistered(_)
            | InstallError::AlreadyUploaded(_)
            | InstallError::InProgress(_) => 409,
            InstallError::Malformed { .. } => 422,
            // The page still renders normally; only the feedback tells the user it failed.
            InstallError::ApplyFailed { .. } => 200,
            InstallError::Storage(_) | InstallError::Lookup(_) => 500,
        }
    }

    /// Details that belong in the operator log and never in user feedback.
    pub fn operator_details(&self) -> Option<String> {
        match self {
            InstallError::ApplyFailed {
                exit_code, details, ..
            } => Some(format!("exit_code={:?}; output: {}", exit_code, details)),
            InstallError::Storage(e) | InstallError::Lookup(e) => Some(format!("{:#}", e)),
            _ => None,
        }
    }
}

/// In-process guard so one instrument name is never installed twice at once.
#[derive(Debug, Default)]
pub struct InstallLocks {
    active: Mutex<HashSet<String>>,
}

pub struct InstallLockGuard<'a> {
    locks: &'a InstallLocks,
    name: String,
}

impl InstallLocks {
    pub fn try_acquire(&self, name: &str) -> Option<InstallLockGuard<'_>> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(name.to_string()) {
            return None;
        }
        Some(InstallLockGuard {
            locks: self,
            name: name.to_string(),
        })
    }
}

impl Drop for InstallLockGuard<'_> {
    fn drop(&mut self) {
        let mut active = self.locks.active.lock().unwrap_or_else(|e| e.into_inner());
        active.remove(&self.name);
    }
}

struct InstallRun {
    correlation_id: String,
    instrument: String,
    state: InstallState,
}

impl InstallRun {
    fn advance(&mut self, next: InstallState) {
        info!(
            "[PHASE: install] [STEP: state] {:?} -> {:?} (instrument={}, correlation_id={})",
            self.state, next, self.instrument, self.correlation_id
        );
        self.state = next;
    }

    fn report(&self, status_code: u16, message: Option<String>) -> InstallReport {
        InstallReport {
            instrument: self.instrument.clone(),
            correlation_id: self.correlation_id.clone(),
            final_state: self.state,
            status_code,
            message,
        }
    }
}

pub struct InstallOrchestrator {
    inspector: Arc<dyn SchemaInspector>,
    files: InstrumentFiles,
    tables_sql_dir: PathBuf,
    generator: Arc<dyn SqlGenerator>,
    /// `None` when automatic installation is not possible.
    applier: Option<Arc<dyn SqlApplier>>,
    capability: InstallCapability,
    locks: InstallLocks,
}

impl InstallOrchestrator {
    pub fn new(
        inspector: Arc<dyn SchemaInspector>,
        files: InstrumentFiles,
        tables_sql_dir: PathBuf,
        generator: Arc<dyn SqlGenerator>,
        applier: Option<Arc<dyn SqlApplier>>,
        capability: InstallCapability,
    ) -> Self {
        Self {
            inspector,
            files,
            tables_sql_dir,
            generator,
            applier,
            capability,
            locks: InstallLocks::default(),
        }
    }

    pub fn locks(&self) -> &InstallLocks {
        &self.locks
    }

    /// Run one upload through the install steps.
    pub async fn install(&self, request: InstallRequest) -> Result<InstallReport, InstallError> {
        if !self.capability.writable {
            warn!("[PHASE: install] [STEP: preconditions] Refusing install: project directories are not writable");
            return Err(InstallError::NotWritable);
        }
        if request.trigger != INSTALL_TRIGGER {
            return Err(InstallError::NotRequested);
        }

        let instrument =
            instrument_name_from_upload(&request.file_name).map_err(InstallError::InvalidUpload)?;
        let mut run = InstallRun {
            correlation_id: Uuid::new_v4().to_string(),
            instrument: instrument.clone(),
            state: InstallState::Received,
        };
        info!(
            "[PHASE: install] [STEP: received] Install requested (instrument={}, bytes={}, correlation_id={})",
            instrument,
            request.bytes.len(),
            run.correlation_id
        );

        let Some(_guard) = self.locks.try_acquire(&instrument) else {
            warn!(
                "[PHASE: install] [STEP: lock] Install of {} already in progress",
                instrument
            );
            return Err(InstallError::InProgress(instrument));
        };

        // Duplicate checks: registry first, then the file on disk.
        let registered = self
            .inspector
            .instrument_registered(&instrument)
            .await
            .map_err(InstallError::Lookup)?;
        if registered {
            info!(
                "[PHASE: install] [STEP: duplicate_check] {} is already in {}",
                instrument, REGISTRY_TABLE
            );
            return Err(InstallError::AlreadyRegistered(instrument));
        }
        let file_name = format!("{}.{}", instrument, DEFINITION_EXTENSION);
        if self.files.exists(&file_name).await {
            info!(
                "[PHASE: install] [STEP: duplicate_check] {:?} already exists; leaving it untouched",
                self.files.path_for(&file_name)
            );
            return Err(InstallError::AlreadyUploaded(instrument));
        }
        run.advance(InstallState::DuplicateChecked);

        let definition = parse_definition(&String::from_utf8_lossy(&request.bytes));
        check_well_formed(&instrument, &definition)?;

        // create_new in `place` still guards against a file appearing since the check above.
        let placed = match self
            .files
            .place(&file_name, &request.bytes)
            .await
            .map_err(InstallError::Storage)?
        {
            PlaceOutcome::Placed { path, sha256 } => {
                info!(
                    "[PHASE: install] [STEP: place_file] {} placed (sha256={}, correlation_id={})",
                    file_name, sha256, run.correlation_id
                );
                path
            }
            PlaceOutcome::AlreadyExists(path) => {
                info!(
                    "[PHASE: install] [STEP: place_file] {:?} already exists; leaving it untouched",
                    path
                );
                return Err(InstallError::AlreadyUploaded(instrument));
            }
        };
        run.advance(InstallState::FilePlaced);

        // Generation is run for its side effect; its exit status is logged, not enforced.
        match self.generator.generate(&placed).await {
            Ok(out) if out.success() => {}
            Ok(out) => warn!(
                "[PHASE: install] [STEP: generate_sql] Generator exited with {:?} for {}: {}",
                out.exit_code,
                instrument,
                out.combined_output()
            ),
            Err(e) => warn!(
                "[PHASE: install] [STEP: generate_sql] Generator could not run for {}: {:#}",
                instrument, e
            ),
        }
        run.advance(InstallState::SqlGenerated);

        let applier = match (&self.applier, self.capability.can_install) {
            (Some(applier), true) => applier,
            _ => {
                info!(
                    "[PHASE: install] [STEP: manual_install] {} uploaded; automatic installation unavailable",
                    instrument
                );
                return Ok(run.report(
                    201,
                    Some(format!(
                        "'{}' was uploaded. An administrator must install the instrument manually.",
                        file_name
                    )),
                ));
            }
        };

        let table = definition
            .table_name
            .clone()
            .unwrap_or_else(|| instrument.clone());
        let sql_file = self.tables_sql_dir.join(format!("{}.sql", table));

        let failure = match applier.apply(&sql_file).await {
            Ok(out) if out.success() => None,
            Ok(out) => Some((out.exit_code, out.combined_output())),
            Err(e) => Some((None, format!("{:#}", e))),
        };
        if let Some((exit_code, details)) = failure {
            let err = InstallError::ApplyFailed {
                table,
                exit_code,
                details,
            };
            error!(
                "[PHASE: install] [STEP: apply_sql] {} Either the instrument table exists (but is not in {}), or the privileged account could not connect. correlation_id={}; {}",
                err,
                REGISTRY_TABLE,
                run.correlation_id,
                err.operator_details().unwrap_or_default()
            );
            return Err(err);
        }
        run.advance(InstallState::SqlApplied);
        run.advance(InstallState::Done);

        info!(
            "[PHASE: install] [STEP: done] {} installed from {:?}",
            instrument, sql_file
        );
        Ok(run.report(200, None))
    }
}

fn check_well_formed(instrument: &str, definition: &Definition) -> Result<(), InstallError> {
    if let Some(field) = definition.duplicate_field_names().into_iter().next() {
        return Err(InstallError::Malformed {
            name: instrument.to_string(),
            reason: format!("field '{}' is declared more than once", field),
        });
    }
    if let Some(table) = &definition.table_name {
        if !is_valid_instrument_name(table) {
            return Err(InstallError::Malformed {
                name: instrument.to_string(),
                reason: format!("'{}' is not a valid table name", table),
            });
        }
    }
    Ok(())
}
