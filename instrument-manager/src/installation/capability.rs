// Install capability probe
//
// Decides up front whether the upload form is offered at all (directories writable) and whether an
// upload can be installed automatically (privileged account usable and apply program present).

use log::{info, warn};
use serde::Serialize;
use std::path::Path;

use crate::database::connection::{is_quat_user_configured, DbConnector};
use crate::models::settings::ManagerConfig;

pub const QUAT_USER_FEEDBACK: &str = "Instrument installation is not possible given the current server \
configuration; the 'quatUser' is not configured properly. File upload is still possible but \
instruments will need to be installed manually.";

pub const NOT_WRITABLE_FEEDBACK: &str = "Automatic installation of instruments is not possible given \
the current server configuration. Please contact your administrator if you require this functionality.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallCapability {
    /// Both project directories accept new files.
    pub writable: bool,
    /// Uploaded definitions can be applied to the database automatically.
    pub can_install: bool,
    /// Standing warning for the listing page.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
}

impl InstallCapability {
    pub fn new(writable: bool, can_install: bool) -> Self {
        let feedback = if !writable {
            Some(NOT_WRITABLE_FEEDBACK.to_string())
        } else if !can_install {
            Some(QUAT_USER_FEEDBACK.to_string())
        } else {
            None
        };
        Self {
            writable,
            can_install,
            feedback,
        }
    }

    pub async fn probe(config: &ManagerConfig, connector: &dyn DbConnector) -> Self {
        let writable = dir_is_writable(&config.instruments_dir()).await
            && dir_is_writable(&config.tables_sql_dir()).await;

        let apply_program_found = match which::which(&config.tools.apply_program) {
            Ok(path) => {
                info!(
                    "[PHASE: preflight] [STEP: apply_program] Found {:?}",
                    path
                );
                true
            }
            Err(e) => {
                warn!(
                    "[PHASE: preflight] [STEP: apply_program] '{}' not found on PATH: {}",
                    config.tools.apply_program, e
                );
                false
            }
        };
        let can_install =
            apply_program_found && is_quat_user_configured(&config.database, connector).await;

        let capability = Self::new(writable, can_install);
        info!(
            "[PHASE: preflight] [STEP: capability] writable={}, can_install={}",
            capability.writable, capability.can_install
        );
        capability
    }
}

/// Real writability test: create and remove a scratch file.
pub async fn dir_is_writable(dir: &Path) -> bool {
    let meta = match tokio::fs::metadata(dir).await {
        Ok(m) => m,
        Err(e) => {
            warn!(
                "[PHASE: preflight] [STEP: writable] {:?} is not accessible: {}",
                dir, e
            );
            return false;
        }
    };
    if !meta.is_dir() {
        warn!("[PHASE: preflight] [STEP: writable] {:?} is not a directory", dir);
        return false;
    }

    let probe = dir.join(format!(".instrument-manager-write-test-{}", uuid::Uuid::new_v4()));
    match tokio::fs::write(&probe, b"ok").await {
        Ok(()) => {
            let _ = tokio::fs::remove_file(&probe).await;
            true
        }
        Err(e) => {
            warn!(
                "[PHASE: preflight] [STEP: writable] {:?} is not writable: {}",
                dir, e
            );
            false
        }
    }
}
