//! Instrument file placement.
//!
//! Uploaded definitions land in the project's instruments directory. Placement never overwrites:
//! an existing file means an administrator has to step in.

use anyhow::{Context, Result};
use log::{debug, info};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

use crate::instrument::definition::DEFINITION_EXTENSION;

/// How an instrument is implemented, judged by which file exists on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum InstrumentKind {
    #[serde(rename = "Instrument Builder")]
    InstrumentBuilder,
    #[serde(rename = "PHP")]
    Php,
    #[serde(rename = "Missing")]
    Missing,
}

impl InstrumentKind {
    pub fn label(&self) -> &'static str {
        match self {
            InstrumentKind::InstrumentBuilder => "Instrument Builder",
            InstrumentKind::Php => "PHP",
            InstrumentKind::Missing => "Missing",
        }
    }
}

#[derive(Debug)]
pub enum PlaceOutcome {
    Placed { path: PathBuf, sha256: String },
    AlreadyExists(PathBuf),
}

#[derive(Debug, Clone)]
pub struct InstrumentFiles {
    instruments_dir: PathBuf,
    file_mode: u32,
}

impl InstrumentFiles {
    pub fn new(instruments_dir: PathBuf, file_mode: u32) -> Self {
        Self {
            instruments_dir,
            file_mode,
        }
    }

    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.instruments_dir.join(file_name)
    }

    pub async fn exists(&self, file_name: &str) -> bool {
        tokio::fs::try_exists(self.path_for(file_name))
            .await
            .unwrap_or(false)
    }

    pub async fn kind_of(&self, instrument: &str) -> InstrumentKind {
        if self
            .exists(&format!("{}.{}", instrument, DEFINITION_EXTENSION))
            .await
        {
            InstrumentKind::InstrumentBuilder
        } else if self
            .exists(&format!("NDB_BVL_Instrument_{}.class.inc", instrument))
            .await
        {
            InstrumentKind::Php
        } else {
            InstrumentKind::Missing
        }
    }

    /// Write `bytes` to `<instruments_dir>/<file_name>` unless a file is already there.
    pub async fn place(&self, file_name: &str, bytes: &[u8]) -> Result<PlaceOutcome> {
        let path = self.path_for(file_name);
        debug!(
            "[PHASE: install] [STEP: place_file] place entered (path={:?}, bytes={})",
            path,
            bytes.len()
        );

        let open = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;
        let mut file = match open {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Ok(PlaceOutcome::AlreadyExists(path));
            }
            Err(e) => {
                return Err(anyhow::Error::new(e))
                    .with_context(|| format!("Failed to create {:?}", path));
            }
        };

        if let Err(e) = write_all_and_flush(&mut file, bytes).await {
            // Leave nothing half-written behind; a partial file would block every retry.
            drop(file);
            let _ = tokio::fs::remove_file(&path).await;
            return Err(e.context(format!("Failed to write {:?}", path)));
        }
        drop(file);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(self.file_mode))
                .await
                .with_context(|| format!("Failed to set permissions on {:?}", path))?;
        }

        let sha256 = Sha256::digest(bytes)
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>();
        info!(
            "[PHASE: install] [STEP: place_file] Placed {:?} (bytes={}, sha256={}, mode={:o})",
            path,
            bytes.len(),
            sha256,
            self.file_mode
        );
        Ok(PlaceOutcome::Placed { path, sha256 })
    }
}

async fn write_all_and_flush(file: &mut tokio::fs::File, bytes: &[u8]) -> Result<()> {
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}
