//! Run log of stored flat fields
//!
//! One CSV row per stored frame with the columns
//! `datetime,solalt,exptime,counts,filter,binning`. Collected over many
//! nights, the log is used to fit the per-filter exposure time functions.
//!
//! Appending loads the whole table, adds the row and rewrites the file. Only
//! one run may write a log at a time.

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRow {
    /// Start of the exposure
    pub datetime: DateTime<Utc>,
    /// Solar altitude at the start of the exposure in degrees
    pub solalt: f64,
    /// Exposure time in seconds
    pub exptime: f64,
    /// Target count the exposure time was chosen for
    pub counts: f64,
    pub filter: String,
    pub binning: u32,
}

#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read all rows in file order
    pub fn read_all(&self) -> Result<Vec<LogRow>> {
        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(&self.path)?;
        let mut rows = Vec::new();
        for row in reader.deserialize() {
            rows.push(row?);
        }
        Ok(rows)
    }

    /// Append a row, starting a fresh table if the file is missing or unreadable
    pub fn append(&self, row: LogRow) -> Result<()> {
        let mut rows = if self.path.exists() {
            match self.read_all() {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::warn!("Could not read flat-field log {}, starting fresh: {}", self.path.display(), e);
                    Vec::new()
                }
            }
        } else {
            Vec::new()
        };
        rows.push(row);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut writer = csv::Writer::from_path(&self.path)?;
        for row in &rows {
            writer.serialize(row)?;
        }
        writer.flush()?;

        tracing::debug!("Wrote flat-field log with {} rows to {}", rows.len(), self.path.display());
        Ok(())
    }
}
