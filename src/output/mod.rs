//! Output reporters for different formats
//!
//! Supports plain text for terminals and JSON for tooling.

use std::io::Write;

use thiserror::Error;

use crate::engine::ChangeSetStatus;
use crate::lock::LockInfo;
use crate::report::RunReport;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("IO error writing report: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Trait for output format reporters.
pub trait Reporter {
    /// Write the outcome of an update, sync or rollback.
    fn emit_run(&self, report: &RunReport, out: &mut dyn Write) -> Result<(), ReportError>;

    /// Write the classification produced by `status`.
    fn emit_status(
        &self,
        statuses: &[ChangeSetStatus],
        out: &mut dyn Write,
    ) -> Result<(), ReportError>;

    fn emit_locks(&self, locks: &[LockInfo], out: &mut dyn Write) -> Result<(), ReportError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

pub struct TextReporter;

pub struct JsonReporter {
    pub pretty: bool,
}

impl JsonReporter {
    pub fn new(pretty: bool) -> Self {
        Self { pretty }
    }
}

impl Default for JsonReporter {
    fn default() -> Self {
        Self::new(true)
    }
}

pub fn reporter_for(format: OutputFormat) -> Box<dyn Reporter> {
    match format {
        OutputFormat::Text => Box::new(TextReporter),
        OutputFormat::Json => Box::new(JsonReporter::default()),
    }
}

pub mod json;
pub mod text;
