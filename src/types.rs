use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::ScanReport;
use crate::options::ScanOptions;
use crate::target::TargetScope;

/// One scanner invocation: what to scan and how
#[derive(Debug, Clone)]
pub struct ScanRequest {
    pub scope: TargetScope,
    pub options: ScanOptions,
}

impl ScanRequest {
    pub fn new(scope: TargetScope, options: ScanOptions) -> Self {
        Self { scope, options }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanStatus {
    Running,
    Complete,
    Failed,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Complete => "complete",
            Self::Failed => "failed",
        }
    }
}

/// Outcome of one scan as kept in a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub status: ScanStatus,
    pub command_line: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub report: Option<ScanReport>,
    pub error: Option<String>,
}

impl ScanRecord {
    pub fn running(command_line: Vec<String>) -> Self {
        Self {
            status: ScanStatus::Running,
            command_line,
            started_at: Utc::now(),
            finished_at: None,
            report: None,
            error: None,
        }
    }

    pub fn complete(&mut self, report: ScanReport) {
        self.status = ScanStatus::Complete;
        self.finished_at = Some(Utc::now());
        self.report = Some(report);
        self.error = None;
    }

    pub fn fail(&mut self, error: &eyre::Error) {
        self.status = ScanStatus::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(format!("{:#}", error));
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }
}
