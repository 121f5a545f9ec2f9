// Response models for the JSON output of the CLI

use serde::Serialize;

use crate::database::consistency::ValidationVerdict;
use crate::installation::capability::InstallCapability;
use crate::installation::orchestrator::{InstallError, InstallReport};
use crate::listing::InstrumentRow;

/// `{ success, statusCode, data?, error? }`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub success: bool,
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            status_code: 200,
            data: Some(data),
            error: None,
        }
    }

    pub fn fail(status_code: u16, message: impl Into<String>) -> Self {
        Self {
            success: false,
            status_code,
            data: None,
            error: Some(message.into()),
        }
    }
}

impl From<Result<InstallReport, InstallError>> for ApiResponse<InstallReport> {
    fn from(result: Result<InstallReport, InstallError>) -> Self {
        match result {
            Ok(report) => Self {
                success: true,
                status_code: report.status_code,
                data: Some(report),
                error: None,
            },
            // Display is the user-safe message; operator details never reach the response.
            Err(e) => Self::fail(e.status_code(), e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentListing {
    pub capability: InstallCapability,
    pub instruments: Vec<InstrumentRow>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub instrument: String,
    pub table_valid: ValidationVerdict,
    pub pages_valid: ValidationVerdict,
}

impl CheckResult {
    pub fn all_valid(&self) -> bool {
        self.table_valid == ValidationVerdict::Valid && self.pages_valid == ValidationVerdict::Valid
    }
}
