//! The validation verdict surfaced to callers.

use serde::{Deserialize, Serialize};

/// One finding: a stable code, a human message, and optionally where in the
/// config it points and how to fix it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationIssue {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json_pointer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation: Option<String>,
}

/// Ordered errors and warnings; `ok` iff no errors. Issue order is the order
/// checks ran in, so identical configs produce identical reports.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationReport {
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn error(
        &mut self,
        code: impl Into<String>,
        message: impl Into<String>,
        json_pointer: Option<String>,
    ) {
        self.errors.push(ValidationIssue {
            code: code.into(),
            message: message.into(),
            json_pointer,
            remediation: None,
        });
    }

    pub fn error_with_remediation(
        &mut self,
        code: impl Into<String>,
        message: impl Into<String>,
        json_pointer: Option<String>,
        remediation: impl Into<String>,
    ) {
        self.errors.push(ValidationIssue {
            code: code.into(),
            message: message.into(),
            json_pointer,
            remediation: Some(remediation.into()),
        });
    }

    pub fn warning(
        &mut self,
        code: impl Into<String>,
        message: impl Into<String>,
        json_pointer: Option<String>,
    ) {
        self.warnings.push(ValidationIssue {
            code: code.into(),
            message: message.into(),
            json_pointer,
            remediation: None,
        });
    }

    /// Append another report's findings, preserving order.
    pub fn merge(&mut self, other: ValidationReport) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
    }
}
