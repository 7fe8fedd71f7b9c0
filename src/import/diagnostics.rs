use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    General,
    Schema,
    MissingValue,
    InvalidValue,
    Duplicate,
    Conflict,
    Existing,
    Inactive,
    Ignored,
    Plan,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    pub severity: Severity,
    pub category: Category,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

/// Ordered diagnostics of one test run. Order is the order rules fired,
/// which is deterministic for a given upload and snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImporterLog {
    entries: Vec<DiagnosticEntry>,
}

impl ImporterLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(
        &mut self,
        severity: Severity,
        category: Category,
        line: Option<usize>,
        message: impl Into<String>,
    ) {
        self.entries.push(DiagnosticEntry {
            severity,
            category,
            message: message.into(),
            line,
        });
    }

    pub fn error(&mut self, category: Category, line: Option<usize>, message: impl Into<String>) {
        self.push(Severity::Error, category, line, message);
    }

    pub fn warning(&mut self, category: Category, line: Option<usize>, message: impl Into<String>) {
        self.push(Severity::Warning, category, line, message);
    }

    pub fn info(&mut self, category: Category, line: Option<usize>, message: impl Into<String>) {
        self.push(Severity::Info, category, line, message);
    }

    pub fn extend(&mut self, other: ImporterLog) {
        self.entries.extend(other.entries);
    }

    pub fn entries(&self) -> &[DiagnosticEntry] {
        &self.entries
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.entries.iter().filter(|e| e.severity == severity).count()
    }

    pub fn has_errors(&self) -> bool {
        self.count(Severity::Error) > 0
    }

    pub fn has_warnings(&self) -> bool {
        self.count(Severity::Warning) > 0
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
