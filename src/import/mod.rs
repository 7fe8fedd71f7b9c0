//! Two-phase bulk import: read, validate, plan, and (on confirmation) commit.
//!
//! Every import kind runs through the same pipeline. The kind selects the
//! column schema, the identity used to match rows against stored entities,
//! and the validation and planning rules.

pub mod diagnostics;
pub mod error;
pub mod executor;
pub mod planner;
pub mod reader;
pub mod schema;
pub mod session;
pub mod settings;
pub mod snapshot;
pub mod validator;
pub mod workflow;
pub mod xlsx;

pub use error::{ImportError, ImportResult};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportKind {
    User,
    Participant,
    Contributor,
    Semester,
    UserBulkUpdate,
}

impl ImportKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" | "users" => Some(Self::User),
            "participant" | "participants" => Some(Self::Participant),
            "contributor" | "contributors" => Some(Self::Contributor),
            "semester" => Some(Self::Semester),
            "user_bulk_update" => Some(Self::UserBulkUpdate),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Participant => "participant",
            Self::Contributor => "contributor",
            Self::Semester => "semester",
            Self::UserBulkUpdate => "user_bulk_update",
        }
    }

    pub fn scope(self) -> TargetScope {
        match self {
            Self::User | Self::UserBulkUpdate => TargetScope::Global,
            Self::Participant | Self::Contributor => TargetScope::Evaluation,
            Self::Semester => TargetScope::Semester,
        }
    }

    /// Kinds whose rows attach people to an evaluation.
    pub fn is_membership(self) -> bool {
        matches!(self, Self::Participant | Self::Contributor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetScope {
    Global,
    Evaluation,
    Semester,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportTarget {
    Global,
    Evaluation(String),
    Semester(String),
}

impl ImportTarget {
    /// Builds the target for `kind`, requiring an id exactly when the kind is scoped.
    pub fn for_kind(kind: ImportKind, id: Option<&str>) -> ImportResult<Self> {
        let id = id.map(str::trim).filter(|s| !s.is_empty());
        match (kind.scope(), id) {
            (TargetScope::Global, _) => Ok(Self::Global),
            (TargetScope::Evaluation, Some(id)) => Ok(Self::Evaluation(id.to_string())),
            (TargetScope::Semester, Some(id)) => Ok(Self::Semester(id.to_string())),
            (TargetScope::Evaluation, None) => Err(ImportError::BadParams(
                "missing evaluationId".to_string(),
            )),
            (TargetScope::Semester, None) => {
                Err(ImportError::BadParams("missing semesterId".to_string()))
            }
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            Self::Global => None,
            Self::Evaluation(id) | Self::Semester(id) => Some(id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportPolicy {
    /// Add and update; never delete what the upload does not mention.
    Merge,
    /// Delete what the upload does not mention, then add and update.
    Replace,
}

impl ImportPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Replace => "replace",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportAction {
    Import,
    Copy,
}

/// The operation a staff member confirmed, e.g. `import-replace-participants`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmOperation {
    pub action: ImportAction,
    pub policy: ImportPolicy,
    pub kind: Option<ImportKind>,
}

impl ConfirmOperation {
    pub fn parse(raw: &str) -> ImportResult<Self> {
        let op = raw.trim().to_ascii_lowercase();
        if op == "bulk_update" {
            return Ok(Self {
                action: ImportAction::Import,
                policy: ImportPolicy::Replace,
                kind: Some(ImportKind::UserBulkUpdate),
            });
        }
        if op == "test" || op.starts_with("test-") {
            return Err(ImportError::BadParams(
                "test runs are submitted through imports.test".to_string(),
            ));
        }
        let (action, rest) = if let Some(rest) = op.strip_prefix("import") {
            (ImportAction::Import, rest)
        } else if let Some(rest) = op.strip_prefix("copy") {
            (ImportAction::Copy, rest)
        } else {
            return Err(ImportError::BadParams(format!("unknown operation: {raw}")));
        };
        let (policy, rest) = match rest.strip_prefix("-replace") {
            Some(r) => (ImportPolicy::Replace, r),
            None => (ImportPolicy::Merge, rest),
        };
        let kind = match rest {
            "" => None,
            "-participants" => Some(ImportKind::Participant),
            "-contributors" => Some(ImportKind::Contributor),
            _ => return Err(ImportError::BadParams(format!("unknown operation: {raw}"))),
        };
        if action == ImportAction::Copy && kind.is_none() {
            return Err(ImportError::BadParams(
                "copy operations must name participants or contributors".to_string(),
            ));
        }
        Ok(Self {
            action,
            policy,
            kind,
        })
    }

    pub fn check_kind(&self, kind: ImportKind) -> ImportResult<()> {
        match self.kind {
            Some(k) if k != kind => Err(ImportError::PolicyViolation(format!(
                "operation targets {} but the session imports {}",
                k.as_str(),
                kind.as_str()
            ))),
            _ => Ok(()),
        }
    }
}
