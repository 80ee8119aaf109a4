//! Review session lifecycle types.
//!
//! A review session is the lifecycle record for one pull request's automated
//! review. There is at most one logically-current session per
//! `(repository, pull request number)`; re-opening or synchronizing a PR
//! updates the existing row rather than creating a duplicate.
//!
//! Within one lifecycle, transitions are monotonic:
//!
//! ```text
//! pending ──(opened/synchronize)──> analyzing ──(findings saved)──> completed
//! analyzing ──(engine failed, recorded)──> error ──(queue retry)──> analyzing
//! any non-terminal ──(PR closed, merged)──> completed
//! any non-terminal ──(PR closed, not merged)──> cancelled
//! ```
//!
//! `completed` and `cancelled` are terminal.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Pending,
    Analyzing,
    Completed,
    Cancelled,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Analyzing => "analyzing",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "analyzing" => Some(Self::Analyzing),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// `analyzing -> analyzing` is a legal self-loop: the same job retried by
    /// the queue re-enters analysis.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        match self {
            Self::Pending => matches!(
                next,
                Self::Analyzing | Self::Completed | Self::Cancelled
            ),
            Self::Analyzing => matches!(
                next,
                Self::Analyzing | Self::Completed | Self::Cancelled | Self::Error
            ),
            Self::Error => matches!(
                next,
                Self::Analyzing | Self::Completed | Self::Cancelled
            ),
            Self::Completed | Self::Cancelled => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl FindingSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for FindingSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Review-comment lifecycle. Findings are immutable once created except for
/// this field; new findings start as `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingStatus {
    Pending,
    Accepted,
    Rejected,
    Applied,
}

impl FindingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Applied => "applied",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            "applied" => Some(Self::Applied),
            _ => None,
        }
    }
}

/// A finding as produced by the analysis engine, before persistence.
///
/// `kind` is engine-defined free text (the engine is a replaceable plugin);
/// severity is constrained because the aggregate counters depend on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftFinding {
    pub kind: String,
    pub severity: FindingSeverity,
    pub title: String,
    pub description: String,
    pub file_path: Option<String>,
    pub line_number: Option<u32>,
    pub suggestion: Option<String>,
    pub is_committable: bool,
}

/// Aggregate counters stored on a completed session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SessionTotals {
    pub total_issues: u32,
    pub critical_issues: u32,
    pub suggestions: u32,
}

impl SessionTotals {
    pub fn from_findings(findings: &[DraftFinding]) -> Self {
        Self {
            total_issues: findings.len() as u32,
            critical_issues: findings
                .iter()
                .filter(|f| f.severity == FindingSeverity::Critical)
                .count() as u32,
            suggestions: findings
                .iter()
                .filter(|f| f.suggestion.is_some())
                .count() as u32,
        }
    }
}
