use std::fmt;
use thiserror::Error;

/// Errors raised by the cluster-facing core.
///
/// Per-VM enrichment failures (`SourceUnavailable`, `ParseFailure`) are
/// downgraded to sentinels by the inventory resolver; everything else is
/// surfaced to the caller that triggered the operation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("cluster source unavailable ({source_name}): {reason}")]
    SourceUnavailable {
        source_name: String,
        reason: String,
    },

    #[error("unparsable output from {source_name}: {error}")]
    ParseFailure {
        source_name: String,
        error: ParseError,
    },

    #[error("invalid migration target '{target}' for {vm_name}: {reason}")]
    InvalidTarget {
        vm_name: String,
        target: String,
        reason: TargetRejection,
    },

    #[error("migration of {vm_name} did not settle after {attempts} polls")]
    TimedOut {
        vm_name: String,
        attempts: u32,
    },

    #[error("migration of {vm_name} was aborted")]
    Aborted {
        vm_name: String,
    },

    #[error("a migration is already in progress for {vm_name}")]
    MigrationInProgress {
        vm_name: String,
    },

    #[error("VM not found: {vm_name}")]
    VmNotFound {
        vm_name: String,
    },

    #[error("`{command}` exited with status {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl ClusterError {
    pub fn source_unavailable(source_name: impl Into<String>, reason: impl ToString) -> Self {
        ClusterError::SourceUnavailable {
            source_name: source_name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn parse_failure(source_name: impl Into<String>, error: ParseError) -> Self {
        ClusterError::ParseFailure {
            source_name: source_name.into(),
            error,
        }
    }

    /// Short machine-readable kind, used in API error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            ClusterError::SourceUnavailable { .. } => "source_unavailable",
            ClusterError::ParseFailure { .. } => "parse_failure",
            ClusterError::InvalidTarget { .. } => "invalid_target",
            ClusterError::TimedOut { .. } => "timed_out",
            ClusterError::Aborted { .. } => "aborted",
            ClusterError::MigrationInProgress { .. } => "migration_in_progress",
            ClusterError::VmNotFound { .. } => "vm_not_found",
            ClusterError::CommandFailed { .. } => "command_failed",
            ClusterError::InvalidArgument(_) => "invalid_argument",
        }
    }
}

/// Why a migration target was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetRejection {
    SameAsCurrent,
    NotOnline,
}

impl fmt::Display for TargetRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetRejection::SameAsCurrent => write!(f, "VM is already running there"),
            TargetRejection::NotOnline => write!(f, "node is not online"),
        }
    }
}

/// Failure of one of the text parsers in `core::parser`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected `{expected}` in output")]
    MissingField {
        expected: &'static str,
    },

    #[error("malformed line {line}: {content:?}")]
    MalformedLine {
        line: usize,
        content: String,
    },

    #[error("duplicate entry: {0}")]
    Duplicate(String),

    #[error("resource {0} not present in status output")]
    ResourceNotFound(String),
}

pub type ClusterResult<T> = Result<T, ClusterError>;
