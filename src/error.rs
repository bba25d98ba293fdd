use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RunnerErrorCode {
    Unauthenticated,
    InvalidInput,
    InvalidScore,
    InsufficientFunds,
    LimitExceeded,
    TooFrequent,
    DuplicateTransaction,
    StorageFailure,
    RemoteUnavailable,
    TournamentFull,
    TournamentInactive,
    NotFound,
    Conflict,
    Internal,
}

impl RunnerErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerErrorCode::Unauthenticated => "runner/unauthenticated",
            RunnerErrorCode::InvalidInput => "runner/invalid-input",
            RunnerErrorCode::InvalidScore => "runner/invalid-score",
            RunnerErrorCode::InsufficientFunds => "runner/insufficient-funds",
            RunnerErrorCode::LimitExceeded => "runner/limit-exceeded",
            RunnerErrorCode::TooFrequent => "runner/too-frequent",
            RunnerErrorCode::DuplicateTransaction => "runner/duplicate-transaction",
            RunnerErrorCode::StorageFailure => "runner/storage-failure",
            RunnerErrorCode::RemoteUnavailable => "runner/remote-unavailable",
            RunnerErrorCode::TournamentFull => "runner/tournament-full",
            RunnerErrorCode::TournamentInactive => "runner/tournament-inactive",
            RunnerErrorCode::NotFound => "runner/not-found",
            RunnerErrorCode::Conflict => "runner/conflict",
            RunnerErrorCode::Internal => "runner/internal",
        }
    }

    /// Failures that are recovered locally (queue or cache fallback) rather than surfaced.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            RunnerErrorCode::RemoteUnavailable
                | RunnerErrorCode::StorageFailure
                | RunnerErrorCode::Conflict
        )
    }

    /// Soft declines meant to be shown to the player.
    pub fn is_soft_decline(&self) -> bool {
        matches!(
            self,
            RunnerErrorCode::TooFrequent | RunnerErrorCode::LimitExceeded
        )
    }

    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            RunnerErrorCode::InvalidInput | RunnerErrorCode::InvalidScore
        )
    }
}

#[derive(Clone, Debug)]
pub struct RunnerError {
    pub code: RunnerErrorCode,
    message: String,
}

impl RunnerError {
    pub fn new(code: RunnerErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is_retriable(&self) -> bool {
        self.code.is_retriable()
    }
}

impl Display for RunnerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for RunnerError {}

impl PartialEq for RunnerError {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code && self.message == other.message
    }
}

pub type RunnerResult<T> = Result<T, RunnerError>;

pub fn unauthenticated(message: impl Into<String>) -> RunnerError {
    RunnerError::new(RunnerErrorCode::Unauthenticated, message)
}

pub fn invalid_input(message: impl Into<String>) -> RunnerError {
    RunnerError::new(RunnerErrorCode::InvalidInput, message)
}

pub fn invalid_score(message: impl Into<String>) -> RunnerError {
    RunnerError::new(RunnerErrorCode::InvalidScore, message)
}

pub fn insufficient_funds(message: impl Into<String>) -> RunnerError {
    RunnerError::new(RunnerErrorCode::InsufficientFunds, message)
}

pub fn limit_exceeded(message: impl Into<String>) -> RunnerError {
    RunnerError::new(RunnerErrorCode::LimitExceeded, message)
}

pub fn too_frequent(message: impl Into<String>) -> RunnerError {
    RunnerError::new(RunnerErrorCode::TooFrequent, message)
}

pub fn duplicate_transaction(message: impl Into<String>) -> RunnerError {
    RunnerError::new(RunnerErrorCode::DuplicateTransaction, message)
}

pub fn storage_failure(message: impl Into<String>) -> RunnerError {
    RunnerError::new(RunnerErrorCode::StorageFailure, message)
}

pub fn remote_unavailable(message: impl Into<String>) -> RunnerError {
    RunnerError::new(RunnerErrorCode::RemoteUnavailable, message)
}

pub fn tournament_full(message: impl Into<String>) -> RunnerError {
    RunnerError::new(RunnerErrorCode::TournamentFull, message)
}

pub fn tournament_inactive(message: impl Into<String>) -> RunnerError {
    RunnerError::new(RunnerErrorCode::TournamentInactive, message)
}

pub fn not_found(message: impl Into<String>) -> RunnerError {
    RunnerError::new(RunnerErrorCode::NotFound, message)
}

pub fn conflict(message: impl Into<String>) -> RunnerError {
    RunnerError::new(RunnerErrorCode::Conflict, message)
}

pub fn internal_error(message: impl Into<String>) -> RunnerError {
    RunnerError::new(RunnerErrorCode::Internal, message)
}
