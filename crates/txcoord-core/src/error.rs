// Error taxonomy for coordinator RPCs and persistence
//
// Every failure that crosses a component boundary is a `Status`: an
// `ErrorCode` from the closed set below plus a human readable reason.
// Classification (retriable vs authoritative) lives on the code so that no
// caller needs to match on strings or raw integers.

use serde::{Serialize, Deserialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    NoSuchKey,
    HostUnreachable,
    ExceededTimeLimit,
    InvalidOptions,
    NetworkTimeout,
    ShutdownInProgress,
    WriteConflict,
    ReadConcernMajorityNotEnabled,
    TransactionTooOld,
    NoSuchTransaction,
    TransactionCommitted,
    PreparedTransactionInProgress,
    TransactionCoordinatorSteppingDown,
    TransactionCoordinatorReachedAbortDecision,
    DuplicateKey,
    NotWritablePrimary,
    Interrupted,
    InvalidPrepareResponse,
    FailedToParse,
    CommandNotFound,
    InternalError,
}

impl ErrorCode {
    /// Numeric code used on the wire
    pub fn code(&self) -> i32 {
        match self {
            Self::InternalError => 1,
            Self::FailedToParse => 9,
            Self::CommandNotFound => 59,
            Self::NoSuchKey => 4,
            Self::HostUnreachable => 6,
            Self::ExceededTimeLimit => 50,
            Self::InvalidOptions => 72,
            Self::NetworkTimeout => 89,
            Self::ShutdownInProgress => 91,
            Self::WriteConflict => 112,
            Self::ReadConcernMajorityNotEnabled => 148,
            Self::TransactionTooOld => 225,
            Self::NoSuchTransaction => 251,
            Self::TransactionCommitted => 256,
            Self::PreparedTransactionInProgress => 267,
            Self::TransactionCoordinatorSteppingDown => 281,
            Self::TransactionCoordinatorReachedAbortDecision => 282,
            Self::DuplicateKey => 11000,
            Self::NotWritablePrimary => 10107,
            Self::Interrupted => 11601,
            Self::InvalidPrepareResponse => 50993,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::NoSuchKey => "NoSuchKey",
            Self::HostUnreachable => "HostUnreachable",
            Self::ExceededTimeLimit => "ExceededTimeLimit",
            Self::InvalidOptions => "InvalidOptions",
            Self::NetworkTimeout => "NetworkTimeout",
            Self::ShutdownInProgress => "ShutdownInProgress",
            Self::WriteConflict => "WriteConflict",
            Self::ReadConcernMajorityNotEnabled => "ReadConcernMajorityNotEnabled",
            Self::TransactionTooOld => "TransactionTooOld",
            Self::NoSuchTransaction => "NoSuchTransaction",
            Self::TransactionCommitted => "TransactionCommitted",
            Self::PreparedTransactionInProgress => "PreparedTransactionInProgress",
            Self::TransactionCoordinatorSteppingDown => "TransactionCoordinatorSteppingDown",
            Self::TransactionCoordinatorReachedAbortDecision => {
                "TransactionCoordinatorReachedAbortDecision"
            }
            Self::DuplicateKey => "DuplicateKey",
            Self::NotWritablePrimary => "NotWritablePrimary",
            Self::Interrupted => "Interrupted",
            Self::InvalidPrepareResponse => "InvalidPrepareResponse",
            Self::FailedToParse => "FailedToParse",
            Self::CommandNotFound => "CommandNotFound",
            Self::InternalError => "InternalError",
        }
    }

    /// Look up a code by its wire number. Unknown numbers map to `InternalError`.
    pub fn from_code(code: i32) -> Self {
        const ALL: [ErrorCode; 21] = [
            ErrorCode::NoSuchKey,
            ErrorCode::HostUnreachable,
            ErrorCode::ExceededTimeLimit,
            ErrorCode::InvalidOptions,
            ErrorCode::NetworkTimeout,
            ErrorCode::ShutdownInProgress,
            ErrorCode::WriteConflict,
            ErrorCode::ReadConcernMajorityNotEnabled,
            ErrorCode::TransactionTooOld,
            ErrorCode::NoSuchTransaction,
            ErrorCode::TransactionCommitted,
            ErrorCode::PreparedTransactionInProgress,
            ErrorCode::TransactionCoordinatorSteppingDown,
            ErrorCode::TransactionCoordinatorReachedAbortDecision,
            ErrorCode::DuplicateKey,
            ErrorCode::NotWritablePrimary,
            ErrorCode::Interrupted,
            ErrorCode::InvalidPrepareResponse,
            ErrorCode::FailedToParse,
            ErrorCode::CommandNotFound,
            ErrorCode::InternalError,
        ];
        ALL.iter()
            .copied()
            .find(|candidate| candidate.code() == code)
            .unwrap_or(ErrorCode::InternalError)
    }

    /// Transient failures: the same request may succeed if re-sent.
    ///
    /// `Interrupted` is retriable because a killOp on a single outstanding
    /// RPC must only cause that RPC to be re-issued.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::HostUnreachable
                | Self::NetworkTimeout
                | Self::ShutdownInProgress
                | Self::NotWritablePrimary
                | Self::Interrupted
        )
    }

    /// Errors a participant returns to mean "this transaction cannot commit here".
    ///
    /// `TransactionCommitted` is the opposite answer: the participant already
    /// committed under an earlier coordination.
    pub fn is_vote_abort(&self) -> bool {
        !self.is_retriable()
            && !matches!(
                self,
                Self::TransactionCoordinatorSteppingDown | Self::TransactionCommitted
            )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Error value crossing RPC and persistence boundaries
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {reason}")]
pub struct Status {
    pub code: ErrorCode,
    pub reason: String,
}

impl Status {
    pub fn new(code: ErrorCode, reason: impl Into<String>) -> Self {
        Status {
            code,
            reason: reason.into(),
        }
    }

    pub fn no_such_transaction(reason: impl Into<String>) -> Self {
        Status::new(ErrorCode::NoSuchTransaction, reason)
    }

    pub fn stepping_down() -> Self {
        Status::new(
            ErrorCode::TransactionCoordinatorSteppingDown,
            "Transaction coordinator is stepping down",
        )
    }

    pub fn interrupted(reason: impl Into<String>) -> Self {
        Status::new(ErrorCode::Interrupted, reason)
    }

    pub fn is_retriable(&self) -> bool {
        self.code.is_retriable()
    }
}
