//! Error types for the dicehall table engine
//!
//! Every rejection carries a machine-readable code plus a human-readable
//! message. The taxonomy separates errors the client caused (validation,
//! business rules) from errors the infrastructure caused (lock contention,
//! store failures, unreachable collaborators), because they are handled
//! differently: the former are final, the latter are retryable or logged.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Root error type for all table-engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed input: rejected synchronously, no state change
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Well-formed input rejected by a business rule, no state change
    #[error("business rule: {0}")]
    Business(#[from] BusinessError),

    /// Per-(user, round) exclusivity lock not acquired in time; retryable
    #[error("lock busy: {key}")]
    LockBusy { key: String },

    /// Durable store failure; the attempted operation was rolled back
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// External collaborator (identity provider, fast cache) unavailable;
    /// the specific request fails closed
    #[error("external dependency: {0}")]
    External(#[from] ExternalError),
}

/// Input-shape errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("frame exceeds {max} byte limit ({size} bytes)")]
    FrameTooLarge { size: usize, max: usize },

    #[error("malformed message: {0}")]
    BadMessage(String),

    #[error("unknown bet type: {0}")]
    UnknownBetType(String),

    #[error("duplicate bet type in request: {0}")]
    DuplicateBetType(String),

    #[error("bet list is empty")]
    EmptyBetList,

    #[error("stake must be positive")]
    NonPositiveStake,

    #[error("die value {0} out of range 1-6")]
    InvalidDie(u8),

    #[error("total_amount {declared} does not match summed stakes {actual}")]
    TotalMismatch { declared: u64, actual: u64 },
}

/// Business-rule rejections, each with a specific client-facing code
#[derive(Debug, Error)]
pub enum BusinessError {
    #[error("authentication required")]
    AuthRequired,

    #[error("authentication failed for user {0}")]
    AuthFailed(u64),

    #[error("message rate limit exceeded ({limit} per {window_secs}s)")]
    RateLimited { limit: u32, window_secs: u64 },

    #[error("table {0} not found")]
    TableNotFound(u64),

    #[error("table {0} is not open")]
    TableClosed(u64),

    #[error("table {0} already has an active round")]
    RoundInProgress(u64),

    #[error("no active round on table {0}")]
    RoundNotFound(u64),

    #[error("round {requested} does not match current round {current}")]
    RoundMismatch { requested: String, current: String },

    #[error("round is in phase {actual}, expected {expected}")]
    PhaseMismatch { expected: String, actual: String },

    #[error("betting window closed")]
    WindowClosed,

    #[error("cancellation is locked in the final {0}s of the window")]
    CancelCutoff(u64),

    #[error("stake {stake} outside limits {min}..={max} for {bet_type}")]
    StakeOutOfRange {
        bet_type: String,
        stake: u64,
        min: u64,
        max: u64,
    },

    #[error("round aggregate stake cap {cap} exceeded")]
    RoundCapExceeded { cap: u64 },

    #[error("daily aggregate stake cap {cap} exceeded")]
    DailyCapExceeded { cap: u64 },

    #[error("insufficient balance: need {needed}, available {available}")]
    InsufficientBalance { needed: u64, available: u64 },

    #[error("account {0} not found")]
    AccountNotFound(u64),

    #[error("account {0} is not active")]
    AccountInactive(u64),

    #[error("account {0} is blacklisted")]
    AccountBlacklisted(u64),

    #[error("round {0} already settled")]
    AlreadySettled(String),

    #[error("no bets to cancel")]
    NothingToCancel,

    #[error("not joined to a table")]
    NotAtTable,
}

/// Durable-store failures
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("transaction commit failed: {0}")]
    CommitFailed(String),

    #[error("read failed: {0}")]
    ReadFailed(String),

    #[error("write failed: {0}")]
    WriteFailed(String),
}

/// External collaborator failures
#[derive(Debug, Error)]
pub enum ExternalError {
    #[error("identity provider unavailable: {0}")]
    IdentityUnavailable(String),

    #[error("fast state cache unavailable: {0}")]
    CacheUnavailable(String),
}

impl EngineError {
    /// Machine-readable code sent to clients
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(e) => match e {
                ValidationError::FrameTooLarge { .. } => "FRAME_TOO_LARGE",
                ValidationError::BadMessage(_) => "BAD_MESSAGE",
                ValidationError::UnknownBetType(_) => "UNKNOWN_BET_TYPE",
                ValidationError::DuplicateBetType(_) => "DUPLICATE_BET_TYPE",
                ValidationError::EmptyBetList => "EMPTY_BET_LIST",
                ValidationError::NonPositiveStake => "NON_POSITIVE_STAKE",
                ValidationError::InvalidDie(_) => "INVALID_DICE",
                ValidationError::TotalMismatch { .. } => "TOTAL_MISMATCH",
            },
            EngineError::Business(e) => match e {
                BusinessError::AuthRequired => "AUTH_REQUIRED",
                BusinessError::AuthFailed(_) => "AUTH_FAILED",
                BusinessError::RateLimited { .. } => "RATE_LIMITED",
                BusinessError::TableNotFound(_) => "TABLE_NOT_FOUND",
                BusinessError::TableClosed(_) => "TABLE_CLOSED",
                BusinessError::RoundInProgress(_) => "ROUND_IN_PROGRESS",
                BusinessError::RoundNotFound(_) => "ROUND_NOT_FOUND",
                BusinessError::RoundMismatch { .. } => "ROUND_MISMATCH",
                BusinessError::PhaseMismatch { .. } => "PHASE_MISMATCH",
                BusinessError::WindowClosed => "WINDOW_CLOSED",
                BusinessError::CancelCutoff(_) => "CANCEL_CUTOFF",
                BusinessError::StakeOutOfRange { .. } => "STAKE_OUT_OF_RANGE",
                BusinessError::RoundCapExceeded { .. } => "ROUND_CAP_EXCEEDED",
                BusinessError::DailyCapExceeded { .. } => "DAILY_CAP_EXCEEDED",
                BusinessError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
                BusinessError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
                BusinessError::AccountInactive(_) => "ACCOUNT_INACTIVE",
                BusinessError::AccountBlacklisted(_) => "ACCOUNT_BLACKLISTED",
                BusinessError::AlreadySettled(_) => "ALREADY_SETTLED",
                BusinessError::NothingToCancel => "NOTHING_TO_CANCEL",
                BusinessError::NotAtTable => "NOT_AT_TABLE",
            },
            EngineError::LockBusy { .. } => "LOCK_BUSY",
            EngineError::Store(_) => "STORE_UNAVAILABLE",
            EngineError::External(_) => "SERVICE_UNAVAILABLE",
        }
    }

    /// Whether the caller should retry the same request
    pub fn retryable(&self) -> bool {
        matches!(self, EngineError::LockBusy { .. })
    }

    /// Client-facing body: code + message (+ retryable marker for LOCK_BUSY)
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            error_code: self.code().to_string(),
            message: self.to_string(),
            retryable: self.retryable(),
        }
    }
}

/// Structured error payload sent over the wire and in HTTP responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error_code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub retryable: bool,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = match &self {
            EngineError::Validation(_) => StatusCode::BAD_REQUEST,
            EngineError::Business(e) => match e {
                BusinessError::AuthRequired | BusinessError::AuthFailed(_) => {
                    StatusCode::UNAUTHORIZED
                }
                BusinessError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
                BusinessError::TableNotFound(_)
                | BusinessError::RoundNotFound(_)
                | BusinessError::AccountNotFound(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::CONFLICT,
            },
            EngineError::LockBusy { .. } => StatusCode::CONFLICT,
            EngineError::Store(_) | EngineError::External(_) => StatusCode::SERVICE_UNAVAILABLE,
        };

        (status, Json(self.to_body())).into_response()
    }
}

/// Convenience alias used throughout the crate
pub type EngineResult<T> = Result<T, EngineError>;
