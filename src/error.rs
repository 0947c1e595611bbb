//! Wire-level error taxonomy (§7 of the broker specification).
//!
//! Every handler failure renders to the exact lowercase token the wire
//! protocol expects in `{"ok":false,"error":"<token>"}`. Start-time and
//! CLI failures use `anyhow` instead — see `main.rs` and `endpoint.rs`.

use thiserror::Error;

/// A handler-level failure that serialises to a wire error token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BrokerError {
    /// Request body could not be parsed as JSON.
    #[error("invalid_json")]
    InvalidJson,
    /// `action` did not match any recognised handler.
    #[error("unknown_action")]
    UnknownAction,
    /// Request or response exceeded a configured size cap.
    #[error("too_large")]
    TooLarge,
    /// `lease` was missing `key` or `workerId`.
    #[error("key_and_worker_required")]
    KeyAndWorkerRequired,
    /// `release` was missing `workerId`.
    #[error("worker_required")]
    WorkerRequired,
    /// `set` requires a positive TTL and none was given.
    #[error("ttl_required")]
    TtlRequired,
    /// TTL was present but zero or negative.
    #[error("invalid_ttl")]
    InvalidTtl,
    /// The store is at `max_items` capacity and the key is new.
    #[error("max_items")]
    MaxItems,
    /// `worker_id` already holds a lease in a different pool.
    #[error("worker_already_has_lease")]
    WorkerAlreadyHasLease,
    /// Key was never set (or was already removed).
    #[error("not_found")]
    NotFound,
    /// Key existed but its TTL had elapsed.
    #[error("expired")]
    Expired,
    /// HMAC verification failed or was required but missing.
    #[error("auth_failed")]
    AuthFailed,
    /// The broker is draining and refuses new connections.
    #[error("draining")]
    Draining,
}

impl BrokerError {
    /// The lowercase wire token for this error.
    #[must_use]
    pub const fn token(self) -> &'static str {
        match self {
            Self::InvalidJson => "invalid_json",
            Self::UnknownAction => "unknown_action",
            Self::TooLarge => "too_large",
            Self::KeyAndWorkerRequired => "key_and_worker_required",
            Self::WorkerRequired => "worker_required",
            Self::TtlRequired => "ttl_required",
            Self::InvalidTtl => "invalid_ttl",
            Self::MaxItems => "max_items",
            Self::WorkerAlreadyHasLease => "worker_already_has_lease",
            Self::NotFound => "not_found",
            Self::Expired => "expired",
            Self::AuthFailed => "auth_failed",
            Self::Draining => "draining",
        }
    }
}

/// Result type returned by store/lease handlers.
pub type BrokerResult<T> = Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_match_spec_table() {
        assert_eq!(BrokerError::TtlRequired.token(), "ttl_required");
        assert_eq!(BrokerError::InvalidTtl.token(), "invalid_ttl");
        assert_eq!(BrokerError::WorkerAlreadyHasLease.token(), "worker_already_has_lease");
        assert_eq!(BrokerError::Draining.to_string(), "draining");
    }
}
