// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Error types for the CamBANG core.
//!
//! `ProviderError` is the stable category set providers report; `CoreError`
//! is the host-facing taxonomy, a superset that adds core-only denials.
//! Both expose `code_str()` so logs and host bindings see the same stable
//! `ERR_*` identifiers regardless of display formatting.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable error categories for provider calls and provider failure signals.
///
/// Categories are stable across versions; do not renumber or rename.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error, Serialize, Deserialize)]
pub enum ProviderError {
    #[error("operation not supported")]
    NotSupported,
    #[error("invalid argument")]
    InvalidArgument,
    #[error("resource busy")]
    Busy,
    #[error("bad state for operation")]
    BadState,
    #[error("platform constraint")]
    PlatformConstraint,
    #[error("transient failure")]
    TransientFailure,
    #[error("provider failed")]
    ProviderFailed,
    #[error("shutting down")]
    ShuttingDown,
}

impl ProviderError {
    /// Stable wire-style identifier for logs and host bindings.
    pub fn code_str(self) -> &'static str {
        match self {
            ProviderError::NotSupported => "ERR_NOT_SUPPORTED",
            ProviderError::InvalidArgument => "ERR_INVALID_ARGUMENT",
            ProviderError::Busy => "ERR_BUSY",
            ProviderError::BadState => "ERR_BAD_STATE",
            ProviderError::PlatformConstraint => "ERR_PLATFORM_CONSTRAINT",
            ProviderError::TransientFailure => "ERR_TRANSIENT_FAILURE",
            ProviderError::ProviderFailed => "ERR_PROVIDER_FAILED",
            ProviderError::ShuttingDown => "ERR_SHUTTING_DOWN",
        }
    }
}

/// Deterministic result for provider method calls.
pub type ProviderResult = std::result::Result<(), ProviderError>;

/// Host-facing error taxonomy.
///
/// Arbitration denials return these synchronously on the command reply;
/// asynchronous provider failures surface through snapshots instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("operation not supported: {0}")]
    NotSupported(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("resource busy: {0}")]
    Busy(String),

    #[error("bad state: {0}")]
    BadState(String),

    #[error("platform constraint: {0}")]
    PlatformConstraint(String),

    #[error("transient failure: {0}")]
    TransientFailure(String),

    #[error("provider failed: {0}")]
    ProviderFailed(String),

    #[error("core is shutting down")]
    ShuttingDown,

    /// The device is a member of an armed rig; the rig owns its pipeline.
    #[error("rig is authoritative for this device")]
    RigAuthoritative,

    #[error("profile incompatible: {0}")]
    ProfileIncompatible(String),

    /// Command or event queue is at capacity; the enqueue was not performed.
    #[error("queue full")]
    QueueFull,
}

impl CoreError {
    /// Stable wire-style identifier for logs and host bindings.
    pub fn code_str(&self) -> &'static str {
        match self {
            CoreError::NotSupported(_) => "ERR_NOT_SUPPORTED",
            CoreError::InvalidArgument(_) => "ERR_INVALID_ARGUMENT",
            CoreError::Busy(_) => "ERR_BUSY",
            CoreError::BadState(_) => "ERR_BAD_STATE",
            CoreError::PlatformConstraint(_) => "ERR_PLATFORM_CONSTRAINT",
            CoreError::TransientFailure(_) => "ERR_TRANSIENT_FAILURE",
            CoreError::ProviderFailed(_) => "ERR_PROVIDER_FAILED",
            CoreError::ShuttingDown => "ERR_SHUTTING_DOWN",
            CoreError::RigAuthoritative => "ERR_RIG_AUTHORITATIVE",
            CoreError::ProfileIncompatible(_) => "ERR_PROFILE_INCOMPATIBLE",
            CoreError::QueueFull => "ERR_QUEUE_FULL",
        }
    }
}

impl From<ProviderError> for CoreError {
    fn from(err: ProviderError) -> Self {
        let detail = err.code_str().to_string();
        match err {
            ProviderError::NotSupported => CoreError::NotSupported(detail),
            ProviderError::InvalidArgument => CoreError::InvalidArgument(detail),
            ProviderError::Busy => CoreError::Busy(detail),
            ProviderError::BadState => CoreError::BadState(detail),
            ProviderError::PlatformConstraint => CoreError::PlatformConstraint(detail),
            ProviderError::TransientFailure => CoreError::TransientFailure(detail),
            ProviderError::ProviderFailed => CoreError::ProviderFailed(detail),
            ProviderError::ShuttingDown => CoreError::ShuttingDown,
        }
    }
}

/// Result type that uses CoreError.
pub type Result<T> = std::result::Result<T, CoreError>;
