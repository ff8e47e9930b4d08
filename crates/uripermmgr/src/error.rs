// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Error types for the URI permission manager.

use std::fmt::Display;

use thiserror::Error;

/// The downstream service a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    BundleManager,
    AccessToken,
    PolicyEngine,
    StorageManager,
}

impl Display for ServiceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServiceKind::BundleManager => "bundle manager",
            ServiceKind::AccessToken => "access token service",
            ServiceKind::PolicyEngine => "sandbox policy engine",
            ServiceKind::StorageManager => "storage manager",
        };
        f.write_str(name)
    }
}

/// Failure reported by a remote collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// The remote object is gone or could not be reached.
    #[error("remote service unavailable")]
    Unavailable,

    /// The call did not complete in time.
    #[error("remote call timed out")]
    Timeout,

    /// The remote answered with an error.
    #[error("remote call rejected: {0}")]
    Rejected(String),
}

/// Errors returned by permission manager operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UriPermissionError {
    /// Caller lacks the privilege or access the operation requires.
    #[error("permission denied")]
    PermissionDenied,

    /// Caller neither issued the grant nor owns the resource.
    #[error("caller does not own the grant")]
    NotOwner,

    /// Requested flag carries neither read nor write access.
    #[error("flag must request read or write access")]
    InvalidFlag,

    /// URI could not be parsed or its kind is not supported.
    #[error("unsupported uri type")]
    InvalidUriType,

    /// The target bundle could not be resolved to a token.
    #[error("target application not found")]
    TargetNotFound,

    #[error("{service} is unavailable")]
    ServiceUnavailable { service: ServiceKind },

    #[error("{service} failed: {reason}")]
    Downstream { service: ServiceKind, reason: String },
}

impl UriPermissionError {
    pub(crate) fn remote(service: ServiceKind, err: RemoteError) -> Self {
        match err {
            RemoteError::Unavailable => UriPermissionError::ServiceUnavailable { service },
            other => UriPermissionError::Downstream {
                service,
                reason: other.to_string(),
            },
        }
    }
}

pub type Result<T, E = UriPermissionError> = std::result::Result<T, E>;

/// Numeric result codes returned across the IPC boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    Ok = 0,
    PermissionDenied = 1,
    NotOwner = 2,
    InvalidFlag = 3,
    InvalidUriType = 4,
    TargetNotFound = 5,
    ServiceUnavailable = 6,
    Downstream = 7,
}

impl ErrorCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl From<&UriPermissionError> for ErrorCode {
    fn from(err: &UriPermissionError) -> Self {
        match err {
            UriPermissionError::PermissionDenied => ErrorCode::PermissionDenied,
            UriPermissionError::NotOwner => ErrorCode::NotOwner,
            UriPermissionError::InvalidFlag => ErrorCode::InvalidFlag,
            UriPermissionError::InvalidUriType => ErrorCode::InvalidUriType,
            UriPermissionError::TargetNotFound => ErrorCode::TargetNotFound,
            UriPermissionError::ServiceUnavailable { .. } => ErrorCode::ServiceUnavailable,
            UriPermissionError::Downstream { .. } => ErrorCode::Downstream,
        }
    }
}

impl<T> From<&Result<T>> for ErrorCode {
    fn from(result: &Result<T>) -> Self {
        match result {
            Ok(_) => ErrorCode::Ok,
            Err(err) => err.into(),
        }
    }
}
