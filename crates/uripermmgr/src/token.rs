// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Caller identity resolution.

use std::sync::Arc;

use tracing::{debug, warn};
use uri_policy::TokenId;

use crate::error::{RemoteError, Result, ServiceKind, UriPermissionError};
use crate::remote::RemoteProxy;

/// Identity of the caller as resolved by the IPC layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallContext {
    pub caller: TokenId,
}

impl CallContext {
    pub fn new(caller: TokenId) -> Self {
        Self { caller }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    /// A system process
    Native,
    /// An installed application package
    Hap,
}

/// What the access token service knows about a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub kind: TokenKind,
    pub process_name: String,
    /// Set for application tokens
    pub bundle_name: Option<String>,
    pub is_system_app: bool,
}

/// Bundle manager contract.
pub trait BundleManager: Send + Sync {
    fn token_of(&self, bundle_name: &str, app_index: i32) -> Result<Option<TokenId>, RemoteError>;

    fn bundle_of(&self, token: TokenId) -> Result<Option<String>, RemoteError>;

    /// Whether `token` belongs to a sandboxed application instance, such as
    /// a DLP sandbox clone.
    fn is_sandbox_app(&self, token: TokenId) -> Result<bool, RemoteError>;
}

/// Access token service contract. This service is in-process, so it cannot
/// fail with a transport error.
pub trait AccessTokenKit: Send + Sync {
    fn token_info(&self, token: TokenId) -> Option<TokenInfo>;

    fn verify_permission(&self, token: TokenId, permission: &str) -> bool;
}

/// Resolves tokens to identities and answers caller-class questions.
pub struct TokenResolver {
    bundle_manager: RemoteProxy<dyn BundleManager>,
    access_token: Arc<dyn AccessTokenKit>,
    foundation_process_name: String,
}

impl TokenResolver {
    pub fn new(
        bundle_manager: RemoteProxy<dyn BundleManager>,
        access_token: Arc<dyn AccessTokenKit>,
        foundation_process_name: impl Into<String>,
    ) -> Self {
        Self {
            bundle_manager,
            access_token,
            foundation_process_name: foundation_process_name.into(),
        }
    }

    /// Resolves an installed bundle to its token.
    pub fn token_of(&self, bundle_name: &str, app_index: i32) -> Result<TokenId> {
        match self
            .bundle_manager
            .call(|bms| bms.token_of(bundle_name, app_index))
        {
            Ok(Some(token)) if token.is_valid() => Ok(token),
            Ok(_) => {
                debug!(bundle_name, app_index, "Bundle is not installed");
                Err(UriPermissionError::TargetNotFound)
            }
            Err(e) => {
                warn!(bundle_name, app_index, error = %e, "Failed to resolve bundle token");
                Err(UriPermissionError::TargetNotFound)
            }
        }
    }

    /// Bundle name of an application token. Native tokens have none.
    pub fn bundle_of(&self, token: TokenId) -> Option<String> {
        if let Some(info) = self.access_token.token_info(token) {
            match info.kind {
                TokenKind::Native => return None,
                TokenKind::Hap if info.bundle_name.is_some() => return info.bundle_name,
                TokenKind::Hap => {}
            }
        }
        self.bundle_manager
            .call(|bms| bms.bundle_of(token))
            .inspect_err(|e| warn!(%token, error = %e, "Failed to resolve bundle name"))
            .ok()
            .flatten()
    }

    /// Unlike the other lookups, a failed query is reported rather than
    /// read as "no".
    pub fn is_sandbox_app(&self, token: TokenId) -> Result<bool> {
        self.bundle_manager
            .call(|bms| bms.is_sandbox_app(token))
            .map_err(|e| UriPermissionError::remote(ServiceKind::BundleManager, e))
    }

    pub fn token_info(&self, token: TokenId) -> Option<TokenInfo> {
        self.access_token.token_info(token)
    }

    pub fn verify_permission(&self, token: TokenId, permission: &str) -> bool {
        self.access_token.verify_permission(token, permission)
    }

    /// Native processes and system applications.
    pub fn is_system_caller(&self, token: TokenId) -> bool {
        self.token_info(token)
            .is_some_and(|info| info.kind == TokenKind::Native || info.is_system_app)
    }

    pub fn is_foundation(&self, token: TokenId) -> bool {
        self.token_info(token).is_some_and(|info| {
            info.kind == TokenKind::Native && info.process_name == self.foundation_process_name
        })
    }
}
