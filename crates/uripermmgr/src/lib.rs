// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Temporary URI permission grants between applications.
//!
//! A grantor hands a grantee access to a URI it can itself reach. Sandbox
//! documents are delegated to the policy engine; provider-backed and sandbox
//! file grants live in an in-memory [`GrantTable`] until revoked or until
//! the grantor's abilities, process or package go away.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};
use uri_policy::{AbilityId, ParsedUri, TokenId, UriFlags, UriKind};

mod config;
mod error;
mod grant_table;
mod policy_adapter;
mod remote;
mod revoke;
mod storage;
mod token;
mod verify;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::{
    ManagerConfig, DEFAULT_FOUNDATION_PROCESS, PERMISSION_FILE_ACCESS_MANAGER,
    PERMISSION_GRANT_URI_PRIVILEGED, PERMISSION_WRITE_IMAGEVIDEO,
};
pub use error::{ErrorCode, RemoteError, Result, ServiceKind, UriPermissionError};
pub use grant_table::{GrantInfo, GrantTable, RemovedGrants};
pub use policy_adapter::{PolicyEngine, PolicyEngineAdapter, PolicyRecordCache};
pub use remote::{Connection, Connector, RemoteProxy};
pub use storage::StorageManager;
pub use token::{
    AccessTokenKit, BundleManager, CallContext, TokenInfo, TokenKind, TokenResolver,
};

/// Handles to the services the manager depends on.
pub struct Collaborators {
    pub bundle_manager: Connector<dyn BundleManager>,
    pub access_token: Arc<dyn AccessTokenKit>,
    pub policy_engine: Connector<dyn PolicyEngine>,
    pub storage_manager: Connector<dyn StorageManager>,
}

/// The URI permission manager.
pub struct UriPermissionManager {
    config: ManagerConfig,
    resolver: TokenResolver,
    policy: PolicyEngineAdapter,
    storage: RemoteProxy<dyn StorageManager>,
    grants: Mutex<GrantTable>,
}

impl UriPermissionManager {
    pub fn new(config: ManagerConfig, collaborators: Collaborators) -> Self {
        let resolver = TokenResolver::new(
            RemoteProxy::new(ServiceKind::BundleManager, collaborators.bundle_manager),
            collaborators.access_token,
            config.foundation_process_name.clone(),
        );
        let policy = PolicyEngineAdapter::new(RemoteProxy::new(
            ServiceKind::PolicyEngine,
            collaborators.policy_engine,
        ));
        let storage = RemoteProxy::new(ServiceKind::StorageManager, collaborators.storage_manager);

        Self {
            config,
            resolver,
            policy,
            storage,
            grants: Mutex::new(GrantTable::new()),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Grants `target_bundle` access to `uri` on behalf of `initiator_token`
    /// (or the caller when the initiator is [`TokenId::INVALID`]).
    ///
    /// A grant made with an `ability_id` is released together with that
    /// ability instance; one without is kept until explicitly revoked.
    #[allow(clippy::too_many_arguments)]
    pub fn grant_uri_permission(
        &self,
        ctx: CallContext,
        uri: &str,
        flag: UriFlags,
        target_bundle: &str,
        app_index: i32,
        initiator_token: TokenId,
        ability_id: Option<AbilityId>,
    ) -> Result<()> {
        self.grant_uri_permissions(
            ctx,
            &[uri],
            flag,
            target_bundle,
            app_index,
            initiator_token,
            ability_id,
        )
    }

    /// Batch form of [`UriPermissionManager::grant_uri_permission`]. URIs the
    /// grantor cannot reach, or that do not parse, are skipped.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(self, ctx, uris), fields(caller = %ctx.caller, count = uris.len()))]
    pub fn grant_uri_permissions<S: AsRef<str>>(
        &self,
        ctx: CallContext,
        uris: &[S],
        flag: UriFlags,
        target_bundle: &str,
        app_index: i32,
        initiator_token: TokenId,
        ability_id: Option<AbilityId>,
    ) -> Result<()> {
        if !self.resolver.is_system_caller(ctx.caller) {
            warn!("Caller is not a system caller");
            return Err(UriPermissionError::PermissionDenied);
        }
        if self.resolver.is_sandbox_app(ctx.caller)? {
            warn!("Sandboxed callers may not grant uri permissions");
            return Err(UriPermissionError::PermissionDenied);
        }
        if !flag.is_valid_request() {
            return Err(UriPermissionError::InvalidFlag);
        }
        let target = self.resolver.token_of(target_bundle, app_index)?;
        let grantor = if initiator_token.is_valid() {
            initiator_token
        } else {
            ctx.caller
        };

        let parsed: Vec<ParsedUri> = uris
            .iter()
            .filter_map(|uri| {
                ParsedUri::parse(uri.as_ref())
                    .inspect_err(|e| debug!(uri = uri.as_ref(), error = %e, "Skipping unsupported uri"))
                    .ok()
            })
            .collect();
        if parsed.is_empty() {
            return Err(UriPermissionError::InvalidUriType);
        }

        let authorized = self.authorize(&parsed, flag, grantor);
        let mut docs = Vec::new();
        let mut provider = Vec::new();
        let mut sandbox = Vec::new();
        let mut owned_by_target = 0;
        for (uri, allowed) in parsed.into_iter().zip(authorized) {
            if !allowed {
                info!(%uri, %grantor, "Grantor has no access to uri, skipping");
                continue;
            }
            if uri.bundle_name() == Some(target_bundle) {
                debug!(%uri, "Target owns the uri");
                owned_by_target += 1;
                continue;
            }
            match uri.kind() {
                UriKind::Docs => docs.push(uri),
                _ if uri.is_provider_backed() => provider.push(uri),
                _ => sandbox.push(uri),
            }
        }
        if owned_by_target == 0 && docs.is_empty() && provider.is_empty() && sandbox.is_empty() {
            return Err(UriPermissionError::PermissionDenied);
        }

        if !provider.is_empty() {
            self.create_share_files(target, &provider, flag)?;
        }
        if !docs.is_empty() {
            let persist = self.should_persist(flag, target_bundle);
            let policies: Vec<_> = docs.iter().filter_map(|u| u.to_policy_info(flag)).collect();
            if let Err(e) = self.policy.grant(grantor, target, &policies, persist) {
                self.rollback_share_files(target, &provider);
                return Err(e);
            }
        }
        self.insert_grants(
            provider.iter().chain(&sandbox),
            flag,
            grantor,
            target,
            ability_id,
        );

        info!(
            %grantor,
            %target,
            policies = docs.len(),
            grants = provider.len() + sandbox.len(),
            "Uri permissions granted"
        );
        Ok(())
    }

    /// Grants without checking the caller's own access. Docs and sandbox
    /// files go to the policy engine in a single batch. Any unsupported URI
    /// fails the call before anything is granted.
    #[instrument(skip(self, ctx, uris), fields(caller = %ctx.caller, count = uris.len()))]
    pub fn grant_uri_permission_privileged<S: AsRef<str>>(
        &self,
        ctx: CallContext,
        uris: &[S],
        flag: UriFlags,
        target_bundle: &str,
        app_index: i32,
    ) -> Result<()> {
        if !self
            .resolver
            .verify_permission(ctx.caller, &self.config.privileged_permission)
        {
            warn!("Caller lacks the privileged grant permission");
            return Err(UriPermissionError::PermissionDenied);
        }
        if !flag.is_valid_request() {
            return Err(UriPermissionError::InvalidFlag);
        }
        let parsed = uris
            .iter()
            .map(|uri| ParsedUri::parse(uri.as_ref()))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                debug!(error = %e, "Rejecting privileged grant");
                UriPermissionError::InvalidUriType
            })?;
        if parsed.is_empty() {
            return Err(UriPermissionError::InvalidUriType);
        }
        let target = self.resolver.token_of(target_bundle, app_index)?;

        let (provider, policy_backed): (Vec<_>, Vec<_>) =
            parsed.into_iter().partition(ParsedUri::is_provider_backed);

        if !provider.is_empty() {
            self.create_share_files(target, &provider, flag)?;
        }
        if !policy_backed.is_empty() {
            let persist = self.should_persist(flag, target_bundle);
            let policies: Vec<_> = policy_backed
                .iter()
                .filter_map(|u| u.to_policy_info(flag))
                .collect();
            if let Err(e) = self.policy.grant(ctx.caller, target, &policies, persist) {
                self.rollback_share_files(target, &provider);
                return Err(e);
            }
        }
        self.insert_grants(provider.iter(), flag, ctx.caller, target, None);

        info!(
            %target,
            policies = policy_backed.len(),
            grants = provider.len(),
            "Privileged uri permissions granted"
        );
        Ok(())
    }

    /// Number of grants held in the grant table.
    pub fn grant_count(&self) -> usize {
        self.grants.lock().len()
    }

    /// Number of policies recorded as set through the policy engine.
    pub fn policy_record_count(&self) -> usize {
        self.policy.record_count()
    }

    pub fn grants_for(&self, uri: &str) -> Vec<GrantInfo> {
        self.grants.lock().grants_for(uri).to_vec()
    }

    fn should_persist(&self, flag: UriFlags, target_bundle: &str) -> bool {
        flag.contains(UriFlags::PERSISTABLE) || self.config.persists_for(target_bundle)
    }

    fn create_share_files(&self, target: TokenId, uris: &[ParsedUri], flag: UriFlags) -> Result<()> {
        let uris: Vec<String> = uris.iter().map(|u| u.as_str().to_string()).collect();
        self.storage
            .call(|storage| storage.create_share_file(target, &uris, flag))
            .map_err(|e| UriPermissionError::remote(ServiceKind::StorageManager, e))
    }

    /// Deletes share files created for a grant that then failed. Files
    /// backing a grant `target` already holds are kept.
    fn rollback_share_files(&self, target: TokenId, uris: &[ParsedUri]) {
        let fresh: Vec<String> = {
            let table = self.grants.lock();
            uris.iter()
                .filter(|u| {
                    !table
                        .grants_for(u.as_str())
                        .iter()
                        .any(|g| g.target_token == target)
                })
                .map(|u| u.as_str().to_string())
                .collect()
        };
        if fresh.is_empty() {
            return;
        }
        if let Err(e) = self
            .storage
            .call(|storage| storage.delete_share_file(target, &fresh))
        {
            warn!(%target, count = fresh.len(), error = %e, "Failed to roll back share files");
        }
    }

    fn insert_grants<'a>(
        &self,
        uris: impl Iterator<Item = &'a ParsedUri>,
        flag: UriFlags,
        grantor: TokenId,
        target: TokenId,
        ability_id: Option<AbilityId>,
    ) {
        let stored = flag & (UriFlags::ACCESS | UriFlags::PREFIX);
        let mut table = self.grants.lock();
        for uri in uris {
            if table.insert(uri.as_str(), GrantInfo::new(stored, grantor, target, ability_id)) {
                debug!(%uri, %grantor, %target, "New grant");
            }
        }
    }
}
