// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Revocation paths: explicit revokes and lifecycle cleanup.

use std::collections::BTreeMap;

use tracing::{debug, info, instrument, warn};
use uri_policy::{AbilityId, ParsedUri, TokenId};

use crate::error::{Result, UriPermissionError};
use crate::grant_table::RemovedGrants;
use crate::token::CallContext;

impl crate::UriPermissionManager {
    /// Releases the grants `token` issued from one ability instance, or from
    /// every ability when `ability_id` is `None`. Only the foundation process
    /// drives this.
    #[instrument(skip(self, ctx), fields(caller = %ctx.caller))]
    pub fn revoke_uri_permission(
        &self,
        ctx: CallContext,
        token: TokenId,
        ability_id: Option<AbilityId>,
    ) -> Result<()> {
        if !self.resolver.is_foundation(ctx.caller) {
            warn!("Caller is not the foundation process");
            return Err(UriPermissionError::PermissionDenied);
        }
        self.release_ability(token, ability_id);
        Ok(())
    }

    /// Deletes every grant and policy where `token` is grantor or grantee.
    #[instrument(skip(self, ctx), fields(caller = %ctx.caller))]
    pub fn revoke_all_uri_permissions(&self, ctx: CallContext, token: TokenId) -> Result<()> {
        if !self.resolver.is_system_caller(ctx.caller) {
            warn!("Caller is not a system caller");
            return Err(UriPermissionError::PermissionDenied);
        }
        self.revoke_all_for(token);
        Ok(())
    }

    /// Revokes grants of `uri` held by the given bundle. The resource owner
    /// may revoke any grant; anyone else only the grants they issued.
    #[instrument(skip(self, ctx), fields(caller = %ctx.caller))]
    pub fn revoke_uri_permission_manually(
        &self,
        ctx: CallContext,
        uri: &str,
        bundle_name: &str,
        app_index: i32,
    ) -> Result<()> {
        let parsed = ParsedUri::parse(uri).map_err(|e| {
            debug!(error = %e, "Rejecting revoke");
            UriPermissionError::InvalidUriType
        })?;
        let target = self.resolver.token_of(bundle_name, app_index)?;
        let caller = ctx.caller;

        let policy_path = parsed.policy_path();
        let records = policy_path
            .as_deref()
            .map(|path| self.policy.records_for(path, target))
            .unwrap_or_default();
        let (has_grants, caller_grants) = {
            let table = self.grants.lock();
            let held: Vec<_> = table
                .grants_for(parsed.as_str())
                .iter()
                .filter(|g| g.target_token == target)
                .map(|g| g.from_token)
                .collect();
            (!held.is_empty(), held.contains(&caller))
        };
        if !has_grants && records.is_empty() {
            debug!(%target, "Nothing to revoke");
            return Ok(());
        }

        let is_owner = parsed
            .bundle_name()
            .is_some_and(|owner| self.resolver.bundle_of(caller).as_deref() == Some(owner));
        let caller_records = records.iter().any(|(c, _)| *c == caller);
        if !is_owner && !caller_grants && !caller_records {
            return Err(UriPermissionError::NotOwner);
        }

        if let Some(path) = policy_path.as_deref() {
            if is_owner || caller_records {
                let scope = if is_owner { None } else { Some(caller) };
                self.policy.revoke_path(scope, target, path)?;
            }
        }
        let removed = self
            .grants
            .lock()
            .remove_grant(parsed.as_str(), target, |g| is_owner || g.from_token == caller);
        info!(%target, is_owner, grants = removed.len(), "Uri permission revoked");
        self.delete_share_files(removed);
        Ok(())
    }

    /// Package of `token` was removed. Returns the number of grants and
    /// policies dropped.
    pub fn on_package_removed(&self, token: TokenId) -> usize {
        self.revoke_all_for(token)
    }

    /// Process of `token` died. Drops auto-remove grants it issued or held.
    pub fn on_process_died(&self, token: TokenId) -> usize {
        let removed = self.grants.lock().remove_auto_removable_for(token);
        let count = removed.len();
        if count > 0 {
            info!(%token, count, "Released grants of dead process");
        }
        self.delete_share_files(removed);
        count
    }

    pub fn on_ability_destroyed(&self, token: TokenId, ability_id: Option<AbilityId>) -> usize {
        self.release_ability(token, ability_id)
    }

    fn release_ability(&self, token: TokenId, ability_id: Option<AbilityId>) -> usize {
        let removed = {
            let mut table = self.grants.lock();
            match ability_id {
                Some(id) => table.remove_by_ability_id(token, id),
                None => table.remove_auto_removable(token),
            }
        };
        let count = removed.len();
        debug!(%token, ?ability_id, count, "Released ability grants");
        self.delete_share_files(removed);
        count
    }

    fn revoke_all_for(&self, token: TokenId) -> usize {
        let removed = self.grants.lock().remove_involving(token);
        let grants = removed.len();
        let policies = self.policy.revoke_all(token);
        self.delete_share_files(removed);
        info!(%token, grants, policies, "Revoked all uri permissions");
        grants + policies
    }

    /// One storage call per grantee. Failures are logged, never returned.
    fn delete_share_files(&self, removed: RemovedGrants) {
        let mut by_target: BTreeMap<TokenId, Vec<String>> = BTreeMap::new();
        for (uri, grant) in removed {
            let uris = by_target.entry(grant.target_token).or_default();
            if !uris.contains(&uri) {
                uris.push(uri);
            }
        }
        for (target, uris) in by_target {
            if let Err(e) = self
                .storage
                .call(|storage| storage.delete_share_file(target, &uris))
            {
                warn!(%target, count = uris.len(), error = %e, "Failed to delete share files");
            }
        }
    }
}
