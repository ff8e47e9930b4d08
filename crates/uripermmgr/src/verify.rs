// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use tracing::instrument;
use uri_policy::{ParsedUri, PolicyInfo, TokenId, UriFlags, UriKind};

use crate::token::CallContext;

/// Access a token has through permissions alone.
struct PermissionAccess {
    file_access: bool,
    media: bool,
    foundation: bool,
}

impl PermissionAccess {
    fn covers(&self, uri: &ParsedUri) -> bool {
        match uri.kind() {
            UriKind::Docs | UriKind::Bundle(_) => self.file_access,
            UriKind::Media => self.media,
            UriKind::Content => self.foundation,
        }
    }
}

impl crate::UriPermissionManager {
    /// Whether `token` may access `uri` with `flag`.
    pub fn verify_uri_permission(&self, uri: &str, flag: UriFlags, token: TokenId) -> bool {
        if !flag.is_valid_request() {
            return false;
        }
        let Ok(parsed) = ParsedUri::parse(uri) else {
            return false;
        };
        self.authorize(std::slice::from_ref(&parsed), flag, token)
            .first()
            .copied()
            .unwrap_or(false)
    }

    /// Batch form of [`verify_uri_permission`](Self::verify_uri_permission)
    /// for system callers. Always answers one result per input URI.
    #[instrument(skip(self, ctx, uris), fields(caller = %ctx.caller, count = uris.len()))]
    pub fn check_uri_authorization<S: AsRef<str>>(
        &self,
        ctx: CallContext,
        uris: &[S],
        flag: UriFlags,
        token: TokenId,
    ) -> Vec<bool> {
        let mut results = vec![false; uris.len()];
        if !self.resolver.is_system_caller(ctx.caller) || !flag.is_valid_request() {
            return results;
        }

        let (indices, parsed): (Vec<usize>, Vec<ParsedUri>) = uris
            .iter()
            .enumerate()
            .filter_map(|(i, uri)| ParsedUri::parse(uri.as_ref()).ok().map(|p| (i, p)))
            .unzip();
        for (i, allowed) in indices.into_iter().zip(self.authorize(&parsed, flag, token)) {
            results[i] = allowed;
        }
        results
    }

    /// Resolution order: resource owner, permission-based access, policy
    /// engine, then the grant table.
    pub(crate) fn authorize(&self, uris: &[ParsedUri], flag: UriFlags, token: TokenId) -> Vec<bool> {
        let mut results = vec![false; uris.len()];
        if uris.is_empty() {
            return results;
        }

        let own_bundle = if uris.iter().any(|u| u.bundle_name().is_some()) {
            self.resolver.bundle_of(token)
        } else {
            None
        };
        let permissions = PermissionAccess {
            file_access: self
                .resolver
                .verify_permission(token, &self.config.file_access_permission),
            media: self
                .resolver
                .verify_permission(token, &self.config.media_permission),
            foundation: self.resolver.is_foundation(token),
        };

        let mut pending: Vec<(usize, PolicyInfo)> = Vec::new();
        for (i, uri) in uris.iter().enumerate() {
            let owned = own_bundle.is_some() && uri.bundle_name() == own_bundle.as_deref();
            if owned || permissions.covers(uri) {
                results[i] = true;
            } else if let Some(policy) = uri.to_policy_info(flag) {
                pending.push((i, policy));
            }
        }

        if !pending.is_empty() {
            let (indices, policies): (Vec<usize>, Vec<PolicyInfo>) = pending.into_iter().unzip();
            for (i, allowed) in indices.into_iter().zip(self.policy.check(token, &policies)) {
                results[i] = allowed;
            }
        }

        let table = self.grants.lock();
        for (result, uri) in results.iter_mut().zip(uris) {
            if !*result {
                *result = table.lookup_prefix(uri.as_str(), token).satisfies(flag);
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;
    use uri_policy::AbilityId;

    use crate::testing::TestHarness;
    use crate::{CallContext, PERMISSION_FILE_ACCESS_MANAGER};

    use super::*;

    const URI: &str = "file://app.A/data/x.txt";

    #[test]
    fn test_owner_always_has_access() {
        let harness = TestHarness::new();
        let app_a = harness.install_app("app.A", 100);
        let manager = harness.manager();
        assert!(manager.verify_uri_permission(URI, UriFlags::WRITE, app_a));
    }

    #[test]
    fn test_read_grant_does_not_allow_write() {
        let harness = TestHarness::new();
        let foundation = harness.add_foundation(1);
        let app_a = harness.install_app("app.A", 100);
        let app_b = harness.install_app("app.B", 101);
        let app_c = harness.install_app("app.C", 102);
        let manager = harness.manager();

        manager
            .grant_uri_permission(
                CallContext::new(foundation),
                URI,
                UriFlags::READ,
                "app.B",
                0,
                app_a,
                None,
            )
            .unwrap();

        assert!(manager.verify_uri_permission(URI, UriFlags::READ, app_b));
        assert!(!manager.verify_uri_permission(URI, UriFlags::WRITE, app_b));
        assert!(!manager.verify_uri_permission(URI, UriFlags::READ, app_c));
    }

    #[test]
    fn test_write_grant_allows_read() {
        let harness = TestHarness::new();
        let foundation = harness.add_foundation(1);
        let app_a = harness.install_app("app.A", 100);
        let app_b = harness.install_app("app.B", 101);
        let manager = harness.manager();

        manager
            .grant_uri_permission(
                CallContext::new(foundation),
                URI,
                UriFlags::WRITE,
                "app.B",
                0,
                app_a,
                Some(AbilityId::new(1)),
            )
            .unwrap();
        assert!(manager.verify_uri_permission(URI, UriFlags::READ, app_b));
    }

    #[test]
    fn test_invalid_input_verifies_false() {
        let harness = TestHarness::new();
        let app_a = harness.install_app("app.A", 100);
        let manager = harness.manager();
        assert!(!manager.verify_uri_permission(URI, UriFlags::PERSISTABLE, app_a));
        assert!(!manager.verify_uri_permission("not a uri", UriFlags::READ, app_a));
    }

    #[test]
    fn test_file_access_permission_covers_docs_and_sandbox() {
        let harness = TestHarness::new();
        let app = harness.install_app("app.Files", 100);
        harness
            .tokens
            .grant_permission(app, PERMISSION_FILE_ACCESS_MANAGER);
        let manager = harness.manager();

        assert!(manager.verify_uri_permission("file://docs/a.txt", UriFlags::WRITE, app));
        assert!(manager.verify_uri_permission(URI, UriFlags::READ, app));
        assert!(!manager.verify_uri_permission("file://media/Photo/1", UriFlags::READ, app));
    }

    #[test]
    fn test_content_uris_only_for_foundation() {
        let harness = TestHarness::new();
        let foundation = harness.add_foundation(1);
        let daemon = harness.add_native(2, "media_daemon");
        let manager = harness.manager();

        let uri = "content://com.example.provider/items/1";
        assert!(manager.verify_uri_permission(uri, UriFlags::READ, foundation));
        assert!(!manager.verify_uri_permission(uri, UriFlags::READ, daemon));
    }

    #[test]
    fn test_policy_engine_answers_for_docs() {
        let harness = TestHarness::new();
        let app = harness.install_app("app.B", 101);
        let manager = harness.manager();
        harness
            .policy_adapter()
            .grant(
                TokenId::new(9),
                app,
                &[PolicyInfo::new("/docs/a.txt", uri_policy::PolicyMode::READ)],
                false,
            )
            .unwrap();

        assert!(manager.verify_uri_permission("file://docs/docs/a.txt", UriFlags::READ, app));
        assert!(!manager.verify_uri_permission("file://docs/docs/a.txt", UriFlags::WRITE, app));
    }

    #[test]
    fn test_prefix_grant_covers_descendants() {
        let harness = TestHarness::new();
        let foundation = harness.add_foundation(1);
        let app_a = harness.install_app("app.A", 100);
        let app_b = harness.install_app("app.B", 101);
        let manager = harness.manager();

        manager
            .grant_uri_permission(
                CallContext::new(foundation),
                "file://app.A/dir",
                UriFlags::READ | UriFlags::PREFIX,
                "app.B",
                0,
                app_a,
                None,
            )
            .unwrap();

        assert!(manager.verify_uri_permission("file://app.A/dir/a.txt", UriFlags::READ, app_b));
        assert!(!manager.verify_uri_permission("file://app.A/dirx/a.txt", UriFlags::READ, app_b));
    }

    #[test]
    fn test_check_matches_verify_elementwise() {
        let harness = TestHarness::new();
        let foundation = harness.add_foundation(1);
        let app_a = harness.install_app("app.A", 100);
        let app_b = harness.install_app("app.B", 101);
        let manager = harness.manager();
        manager
            .grant_uri_permission(
                CallContext::new(foundation),
                URI,
                UriFlags::READ,
                "app.B",
                0,
                app_a,
                None,
            )
            .unwrap();

        let uris = [
            URI,
            "file://app.B/own.txt",
            "file://app.C/other.txt",
            "garbage",
            "file://docs/x",
        ];
        for flag in [UriFlags::READ, UriFlags::WRITE] {
            let batch = manager.check_uri_authorization(CallContext::new(foundation), &uris, flag, app_b);
            assert_eq!(batch.len(), uris.len());
            for (uri, result) in uris.iter().zip(&batch) {
                assert_eq!(*result, manager.verify_uri_permission(uri, flag, app_b), "{uri}");
            }
        }
    }

    #[test]
    fn test_check_denies_non_system_caller_and_bad_flag() {
        let harness = TestHarness::new();
        let foundation = harness.add_foundation(1);
        let app_a = harness.install_app("app.A", 100);
        let manager = harness.manager();

        let uris = [URI, URI];
        assert_eq!(
            manager.check_uri_authorization(CallContext::new(app_a), &uris, UriFlags::READ, app_a),
            vec![false, false]
        );
        assert_eq!(
            manager.check_uri_authorization(
                CallContext::new(foundation),
                &uris,
                UriFlags::PREFIX,
                app_a
            ),
            vec![false, false]
        );
        assert_eq!(
            manager.check_uri_authorization(CallContext::new(foundation), &uris, UriFlags::READ, app_a),
            vec![true, true]
        );
    }
}
