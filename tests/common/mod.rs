// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use uri_policy::{AbilityId, TokenId, UriFlags};
use uripermmgr::testing::TestHarness;
use uripermmgr::{CallContext, UriPermissionManager};

pub const URI: &str = "file://app.A/data/x.txt";

/// A foundation process plus three installed applications.
pub struct World {
    pub harness: TestHarness,
    pub foundation: TokenId,
    pub app_a: TokenId,
    pub app_b: TokenId,
    pub app_c: TokenId,
}

impl World {
    pub fn new() -> Self {
        let harness = TestHarness::new();
        let foundation = harness.add_foundation(1);
        let app_a = harness.install_app("app.A", 100);
        let app_b = harness.install_app("app.B", 101);
        let app_c = harness.install_app("app.C", 102);
        Self {
            harness,
            foundation,
            app_a,
            app_b,
            app_c,
        }
    }

    pub fn foundation_ctx(&self) -> CallContext {
        CallContext::new(self.foundation)
    }

    /// Grants `uri` to `target_bundle` through the foundation on behalf of
    /// `grantor`.
    pub fn grant(
        &self,
        manager: &UriPermissionManager,
        uri: &str,
        flag: UriFlags,
        target_bundle: &str,
        grantor: TokenId,
        ability_id: Option<i32>,
    ) -> uripermmgr::Result<()> {
        manager.grant_uri_permission(
            self.foundation_ctx(),
            uri,
            flag,
            target_bundle,
            0,
            grantor,
            ability_id.map(AbilityId::new),
        )
    }
}
