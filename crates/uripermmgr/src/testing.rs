// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! In-memory collaborators for exercising the permission manager without
//! the real bundle manager, policy engine or storage manager.
//!
//! ```rust,ignore
//! use uri_policy::UriFlags;
//! use uripermmgr::testing::TestHarness;
//! use uripermmgr::CallContext;
//!
//! let harness = TestHarness::new();
//! let foundation = harness.add_foundation(1);
//! let grantor = harness.install_app("app.A", 100);
//! let grantee = harness.install_app("app.B", 101);
//!
//! let manager = harness.manager();
//! manager
//!     .grant_uri_permission(
//!         CallContext::new(foundation),
//!         "file://app.A/data/x.txt",
//!         UriFlags::READ,
//!         "app.B",
//!         0,
//!         grantor,
//!         None,
//!     )
//!     .unwrap();
//! assert!(manager.verify_uri_permission("file://app.A/data/x.txt", UriFlags::READ, grantee));
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uri_policy::{PolicyInfo, PolicyMode, TokenId, UriFlags};

use crate::config::{ManagerConfig, DEFAULT_FOUNDATION_PROCESS};
use crate::error::{RemoteError, ServiceKind};
use crate::policy_adapter::{PolicyEngine, PolicyEngineAdapter};
use crate::remote::{Connection, Connector, RemoteProxy};
use crate::storage::StorageManager;
use crate::token::{AccessTokenKit, BundleManager, TokenInfo, TokenKind, TokenResolver};
use crate::{Collaborators, UriPermissionManager};

/// Hands out connections to one fake service and lets tests kill the remote
/// or refuse new connections.
pub struct FakeLink<T: ?Sized> {
    proxy: Arc<T>,
    liveness: Mutex<CancellationToken>,
    connects: AtomicUsize,
    refuse: AtomicBool,
}

impl<T: ?Sized + Send + Sync + 'static> FakeLink<T> {
    pub fn new(proxy: Arc<T>) -> Arc<Self> {
        Arc::new(Self {
            proxy,
            liveness: Mutex::new(CancellationToken::new()),
            connects: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
        })
    }

    pub fn connector(self: &Arc<Self>) -> Connector<T> {
        let link = Arc::clone(self);
        Arc::new(move || {
            if link.refuse.load(Ordering::SeqCst) {
                return Err(RemoteError::Unavailable);
            }
            link.connects.fetch_add(1, Ordering::SeqCst);
            let mut liveness = link.liveness.lock();
            if liveness.is_cancelled() {
                *liveness = CancellationToken::new();
            }
            Ok(Connection::new(Arc::clone(&link.proxy), liveness.clone()))
        })
    }

    /// Simulates death of the remote object.
    pub fn kill(&self) {
        self.liveness.lock().cancel();
    }

    pub fn refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct FakeBundleManager {
    bundles: Mutex<HashMap<(String, i32), TokenId>>,
    sandboxed: Mutex<HashSet<TokenId>>,
    fail_sandbox_query: AtomicBool,
}

impl FakeBundleManager {
    pub fn install(&self, bundle_name: &str, app_index: i32, token: TokenId) {
        self.bundles
            .lock()
            .insert((bundle_name.to_string(), app_index), token);
    }

    pub fn uninstall(&self, bundle_name: &str, app_index: i32) {
        self.bundles
            .lock()
            .remove(&(bundle_name.to_string(), app_index));
    }

    /// Marks `token` as a sandboxed application instance.
    pub fn sandbox(&self, token: TokenId) {
        self.sandboxed.lock().insert(token);
    }

    pub fn fail_sandbox_query(&self, fail: bool) {
        self.fail_sandbox_query.store(fail, Ordering::SeqCst);
    }
}

impl BundleManager for FakeBundleManager {
    fn token_of(&self, bundle_name: &str, app_index: i32) -> Result<Option<TokenId>, RemoteError> {
        Ok(self
            .bundles
            .lock()
            .get(&(bundle_name.to_string(), app_index))
            .copied())
    }

    fn bundle_of(&self, token: TokenId) -> Result<Option<String>, RemoteError> {
        Ok(self
            .bundles
            .lock()
            .iter()
            .find(|(_, t)| **t == token)
            .map(|((bundle, _), _)| bundle.clone()))
    }

    fn is_sandbox_app(&self, token: TokenId) -> Result<bool, RemoteError> {
        if self.fail_sandbox_query.load(Ordering::SeqCst) {
            return Err(RemoteError::Rejected("sandbox query refused".to_string()));
        }
        Ok(self.sandboxed.lock().contains(&token))
    }
}

#[derive(Default)]
pub struct FakeAccessTokenKit {
    tokens: Mutex<HashMap<TokenId, TokenInfo>>,
    permissions: Mutex<HashSet<(TokenId, String)>>,
}

impl FakeAccessTokenKit {
    pub fn add(&self, token: TokenId, info: TokenInfo) {
        self.tokens.lock().insert(token, info);
    }

    pub fn grant_permission(&self, token: TokenId, permission: &str) {
        self.permissions
            .lock()
            .insert((token, permission.to_string()));
    }
}

impl AccessTokenKit for FakeAccessTokenKit {
    fn token_info(&self, token: TokenId) -> Option<TokenInfo> {
        self.tokens.lock().get(&token).cloned()
    }

    fn verify_permission(&self, token: TokenId, permission: &str) -> bool {
        self.permissions
            .lock()
            .contains(&(token, permission.to_string()))
    }
}

/// Policy engine keeping policies per token in memory.
#[derive(Default)]
pub struct FakePolicyEngine {
    policies: Mutex<HashMap<TokenId, HashMap<String, PolicyMode>>>,
    persisted: Mutex<HashSet<(TokenId, String)>>,
    rejected: Mutex<HashSet<String>>,
    fail_unset: AtomicBool,
    set_calls: AtomicUsize,
    persist_calls: AtomicUsize,
    unset_calls: AtomicUsize,
}

impl FakePolicyEngine {
    /// Every later set of `path` answers failure for that element.
    pub fn reject_path(&self, path: &str) {
        self.rejected.lock().insert(path.to_string());
    }

    pub fn fail_unset(&self, fail: bool) {
        self.fail_unset.store(fail, Ordering::SeqCst);
    }

    pub fn is_persisted(&self, token: TokenId, path: &str) -> bool {
        self.persisted.lock().contains(&(token, path.to_string()))
    }

    pub fn policy_count(&self) -> usize {
        self.policies.lock().values().map(HashMap::len).sum()
    }

    pub fn set_calls(&self) -> usize {
        self.set_calls.load(Ordering::SeqCst)
    }

    pub fn persist_calls(&self) -> usize {
        self.persist_calls.load(Ordering::SeqCst)
    }

    pub fn unset_calls(&self) -> usize {
        self.unset_calls.load(Ordering::SeqCst)
    }
}

impl PolicyEngine for FakePolicyEngine {
    fn check_policy(&self, token: TokenId, policies: &[PolicyInfo]) -> Result<Vec<bool>, RemoteError> {
        let held = self.policies.lock();
        Ok(policies
            .iter()
            .map(|p| {
                held.get(&token)
                    .and_then(|paths| paths.get(&p.path))
                    .is_some_and(|mode| mode.covers(p.mode))
            })
            .collect())
    }

    fn set_policy(&self, target: TokenId, policies: &[PolicyInfo]) -> Result<Vec<bool>, RemoteError> {
        self.set_calls.fetch_add(1, Ordering::SeqCst);
        let rejected = self.rejected.lock();
        let mut held = self.policies.lock();
        Ok(policies
            .iter()
            .map(|p| {
                if rejected.contains(&p.path) {
                    return false;
                }
                *held
                    .entry(target)
                    .or_default()
                    .entry(p.path.clone())
                    .or_insert(PolicyMode::empty()) |= p.mode;
                true
            })
            .collect())
    }

    fn persist_policy(
        &self,
        target: TokenId,
        policies: &[PolicyInfo],
    ) -> Result<Vec<bool>, RemoteError> {
        self.persist_calls.fetch_add(1, Ordering::SeqCst);
        let mut persisted = self.persisted.lock();
        for p in policies {
            persisted.insert((target, p.path.clone()));
        }
        Ok(vec![true; policies.len()])
    }

    fn unset_policy(&self, target: TokenId, policy: &PolicyInfo) -> Result<(), RemoteError> {
        if self.fail_unset.load(Ordering::SeqCst) {
            return Err(RemoteError::Rejected("unset refused".to_string()));
        }
        self.unset_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(paths) = self.policies.lock().get_mut(&target) {
            paths.remove(&policy.path);
        }
        self.persisted.lock().remove(&(target, policy.path.clone()));
        Ok(())
    }
}

/// Storage manager recording every share file call.
#[derive(Default)]
pub struct FakeStorageManager {
    created: Mutex<Vec<(TokenId, Vec<String>, UriFlags)>>,
    deleted: Mutex<Vec<(TokenId, Vec<String>)>>,
    fail_create: AtomicBool,
    fail_delete: AtomicBool,
}

impl FakeStorageManager {
    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_delete(&self, fail: bool) {
        self.fail_delete.store(fail, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<(TokenId, Vec<String>, UriFlags)> {
        self.created.lock().clone()
    }

    pub fn deleted(&self) -> Vec<(TokenId, Vec<String>)> {
        self.deleted.lock().clone()
    }
}

impl StorageManager for FakeStorageManager {
    fn create_share_file(
        &self,
        target: TokenId,
        uris: &[String],
        flag: UriFlags,
    ) -> Result<(), RemoteError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RemoteError::Rejected("create share file refused".to_string()));
        }
        self.created.lock().push((target, uris.to_vec(), flag));
        Ok(())
    }

    fn delete_share_file(&self, target: TokenId, uris: &[String]) -> Result<(), RemoteError> {
        self.deleted.lock().push((target, uris.to_vec()));
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(RemoteError::Timeout);
        }
        Ok(())
    }
}

/// A full set of fake collaborators plus helpers to populate them.
pub struct TestHarness {
    pub bundles: Arc<FakeBundleManager>,
    pub tokens: Arc<FakeAccessTokenKit>,
    pub policy: Arc<FakePolicyEngine>,
    pub storage: Arc<FakeStorageManager>,
    pub bundle_link: Arc<FakeLink<dyn BundleManager>>,
    pub policy_link: Arc<FakeLink<dyn PolicyEngine>>,
    pub storage_link: Arc<FakeLink<dyn StorageManager>>,
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

impl TestHarness {
    pub fn new() -> Self {
        let bundles = Arc::new(FakeBundleManager::default());
        let tokens = Arc::new(FakeAccessTokenKit::default());
        let policy = Arc::new(FakePolicyEngine::default());
        let storage = Arc::new(FakeStorageManager::default());

        let bundle_link = FakeLink::<dyn BundleManager>::new(bundles.clone());
        let policy_link = FakeLink::<dyn PolicyEngine>::new(policy.clone());
        let storage_link = FakeLink::<dyn StorageManager>::new(storage.clone());

        Self {
            bundles,
            tokens,
            policy,
            storage,
            bundle_link,
            policy_link,
            storage_link,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            bundle_manager: self.bundle_link.connector(),
            access_token: self.tokens.clone(),
            policy_engine: self.policy_link.connector(),
            storage_manager: self.storage_link.connector(),
        }
    }

    pub fn manager(&self) -> UriPermissionManager {
        self.manager_with(ManagerConfig::default())
    }

    pub fn manager_with(&self, config: ManagerConfig) -> UriPermissionManager {
        UriPermissionManager::new(config, self.collaborators())
    }

    pub fn resolver(&self) -> TokenResolver {
        TokenResolver::new(
            RemoteProxy::new(ServiceKind::BundleManager, self.bundle_link.connector()),
            self.tokens.clone(),
            DEFAULT_FOUNDATION_PROCESS,
        )
    }

    pub fn policy_adapter(&self) -> PolicyEngineAdapter {
        PolicyEngineAdapter::new(RemoteProxy::new(
            ServiceKind::PolicyEngine,
            self.policy_link.connector(),
        ))
    }

    /// Installs a third-party application at app index 0.
    pub fn install_app(&self, bundle_name: &str, token: u32) -> TokenId {
        self.install(bundle_name, token, false)
    }

    pub fn install_system_app(&self, bundle_name: &str, token: u32) -> TokenId {
        self.install(bundle_name, token, true)
    }

    pub fn add_foundation(&self, token: u32) -> TokenId {
        self.add_native(token, DEFAULT_FOUNDATION_PROCESS)
    }

    pub fn add_native(&self, token: u32, process_name: &str) -> TokenId {
        let token = TokenId::new(token);
        self.tokens.add(
            token,
            TokenInfo {
                kind: TokenKind::Native,
                process_name: process_name.to_string(),
                bundle_name: None,
                is_system_app: false,
            },
        );
        token
    }

    fn install(&self, bundle_name: &str, token: u32, is_system_app: bool) -> TokenId {
        let token = TokenId::new(token);
        self.bundles.install(bundle_name, 0, token);
        self.tokens.add(
            token,
            TokenInfo {
                kind: TokenKind::Hap,
                process_name: bundle_name.to_string(),
                bundle_name: Some(bundle_name.to_string()),
                is_system_app,
            },
        );
        token
    }
}
