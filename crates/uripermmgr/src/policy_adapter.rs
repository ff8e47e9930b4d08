// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Sandbox policy engine delegation.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};
use uri_policy::{PolicyInfo, PolicyMode, TokenId};

use crate::error::{RemoteError, Result, ServiceKind, UriPermissionError};
use crate::remote::RemoteProxy;

/// Sandbox policy engine contract.
///
/// Batch calls answer one result per input element.
pub trait PolicyEngine: Send + Sync {
    fn check_policy(&self, token: TokenId, policies: &[PolicyInfo])
        -> Result<Vec<bool>, RemoteError>;

    fn set_policy(&self, target: TokenId, policies: &[PolicyInfo])
        -> Result<Vec<bool>, RemoteError>;

    fn persist_policy(
        &self,
        target: TokenId,
        policies: &[PolicyInfo],
    ) -> Result<Vec<bool>, RemoteError>;

    fn unset_policy(&self, target: TokenId, policy: &PolicyInfo) -> Result<(), RemoteError>;
}

/// What one caller set for one (target, path).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeldPolicy {
    pub mode: PolicyMode,
    /// Modes the engine was also asked to persist.
    pub persisted: PolicyMode,
}

impl HeldPolicy {
    const NONE: HeldPolicy = HeldPolicy {
        mode: PolicyMode::empty(),
        persisted: PolicyMode::empty(),
    };

    fn merge(self, other: HeldPolicy) -> HeldPolicy {
        HeldPolicy {
            mode: self.mode | other.mode,
            persisted: self.persisted | other.persisted,
        }
    }
}

/// Policies set through the engine, keyed by (caller, target).
///
/// The engine stays authoritative. Records answer which caller still needs a
/// path and which modes were already persisted.
#[derive(Debug, Default)]
pub struct PolicyRecordCache {
    records: HashMap<(TokenId, TokenId), HashMap<String, HeldPolicy>>,
}

impl PolicyRecordCache {
    pub fn is_persisted(&self, caller: TokenId, target: TokenId, policy: &PolicyInfo) -> bool {
        self.records
            .get(&(caller, target))
            .and_then(|paths| paths.get(&policy.path))
            .is_some_and(|held| held.persisted.covers(policy.mode))
    }

    pub fn record(&mut self, caller: TokenId, target: TokenId, policy: &PolicyInfo, persisted: bool) {
        let held = self
            .records
            .entry((caller, target))
            .or_default()
            .entry(policy.path.clone())
            .or_insert(HeldPolicy::NONE);
        held.mode |= policy.mode;
        if persisted {
            held.persisted |= policy.mode;
        }
    }

    /// Callers that set `path` for `target`, with the mode each set.
    pub fn records_for(&self, path: &str, target: TokenId) -> Vec<(TokenId, PolicyMode)> {
        let mut found: Vec<_> = self
            .records
            .iter()
            .filter(|((_, t), _)| *t == target)
            .filter_map(|((caller, _), paths)| paths.get(path).map(|held| (*caller, held.mode)))
            .collect();
        found.sort_by_key(|(caller, _)| *caller);
        found
    }

    /// Union of what every caller except `excluded` holds on `path` for
    /// `target`.
    fn held_by_others(&self, path: &str, target: TokenId, excluded: &[TokenId]) -> HeldPolicy {
        self.records
            .iter()
            .filter(|((caller, t), _)| *t == target && !excluded.contains(caller))
            .filter_map(|(_, paths)| paths.get(path))
            .fold(HeldPolicy::NONE, |acc, held| acc.merge(*held))
    }

    fn remove_path(&mut self, caller: TokenId, target: TokenId, path: &str) -> Option<HeldPolicy> {
        let paths = self.records.get_mut(&(caller, target))?;
        let held = paths.remove(path);
        if paths.is_empty() {
            self.records.remove(&(caller, target));
        }
        held
    }

    /// Drops every record where `token` is caller or target and returns the
    /// (target, path, mode) triples that were held.
    fn remove_token(&mut self, token: TokenId) -> Vec<(TokenId, String, PolicyMode)> {
        let mut removed = Vec::new();
        self.records.retain(|(caller, target), paths| {
            if *caller != token && *target != token {
                return true;
            }
            removed.extend(paths.drain().map(|(path, held)| (*target, path, held.mode)));
            false
        });
        removed
    }

    /// Every record grouped by target, for rechecking against the engine.
    fn by_target(&self) -> BTreeMap<TokenId, Vec<(TokenId, PolicyInfo)>> {
        let mut grouped: BTreeMap<TokenId, Vec<(TokenId, PolicyInfo)>> = BTreeMap::new();
        for ((caller, target), paths) in &self.records {
            grouped.entry(*target).or_default().extend(
                paths
                    .iter()
                    .map(|(path, held)| (*caller, PolicyInfo::new(path.clone(), held.mode))),
            );
        }
        grouped
    }

    pub fn len(&self) -> usize {
        self.records.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Engine work left after records were dropped for one (target, path).
struct Release {
    target: TokenId,
    path: String,
    removed: PolicyMode,
    remaining: HeldPolicy,
}

impl Release {
    /// Nothing to do when what is left still covers what was removed.
    fn is_needed(&self) -> bool {
        !self.removed.is_empty() && !self.remaining.mode.covers(self.removed)
    }
}

/// Translates grants into policy engine batches and remembers what it set.
pub struct PolicyEngineAdapter {
    engine: RemoteProxy<dyn PolicyEngine>,
    records: Mutex<PolicyRecordCache>,
    /// Engine connection the records were last checked against.
    seen_generation: AtomicU64,
}

impl PolicyEngineAdapter {
    pub fn new(engine: RemoteProxy<dyn PolicyEngine>) -> Self {
        Self {
            engine,
            records: Mutex::new(PolicyRecordCache::default()),
            seen_generation: AtomicU64::new(0),
        }
    }

    /// One engine round trip. An unreachable engine answers "no" for every
    /// policy.
    pub fn check(&self, token: TokenId, policies: &[PolicyInfo]) -> Vec<bool> {
        if policies.is_empty() {
            return Vec::new();
        }
        match self.engine.call(|engine| engine.check_policy(token, policies)) {
            Ok(mut results) => {
                results.resize(policies.len(), false);
                results
            }
            Err(e) => {
                warn!(%token, error = %e, "Policy check failed, treating as denied");
                vec![false; policies.len()]
            }
        }
    }

    /// Sets every policy, persisting the ones not yet persisted when asked.
    /// Nothing is recorded unless every element succeeds.
    #[instrument(skip(self, policies), fields(count = policies.len()))]
    pub fn grant(
        &self,
        caller: TokenId,
        target: TokenId,
        policies: &[PolicyInfo],
        persist: bool,
    ) -> Result<()> {
        if policies.is_empty() {
            return Ok(());
        }
        self.revalidate();

        let set = self
            .engine
            .call(|engine| engine.set_policy(target, policies))
            .map_err(|e| UriPermissionError::remote(ServiceKind::PolicyEngine, e))?;
        ensure_all(&set, policies.len(), "set")?;

        if persist {
            let pending: Vec<PolicyInfo> = {
                let records = self.records.lock();
                policies
                    .iter()
                    .filter(|p| !records.is_persisted(caller, target, p))
                    .cloned()
                    .collect()
            };
            if pending.is_empty() {
                debug!("All policies already persisted");
            } else {
                let persisted = self
                    .engine
                    .call(|engine| engine.persist_policy(target, &pending))
                    .map_err(|e| UriPermissionError::remote(ServiceKind::PolicyEngine, e))?;
                ensure_all(&persisted, pending.len(), "persist")?;
            }
        }

        let mut records = self.records.lock();
        for policy in policies {
            records.record(caller, target, policy, persist);
        }
        info!(%caller, %target, persist, "Policies set");
        Ok(())
    }

    /// Removes the records of `path` for `target`, limited to `caller` when
    /// given. The engine policy is unset unless the callers left still hold
    /// every removed mode, and is narrowed to their modes otherwise. An unset
    /// failure leaves the records untouched.
    pub fn revoke_path(&self, caller: Option<TokenId>, target: TokenId, path: &str) -> Result<usize> {
        self.revalidate();
        let (revoking, release) = {
            let records = self.records.lock();
            let (revoking, removed) = records
                .records_for(path, target)
                .into_iter()
                .filter(|(c, _)| caller.map_or(true, |wanted| wanted == *c))
                .fold((Vec::new(), PolicyMode::empty()), |(mut callers, acc), (c, mode)| {
                    callers.push(c);
                    (callers, acc | mode)
                });
            let release = Release {
                target,
                path: path.to_string(),
                removed,
                remaining: records.held_by_others(path, target, &revoking),
            };
            (revoking, release)
        };
        if revoking.is_empty() {
            return Ok(0);
        }

        if release.is_needed() {
            self.release(&release)
                .map_err(|e| UriPermissionError::remote(ServiceKind::PolicyEngine, e))?;
        }

        let mut records = self.records.lock();
        for c in &revoking {
            records.remove_path(*c, target, path);
        }
        debug!(%target, path, count = revoking.len(), "Policy records revoked");
        Ok(revoking.len())
    }

    /// Drops every record involving `token`. Engine policies another caller
    /// still needs are kept or narrowed. Engine failures are logged and the
    /// records are dropped regardless.
    pub fn revoke_all(&self, token: TokenId) -> usize {
        self.revalidate();
        let (count, releases) = {
            let mut records = self.records.lock();
            let removed = records.remove_token(token);
            let mut by_path: BTreeMap<(TokenId, String), PolicyMode> = BTreeMap::new();
            for (target, path, mode) in &removed {
                *by_path
                    .entry((*target, path.clone()))
                    .or_insert(PolicyMode::empty()) |= *mode;
            }
            let releases: Vec<Release> = by_path
                .into_iter()
                .map(|((target, path), mode)| Release {
                    remaining: records.held_by_others(&path, target, &[]),
                    target,
                    path,
                    removed: mode,
                })
                .filter(Release::is_needed)
                .collect();
            (removed.len(), releases)
        };

        for release in &releases {
            if let Err(e) = self.release(release) {
                warn!(%token, target = %release.target, path = %release.path, error = %e, "Failed to unset policy");
            }
        }
        count
    }

    /// Unsets the path, then sets back whatever other callers still hold.
    fn release(&self, release: &Release) -> Result<(), RemoteError> {
        let Release {
            target,
            path,
            removed,
            remaining,
        } = release;
        let unset = PolicyInfo::new(path.clone(), *removed | remaining.mode);
        self.engine.call(|engine| engine.unset_policy(*target, &unset))?;
        if remaining.mode.is_empty() {
            return Ok(());
        }

        let kept = [PolicyInfo::new(path.clone(), remaining.mode)];
        let restored = self
            .engine
            .call(|engine| engine.set_policy(*target, &kept))
            .and_then(|set| {
                if !remaining.persisted.is_empty() {
                    let persisted = [PolicyInfo::new(path.clone(), remaining.persisted)];
                    self.engine
                        .call(|engine| engine.persist_policy(*target, &persisted))?;
                }
                Ok(set)
            });
        match restored {
            Ok(set) if set.first() == Some(&true) => {
                debug!(%target, path = %path, mode = ?remaining.mode, "Policy narrowed");
            }
            Ok(_) => warn!(%target, path = %path, "Engine refused to restore policy"),
            Err(e) => warn!(%target, path = %path, error = %e, "Failed to restore policy"),
        }
        Ok(())
    }

    /// Rechecks every record once per new engine connection. A restarted
    /// engine may have lost policies; records it no longer holds are dropped.
    fn revalidate(&self) {
        if self.engine.get().is_err() {
            return;
        }
        let current = self.engine.generation();
        let previous = self.seen_generation.swap(current, Ordering::SeqCst);
        if previous == 0 || previous == current {
            return;
        }

        let grouped = self.records.lock().by_target();
        let mut dropped = 0;
        for (target, held) in grouped {
            let policies: Vec<PolicyInfo> = held.iter().map(|(_, p)| p.clone()).collect();
            let answers = match self.engine.call(|engine| engine.check_policy(target, &policies)) {
                Ok(answers) => answers,
                Err(e) => {
                    warn!(%target, error = %e, "Failed to recheck policy records");
                    continue;
                }
            };
            let mut records = self.records.lock();
            for (i, (caller, policy)) in held.iter().enumerate() {
                if answers.get(i) != Some(&true) {
                    records.remove_path(*caller, target, &policy.path);
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            info!(dropped, generation = current, "Dropped policy records lost by the engine");
        }
    }

    pub fn records_for(&self, path: &str, target: TokenId) -> Vec<(TokenId, PolicyMode)> {
        self.revalidate();
        self.records.lock().records_for(path, target)
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().len()
    }
}

fn ensure_all(results: &[bool], expected: usize, stage: &str) -> Result<()> {
    let failed = expected - results.iter().take(expected).filter(|ok| **ok).count();
    if failed > 0 {
        return Err(UriPermissionError::Downstream {
            service: ServiceKind::PolicyEngine,
            reason: format!("{stage} rejected {failed} of {expected} policies"),
        });
    }
    Ok(())
}
