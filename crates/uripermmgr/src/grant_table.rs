// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! In-memory record of temporary URI grants.

use std::collections::{BTreeSet, HashMap};

use uri_policy::{is_path_ancestor, AbilityId, TokenId, UriFlags};

/// One grantor-to-grantee relationship for one URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrantInfo {
    pub flag: UriFlags,
    pub from_token: TokenId,
    pub target_token: TokenId,
    /// Revoke once no owning ability instance remains
    pub auto_remove: bool,
    /// Grantor-side ability instances keeping the grant alive
    pub ability_ids: BTreeSet<AbilityId>,
}

impl GrantInfo {
    /// A grant tied to an ability instance is auto-removable; one without is
    /// kept until explicitly revoked.
    pub fn new(
        flag: UriFlags,
        from_token: TokenId,
        target_token: TokenId,
        ability_id: Option<AbilityId>,
    ) -> Self {
        Self {
            flag,
            from_token,
            target_token,
            auto_remove: ability_id.is_some(),
            ability_ids: ability_id.into_iter().collect(),
        }
    }

    fn is_garbage(&self) -> bool {
        self.auto_remove && self.ability_ids.is_empty()
    }

    fn same_pair(&self, other: &GrantInfo) -> bool {
        self.from_token == other.from_token && self.target_token == other.target_token
    }

    fn merge(&mut self, other: GrantInfo) {
        self.flag |= other.flag;
        self.ability_ids.extend(other.ability_ids);
        self.auto_remove = self.auto_remove && other.auto_remove;
    }
}

/// Grants removed from the table, with the URI each was stored under.
pub type RemovedGrants = Vec<(String, GrantInfo)>;

/// URI to grant list. No two grants in one list share a (grantor, grantee)
/// pair, and empty lists are never kept.
#[derive(Debug, Default)]
pub struct GrantTable {
    entries: HashMap<String, Vec<GrantInfo>>,
}

impl GrantTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a grant, merging into an existing grant for the same pair.
    /// Returns true if a new entry was created.
    pub fn insert(&mut self, uri: &str, grant: GrantInfo) -> bool {
        let grants = self.entries.entry(uri.to_string()).or_default();
        if let Some(existing) = grants.iter_mut().find(|g| g.same_pair(&grant)) {
            existing.merge(grant);
            false
        } else {
            grants.push(grant);
            true
        }
    }

    /// Flags granted to `target` for exactly `uri`.
    pub fn lookup(&self, uri: &str, target: TokenId) -> UriFlags {
        self.entries
            .get(uri)
            .map(|grants| union_for(grants, target))
            .unwrap_or_else(UriFlags::empty)
    }

    /// Like [`GrantTable::lookup`], plus flags of prefix grants on any
    /// ancestor directory of `uri`.
    pub fn lookup_prefix(&self, uri: &str, target: TokenId) -> UriFlags {
        let mut flags = self.lookup(uri, target);
        for (stored, grants) in &self.entries {
            if !is_path_ancestor(stored, uri) {
                continue;
            }
            for grant in grants {
                if grant.target_token == target && grant.flag.contains(UriFlags::PREFIX) {
                    flags |= grant.flag;
                }
            }
        }
        flags
    }

    /// Deletes every grant held by `target`.
    pub fn remove_by_token(&mut self, target: TokenId) -> RemovedGrants {
        self.remove_where(|g| g.target_token == target)
    }

    /// Deletes every grant issued by `from`.
    pub fn remove_by_grantor(&mut self, from: TokenId) -> RemovedGrants {
        self.remove_where(|g| g.from_token == from)
    }

    /// Deletes every grant where `token` is grantor or grantee.
    pub fn remove_involving(&mut self, token: TokenId) -> RemovedGrants {
        self.remove_where(|g| g.from_token == token || g.target_token == token)
    }

    /// Drops one ability instance's hold on every grant issued by `from`,
    /// deleting grants left with no holder.
    pub fn remove_by_ability_id(&mut self, from: TokenId, ability_id: AbilityId) -> RemovedGrants {
        let mut removed = Vec::new();
        self.entries.retain(|uri, grants| {
            grants.retain_mut(|grant| {
                if grant.from_token != from || !grant.ability_ids.remove(&ability_id) {
                    return true;
                }
                if grant.is_garbage() {
                    removed.push((uri.clone(), grant.clone()));
                    return false;
                }
                true
            });
            !grants.is_empty()
        });
        removed
    }

    /// Deletes every auto-remove grant issued by `from`, whatever abilities
    /// still hold it.
    pub fn remove_auto_removable(&mut self, from: TokenId) -> RemovedGrants {
        self.remove_where(|g| g.auto_remove && g.from_token == from)
    }

    /// Deletes auto-remove grants where `token` is grantor or grantee.
    pub fn remove_auto_removable_for(&mut self, token: TokenId) -> RemovedGrants {
        self.remove_where(|g| g.auto_remove && (g.from_token == token || g.target_token == token))
    }

    /// Deletes grants of `uri` for `target` that satisfy `predicate`.
    pub fn remove_grant(
        &mut self,
        uri: &str,
        target: TokenId,
        predicate: impl Fn(&GrantInfo) -> bool,
    ) -> RemovedGrants {
        let mut removed = Vec::new();
        if let Some(grants) = self.entries.get_mut(uri) {
            grants.retain(|grant| {
                if grant.target_token == target && predicate(grant) {
                    removed.push((uri.to_string(), grant.clone()));
                    false
                } else {
                    true
                }
            });
            if grants.is_empty() {
                self.entries.remove(uri);
            }
        }
        removed
    }

    pub fn grants_for(&self, uri: &str) -> &[GrantInfo] {
        self.entries.get(uri).map(Vec::as_slice).unwrap_or_default()
    }

    /// Number of grants across all URIs.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove_where(&mut self, predicate: impl Fn(&GrantInfo) -> bool) -> RemovedGrants {
        let mut removed = Vec::new();
        self.entries.retain(|uri, grants| {
            grants.retain(|grant| {
                if predicate(grant) {
                    removed.push((uri.clone(), grant.clone()));
                    false
                } else {
                    true
                }
            });
            !grants.is_empty()
        });
        removed
    }
}

fn union_for(grants: &[GrantInfo], target: TokenId) -> UriFlags {
    grants
        .iter()
        .filter(|g| g.target_token == target)
        .fold(UriFlags::empty(), |acc, g| acc | g.flag)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const URI: &str = "file://app.A/data/x.txt";

    fn tok(raw: u32) -> TokenId {
        TokenId::new(raw)
    }

    fn ability(raw: i32) -> Option<AbilityId> {
        Some(AbilityId::new(raw))
    }

    #[test]
    fn test_identical_grants_are_idempotent() {
        let mut table = GrantTable::new();
        let grant = GrantInfo::new(UriFlags::READ, tok(1), tok(2), None);
        assert!(table.insert(URI, grant.clone()));
        assert!(!table.insert(URI, grant.clone()));
        assert_eq!(table.len(), 1);
        assert_eq!(table.grants_for(URI), &[grant]);
    }

    #[test]
    fn test_merge_unions_ability_ids_and_flags() {
        let mut table = GrantTable::new();
        table.insert(URI, GrantInfo::new(UriFlags::READ, tok(1), tok(2), ability(10)));
        table.insert(URI, GrantInfo::new(UriFlags::WRITE, tok(1), tok(2), ability(11)));

        let grants = table.grants_for(URI);
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].flag, UriFlags::READ | UriFlags::WRITE);
        assert_eq!(
            grants[0].ability_ids,
            BTreeSet::from([AbilityId::new(10), AbilityId::new(11)])
        );
        assert!(grants[0].auto_remove);
    }

    #[test]
    fn test_merge_with_persistent_grant_clears_auto_remove() {
        let mut table = GrantTable::new();
        table.insert(URI, GrantInfo::new(UriFlags::READ, tok(1), tok(2), ability(10)));
        table.insert(URI, GrantInfo::new(UriFlags::READ, tok(1), tok(2), None));
        assert!(!table.grants_for(URI)[0].auto_remove);

        // Releasing the only ability must not delete a grant that is now persistent.
        let removed = table.remove_by_ability_id(tok(1), AbilityId::new(10));
        assert!(removed.is_empty());
        assert_eq!(table.lookup(URI, tok(2)), UriFlags::READ);
    }

    #[test]
    fn test_distinct_pairs_are_separate_entries() {
        let mut table = GrantTable::new();
        table.insert(URI, GrantInfo::new(UriFlags::READ, tok(1), tok(2), None));
        table.insert(URI, GrantInfo::new(UriFlags::READ, tok(3), tok(2), None));
        table.insert(URI, GrantInfo::new(UriFlags::WRITE, tok(1), tok(4), None));
        assert_eq!(table.len(), 3);
        assert_eq!(table.lookup(URI, tok(2)), UriFlags::READ);
        assert_eq!(table.lookup(URI, tok(4)), UriFlags::WRITE);
        assert_eq!(table.lookup(URI, tok(5)), UriFlags::empty());
    }

    #[test]
    fn test_remove_by_ability_id_keeps_other_holders() {
        let mut table = GrantTable::new();
        table.insert(URI, GrantInfo::new(UriFlags::READ, tok(1), tok(2), ability(10)));
        table.insert(URI, GrantInfo::new(UriFlags::READ, tok(1), tok(2), ability(11)));

        assert!(table.remove_by_ability_id(tok(1), AbilityId::new(10)).is_empty());
        assert_eq!(table.len(), 1);

        let removed = table.remove_by_ability_id(tok(1), AbilityId::new(11));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, URI);
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_by_ability_id_ignores_other_grantors() {
        let mut table = GrantTable::new();
        table.insert(URI, GrantInfo::new(UriFlags::READ, tok(1), tok(2), ability(10)));
        assert!(table.remove_by_ability_id(tok(9), AbilityId::new(10)).is_empty());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_remove_auto_removable() {
        let mut table = GrantTable::new();
        table.insert(URI, GrantInfo::new(UriFlags::READ, tok(1), tok(2), ability(10)));
        table.insert(URI, GrantInfo::new(UriFlags::READ, tok(1), tok(3), None));
        table.insert("file://app.A/b", GrantInfo::new(UriFlags::READ, tok(4), tok(1), ability(5)));

        let removed = table.remove_auto_removable(tok(1));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].1.target_token, tok(2));
        assert_eq!(table.len(), 2);

        let removed = table.remove_auto_removable_for(tok(1));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].0, "file://app.A/b");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_remove_by_token_and_grantor() {
        let mut table = GrantTable::new();
        table.insert(URI, GrantInfo::new(UriFlags::READ, tok(1), tok(2), None));
        table.insert(URI, GrantInfo::new(UriFlags::READ, tok(2), tok(3), None));
        table.insert("file://app.A/b", GrantInfo::new(UriFlags::READ, tok(3), tok(2), None));

        assert_eq!(table.remove_by_token(tok(2)).len(), 2);
        assert_eq!(table.len(), 1);
        assert_eq!(table.remove_by_grantor(tok(2)).len(), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_remove_involving() {
        let mut table = GrantTable::new();
        table.insert(URI, GrantInfo::new(UriFlags::READ, tok(1), tok(2), None));
        table.insert(URI, GrantInfo::new(UriFlags::READ, tok(3), tok(1), None));
        table.insert(URI, GrantInfo::new(UriFlags::READ, tok(3), tok(4), None));
        assert_eq!(table.remove_involving(tok(1)).len(), 2);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_remove_grant_with_predicate() {
        let mut table = GrantTable::new();
        table.insert(URI, GrantInfo::new(UriFlags::READ, tok(1), tok(2), None));
        table.insert(URI, GrantInfo::new(UriFlags::READ, tok(3), tok(2), None));

        let removed = table.remove_grant(URI, tok(2), |g| g.from_token == tok(3));
        assert_eq!(removed.len(), 1);
        assert_eq!(table.grants_for(URI)[0].from_token, tok(1));

        table.remove_grant(URI, tok(2), |_| true);
        assert!(table.is_empty());
        assert!(table.grants_for(URI).is_empty());
    }

    #[test]
    fn test_prefix_lookup() {
        let mut table = GrantTable::new();
        table.insert(
            "file://app.A/dir",
            GrantInfo::new(UriFlags::READ | UriFlags::PREFIX, tok(1), tok(2), None),
        );
        table.insert(
            "file://app.A/other",
            GrantInfo::new(UriFlags::WRITE, tok(1), tok(2), None),
        );

        assert!(table
            .lookup_prefix("file://app.A/dir/a.txt", tok(2))
            .satisfies(UriFlags::READ));
        assert!(table
            .lookup_prefix("file://app.A/dir/sub/b.txt", tok(2))
            .satisfies(UriFlags::READ));
        assert!(!table
            .lookup_prefix("file://app.A/directory/a.txt", tok(2))
            .satisfies(UriFlags::READ));
        assert!(!table
            .lookup_prefix("file://app.A/other/a.txt", tok(2))
            .satisfies(UriFlags::WRITE));
        assert!(!table
            .lookup_prefix("file://app.A/dir/a.txt", tok(3))
            .satisfies(UriFlags::READ));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Insert { uri: u8, from: u32, target: u32, write: bool, ability: Option<i32> },
        ReleaseAbility { from: u32, ability: i32 },
        RevokeAuto { from: u32 },
        RevokeAll { token: u32 },
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u8..3, 1u32..4, 1u32..4, any::<bool>(), proptest::option::of(0i32..3)).prop_map(
                |(uri, from, target, write, ability)| Op::Insert { uri, from, target, write, ability }
            ),
            (1u32..4, 0i32..3).prop_map(|(from, ability)| Op::ReleaseAbility { from, ability }),
            (1u32..4).prop_map(|from| Op::RevokeAuto { from }),
            (1u32..4).prop_map(|token| Op::RevokeAll { token }),
        ]
    }

    proptest! {
        #[test]
        fn table_invariants_hold(ops in proptest::collection::vec(op(), 0..40)) {
            let mut table = GrantTable::new();
            for op in ops {
                match op {
                    Op::Insert { uri, from, target, write, ability } => {
                        let flag = if write { UriFlags::WRITE } else { UriFlags::READ };
                        table.insert(
                            &format!("file://app.A/{uri}"),
                            GrantInfo::new(flag, tok(from), tok(target), ability.map(AbilityId::new)),
                        );
                    }
                    Op::ReleaseAbility { from, ability } => {
                        table.remove_by_ability_id(tok(from), AbilityId::new(ability));
                    }
                    Op::RevokeAuto { from } => {
                        table.remove_auto_removable(tok(from));
                    }
                    Op::RevokeAll { token } => {
                        table.remove_involving(tok(token));
                        prop_assert_eq!(table.lookup("file://app.A/0", tok(token)), UriFlags::empty());
                    }
                }

                for grants in table.entries.values() {
                    prop_assert!(!grants.is_empty());
                    for (i, a) in grants.iter().enumerate() {
                        prop_assert!(!a.is_garbage());
                        for b in &grants[i + 1..] {
                            prop_assert!(!a.same_pair(b));
                        }
                    }
                }
            }
        }
    }
}
