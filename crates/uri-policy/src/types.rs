// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Type definitions

use std::fmt::Display;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Opaque identity handle of an application or native process.
///
/// Token `0` never names a valid identity; it is used at the IPC boundary to
/// mean "no token supplied".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenId(u32);

impl TokenId {
    /// The boundary value meaning "no token".
    pub const INVALID: TokenId = TokenId(0);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl From<u32> for TokenId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl Display for TokenId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Grantor-side ability instance identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AbilityId(i32);

impl AbilityId {
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    /// Converts the boundary representation, where any negative value
    /// (conventionally `-1`) means "no ability".
    pub fn from_raw(raw: i32) -> Option<Self> {
        (raw >= 0).then_some(Self(raw))
    }

    pub const fn raw(self) -> i32 {
        self.0
    }
}

impl Display for AbilityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

bitflags! {
    /// Access flags carried by a grant request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct UriFlags: u32 {
        /// Read access.
        const READ = 0x1;
        /// Write access.
        const WRITE = 0x2;
        /// The grant should survive reboot.
        const PERSISTABLE = 0x40;
        /// The grant covers every URI below the granted one.
        const PREFIX = 0x80;
    }
}

impl UriFlags {
    /// Access bits only.
    pub const ACCESS: UriFlags = UriFlags::READ.union(UriFlags::WRITE);

    /// Builds flags from a raw request value, dropping unknown bits.
    pub fn from_request(raw: u32) -> Self {
        Self::from_bits_truncate(raw)
    }

    /// A request is only meaningful when it asks for read or write access.
    pub fn is_valid_request(self) -> bool {
        self.intersects(Self::ACCESS)
    }

    pub fn access(self) -> Self {
        self & Self::ACCESS
    }

    /// Returns true if a grant holding `self` satisfies a check for
    /// `requested`. Write access implies read access; nothing else widens.
    pub fn satisfies(self, requested: UriFlags) -> bool {
        let requested = requested.access();
        if requested.is_empty() {
            return false;
        }
        if requested.contains(Self::WRITE) && !self.contains(Self::WRITE) {
            return false;
        }
        if requested.contains(Self::READ) && !self.intersects(Self::ACCESS) {
            return false;
        }
        true
    }
}

bitflags! {
    /// Access mode understood by the sandbox policy engine.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct PolicyMode: u32 {
        const READ = 1;
        const WRITE = 2;
    }
}

impl PolicyMode {
    pub fn from_flags(flag: UriFlags) -> Self {
        let mut mode = PolicyMode::empty();
        if flag.contains(UriFlags::READ) {
            mode |= PolicyMode::READ;
        }
        if flag.contains(UriFlags::WRITE) {
            mode |= PolicyMode::WRITE;
        }
        mode
    }

    /// Returns true if a policy set with `self` already grants `other`.
    pub fn covers(self, other: PolicyMode) -> bool {
        UriFlags::from_bits_truncate(self.bits())
            .satisfies(UriFlags::from_bits_truncate(other.bits()))
    }
}

/// One entry of a sandbox policy batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyInfo {
    /// Sandbox file-system path the policy applies to
    pub path: String,
    pub mode: PolicyMode,
}

impl PolicyInfo {
    pub fn new(path: impl Into<String>, mode: PolicyMode) -> Self {
        Self {
            path: path.into(),
            mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_unknown_bits_are_dropped() {
        let flags = UriFlags::from_request(0x1 | 0x4 | 0x80 | 0x1000);
        assert_eq!(flags, UriFlags::READ | UriFlags::PREFIX);
    }

    #[test]
    fn test_request_needs_access_bits() {
        assert!(!UriFlags::from_request(0).is_valid_request());
        assert!(!UriFlags::PERSISTABLE.is_valid_request());
        assert!(!(UriFlags::PREFIX | UriFlags::PERSISTABLE).is_valid_request());
        assert!(UriFlags::READ.is_valid_request());
        assert!((UriFlags::WRITE | UriFlags::PERSISTABLE).is_valid_request());
    }

    #[test]
    fn test_write_satisfies_read() {
        assert!(UriFlags::WRITE.satisfies(UriFlags::READ));
        assert!(UriFlags::WRITE.satisfies(UriFlags::WRITE));
        assert!(!UriFlags::READ.satisfies(UriFlags::WRITE));
        assert!(!UriFlags::READ.satisfies(UriFlags::READ | UriFlags::WRITE));
        assert!((UriFlags::READ | UriFlags::WRITE).satisfies(UriFlags::READ | UriFlags::WRITE));
    }

    #[test]
    fn test_nothing_satisfies_an_empty_request() {
        assert!(!UriFlags::all().satisfies(UriFlags::empty()));
        assert!(!UriFlags::all().satisfies(UriFlags::PREFIX));
    }

    #[test]
    fn test_ability_id_boundary() {
        assert_eq!(AbilityId::from_raw(-1), None);
        assert_eq!(AbilityId::from_raw(7), Some(AbilityId::new(7)));
    }

    #[test]
    fn test_policy_mode_from_flags() {
        assert_eq!(PolicyMode::from_flags(UriFlags::READ), PolicyMode::READ);
        assert_eq!(
            PolicyMode::from_flags(UriFlags::WRITE | UriFlags::PREFIX),
            PolicyMode::WRITE
        );
        assert!(PolicyMode::WRITE.covers(PolicyMode::READ));
        assert!(!PolicyMode::READ.covers(PolicyMode::WRITE));
    }

    proptest! {
        #[test]
        fn satisfaction_never_widens_beyond_write_implies_read(held in 0u32..0x100, asked in 0u32..0x100) {
            let held = UriFlags::from_request(held);
            let asked = UriFlags::from_request(asked);
            if held.satisfies(asked) {
                prop_assert!(asked.is_valid_request());
                if asked.contains(UriFlags::WRITE) {
                    prop_assert!(held.contains(UriFlags::WRITE));
                }
                prop_assert!(held.intersects(UriFlags::ACCESS));
            }
        }
    }
}
