// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use serde::{Deserialize, Serialize};

pub const DEFAULT_FOUNDATION_PROCESS: &str = "foundation";
pub const PERMISSION_GRANT_URI_PRIVILEGED: &str = "ohos.permission.GRANT_URI_PERMISSION_PRIVILEGED";
pub const PERMISSION_FILE_ACCESS_MANAGER: &str = "ohos.permission.FILE_ACCESS_MANAGER";
pub const PERMISSION_WRITE_IMAGEVIDEO: &str = "ohos.permission.WRITE_IMAGEVIDEO";

/// Knobs of the permission manager.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Process name of the ability manager host
    pub foundation_process_name: String,
    /// Permission required for privileged batch grants
    pub privileged_permission: String,
    /// Permission giving direct access to docs and sandbox files
    pub file_access_permission: String,
    /// Permission giving direct access to media files
    pub media_permission: String,
    /// Bundles whose docs grants are always persisted
    pub auto_persist_bundles: Vec<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            foundation_process_name: DEFAULT_FOUNDATION_PROCESS.to_string(),
            privileged_permission: PERMISSION_GRANT_URI_PRIVILEGED.to_string(),
            file_access_permission: PERMISSION_FILE_ACCESS_MANAGER.to_string(),
            media_permission: PERMISSION_WRITE_IMAGEVIDEO.to_string(),
            auto_persist_bundles: Vec::new(),
        }
    }
}

impl ManagerConfig {
    pub fn persists_for(&self, bundle_name: &str) -> bool {
        self.auto_persist_bundles.iter().any(|b| b == bundle_name)
    }
}
