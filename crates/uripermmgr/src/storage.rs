// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use uri_policy::{TokenId, UriFlags};

use crate::error::RemoteError;

/// Storage manager contract for provider-backed URIs.
///
/// A share file is the storage manager's cached copy of a provider resource
/// made visible to a grantee.
pub trait StorageManager: Send + Sync {
    fn create_share_file(
        &self,
        target: TokenId,
        uris: &[String],
        flag: UriFlags,
    ) -> Result<(), RemoteError>;

    fn delete_share_file(&self, target: TokenId, uris: &[String]) -> Result<(), RemoteError>;
}
