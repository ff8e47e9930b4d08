// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::fmt::Display;

use anyhow::{bail, Context};

use crate::{PolicyInfo, PolicyMode, PolicyResult, UriFlags};

const DOCS_AUTHORITY: &str = "docs";
const MEDIA_AUTHORITY: &str = "media";
const SANDBOX_BASE: &str = "/data/app/el2/base/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    File,
    Content,
}

/// The kind of resource a URI names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UriKind {
    /// Generic file-system document (`file://docs/...`)
    Docs,
    /// Media library item (`file://media/...`)
    Media,
    /// Content provider item (`content://...`)
    Content,
    /// File inside an application sandbox; carries the owning bundle name
    Bundle(String),
}

/// A URI split into its parts and classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedUri {
    raw: String,
    scheme: Scheme,
    authority: String,
    path: String,
    kind: UriKind,
}

impl ParsedUri {
    /// Parse and classify a URI
    ///
    /// # Example
    ///
    /// ```rust
    /// use uri_policy::{ParsedUri, UriKind};
    ///
    /// let uri = ParsedUri::parse("file://com.example.notes/data/storage/a.txt").unwrap();
    /// assert_eq!(uri.kind(), &UriKind::Bundle("com.example.notes".to_string()));
    /// assert_eq!(uri.path(), "/data/storage/a.txt");
    /// ```
    pub fn parse(uri: impl AsRef<str>) -> PolicyResult<Self> {
        let raw = uri.as_ref().trim();
        let (scheme, rest) = raw
            .split_once("://")
            .with_context(|| format!("URI is missing a scheme: {raw}"))?;

        let scheme = match scheme {
            "file" => Scheme::File,
            "content" => Scheme::Content,
            other => bail!("Unsupported URI scheme: {other}"),
        };

        let (authority, path) = match rest.find('/') {
            Some(idx) => rest.split_at(idx),
            None => (rest, ""),
        };
        if authority.is_empty() {
            bail!("URI has an empty authority: {raw}");
        }
        let decoded = urlencoding::decode(path)
            .with_context(|| format!("URI path is not valid percent-encoded UTF-8: {raw}"))?;
        if decoded.split(['/', '\\']).any(|segment| segment == "..") {
            bail!("URI path escapes its root: {raw}");
        }

        let kind = match (scheme, authority) {
            (Scheme::Content, _) => UriKind::Content,
            (Scheme::File, DOCS_AUTHORITY) => UriKind::Docs,
            (Scheme::File, MEDIA_AUTHORITY) => UriKind::Media,
            (Scheme::File, bundle) => UriKind::Bundle(bundle.to_string()),
        };

        Ok(Self {
            raw: raw.to_string(),
            scheme,
            authority: authority.to_string(),
            path: path.to_string(),
            kind,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn kind(&self) -> &UriKind {
        &self.kind
    }

    /// The bundle that owns the resource, for sandbox files.
    pub fn bundle_name(&self) -> Option<&str> {
        match &self.kind {
            UriKind::Bundle(bundle) => Some(bundle),
            _ => None,
        }
    }

    /// Media and content URIs are served through a provider and need a
    /// share file in the storage manager.
    pub fn is_provider_backed(&self) -> bool {
        matches!(self.kind, UriKind::Media | UriKind::Content)
    }

    /// Sandbox path the policy engine knows this resource by. Provider-backed
    /// URIs have none.
    pub fn policy_path(&self) -> Option<String> {
        match &self.kind {
            UriKind::Docs => Some(self.path.clone()),
            UriKind::Bundle(bundle) => Some(format!("{SANDBOX_BASE}{bundle}{}", self.path)),
            UriKind::Media | UriKind::Content => None,
        }
    }

    pub fn to_policy_info(&self, flag: UriFlags) -> Option<PolicyInfo> {
        self.policy_path()
            .map(|path| PolicyInfo::new(path, PolicyMode::from_flags(flag)))
    }
}

impl Display for ParsedUri {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Returns true if `ancestor` names a directory above `uri`, ending on a `/`
/// boundary. A URI is not its own ancestor.
pub fn is_path_ancestor(ancestor: &str, uri: &str) -> bool {
    if ancestor.len() >= uri.len() || !uri.starts_with(ancestor) {
        return false;
    }
    ancestor.ends_with('/') || uri[ancestor.len()..].starts_with('/')
}
