// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Shared vocabulary for URI permission grants.
//!
//! This crate holds the identity handles, access flags and sandbox policy
//! entries that the permission manager and its collaborators exchange, along
//! with the parser that classifies a URI into the kind of resource it names.

mod parser;
mod types;

pub use parser::{is_path_ancestor, ParsedUri, Scheme, UriKind};
pub use types::*;

pub type PolicyResult<T> = anyhow::Result<T>;
