// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::path::{Path, PathBuf};

use anyhow::Context;
use etcetera::BaseStrategy;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use uripermmgr::ManagerConfig;

const CONFIG_FILE_ENV: &str = "UPMS_CONFIG_FILE";
const ENV_PREFIX: &str = "UPMS_";

fn default_event_queue_depth() -> usize {
    64
}

fn default_log_filter() -> String {
    "info".to_string()
}

/// Configuration for the URI permission service
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(flatten)]
    pub manager: ManagerConfig,

    /// Capacity of the lifecycle event queue
    #[serde(default = "default_event_queue_depth")]
    pub event_queue_depth: usize,

    /// Filter used when `RUST_LOG` is not set
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            manager: ManagerConfig::default(),
            event_queue_depth: default_event_queue_depth(),
            log_filter: default_log_filter(),
        }
    }
}

/// Values that take precedence over the file and the environment. Unset
/// fields leave the lower layers alone.
#[derive(Debug, Default, Clone, Serialize)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub foundation_process_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_queue_depth: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_filter: Option<String>,
}

impl Config {
    /// Returns a new [`Config`] instance by merging the configuration from the specified
    /// `overrides` (any struct that is Serialize) with the configuration file and environment
    /// variables. By default, the configuration file is located at
    /// `$XDG_CONFIG_HOME/uripermmgr/config.toml`. This can be overridden by setting the
    /// `UPMS_CONFIG_FILE` environment variable.
    ///
    /// The order of precedence for configuration sources is as follows:
    /// 1. Values from `overrides`
    /// 2. Environment variables prefixed with `UPMS_`
    /// 3. Configuration file specified by `UPMS_CONFIG_FILE` or default location
    pub fn new<T: Serialize>(overrides: &T) -> Result<Self, anyhow::Error> {
        let config_file_path = match std::env::var_os(CONFIG_FILE_ENV) {
            Some(path) => PathBuf::from(path),
            None => etcetera::choose_base_strategy()
                .context("Unable to get home directory")?
                .config_dir()
                .join("uripermmgr")
                .join("config.toml"),
        };
        Self::new_from_path(overrides, config_file_path)
    }

    /// Same as [`Config::new`], but allows specifying a custom path for the configuration file.
    pub fn new_from_path<T: Serialize>(
        overrides: &T,
        config_file_path: impl AsRef<Path>,
    ) -> Result<Self, anyhow::Error> {
        figment::Figment::from(Serialized::defaults(Config::default()))
            .admerge(Toml::file(config_file_path))
            .admerge(Env::prefixed(ENV_PREFIX))
            .admerge(Serialized::defaults(overrides))
            .extract()
            .context("Unable to merge configs")
    }
}
