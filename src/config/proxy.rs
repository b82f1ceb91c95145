// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Typed proxy configuration: the upstream target and the policy chains.

use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::ConfigError;

/// Upstream and masking settings, read from the `proxy` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Absolute URL every request is forwarded to
    pub target_url: String,

    /// Skip upstream certificate validation (self-signed upstreams)
    #[serde(default)]
    pub tls_skip_verify: bool,

    /// Never negotiate compressed responses so maskers see plain bytes
    #[serde(default = "default_true")]
    pub disable_compression: bool,

    /// Upstream dial timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Maskers applied to GET response bodies, in order
    #[serde(default = "default_maskers")]
    pub maskers: Vec<MaskerKind>,
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_maskers() -> Vec<MaskerKind> {
    vec![MaskerKind::Email, MaskerKind::CreditCard]
}

impl ProxyConfig {
    /// Configuration for `target_url` with every other field at its default.
    pub fn new(target_url: impl Into<String>) -> Self {
        Self {
            target_url: target_url.into(),
            tls_skip_verify: false,
            disable_compression: true,
            connect_timeout_secs: default_connect_timeout_secs(),
            maskers: default_maskers(),
        }
    }

    /// Parse and validate the target URL.
    ///
    /// The target must be absolute, use `http` or `https`, and name a host.
    pub fn target(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.target_url)
            .map_err(|e| ConfigError::invalid("proxy.target_url", e))?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::invalid(
                "proxy.target_url",
                format!("unsupported scheme '{}'", url.scheme()),
            ));
        }
        if url.host_str().is_none() {
            return Err(ConfigError::invalid("proxy.target_url", "missing host"));
        }
        Ok(url)
    }
}

/// One entry of the `blockers` array.
///
/// ```toml
/// [[blockers]]
/// type = "header"
/// headers = { "X-Debug" = "1" }
///
/// [[blockers]]
/// type = "method"
/// methods = ["DELETE", "PATCH"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockerConfig {
    /// Block when a header carries an exact value
    Header { headers: HashMap<String, String> },
    /// Block listed methods
    Method { methods: Vec<String> },
    /// Block listed paths
    Path { paths: Vec<String> },
    /// Block when a query parameter carries an exact value
    Query { params: HashMap<String, String> },
}

/// Built-in maskers that can be enabled from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaskerKind {
    Email,
    CreditCard,
}
