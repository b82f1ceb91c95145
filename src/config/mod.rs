// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Veil configuration subsystem
//!
//! A running proxy is created from an ordered list of [`ConfigProvider`]s;
//! later providers override earlier ones.  Typical stacking order:
//!
//! 1. `FileConfigProvider` – `veil.{toml,json,yaml}`
//! 2. `EnvConfigProvider`  – `VEIL_PROXY__TARGET_URL=https://…`
//! 3. *your* provider implementing [`ConfigProvider`]
//!
//! Configuration is read exactly once at startup.  Every key below is typed
//! through [`ProxyConfig`], [`crate::server::ServerConfig`],
//! [`BlockerConfig`] and [`crate::logging::config::LoggingConfig`].
//!
//! | key | type | default | description |
//! |-----|------|---------|-------------|
//! | `proxy.target_url`             | string  | –       | Absolute upstream URL (required) |
//! | `proxy.tls_skip_verify`        | bool    | `false` | Accept any upstream certificate |
//! | `proxy.disable_compression`    | bool    | `true`  | Never negotiate compressed responses |
//! | `proxy.connect_timeout_secs`   | integer | `30`    | Upstream dial timeout |
//! | `proxy.maskers`                | array   | `["email", "credit_card"]` | Masker chain, in order |
//! | `server.host`                  | string  | `0.0.0.0` | Address to bind |
//! | `server.port`                  | integer | `8080`  | Port to bind |
//! | `server.shutdown_timeout_secs` | integer | `5`     | Grace deadline for draining |
//! | `blockers`                     | array   | `[]`    | Blocker chain, in order |
//! | `logging`                      | table   | –       | Request log settings |

mod env;
pub mod error;
mod file;
mod proxy;


pub use env::EnvConfigProvider;
pub use error::ConfigError;
pub use file::{FileConfigProvider, FileFormat};
pub use proxy::{BlockerConfig, MaskerKind, ProxyConfig};

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fmt::Debug;
use std::sync::Arc;

/// Core configuration provider trait that all configuration sources must implement.
/// This trait is object-safe since it doesn't contain generic methods.
pub trait ConfigProvider: Debug + Send + Sync {
    /// Check if the configuration provider has a value for the given key.
    fn has(&self, key: &str) -> bool;

    /// Get the name of the configuration provider for debugging purposes.
    fn provider_name(&self) -> &str;

    /// Get a raw configuration value by key.
    /// Returns a JSON Value that can be later deserialized into specific types.
    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError>;

    /// Flat keys starting with `prefix`, for providers that store dotted
    /// keys rather than nested tables.
    fn keys_with_prefix(&self, _prefix: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Typed access on top of [`ConfigProvider`].  Not object-safe.
pub trait ConfigProviderExt: ConfigProvider {
    /// Get a configuration value by key and deserialize it to the specified type.
    fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.get_raw(key)? {
            Some(value) => serde_json::from_value(value).map(Some).map_err(|e| {
                ConfigError::ParseError(format!("failed to deserialize '{key}': {e}"))
            }),
            None => Ok(None),
        }
    }
}

impl<T: ConfigProvider> ConfigProviderExt for T {}

/// Builder for the configuration system.
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    providers: Vec<Arc<dyn ConfigProvider>>,
}

impl ConfigBuilder {
    /// Create a new configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a configuration provider.
    pub fn with_provider<P: ConfigProvider + 'static>(mut self, provider: P) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    /// Add a provider that is already shared.
    pub fn with_shared_provider(mut self, provider: Arc<dyn ConfigProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Config {
        Config {
            providers: self.providers,
        }
    }
}

/// Holds all providers and resolves keys against them.
#[derive(Debug, Clone)]
pub struct Config {
    providers: Vec<Arc<dyn ConfigProvider>>,
}

impl Config {
    /// Create a new configuration builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Resolve `key` across every provider.  Tables are merged key by key,
    /// anything else is taken from the last provider that has it.
    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        let nested_prefix = format!("{key}.");
        let mut merged: Option<Value> = None;

        for provider in &self.providers {
            if let Some(value) = lookup(provider.as_ref(), key)? {
                merged = Some(match merged {
                    Some(base) => overlay(base, value),
                    None => value,
                });
            }

            for full_key in provider.keys_with_prefix(&nested_prefix) {
                if let Some(value) = provider.get_raw(&full_key)? {
                    let target = merged.get_or_insert_with(|| Value::Object(Map::new()));
                    set_path(target, &full_key[nested_prefix.len()..], value);
                }
            }
        }
        Ok(merged)
    }

    /// Get a configuration value by key from the highest-priority provider that has it.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.get_raw(key)? {
            Some(value) => serde_json::from_value(value).map(Some).map_err(|e| {
                ConfigError::ParseError(format!("failed to deserialize '{key}': {e}"))
            }),
            None => Ok(None),
        }
    }

    /// Get a configuration value by key with a default fallback value.
    pub fn get_or_default<T: DeserializeOwned>(
        &self,
        key: &str,
        default: T,
    ) -> Result<T, ConfigError> {
        match self.get(key)? {
            Some(value) => Ok(value),
            None => Ok(default),
        }
    }

    /// Get a required configuration value.
    pub fn require<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigError> {
        self.get(key)?.ok_or_else(|| ConfigError::Missing(key.to_string()))
    }

    /// Create a configuration backed by a single file.
    pub fn default_file(file_path: &str) -> Result<Self, ConfigError> {
        let provider = FileConfigProvider::new(file_path)?;
        Ok(Self::builder().with_provider(provider).build())
    }
}

/// Value of `key` in `provider`, walking into the nearest enclosing table
/// when the provider only stores the parent (`server` holding `{port}` for
/// `server.port`).
fn lookup(provider: &dyn ConfigProvider, key: &str) -> Result<Option<Value>, ConfigError> {
    if provider.has(key) {
        return provider.get_raw(key);
    }
    for (dot, _) in key.rmatch_indices('.') {
        let parent = &key[..dot];
        if provider.has(parent) {
            let found = provider.get_raw(parent)?.and_then(|mut value| {
                for part in key[dot + 1..].split('.') {
                    value = value.get_mut(part)?.take();
                }
                Some(value)
            });
            return Ok(found);
        }
    }
    Ok(None)
}

fn overlay(base: Value, top: Value) -> Value {
    match (base, top) {
        (Value::Object(mut base), Value::Object(top)) => {
            for (key, value) in top {
                let value = match base.remove(&key) {
                    Some(existing) => overlay(existing, value),
                    None => value,
                };
                base.insert(key, value);
            }
            Value::Object(base)
        }
        (_, top) => top,
    }
}

fn set_path(target: &mut Value, path: &str, value: Value) {
    let mut current = target;
    let mut parts = path.split('.').peekable();
    while let Some(part) = parts.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let Value::Object(map) = current else {
            return;
        };
        if parts.peek().is_none() {
            map.insert(part.to_string(), value);
            return;
        }
        current = map
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}
