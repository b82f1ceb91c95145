// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Environment variable configuration provider.
//!
//! Variables are matched by prefix, lower-cased, and split into nested keys
//! on a double underscore so that single underscores survive inside key
//! names: `VEIL_PROXY__TARGET_URL` becomes `proxy.target_url`.

use serde_json::{Value, json};
use std::collections::HashMap;
use std::env;

use super::ConfigError;
use super::ConfigProvider;

const DEFAULT_PREFIX: &str = "VEIL_";
const NESTING_SEPARATOR: &str = "__";

/// Configuration provider that retrieves values from environment variables.
#[derive(Debug)]
pub struct EnvConfigProvider {
    prefix: String,
    /// Snapshot of matching variables, keyed by dotted config key.
    cache: HashMap<String, String>,
}

impl EnvConfigProvider {
    /// Create a provider reading variables that start with `prefix`.
    pub fn new(prefix: &str) -> Self {
        let mut provider = Self {
            prefix: prefix.to_string(),
            cache: HashMap::new(),
        };
        provider.refresh_cache();
        provider
    }

    /// Re-read the process environment.
    pub fn refresh_cache(&mut self) {
        self.cache = env::vars()
            .filter_map(|(key, value)| {
                let stripped = key.strip_prefix(&self.prefix)?;
                Some((to_config_key(stripped), value))
            })
            .collect();
    }

    /// Interpret a raw variable as JSON when possible, otherwise as a
    /// boolean, a number, or finally a plain string.
    fn parse_value(value: &str) -> Value {
        if let Ok(parsed) = serde_json::from_str(value) {
            return parsed;
        }
        if value.eq_ignore_ascii_case("true") {
            return json!(true);
        }
        if value.eq_ignore_ascii_case("false") {
            return json!(false);
        }
        if let Ok(int_val) = value.parse::<i64>() {
            return json!(int_val);
        }
        if let Ok(float_val) = value.parse::<f64>() {
            return json!(float_val);
        }
        json!(value)
    }
}

fn to_config_key(var: &str) -> String {
    var.to_lowercase().replace(NESTING_SEPARATOR, ".")
}

impl Default for EnvConfigProvider {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

impl ConfigProvider for EnvConfigProvider {
    fn has(&self, key: &str) -> bool {
        self.cache.contains_key(key)
    }

    fn provider_name(&self) -> &str {
        "env"
    }

    fn get_raw(&self, key: &str) -> Result<Option<Value>, ConfigError> {
        Ok(self.cache.get(key).map(|v| Self::parse_value(v)))
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.cache
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigProviderExt;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_env_provider_nested_keys() {
        unsafe {
            env::set_var("VEIL_PROXY__TARGET_URL", "http://backend:9000");
            env::set_var("VEIL_SERVER__PORT", "9090");
            env::set_var("VEIL_PROXY__TLS_SKIP_VERIFY", "true");
        }

        let provider = EnvConfigProvider::default();

        assert!(provider.has("proxy.target_url"));
        assert!(!provider.has("proxy.target.url"));

        let target: String = provider.get("proxy.target_url").unwrap().unwrap();
        assert_eq!(target, "http://backend:9000");

        let port: u16 = provider.get("server.port").unwrap().unwrap();
        assert_eq!(port, 9090);

        let skip: bool = provider.get("proxy.tls_skip_verify").unwrap().unwrap();
        assert!(skip);

        unsafe {
            env::remove_var("VEIL_PROXY__TARGET_URL");
            env::remove_var("VEIL_SERVER__PORT");
            env::remove_var("VEIL_PROXY__TLS_SKIP_VERIFY");
        }
    }

    #[test]
    #[serial]
    fn test_custom_prefix_and_refresh() {
        let mut provider = EnvConfigProvider::new("VEILTEST_");
        assert!(!provider.has("value"));

        unsafe {
            env::set_var("VEILTEST_VALUE", "42");
        }
        assert!(!provider.has("value"));

        provider.refresh_cache();
        let value: i32 = provider.get("value").unwrap().unwrap();
        assert_eq!(value, 42);

        unsafe {
            env::remove_var("VEILTEST_VALUE");
        }
    }

    #[test]
    #[serial]
    fn test_value_types() {
        unsafe {
            env::set_var("VEIL_STRING", "hello world");
            env::set_var("VEIL_ARRAY", r#"["email", "credit_card"]"#);
            env::set_var("VEIL_BROKEN", "{invalid json}");
        }

        let provider = EnvConfigProvider::default();

        let s: String = provider.get("string").unwrap().unwrap();
        assert_eq!(s, "hello world");

        let arr: Vec<String> = provider.get("array").unwrap().unwrap();
        assert_eq!(arr, vec!["email", "credit_card"]);

        let broken: String = provider.get("broken").unwrap().unwrap();
        assert_eq!(broken, "{invalid json}");

        unsafe {
            env::remove_var("VEIL_STRING");
            env::remove_var("VEIL_ARRAY");
            env::remove_var("VEIL_BROKEN");
        }
    }

    #[test]
    fn test_provider_name() {
        let provider = EnvConfigProvider::new("NONEXISTENT_PREFIX_");
        assert_eq!(provider.provider_name(), "env");
        assert!(provider.get_raw("any.key").unwrap().is_none());
    }
}
