// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Built-in blockers
//!
//! A blocker is a deny-list predicate evaluated before a request is
//! forwarded.  Blockers run in the order they are configured and the first
//! one that matches (or fails) decides the request:
//!
//! ```toml
//! [[blockers]]
//! type = "path"
//! paths = ["/admin", "/internal/metrics"]
//!
//! [[blockers]]
//! type = "query"
//! params = { debug = "true" }
//! ```


use async_trait::async_trait;
use reqwest::header::HeaderName;
use std::borrow::Cow;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use crate::config::{BlockerConfig, ConfigError};
use crate::core::{ProxyError, ProxyRequest};
use crate::{debug_fmt, trace_fmt};

/// A policy predicate deciding whether a request is rejected.
///
/// Implementations are shared between connections and must synchronize any
/// internal state themselves.
#[async_trait]
pub trait Blocker: fmt::Debug + Send + Sync {
    /// Stable name reported when this blocker decides a request.
    fn name(&self) -> &str;

    /// `Ok(true)` blocks the request, `Ok(false)` lets the next blocker
    /// look at it.  An error aborts the chain.
    async fn evaluate(&self, request: &ProxyRequest) -> Result<bool, ProxyError>;
}

/// The decision of a [`BlockerChain`] for one request.
#[derive(Debug)]
pub enum BlockOutcome {
    /// No blocker matched
    Allowed,
    /// `blocker` matched the request
    Blocked { blocker: String },
    /// `blocker` could not reach a decision
    Failed { blocker: String, error: ProxyError },
}

impl BlockOutcome {
    pub fn is_allowed(&self) -> bool {
        matches!(self, BlockOutcome::Allowed)
    }
}

/// Ordered list of blockers.  Built once at startup, read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct BlockerChain {
    blockers: Vec<Arc<dyn Blocker>>,
}

impl BlockerChain {
    pub fn new(blockers: Vec<Arc<dyn Blocker>>) -> Self {
        Self { blockers }
    }

    /// Build a chain from configuration, preserving order.
    pub fn from_config(configs: &[BlockerConfig]) -> Result<Self, ConfigError> {
        let blockers = configs
            .iter()
            .map(BlockerFactory::create)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(blockers))
    }

    /// Append a blocker to the end of the chain.
    pub fn push(&mut self, blocker: Arc<dyn Blocker>) {
        self.blockers.push(blocker);
    }

    pub fn len(&self) -> usize {
        self.blockers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blockers.is_empty()
    }

    /// Names of the blockers, in evaluation order.
    pub fn names(&self) -> Vec<&str> {
        self.blockers.iter().map(|b| b.name()).collect()
    }

    /// Evaluate blockers in order, stopping at the first match or error.
    pub async fn evaluate(&self, request: &ProxyRequest) -> BlockOutcome {
        for blocker in &self.blockers {
            match blocker.evaluate(request).await {
                Ok(false) => {
                    trace_fmt!("BlockerChain", "{} passed {} {}", blocker.name(), request.method, request.path);
                }
                Ok(true) => {
                    return BlockOutcome::Blocked {
                        blocker: blocker.name().to_string(),
                    };
                }
                Err(error) => {
                    return BlockOutcome::Failed {
                        blocker: blocker.name().to_string(),
                        error,
                    };
                }
            }
        }
        BlockOutcome::Allowed
    }
}

/// Blocks when any configured header carries exactly the configured value.
///
/// Only the first value of a repeated header is compared.  A header that is
/// absent never matches.
#[derive(Debug)]
pub struct HeaderBlocker {
    headers: HashMap<HeaderName, String>,
}

impl HeaderBlocker {
    pub fn new(headers: HashMap<String, String>) -> Result<Self, ConfigError> {
        let headers = headers
            .into_iter()
            .map(|(name, value)| {
                HeaderName::from_bytes(name.as_bytes())
                    .map(|name| (name, value))
                    .map_err(|e| ConfigError::invalid(format!("blockers.header.{name}"), e))
            })
            .collect::<Result<HashMap<_, _>, _>>()?;
        Ok(Self { headers })
    }
}

#[async_trait]
impl Blocker for HeaderBlocker {
    fn name(&self) -> &str {
        "header_blocker"
    }

    async fn evaluate(&self, request: &ProxyRequest) -> Result<bool, ProxyError> {
        Ok(self.headers.iter().any(|(name, expected)| {
            request
                .headers
                .get(name)
                .is_some_and(|actual| actual.as_bytes() == expected.as_bytes())
        }))
    }
}

/// Blocks listed methods.  Matching is exact and case-sensitive.
#[derive(Debug)]
pub struct MethodBlocker {
    methods: HashSet<String>,
}

impl MethodBlocker {
    pub fn new(methods: impl IntoIterator<Item = String>) -> Self {
        Self {
            methods: methods.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Blocker for MethodBlocker {
    fn name(&self) -> &str {
        "method_blocker"
    }

    async fn evaluate(&self, request: &ProxyRequest) -> Result<bool, ProxyError> {
        Ok(self.methods.contains(request.method.as_str()))
    }
}

/// Blocks when the percent-decoded path equals a configured path.
#[derive(Debug)]
pub struct PathBlocker {
    paths: HashSet<String>,
}

impl PathBlocker {
    pub fn new(paths: impl IntoIterator<Item = String>) -> Self {
        Self {
            paths: paths.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Blocker for PathBlocker {
    fn name(&self) -> &str {
        "path_blocker"
    }

    async fn evaluate(&self, request: &ProxyRequest) -> Result<bool, ProxyError> {
        // Malformed escapes are compared verbatim
        let path = urlencoding::decode(&request.path).unwrap_or(Cow::Borrowed(request.path.as_str()));
        Ok(self.paths.contains(path.as_ref()))
    }
}

/// Blocks when the first value of a configured query parameter equals the
/// configured value.
#[derive(Debug)]
pub struct QueryBlocker {
    params: HashMap<String, String>,
}

impl QueryBlocker {
    pub fn new(params: HashMap<String, String>) -> Self {
        Self { params }
    }
}

#[async_trait]
impl Blocker for QueryBlocker {
    fn name(&self) -> &str {
        "query_blocker"
    }

    async fn evaluate(&self, request: &ProxyRequest) -> Result<bool, ProxyError> {
        let Some(query) = request.query.as_deref() else {
            return Ok(false);
        };
        let values = first_query_values(query);
        Ok(self
            .params
            .iter()
            .any(|(name, expected)| values.get(name.as_str()) == Some(expected)))
    }
}

/// Decode a raw query string into the first value of every parameter.
///
/// `+` means space.  Pairs that do not decode are skipped.
pub(crate) fn first_query_values(query: &str) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let (Some(key), Some(value)) = (decode_component(key), decode_component(value)) else {
            continue;
        };
        values.entry(key).or_insert(value);
    }
    values
}

fn decode_component(raw: &str) -> Option<String> {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced).ok().map(Cow::into_owned)
}

/// Builds blockers from their configuration entries.
pub struct BlockerFactory;

impl BlockerFactory {
    /// Create a blocker from one `blockers` entry.
    pub fn create(config: &BlockerConfig) -> Result<Arc<dyn Blocker>, ConfigError> {
        debug_fmt!("BlockerFactory", "Creating blocker from {:?}", config);

        let blocker: Arc<dyn Blocker> = match config {
            BlockerConfig::Header { headers } => Arc::new(HeaderBlocker::new(headers.clone())?),
            BlockerConfig::Method { methods } => Arc::new(MethodBlocker::new(methods.iter().cloned())),
            BlockerConfig::Path { paths } => Arc::new(PathBlocker::new(paths.iter().cloned())),
            BlockerConfig::Query { params } => Arc::new(QueryBlocker::new(params.clone())),
        };
        Ok(blocker)
    }
}
