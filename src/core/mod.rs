// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Core primitives – requests, responses, errors & the interception pipeline.
//!
//! Everything that physically moves through the proxy is defined here.
//! Socket IO sits in `server`, policy behaviour in `blockers` and `maskers`,
//! and the upstream leg in [`forward`].

pub mod forward;


use bytes::Bytes;
use reqwest::Method;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, HeaderMap, HeaderValue};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::blockers::{BlockOutcome, BlockerChain};
use crate::config::ProxyConfig;
use crate::maskers::MaskerChain;
use crate::{debug_fmt, info_fmt, warn_fmt};

pub use forward::ForwardingEngine;

/// Literal body of every 403 produced by a blocker.
pub const BLOCKED_BODY: &str = "blocked";

/// Errors that can occur during proxy operations.
///
/// Each variant maps to exactly one client-visible status; see
/// [`ProxyError::status_code`].
#[derive(Error, Debug)]
pub enum ProxyError {
    /// A blocker could not reach a decision
    #[error("blocker '{blocker}' failed: {message}")]
    BlockDecision { blocker: String, message: String },

    /// A blocker matched the request
    #[error("request blocked by '{0}'")]
    Blocked(String),

    /// Connection refused, reset or timed out
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// Malformed target URL or broken upstream framing
    #[error("upstream protocol error: {0}")]
    UpstreamProtocol(String),

    /// Any other failure on the upstream leg
    #[error("upstream transport error: {0}")]
    Transport(String),

    /// A masker failed; the response must not be delivered
    #[error("masker '{masker}' failed: {message}")]
    Masking { masker: String, message: String },

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// The listening socket could not be bound
    #[error("failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// In-flight connections outlived the grace deadline
    #[error("shutdown timed out after {0:?}; remaining connections were closed")]
    ShutdownTimeout(Duration),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<crate::config::error::ConfigError> for ProxyError {
    fn from(err: crate::config::error::ConfigError) -> Self {
        ProxyError::ConfigError(err.to_string())
    }
}

impl ProxyError {
    /// Status code sent to the client for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            ProxyError::Blocked(_) => 403,
            ProxyError::UpstreamUnreachable(_) | ProxyError::UpstreamProtocol(_) => 502,
            _ => 500,
        }
    }

    /// Body sent to the client for this error.
    ///
    /// Only policy failures carry text.  Upstream failures never leak their
    /// cause.
    pub fn client_body(&self) -> Bytes {
        match self {
            ProxyError::Blocked(_) => Bytes::from_static(BLOCKED_BODY.as_bytes()),
            ProxyError::BlockDecision { message, .. } | ProxyError::Masking { message, .. } => {
                Bytes::from(message.clone())
            }
            _ => Bytes::new(),
        }
    }
}

/// Per-request metadata that is not part of the HTTP message itself.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Correlates the request with its log record
    pub request_id: String,
    /// Peer address of the client connection
    pub client_addr: Option<SocketAddr>,
    /// When the request was received
    pub received_at: Instant,
}

impl Default for RequestContext {
    fn default() -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            client_addr: None,
            received_at: Instant::now(),
        }
    }
}

/// An inbound request as seen by blockers and the forwarding engine.
#[derive(Debug)]
pub struct ProxyRequest {
    pub method: Method,
    /// Raw (still percent-encoded) path
    pub path: String,
    /// Raw query string without the leading `?`
    pub query: Option<String>,
    /// Host the client addressed
    pub host: String,
    pub headers: HeaderMap,
    pub body: reqwest::Body,
    pub context: RequestContext,
}

impl ProxyRequest {
    /// Build a request from a method and an origin-form target such as
    /// `/search?q=1`.  The body is empty.
    pub fn new(method: Method, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p.to_string(), Some(q.to_string())),
            None => (target.to_string(), None),
        };
        Self {
            method,
            path,
            query,
            host: String::new(),
            headers: HeaderMap::new(),
            body: reqwest::Body::from(Bytes::new()),
            context: RequestContext::default(),
        }
    }

    /// Add a header, ignoring names or values that are not valid HTTP.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    /// Replace the body.
    pub fn with_body(mut self, body: impl Into<reqwest::Body>) -> Self {
        self.body = body.into();
        self
    }
}

/// A response on its way back to the client.
#[derive(Debug)]
pub struct ProxyResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: reqwest::Body,
}

impl ProxyResponse {
    /// The response the client sees for `err`.
    pub fn from_error(err: &ProxyError) -> Self {
        let body = err.client_body();
        let mut headers = HeaderMap::new();
        if !body.is_empty() {
            headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            );
        }
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
        Self {
            status: err.status_code(),
            headers,
            body: reqwest::Body::from(body),
        }
    }
}

/// The interception pipeline: blockers, then the upstream call, then
/// maskers for GET responses.
///
/// Both chains are fixed at construction and shared read-only by every
/// in-flight request.
#[derive(Debug)]
pub struct ProxyCore {
    /// Configuration for the proxy
    pub config: Arc<ProxyConfig>,
    forwarder: ForwardingEngine,
    blockers: BlockerChain,
    maskers: MaskerChain,
}

impl ProxyCore {
    /// Create a core for `config` with the given chains.
    pub fn new(
        config: ProxyConfig,
        blockers: BlockerChain,
        maskers: MaskerChain,
    ) -> Result<Self, ProxyError> {
        let forwarder = ForwardingEngine::new(&config)?;
        Ok(Self {
            config: Arc::new(config),
            forwarder,
            blockers,
            maskers,
        })
    }

    pub fn blockers(&self) -> &BlockerChain {
        &self.blockers
    }

    pub fn maskers(&self) -> &MaskerChain {
        &self.maskers
    }

    /// Run one request through the pipeline.
    ///
    /// An `Err` is always safe to render with [`ProxyResponse::from_error`].
    pub async fn process_request(&self, request: ProxyRequest) -> Result<ProxyResponse, ProxyError> {
        let overall_start = Instant::now();

        /* ---------- blockers ---------- */
        match self.blockers.evaluate(&request).await {
            BlockOutcome::Allowed => {}
            BlockOutcome::Blocked { blocker } => {
                info_fmt!("ProxyCore", "{} {} blocked by {}", request.method, request.path, blocker);
                return Err(ProxyError::Blocked(blocker));
            }
            BlockOutcome::Failed { blocker, error } => {
                warn_fmt!("ProxyCore", "Blocker {} failed on {} {}: {}", blocker, request.method, request.path, error);
                return Err(ProxyError::BlockDecision {
                    blocker,
                    message: error.to_string(),
                });
            }
        }

        let method = request.method.clone();
        let path = request.path.clone();

        /* ---------- upstream ---------- */
        let upstream_start = Instant::now();
        let upstream = self.forwarder.forward(request).await?;
        let upstream_elapsed = upstream_start.elapsed();

        let status = upstream.status().as_u16();
        let mut headers = upstream.headers().clone();
        forward::strip_hop_by_hop(&mut headers);

        /* ---------- maskers (GET only) ---------- */
        let body = if method == Method::GET {
            let raw = upstream.bytes().await.map_err(forward::classify)?;
            let masked = self.maskers.apply(raw)?;
            headers.insert(CONTENT_LENGTH, HeaderValue::from(masked.len()));
            reqwest::Body::from(masked)
        } else {
            reqwest::Body::wrap_stream(upstream.bytes_stream())
        };

        let overall_elapsed = overall_start.elapsed();
        debug_fmt!(
            "ProxyCore",
            "[timing] {} {} -> {} | total={:?} upstream={:?} internal={:?}",
            method,
            path,
            status,
            overall_elapsed,
            upstream_elapsed,
            overall_elapsed.saturating_sub(upstream_elapsed)
        );

        Ok(ProxyResponse { status, headers, body })
    }
}
