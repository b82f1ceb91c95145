// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The upstream leg: one attempt per request against the single target.

use reqwest::header::{ACCEPT_ENCODING, CONNECTION, HOST, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Url, redirect};
use std::error::Error as StdError;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use super::{ProxyError, ProxyRequest};
use crate::config::ProxyConfig;
use crate::config::error::ConfigError;
use crate::{debug_fmt, error_fmt, warn_fmt};

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Headers that describe a single connection and must not be forwarded.
const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Sends allowed requests to the configured target.
#[derive(Debug, Clone)]
pub struct ForwardingEngine {
    client: reqwest::Client,
    target: Url,
    host_header: HeaderValue,
    disable_compression: bool,
}

impl ForwardingEngine {
    /// Build the HTTP client for `config`.
    ///
    /// Redirects are handed back to the client untouched and, when
    /// compression is disabled, the client never asks for an encoded body.
    pub fn new(config: &ProxyConfig) -> Result<Self, ProxyError> {
        let target = config.target()?;
        let host_header = host_header_for(&target)?;

        if config.tls_skip_verify {
            warn_fmt!("ForwardingEngine", "Upstream certificate validation is disabled for {}", target);
        }

        let mut builder = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .redirect(redirect::Policy::none())
            .danger_accept_invalid_certs(config.tls_skip_verify);

        if config.disable_compression {
            builder = builder.no_gzip().no_brotli().no_deflate();
        }

        let client = builder
            .build()
            .map_err(|e| ProxyError::Other(format!("failed to build upstream client: {e}")))?;

        Ok(Self {
            client,
            target,
            host_header,
            disable_compression: config.disable_compression,
        })
    }

    /// The configured upstream.
    pub fn target(&self) -> &Url {
        &self.target
    }

    /// Forward `request` upstream.  The response body is not read here.
    pub async fn forward(&self, request: ProxyRequest) -> Result<reqwest::Response, ProxyError> {
        let url = self.upstream_url(&request.path, request.query.as_deref());

        let mut headers = request.headers;
        strip_hop_by_hop(&mut headers);
        if self.disable_compression {
            headers.remove(ACCEPT_ENCODING);
        }
        headers.insert(HOST, self.host_header.clone());
        if let Some(addr) = request.context.client_addr {
            append_forwarded_for(&mut headers, addr);
        }

        debug_fmt!("ForwardingEngine", "{} {} -> {}", request.method, request.path, url);

        self.client
            .request(request.method, url)
            .headers(headers)
            .body(request.body)
            .send()
            .await
            .map_err(classify)
    }

    /// Join the target's base path with the request path and merge queries.
    fn upstream_url(&self, path: &str, query: Option<&str>) -> Url {
        let mut url = self.target.clone();
        url.set_path(&join_paths(self.target.path(), path));

        let merged = match (self.target.query().filter(|q| !q.is_empty()), query.filter(|q| !q.is_empty())) {
            (Some(base), Some(extra)) => Some(format!("{base}&{extra}")),
            (Some(base), None) => Some(base.to_string()),
            (None, Some(extra)) => Some(extra.to_string()),
            (None, None) => None,
        };
        url.set_query(merged.as_deref());
        url
    }
}

fn host_header_for(target: &Url) -> Result<HeaderValue, ConfigError> {
    let host = target
        .host_str()
        .ok_or_else(|| ConfigError::invalid("proxy.target_url", "missing host"))?;
    let value = match target.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    HeaderValue::from_str(&value).map_err(|e| ConfigError::invalid("proxy.target_url", e))
}

/// Join two URL paths with exactly one slash between them.
fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

/// Remove connection-scoped headers, including any named by `Connection`.
pub(crate) fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }

    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, addr: SocketAddr) {
    let client_ip = addr.ip().to_string();
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) if !prior.is_empty() => format!("{prior}, {client_ip}"),
        _ => client_ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// Translate an upstream failure into the client-facing error class.
///
/// The original error text is kept for logs only; see
/// [`ProxyError::client_body`].
pub(crate) fn classify(err: reqwest::Error) -> ProxyError {
    let detail = err.to_string();
    let classified = if err.is_connect() || err.is_timeout() || has_network_io_error(&err) {
        ProxyError::UpstreamUnreachable(detail)
    } else if err.is_builder()
        || err.is_redirect()
        || err.is_body()
        || err.is_decode()
        || has_protocol_error(&err)
    {
        ProxyError::UpstreamProtocol(detail)
    } else {
        ProxyError::Transport(detail)
    };
    error_fmt!("ForwardingEngine", "Upstream call failed: {}", classified);
    classified
}

fn sources<'a>(err: &'a (dyn StdError + 'static)) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(err), |&e| e.source())
}

fn has_network_io_error(err: &reqwest::Error) -> bool {
    sources(err).any(|e| {
        e.downcast_ref::<io::Error>().is_some_and(|io_err| {
            matches!(
                io_err.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::NotConnected
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::TimedOut
            )
        })
    })
}

fn has_protocol_error(err: &reqwest::Error) -> bool {
    sources(err).any(|e| {
        e.downcast_ref::<hyper::Error>().is_some_and(|h| {
            h.is_parse() || h.is_parse_status() || h.is_incomplete_message() || h.is_closed()
        }) || e
            .downcast_ref::<io::Error>()
            .is_some_and(|io_err| matches!(io_err.kind(), io::ErrorKind::UnexpectedEof | io::ErrorKind::InvalidData))
    })
}
