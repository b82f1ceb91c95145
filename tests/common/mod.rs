// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Common helpers for Veil integration tests.

use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;
use veil::{RunningServer, Veil, VeilLoader};
use wiremock::MockServer;

/// Write `content` to a temporary `.toml` file.
#[allow(dead_code)]
pub fn write_config(content: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("create temp config");
    file.write_all(content.as_bytes()).expect("write temp config");
    file
}

/// Configuration pointing at `upstream`, bound to an ephemeral local port.
/// `extra` is appended verbatim.
#[allow(dead_code)]
pub fn config_for(upstream: &str, shutdown_timeout_secs: u64, extra: &str) -> String {
    format!(
        r#"
[proxy]
target_url = "{upstream}"

[server]
host = "127.0.0.1"
port = 0
shutdown_timeout_secs = {shutdown_timeout_secs}

[logging]
level = "debug"

{extra}
"#
    )
}

/// A proxy in front of a test upstream.  The temp file lives as long as
/// the proxy.
#[allow(dead_code)]
pub struct TestProxy {
    pub veil: Veil,
    pub server: RunningServer,
    _config_file: NamedTempFile,
}

#[allow(dead_code)]
impl TestProxy {
    pub async fn start(upstream: &MockServer, extra: &str) -> Self {
        Self::start_with_grace(upstream, 5, extra).await
    }

    pub async fn start_with_grace(upstream: &MockServer, grace_secs: u64, extra: &str) -> Self {
        let file = write_config(&config_for(&upstream.uri(), grace_secs, extra));
        let veil = VeilLoader::new()
            .with_config_file(file.path().to_str().expect("utf-8 temp path"))
            .build()
            .await
            .expect("build proxy");
        let server = veil.start().await.expect("start proxy");
        Self {
            veil,
            server,
            _config_file: file,
        }
    }

    pub fn url(&self, path_and_query: &str) -> String {
        format!("http://{}{}", self.server.local_addr(), path_and_query)
    }
}

/// A client that ignores proxy environment variables.
#[allow(dead_code)]
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(10))
        .build()
        .expect("build client")
}

/// Wait until `upstream` has seen at least one request.
#[allow(dead_code)]
pub async fn wait_for_upstream_request(upstream: &MockServer) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let seen = upstream.received_requests().await.unwrap_or_default();
            if !seen.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("upstream never saw the request");
}
