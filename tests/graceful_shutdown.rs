// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lifecycle tests for the running proxy.

mod common;

use common::{TestProxy, client, wait_for_upstream_request};
use std::time::{Duration, Instant};
use veil::{ProxyError, ServerState};
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn test_in_flight_request_finishes_within_grace() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("reply to carol@example.com")
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&upstream)
        .await;

    let proxy = TestProxy::start(&upstream, "").await;
    let url = proxy.url("/slow");
    let in_flight = tokio::spawn(async move {
        let resp = client().get(&url).send().await?;
        resp.text().await
    });

    wait_for_upstream_request(&upstream).await;
    let handle = proxy.server.shutdown_handle();
    assert!(handle.shutdown());

    assert_eq!(in_flight.await.unwrap().unwrap(), "reply to ****@example.com");
    proxy.server.wait().await.unwrap();
    assert_eq!(proxy.veil.server().state(), ServerState::Stopped);
}

#[tokio::test]
async fn test_grace_deadline_forces_stop() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
        .mount(&upstream)
        .await;

    let proxy = TestProxy::start_with_grace(&upstream, 1, "").await;
    let url = proxy.url("/stuck");
    let in_flight = tokio::spawn(async move { client().get(&url).send().await });

    wait_for_upstream_request(&upstream).await;
    let started = Instant::now();
    let result = proxy.server.shutdown().await;

    assert!(matches!(result, Err(ProxyError::ShutdownTimeout(_))), "{result:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(proxy.veil.server().state(), ServerState::Stopped);
    assert!(in_flight.await.unwrap().is_err());
}

#[tokio::test]
async fn test_shutdown_from_many_handles() {
    let upstream = MockServer::start().await;
    let proxy = TestProxy::start(&upstream, "").await;
    let addr = proxy.server.local_addr();

    let handles: Vec<_> = (0..4).map(|_| proxy.server.shutdown_handle()).collect();
    let started: Vec<bool> = handles.iter().map(|h| h.shutdown()).collect();
    assert_eq!(started.iter().filter(|s| **s).count(), 1);

    proxy.server.wait().await.unwrap();

    // Listener is gone
    assert!(tokio::net::TcpStream::connect(addr).await.is_err());
    assert!(!handles[0].shutdown());
}

#[tokio::test]
async fn test_port_in_use_fails_start() {
    let upstream = MockServer::start().await;
    let first = TestProxy::start(&upstream, "").await;
    let port = first.server.local_addr().port();

    let file = common::write_config(&format!(
        "[proxy]\ntarget_url = \"{}\"\n\n[server]\nhost = \"127.0.0.1\"\nport = {port}\n",
        upstream.uri()
    ));
    let second = veil::VeilLoader::new()
        .with_config_file(file.path().to_str().unwrap())
        .build()
        .await
        .unwrap();

    match second.start().await {
        Err(veil::LoaderError::ProxyError(ProxyError::Listen { .. })) => {}
        other => panic!("expected a listen error, got {other:?}"),
    }
    assert_eq!(second.server().state(), ServerState::NotStarted);

    first.server.shutdown().await.unwrap();
}
