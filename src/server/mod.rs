// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP server and lifecycle supervisor for Veil.
//!
//! The server is a *thin* wrapper around **hyper-util**.  It owns the
//! listening socket, translates between Hyper's types and the internal
//! [`ProxyRequest`] / [`ProxyResponse`], and runs the
//! `NotStarted → Running → Draining → Stopped` lifecycle.
//!
//! **Protocol support**
//! Uses `hyper_util::server::conn::auto::Builder`, so the same
//! connection transparently handles both HTTP/1.1 *and* HTTP/2.
//!
//! ## Shutdown
//! The first [`ShutdownHandle::shutdown`] closes the listener and asks every
//! connection to finish its in-flight request and close.  Connections still
//! open when the grace deadline passes are aborted and the server reports
//! [`ProxyError::ShutdownTimeout`].  Either way the state ends at
//! [`ServerState::Stopped`].


use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::HOST;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use reqwest::Body;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

use crate::core::{ProxyCore, ProxyError, ProxyRequest, ProxyResponse, RequestContext};
use crate::logging::{PendingRecord, RequestLogger, tee_body};
use crate::{debug_fmt, error_fmt, info_fmt, trace_fmt, warn_fmt};

/// Configuration for the HTTP server, read from the `server` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on; `0` picks a free port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Grace deadline for in-flight requests during shutdown
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl ServerConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

/// Lifecycle of a [`ProxyServer`].  Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    NotStarted,
    Running,
    Draining,
    Stopped,
}

/// Requests shutdown of a running server.  Cheap to clone.
///
/// Only the first call on any clone has an effect.  Dropping every handle
/// also stops the server.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    sender: Arc<std::sync::Mutex<Option<oneshot::Sender<()>>>>,
}

impl ShutdownHandle {
    fn new(sender: oneshot::Sender<()>) -> Self {
        Self {
            sender: Arc::new(std::sync::Mutex::new(Some(sender))),
        }
    }

    /// Begin draining.  Returns `true` if this call started the shutdown.
    pub fn shutdown(&self) -> bool {
        let sender = match self.sender.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match sender {
            Some(tx) => {
                info_fmt!("ProxyServer", "Shutdown requested");
                let _ = tx.send(());
                true
            }
            None => false,
        }
    }
}

/// HTTP server for the proxy.
#[derive(Debug, Clone)]
pub struct ProxyServer {
    /// Server configuration
    config: ServerConfig,
    /// Proxy core
    core: Arc<ProxyCore>,
    /// Request record sink
    logger: RequestLogger,
    state: Arc<watch::Sender<ServerState>>,
}

impl ProxyServer {
    /// Create a new proxy server with the given configuration and proxy core.
    pub fn new(config: ServerConfig, core: Arc<ProxyCore>, logger: RequestLogger) -> Self {
        let (state, _) = watch::channel(ServerState::NotStarted);
        Self {
            config,
            core,
            logger,
            state: Arc::new(state),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn core(&self) -> &Arc<ProxyCore> {
        &self.core
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Bind the listener and start accepting connections.
    ///
    /// A bind failure is returned here and the server stays
    /// [`ServerState::NotStarted`].  A server can only be started once.
    pub async fn start(&self) -> Result<RunningServer, ProxyError> {
        if self.state() != ServerState::NotStarted {
            return Err(ProxyError::Other("server already started".to_string()));
        }

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ProxyError::Listen {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        info_fmt!(
            "ProxyServer",
            "Veil proxy listening on http://{} -> {}",
            local_addr,
            self.core.config.target_url
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let state_rx = self.state.subscribe();
        self.state.send_replace(ServerState::Running);

        let task = tokio::spawn(serve(
            listener,
            self.core.clone(),
            self.logger.clone(),
            self.config.shutdown_timeout(),
            shutdown_rx,
            self.state.clone(),
        ));

        Ok(RunningServer {
            local_addr,
            state: state_rx,
            shutdown: ShutdownHandle::new(shutdown_tx),
            task,
        })
    }

    /// Start, serve until Ctrl-C or SIGTERM, then drain.
    pub async fn run(&self) -> Result<(), ProxyError> {
        let server = self.start().await?;
        wait_for_signal().await?;
        server.shutdown().await
    }
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
pub async fn wait_for_signal() -> Result<(), ProxyError> {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let mut term_stream = signal(SignalKind::terminate())
        .map_err(|e| ProxyError::Other(format!("Cannot install SIGTERM handler: {e}")))?;
    #[cfg(unix)]
    let sigterm = term_stream.recv();
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = ctrl_c => info_fmt!("ProxyServer", "Received Ctrl-C; initiating graceful shutdown"),
        _ = sigterm => info_fmt!("ProxyServer", "Received SIGTERM; initiating graceful shutdown"),
    }
    Ok(())
}

/// A server that is accepting connections.
#[derive(Debug)]
pub struct RunningServer {
    local_addr: SocketAddr,
    state: watch::Receiver<ServerState>,
    shutdown: ShutdownHandle,
    task: JoinHandle<Result<(), ProxyError>>,
}

impl RunningServer {
    /// The bound address, useful when the configured port was `0`.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Wait until the server reaches `state`.
    pub async fn wait_for_state(&mut self, state: ServerState) {
        let _ = self.state.wait_for(|s| *s == state).await;
    }

    /// Wait for the server to stop.
    ///
    /// Returns [`ProxyError::ShutdownTimeout`] if connections had to be
    /// aborted at the grace deadline.
    pub async fn wait(self) -> Result<(), ProxyError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(ProxyError::Other(format!("server task failed: {e}"))),
        }
    }

    /// Request shutdown and wait for it to finish.
    pub async fn shutdown(self) -> Result<(), ProxyError> {
        self.shutdown.shutdown();
        self.wait().await
    }
}

type ShutdownSenders = Arc<Mutex<HashMap<u64, oneshot::Sender<()>>>>;

async fn serve(
    listener: TcpListener,
    core: Arc<ProxyCore>,
    logger: RequestLogger,
    grace: Duration,
    shutdown_rx: oneshot::Receiver<()>,
    state: Arc<watch::Sender<ServerState>>,
) -> Result<(), ProxyError> {
    let shutdown_senders: ShutdownSenders = Arc::new(Mutex::new(HashMap::new()));
    let mut join_set = JoinSet::new();
    let mut next_conn_id: u64 = 0;

    tokio::pin!(shutdown_rx);

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            Some(res) = join_set.join_next(), if !join_set.is_empty() => {
                if let Err(e) = res {
                    if !e.is_cancelled() {
                        error_fmt!("ProxyServer", "Connection task failed: {}", e);
                    }
                }
            }
            accept = listener.accept() => {
                match accept {
                    Ok((stream, remote_addr)) => {
                        let conn_id = next_conn_id;
                        next_conn_id += 1;

                        let (tx, rx) = oneshot::channel();
                        shutdown_senders.lock().await.insert(conn_id, tx);

                        let core = core.clone();
                        let logger = logger.clone();
                        let senders = shutdown_senders.clone();
                        join_set.spawn(async move {
                            serve_connection(stream, remote_addr, core, logger, rx).await;
                            senders.lock().await.remove(&conn_id);
                            trace_fmt!("ProxyServer", "Connection {} from {} completed", conn_id, remote_addr);
                        });
                    }
                    Err(e) => error_fmt!("ProxyServer", "Accept error: {}", e),
                }
            }
        }
    }

    // Stop accepting connections and signal existing ones to shut down
    state.send_replace(ServerState::Draining);
    drop(listener);

    {
        let mut senders = shutdown_senders.lock().await;
        info_fmt!("ProxyServer", "Draining {} connection(s), grace {:?}", senders.len(), grace);
        for (_, sender) in senders.drain() {
            let _ = sender.send(());
        }
    }

    let start_time = Instant::now();
    let drain = async {
        while let Some(res) = join_set.join_next().await {
            if let Err(e) = res {
                if !e.is_cancelled() {
                    error_fmt!("ProxyServer", "Connection task failed during drain: {}", e);
                }
            }
        }
    };

    let result = match tokio::time::timeout(grace, drain).await {
        Ok(()) => {
            info_fmt!(
                "ProxyServer",
                "All connections drained gracefully in {:.1}s",
                start_time.elapsed().as_secs_f32()
            );
            Ok(())
        }
        Err(_) => {
            warn_fmt!(
                "ProxyServer",
                "Shutdown timed out after {:?}; aborting {} connection(s)",
                grace,
                join_set.len()
            );
            join_set.shutdown().await;
            Err(ProxyError::ShutdownTimeout(grace))
        }
    };

    state.send_replace(ServerState::Stopped);
    info_fmt!("ProxyServer", "Shutdown complete");
    result
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    remote_addr: SocketAddr,
    core: Arc<ProxyCore>,
    logger: RequestLogger,
    shutdown_rx: oneshot::Receiver<()>,
) {
    let service = service_fn(move |req: Request<Incoming>| {
        trace_fmt!("ProxyServer", "Incoming over {:?}", req.version());
        handle_request(req, core.clone(), logger.clone(), remote_addr)
    });
    let io = TokioIo::new(stream);
    let builder = AutoBuilder::new(TokioExecutor::new());
    let mut conn = std::pin::pin!(builder.serve_connection(io, service));

    tokio::select! {
        res = &mut conn => log_connection_result(res),
        _ = shutdown_rx => {
            debug_fmt!("ProxyServer", "Connection from {} asked to close", remote_addr);
            conn.as_mut().graceful_shutdown();
            log_connection_result(conn.await);
        }
    }
}

fn log_connection_result(res: Result<(), Box<dyn std::error::Error + Send + Sync>>) {
    if let Err(e) = res {
        let err_str = e.to_string();
        if err_str.contains("connection closed") || err_str.contains("connection reset") {
            debug_fmt!("ProxyServer", "Connection ended: {}", err_str);
        } else {
            error_fmt!("ProxyServer", "Connection error: {}", err_str);
        }
    }
}

/// Convert a hyper request to a proxy request.  The body is streamed, not
/// buffered.
fn convert_hyper_request(req: Request<Incoming>, remote_addr: SocketAddr) -> ProxyRequest {
    let (parts, body) = req.into_parts();

    let host = parts
        .headers
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| parts.uri.authority().map(|a| a.to_string()))
        .unwrap_or_default();

    ProxyRequest {
        method: parts.method,
        path: parts.uri.path().to_string(),
        query: parts.uri.query().map(str::to_string),
        host,
        headers: parts.headers,
        body: Body::wrap_stream(body.into_data_stream()),
        context: RequestContext {
            client_addr: Some(remote_addr),
            ..RequestContext::default()
        },
    }
}

/// Convert a proxy response to a hyper response.
fn convert_proxy_response(resp: ProxyResponse) -> Response<Body> {
    let mut response = Response::new(resp.body);
    *response.status_mut() = StatusCode::from_u16(resp.status).unwrap_or_else(|_| {
        error_fmt!("ProxyServer", "Refusing to send invalid status {}", resp.status);
        StatusCode::INTERNAL_SERVER_ERROR
    });
    *response.headers_mut() = resp.headers;
    response
}

/// Handle an incoming HTTP request.
async fn handle_request(
    req: Request<Incoming>,
    core: Arc<ProxyCore>,
    logger: RequestLogger,
    remote_addr: SocketAddr,
) -> Result<Response<Body>, Infallible> {
    /* ---- convert Hyper → ProxyRequest ---- */
    let mut proxy_req = convert_hyper_request(req, remote_addr);
    let pending = PendingRecord::from_request(&proxy_req);
    let (body, request_copy) = tee_body(proxy_req.body);
    proxy_req.body = body;

    let method = proxy_req.method.clone();
    let path = proxy_req.path.clone();

    /* ---------- core processing ---------- */
    let proxy_resp = match core.process_request(proxy_req).await {
        Ok(resp) => {
            debug_fmt!("ProxyServer", "{} {} -> {}", method, path, resp.status);
            resp
        }
        Err(e) => {
            let resp = ProxyResponse::from_error(&e);
            match resp.status {
                403 => debug_fmt!("ProxyServer", "{} {} -> 403", method, path),
                status => warn_fmt!("ProxyServer", "{} {} -> {}: {}", method, path, status, e),
            }
            resp
        }
    };

    /* ---------- tee response & log ---------- */
    let (body, response_copy) = tee_body(proxy_resp.body);
    logger.capture(
        pending,
        proxy_resp.status,
        proxy_resp.headers.clone(),
        request_copy,
        response_copy,
    );

    Ok(convert_proxy_response(ProxyResponse {
        status: proxy_resp.status,
        headers: proxy_resp.headers,
        body,
    }))
}
