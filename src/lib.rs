// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Veil - an intercepting HTTP proxy that enforces request policy and
//! redacts sensitive data from responses.
//!
//! Every request passes through the same pipeline:
//!
//! 1. **Blockers** decide whether the request may proceed.  The first match
//!    answers `403 Forbidden` and the upstream is never contacted.
//! 2. The **forwarding engine** sends the request to the single configured
//!    upstream.  Unreachable upstreams answer `502 Bad Gateway`.
//! 3. For `GET` requests the **maskers** rewrite the response body, e.g.
//!    `alice@example.com` becomes `****@example.com`.  A failing masker fails
//!    the whole response; unmasked data is never sent.
//! 4. A **request record** with both bodies is logged asynchronously.
//!
//! # Configuration
//!
//! ```toml
//! [proxy]
//! target_url = "http://backend:9000"
//! maskers = ["email", "credit_card"]
//!
//! [server]
//! port = 8080
//! shutdown_timeout_secs = 5
//!
//! [[blockers]]
//! type = "header"
//! headers = { "X-Debug" = "1" }
//! ```
//!
//! # Custom blockers
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use veil::{Blocker, ProxyError, ProxyRequest, VeilLoader};
//!
//! #[derive(Debug)]
//! struct NoRobots;
//!
//! #[async_trait]
//! impl Blocker for NoRobots {
//!     fn name(&self) -> &str {
//!         "no_robots"
//!     }
//!
//!     async fn evaluate(&self, request: &ProxyRequest) -> Result<bool, ProxyError> {
//!         Ok(request
//!             .headers
//!             .get("user-agent")
//!             .is_some_and(|ua| ua.as_bytes().starts_with(b"robot")))
//!     }
//! }
//!
//! # async fn run() -> Result<(), veil::LoaderError> {
//! let veil = VeilLoader::new()
//!     .with_config_file("config.toml")
//!     .with_blocker(NoRobots)
//!     .build()
//!     .await?;
//! veil.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod blockers;
pub mod config;
pub mod core;
pub mod loader;
pub mod logging;
pub mod maskers;
pub mod server;

pub use blockers::{BlockOutcome, Blocker, BlockerChain, BlockerFactory};
pub use config::{Config, ConfigError, ConfigProvider, ConfigProviderExt};
pub use core::{ProxyCore, ProxyError, ProxyRequest, ProxyResponse, RequestContext};
pub use loader::{LoaderError, Veil, VeilLoader};
pub use maskers::{Masker, MaskerChain, MaskerFactory};
pub use server::{ProxyServer, RunningServer, ServerConfig, ServerState, ShutdownHandle};
