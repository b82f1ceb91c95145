// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! High-level entry-point – "turn the key and go".
//!
//! The [`VeilLoader`] consumes configuration, builds the blocker and masker
//! chains and the forwarding client, and returns a [`Veil`] ready to serve.
//!
//! ```rust,no_run
//! # async fn run() -> Result<(), veil::LoaderError> {
//! let veil = veil::VeilLoader::new()
//!     .with_config_file("config.toml")
//!     .with_env_vars()
//!     .build()
//!     .await?;
//! veil.run().await?;
//! # Ok(())
//! # }
//! ```


use std::sync::Arc;
use thiserror::Error;

use crate::blockers::{Blocker, BlockerChain};
use crate::config::{
    BlockerConfig, Config, ConfigError, ConfigProvider, EnvConfigProvider, FileConfigProvider,
    ProxyConfig,
};
use crate::core::{ProxyCore, ProxyError};
use crate::logging::{self, LoggingConfig, RequestLogger};
use crate::maskers::{Masker, MaskerChain};
use crate::server::{ProxyServer, RunningServer, ServerConfig};
use crate::{debug_fmt, info_fmt};

/// Errors that can occur during Veil initialization.
#[derive(Error, Debug)]
pub enum LoaderError {
    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigError(#[from] ConfigError),

    /// Proxy error
    #[error("proxy error: {0}")]
    ProxyError(#[from] ProxyError),

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl LoaderError {
    /// Whether the process should exit with a failure.  A shutdown that hit
    /// its grace deadline still stopped the server and is only reported.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, LoaderError::ProxyError(ProxyError::ShutdownTimeout(_)))
    }
}

/// Builder for initializing and configuring Veil.
#[derive(Debug, Default)]
pub struct VeilLoader {
    config: Option<Config>,
    providers: Vec<Arc<dyn ConfigProvider>>,
    config_file_path: Option<String>,
    use_env_vars: bool,
    env_prefix: Option<String>,
    custom_blockers: Vec<Arc<dyn Blocker>>,
    custom_maskers: Vec<Arc<dyn Masker>>,
}

impl VeilLoader {
    /// Create a new Veil loader with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a fully built configuration; other sources are ignored.
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set a configuration file to load.
    pub fn with_config_file(mut self, file_path: &str) -> Self {
        self.config_file_path = Some(file_path.to_string());
        self
    }

    /// Enable environment variable configuration.
    pub fn with_env_vars(mut self) -> Self {
        self.use_env_vars = true;
        self
    }

    /// Set a custom prefix for environment variables (default is "VEIL_").
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = Some(prefix.to_string());
        self.use_env_vars = true;
        self
    }

    /// Add a custom configuration provider.  It overrides the file and
    /// environment providers.
    pub fn with_provider<P: ConfigProvider + 'static>(mut self, provider: P) -> Self {
        self.providers.push(Arc::new(provider));
        self
    }

    /// Append a blocker after the configured ones.
    pub fn with_blocker<B: Blocker + 'static>(mut self, blocker: B) -> Self {
        self.custom_blockers.push(Arc::new(blocker));
        self
    }

    /// Append a masker after the configured ones.
    pub fn with_masker<M: Masker + 'static>(mut self, masker: M) -> Self {
        self.custom_maskers.push(Arc::new(masker));
        self
    }

    fn build_config(&mut self) -> Result<Config, ConfigError> {
        if let Some(config) = self.config.take() {
            return Ok(config);
        }

        let mut builder = Config::builder();

        if let Some(file_path) = &self.config_file_path {
            builder = builder.with_provider(FileConfigProvider::new(file_path)?);
        }

        if self.use_env_vars {
            let env_provider = match &self.env_prefix {
                Some(prefix) => EnvConfigProvider::new(prefix),
                None => EnvConfigProvider::default(),
            };
            builder = builder.with_provider(env_provider);
        }

        for provider in self.providers.drain(..) {
            builder = builder.with_shared_provider(provider);
        }

        Ok(builder.build())
    }

    /// Build and initialize Veil.
    ///
    /// Every configuration problem is reported here, before anything binds.
    pub async fn build(mut self) -> Result<Veil, LoaderError> {
        let config = self.build_config()?;

        let logging_config: LoggingConfig =
            config.get_or_default("logging", LoggingConfig::default())?;
        logging::init_with_config(logging_config.level_filter(), &logging_config);

        info_fmt!("Startup", "Veil starting up");

        let proxy_config: ProxyConfig = config.require("proxy")?;
        let target = proxy_config.target()?;
        let server_config: ServerConfig = config.get_or_default("server", ServerConfig::default())?;
        let blocker_configs: Vec<BlockerConfig> = config.get_or_default("blockers", Vec::new())?;

        let mut blockers = BlockerChain::from_config(&blocker_configs)?;
        for blocker in self.custom_blockers {
            blockers.push(blocker);
        }

        let mut maskers = MaskerChain::from_kinds(&proxy_config.maskers);
        for masker in self.custom_maskers {
            maskers.push(masker);
        }

        info_fmt!("Startup", "Upstream: {}", target);
        info_fmt!("Startup", "Blockers: {:?}", blockers.names());
        info_fmt!("Startup", "Maskers: {:?}", maskers.names());

        let core = ProxyCore::new(proxy_config, blockers, maskers)?;
        let request_logger = RequestLogger::from_config(&logging_config);
        debug_fmt!("Startup", "Request logging: {:?}", request_logger.config());

        let server = ProxyServer::new(server_config, Arc::new(core), request_logger);

        Ok(Veil {
            config: Arc::new(config),
            server,
        })
    }
}

/// Main Veil struct that holds the initialized proxy.
#[derive(Debug, Clone)]
pub struct Veil {
    config: Arc<Config>,
    server: ProxyServer,
}

impl Veil {
    /// Create a new loader for initializing Veil.
    pub fn loader() -> VeilLoader {
        VeilLoader::new()
    }

    /// Get the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn server(&self) -> &ProxyServer {
        &self.server
    }

    /// Bind and start serving in the background.
    pub async fn start(&self) -> Result<RunningServer, LoaderError> {
        self.server.start().await.map_err(LoaderError::ProxyError)
    }

    /// Serve until Ctrl-C or SIGTERM, then drain.
    pub async fn run(&self) -> Result<(), LoaderError> {
        self.server.run().await.map_err(LoaderError::ProxyError)
    }
}
