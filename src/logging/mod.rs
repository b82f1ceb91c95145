// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Logging for Veil.
//!
//! Two streams leave the proxy:
//!
//! * operational messages through the `log` facade and the `*_fmt!` macros,
//!   printed by env_logger or, with `logging.structured = true`, forwarded
//!   into slog;
//! * one request record per exchange, written by [`RequestLogger`] through
//!   an asynchronous slog drain.

pub mod config;
pub mod request;
pub mod structured;
mod wrapper;


pub use config::LoggingConfig;
pub use request::{BodyCopy, LogRecord, PendingRecord, RequestLogger, tee_body};

use log::{LevelFilter, info, warn};
use std::sync::Once;
use std::sync::atomic::{AtomicBool, Ordering};

static INIT: Once = Once::new();
static USING_STRUCTURED: AtomicBool = AtomicBool::new(false);

/// Initialize env_logger at `level` unless `RUST_LOG` says otherwise.
///
/// Only the first call has any effect.
pub fn init(level: Option<LevelFilter>) {
    INIT.call_once(|| init_env_logger(level.unwrap_or(LevelFilter::Info)));
}

/// Initialize operational logging from `config`.
///
/// Only the first call has any effect.
pub fn init_with_config(level: LevelFilter, config: &LoggingConfig) {
    INIT.call_once(|| {
        if config.structured {
            match structured::init_global_logger(&config.to_logger_config(), level) {
                Ok(()) => {
                    USING_STRUCTURED.store(true, Ordering::SeqCst);
                    info!("Structured logging initialized at level: {}", level);
                }
                Err(e) => {
                    // Someone else owns the `log` backend; keep theirs
                    warn!("Structured logging unavailable: {}", e);
                }
            }
        } else {
            init_env_logger(level);
        }
    });
}

/// Whether operational logs are routed through slog.
pub fn is_structured() -> bool {
    USING_STRUCTURED.load(Ordering::SeqCst)
}

fn init_env_logger(level: LevelFilter) {
    let default_filter = level.to_string().to_lowercase();
    let env = env_logger::Env::default().filter_or("RUST_LOG", default_filter);

    // try_init: a test harness may have installed a logger already
    if env_logger::Builder::from_env(env)
        .format_timestamp_millis()
        .format_target(true)
        .try_init()
        .is_ok()
    {
        info!("Logging initialized at level: {}", log::max_level());
    }
}
