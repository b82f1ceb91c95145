// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Minimal CLI wrapper so the library can run as a stand-alone proxy.
//!
//!  Build it with `cargo build --release --bin veil`
//!  The binary honours VEIL_CONFIG_FILE, then its first argument, and
//!  falls back to ./config.toml.

use std::env;
use std::error::Error;
use std::time::Duration;
use veil::{Veil, error_fmt, info_fmt, warn_fmt};

const FALLBACK_CONFIG_PATH: &str = "./config.toml";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    println!("Starting Veil");

    let config_path = env::var("VEIL_CONFIG_FILE")
        .ok()
        .or_else(|| env::args().nth(1))
        .unwrap_or_else(|| FALLBACK_CONFIG_PATH.to_string());

    println!("Using configuration from {config_path}");

    // Environment variables override the file
    let loader = Veil::loader()
        .with_config_file(&config_path)
        .with_env_vars();

    let proxy = match loader.build().await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Failed to build proxy: {e}");
            return Err(e.into());
        }
    };

    let result = proxy.run().await;

    // Let the async log drains flush
    tokio::time::sleep(Duration::from_secs(1)).await;

    match result {
        Ok(()) => {
            info_fmt!("Veil", "Proxy server stopped gracefully");
            Ok(())
        }
        Err(e) if !e.is_fatal() => {
            warn_fmt!("Veil", "Proxy server stopped: {}", e);
            Ok(())
        }
        Err(e) => {
            error_fmt!("Veil", "Proxy server failed: {}", e);
            Err(e.into())
        }
    }
}
