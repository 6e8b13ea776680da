//! Configuration module for wg-forwarder
//!
//! This module provides configuration types and loading utilities.
//!
//! # Example
//!
//! ```no_run
//! use wg_forwarder::config::load_config;
//!
//! let config = load_config("/etc/wg-forwarder.conf").unwrap();
//! println!("Intercepting port {}", config.tunnel.intercept_port);
//! ```

mod loader;
mod types;

pub use loader::{
    load_config, load_config_str, load_config_with_env, parse_allowed_ip, parse_lines,
    KEY_ALLOWED_IP, KEY_INTERCEPT_IP, KEY_INTERCEPT_PORT, KEY_LISTEN_PORT, KEY_PRIVATE_KEY,
    KEY_PUBLIC_KEY,
};
pub use types::{
    Config, LogConfig, RelayConfig, TunnelConfig, TunnelOptions, UpstreamTarget, DEFAULT_MTU,
};
