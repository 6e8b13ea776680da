//! Integration tests for wg-forwarder
//!
//! # Test Organization
//!
//! - `config_file`: configuration files on disk, loaded through `load_config`
//! - `relay_local`: interceptor and relay over plain loopback TCP
//! - `tunnel_e2e`: full path through a real endpoint, driven by a test-side
//!   WireGuard peer with its own userspace TCP/IP stack
//!
//! # Test Requirements
//!
//! Everything runs on loopback; no privileges or real interfaces are needed.

pub mod config_file;
pub mod relay_local;
pub mod support;
pub mod tunnel_e2e;
