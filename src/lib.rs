//! Storefront gate - the same-origin front door of the storefront
//!
//! This library provides a small HTTP server that:
//! - Serves the prebuilt single-page storefront from the first usable build directory
//! - Falls back to `index.html` for client-side routes
//! - Streams every request under the API prefix to the REST backend, untouched apart from Host
//! - Binds the first free port from an ordered candidate list

pub mod assets;
pub mod config;
pub mod error;
pub mod listener;
pub mod proxy;
pub mod upstream;

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
