//! Demo server hosting the rpcchan test service over HTTP/1.1.

pub mod app;
pub mod banner;
pub mod config;
pub mod logging;
pub mod signal;

pub use config::{Config, ConfigError};
