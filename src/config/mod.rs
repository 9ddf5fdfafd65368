//! Configuration module for Crawl Conductor
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//! Every field has a default, so an empty file yields a usable configuration.
//!
//! # Example
//!
//! ```no_run
//! use crawl_conductor::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("conductor.toml")).unwrap();
//! println!("Max retries: {}", config.retry.max_retries);
//! ```

mod parser;
mod types;
mod validation;

pub use types::{
    Config, CrawlerConfig, LogLevel, LoggingConfig, QueueConfig, RetryConfig, StorageConfig,
    DEFAULT_RETRY_HTTP_CODES,
};

pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
pub use validation::validate;
