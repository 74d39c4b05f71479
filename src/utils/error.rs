//! Error handling for the daemon
//!
//! This module defines all error types used throughout the daemon.

#![allow(missing_docs)]

use thiserror::Error;

/// Result type alias for the daemon
pub type Result<T> = std::result::Result<T, HealthError>;

/// Main error type for the daemon
#[derive(Error, Debug)]
pub enum HealthError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Docker engine errors
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// HTTP client errors
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Elasticsearch API errors
    #[error("Elasticsearch error: {0}")]
    Elasticsearch(String),

    /// Consul API errors
    #[error("Consul error: {0}")]
    Consul(String),

    /// History persistence errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// Host system probe errors
    #[error("System probe error: {0}")]
    System(String),

    /// Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
}
