//! Error handling for the Bloom data layer

use std::fmt;
use thiserror::Error;

/// Unified error type for the Bloom data layer
#[derive(Error, Debug)]
pub enum Error {
    /// The remote store rejected or failed a request. Surfaced, never retried.
    #[error("Remote store error: {0}")]
    RemoteStore(String),

    /// Input rejected before any store call
    #[error("Validation error: {0}")]
    Validation(String),

    /// A stored row does not have the shape of its collection's record
    #[error("Unexpected {collection} row shape: {message}")]
    Shape {
        collection: &'static str,
        message: String,
    },

    /// Position or reverse-geocoding failure
    #[error("Geolocation error: {0}")]
    Geolocation(String),

    /// Authentication errors
    #[error("Authentication error: {0}")]
    Auth(String),

    /// JSON serialization or deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Delimited-text read/write errors
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// File system errors while reading imports or writing exports
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network or HTTP related errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// URL parsing errors
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// Missing or invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new remote store error
    pub fn remote_store<T: fmt::Display>(msg: T) -> Self {
        Error::RemoteStore(msg.to_string())
    }

    /// Create a new validation error
    pub fn validation<T: fmt::Display>(msg: T) -> Self {
        Error::Validation(msg.to_string())
    }

    /// Create a new shape error for the given collection
    pub fn shape<T: fmt::Display>(collection: &'static str, msg: T) -> Self {
        Error::Shape {
            collection,
            message: msg.to_string(),
        }
    }

    /// Create a new geolocation error
    pub fn geolocation<T: fmt::Display>(msg: T) -> Self {
        Error::Geolocation(msg.to_string())
    }

    /// Create a new authentication error
    pub fn auth<T: fmt::Display>(msg: T) -> Self {
        Error::Auth(msg.to_string())
    }

    /// Create a new configuration error
    pub fn config<T: fmt::Display>(msg: T) -> Self {
        Error::Config(msg.to_string())
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Error::Validation(_))
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, Error::Auth(_))
    }
}

impl From<bloom_postgrest::PostgrestError> for Error {
    fn from(err: bloom_postgrest::PostgrestError) -> Self {
        Error::RemoteStore(err.to_string())
    }
}

impl From<bloom_realtime::RealtimeError> for Error {
    fn from(err: bloom_realtime::RealtimeError) -> Self {
        Error::RemoteStore(err.to_string())
    }
}

impl From<bloom_auth::AuthError> for Error {
    fn from(err: bloom_auth::AuthError) -> Self {
        Error::Auth(err.to_string())
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;
