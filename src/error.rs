//! Error types for the proxy

use std::io;
use thiserror::Error;
use tokio_rustls::rustls;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for proxy operations
#[derive(Error, Debug)]
pub enum Error {
  /// IO error
  #[error("IO error: {0}")]
  Io(io::Error),

  /// TLS error reported by rustls
  #[error("TLS error: {0}")]
  Tls(rustls::Error),

  /// HTTP building error
  #[error("HTTP error: {0}")]
  Http(http::Error),

  /// Certificate generation, parsing or persistence failed
  #[error("Certificate error: {0}")]
  Certificate(String),

  /// No root CA is available, so no leaf can be issued
  #[error("Certificate unavailable: {0}")]
  CertificateUnavailable(String),

  /// Invalid request
  #[error("Invalid request: {0}")]
  InvalidRequest(String),

  /// The chained upstream proxy refused or mangled the CONNECT handshake
  #[error("Proxy connect error: {0}")]
  ProxyConnect(String),

  /// Connection error
  #[error("Connection error: {0}")]
  Connection(String),

  /// An upstream operation exceeded the configured timeout
  #[error("Timeout: {0}")]
  Timeout(String),

  /// A handler invoked `next()` more than once
  #[error("next() called multiple times by the handler at position {position}")]
  NextCalledTwice {
    /// Pipeline position of the offending handler
    position: usize,
  },

  /// Other errors
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Create a certificate error and log it
  pub fn certificate_error(msg: impl Into<String>) -> Self {
    let error = Error::Certificate(msg.into());
    tracing::error!("Certificate error: {}", error);
    error
  }

  /// Create a certificate unavailable error and log it
  pub fn certificate_unavailable(msg: impl Into<String>) -> Self {
    let error = Error::CertificateUnavailable(msg.into());
    tracing::error!("Certificate unavailable: {}", error);
    error
  }

  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::warn!("Invalid request: {}", error);
    error
  }

  /// Create a proxy connect error and log it
  pub fn proxy_connect(msg: impl Into<String>) -> Self {
    let error = Error::ProxyConnect(msg.into());
    tracing::warn!("Proxy connect error: {}", error);
    error
  }

  /// Create a connection error and log it
  pub fn connection_error(msg: impl Into<String>) -> Self {
    let error = Error::Connection(msg.into());
    tracing::warn!("Connection error: {}", error);
    error
  }

  /// Create a timeout error and log it
  pub fn timeout(msg: impl Into<String>) -> Self {
    let error = Error::Timeout(msg.into());
    tracing::warn!("Timeout: {}", error);
    error
  }

  /// Create a double `next()` error and log it
  pub fn next_called_twice(position: usize) -> Self {
    let error = Error::NextCalledTwice { position };
    tracing::error!("Pipeline error: {}", error);
    error
  }

  /// Create an other error and log it
  pub fn other(msg: impl Into<String>) -> Self {
    let error = Error::Other(msg.into());
    tracing::error!("Other error: {}", error);
    error
  }

  /// Whether this error came from an expired upstream deadline.
  pub fn is_timeout(&self) -> bool {
    match self {
      Error::Timeout(_) => true,
      Error::Io(e) => e.kind() == io::ErrorKind::TimedOut,
      _ => false,
    }
  }
}

impl From<io::Error> for Error {
  fn from(value: io::Error) -> Self {
    let error = Error::Io(value);
    tracing::debug!("IO error: {}", error);
    error
  }
}

impl From<rustls::Error> for Error {
  fn from(value: rustls::Error) -> Self {
    let error = Error::Tls(value);
    tracing::warn!("TLS error: {}", error);
    error
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    let error = Error::Http(value);
    tracing::error!("HTTP error: {}", error);
    error
  }
}

impl From<rcgen::Error> for Error {
  fn from(value: rcgen::Error) -> Self {
    Error::certificate_error(value.to_string())
  }
}

pub(crate) fn new_io_error(kind: io::ErrorKind, msg: &str) -> Error {
  Error::Io(io::Error::new(kind, msg))
}
