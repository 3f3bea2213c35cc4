//! Error types for the relay.

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Failure to turn an environment id into a backend target.
///
/// Resolution failures are never cached and never retried by the relay; the
/// client resending its first packet is the only recovery path.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// The registry answered but had no usable healthy instance.
    #[error("no healthy instance for {service}")]
    NoHealthyInstance { service: String },

    /// Name lookup failed (DNS error, transport error, bad response).
    #[error("lookup failed for {name}: {detail}")]
    Lookup { name: String, detail: String },

    /// The registry rejected the query.
    #[error("registry query for {service} failed (status={status}): {body}")]
    Registry {
        service: String,
        status: u16,
        body: String,
    },

    /// The resolver did not answer in time.
    #[error("resolution of {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },
}

impl ResolveError {
    /// Short label for logs and counters.
    pub fn kind(&self) -> &'static str {
        match self {
            ResolveError::NoHealthyInstance { .. } => "no_healthy_instance",
            ResolveError::Lookup { .. } => "lookup",
            ResolveError::Registry { .. } => "registry",
            ResolveError::Timeout { .. } => "timeout",
        }
    }
}

/// Failure to obtain signing credentials from the container endpoint.
#[derive(Debug, Error)]
pub enum CredentialsError {
    /// The endpoint could not be reached or its answer not decoded.
    #[error("credentials request to {url} failed: {detail}")]
    Fetch { url: String, detail: String },

    /// The endpoint answered with a non-success status.
    #[error("credentials endpoint {url} returned status {status}")]
    Status { url: String, status: u16 },

    /// The authorization token file could not be read.
    #[error("failed to read authorization token from {path}: {source}")]
    TokenFile {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Data-path errors.
#[derive(Debug, Error)]
pub enum RelayError {
    /// A listener could not be bound. Fatal at startup.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// First packet of a session carried no `pr-<digits>` token.
    #[error("no environment identifier in payload")]
    NoIdentifier,

    /// Environment could not be resolved.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// The session table is at capacity.
    #[error("session limit reached ({limit} sessions)")]
    SessionLimit { limit: usize },

    /// Sending to the target failed.
    #[error("forward to {target} failed: {source}")]
    Send {
        target: SocketAddr,
        #[source]
        source: io::Error,
    },
}
