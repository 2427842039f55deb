//! Broker URL parsing.
//!
//! Accepts `mqtt://`, `tcp://`, `mqtts://`, `ssl://` and `tls://` URLs with
//! optional `user:password@` credentials. A URL without a scheme is plain TCP.

use std::fmt;

use percent_encoding::percent_decode_str;
use url::{Host, Url};

const DEFAULT_TCP_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;

/// Where and how to reach the broker.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name or address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Whether the connection uses TLS.
    pub tls: bool,
    /// User name embedded in the URL.
    pub username: Option<String>,
    /// Password embedded in the URL.
    pub password: Option<String>,
}

/// Unusable broker URL.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EndpointError {
    /// Not a URL at all.
    #[error("invalid broker URL: {0}")]
    Invalid(url::ParseError),
    /// Scheme other than the supported TCP and TLS ones.
    #[error("unsupported broker URL scheme: {0}")]
    UnsupportedScheme(String),
    /// No host.
    #[error("broker URL has no host")]
    MissingHost,
    /// Credentials that are not UTF-8 once decoded.
    #[error("broker URL credentials are not valid UTF-8")]
    InvalidCredentials,
}

impl From<url::ParseError> for EndpointError {
    fn from(error: url::ParseError) -> Self {
        match error {
            url::ParseError::EmptyHost => Self::MissingHost,
            other => Self::Invalid(other),
        }
    }
}

impl Endpoint {
    /// Parse a broker URL.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError`] for malformed URLs, unsupported schemes or a
    /// missing host.
    pub fn parse(url: &str) -> Result<Self, EndpointError> {
        let url = url.trim();
        let url = if url.contains("://") {
            Url::parse(url)?
        } else {
            Url::parse(&format!("mqtt://{url}"))?
        };

        let tls = match url.scheme() {
            "mqtt" | "tcp" => false,
            "mqtts" | "ssl" | "tls" => true,
            other => return Err(EndpointError::UnsupportedScheme(other.to_string())),
        };

        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            _ => return Err(EndpointError::MissingHost),
        };
        let port = url
            .port()
            .unwrap_or(if tls { DEFAULT_TLS_PORT } else { DEFAULT_TCP_PORT });

        let username = Some(decode(url.username())?).filter(|u| !u.is_empty());
        let password = url.password().map(decode).transpose()?;

        Ok(Self {
            host,
            port,
            tls,
            username,
            password,
        })
    }
}

fn decode(raw: &str) -> Result<String, EndpointError> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| EndpointError::InvalidCredentials)
}

/// Credentials are never printed.
impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "mqtts" } else { "mqtt" };
        if self.host.contains(':') {
            write!(f, "{scheme}://[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{scheme}://{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("url", &self.to_string())
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}
