//! Broker endpoint URIs and session identities

use super::BrokerError;
use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// Where the broker lives and whether to speak TLS to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl Endpoint {
    /// Parse `scheme://host[:port][/...]`.
    ///
    /// `tcp`/`mqtt` are plain (default port 1883), `ssl`/`mqtts` use TLS
    /// (default port 8883). Without a scheme the URI is treated as `tcp`.
    pub fn parse(uri: &str) -> Result<Self, BrokerError> {
        let uri = uri.trim();
        let invalid = |reason: &str| BrokerError::InvalidEndpoint(format!("{}: {}", uri, reason));

        let (scheme, rest) = match uri.split_once("://") {
            Some((scheme, rest)) => (scheme.to_ascii_lowercase(), rest),
            None => ("tcp".to_string(), uri),
        };

        let (tls, default_port) = match scheme.as_str() {
            "tcp" | "mqtt" => (false, 1883),
            "ssl" | "mqtts" | "tls" => (true, 8883),
            other => return Err(invalid(&format!("unsupported scheme {:?}", other))),
        };

        let authority = rest.split('/').next().unwrap_or_default();
        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            // [v6addr]:port
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 address"))?;
            let port = match after.strip_prefix(':') {
                Some(port) => Some(port),
                None if after.is_empty() => None,
                None => return Err(invalid("garbage after IPv6 address")),
            };
            (host, port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        let port = match port {
            Some(port) => port
                .parse::<u16>()
                .map_err(|_| invalid(&format!("bad port {:?}", port)))?,
            None => default_port,
        };

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "ssl" } else { "tcp" };
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", scheme, self.host, self.port)
        }
    }
}

/// Last creation timestamp handed out in this process
static LAST_ISSUED_MS: AtomicI64 = AtomicI64::new(0);

/// Broker client identifier: principal name plus session creation time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    principal: String,
    created_at_ms: i64,
}

impl SessionIdentity {
    /// New identity stamped with the current time.
    ///
    /// Two identities created in the same millisecond get distinct stamps, so
    /// reconnect attempts from this device never collide on the broker.
    pub fn new(principal: &str) -> Self {
        let now = Utc::now().timestamp_millis();
        let mut last = LAST_ISSUED_MS.load(Ordering::SeqCst);
        let stamp = loop {
            let next = now.max(last + 1);
            match LAST_ISSUED_MS.compare_exchange(last, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => break next,
                Err(actual) => last = actual,
            }
        };
        Self::from_parts(principal, stamp)
    }

    pub fn from_parts(principal: &str, created_at_ms: i64) -> Self {
        Self {
            principal: principal.to_string(),
            created_at_ms,
        }
    }

    pub fn client_id(&self) -> String {
        format!("{}-relay-client-{}", self.principal, self.created_at_ms)
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.created_at_ms).single()
    }
}
