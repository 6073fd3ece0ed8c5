//! # Receiver Topology
//!
//! Parsing and validation of the receiver / authentication URL expressions
//! that describe where events are published.
//!
//! ## Grammar
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Topology Expression Grammar                        │
//! │                                                                         │
//! │  topology := alt ( "," alt )*          failover alternatives           │
//! │  alt      := url ( "|" url )*          load-balanced endpoints         │
//! │  url      := scheme "://" host ":" port                                 │
//! │                                                                         │
//! │  Braces may wrap the whole topology:  {alt,alt}  ≡  alt,alt            │
//! │                                                                         │
//! │  Example:                                                              │
//! │    {tcp://a:7611|tcp://b:7611 , tcp://c:7611}                          │
//! │     └──── tier 0 (primary) ───┘ └ tier 1 ──┘                           │
//! │      round-robin between a, b    used when a and b are both down       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Pairing Rules
//! The receiver expression (data channels) and the auth expression (control
//! channels) must have the SAME SHAPE:
//! - identical number of failover alternatives
//! - identical number of endpoints inside each alternative
//!
//! Pairing is positional: the i-th receiver URL of tier t authenticates via
//! the i-th auth URL of tier t. Any mismatch is a configuration error and is
//! reported before a single connection is attempted.
//!
//! ## Usage
//! ```rust
//! use databridge_core::topology::Topology;
//!
//! let topology = Topology::parse("tcp://localhost:9661", Some("ssl://localhost:9761")).unwrap();
//! assert_eq!(topology.group_count(), 1);
//! assert_eq!(topology.endpoint_count(), 1);
//!
//! // Shape mismatch: 2 receiver URLs, 1 auth URL in the only tier
//! assert!(Topology::parse("{tcp://h:9129|tcp://h:9229}", Some("{ssl://h:9130}")).is_err());
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{CoreError, CoreResult, UrlError};

/// Port offset used to derive the control channel when no auth URLs are given.
///
/// `tcp://host:7611` authenticates through `ssl://host:7711`.
pub const SECURE_PORT_OFFSET: u16 = 100;

/// Scheme used for derived control channel URLs.
pub const SECURE_SCHEME: &str = "ssl";

const ALTERNATIVE_SEPARATOR: char = ',';
const LOAD_BALANCE_SEPARATOR: char = '|';

// =============================================================================
// Receiver URL
// =============================================================================

/// A validated `scheme://host:port` URL for one data or control channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReceiverUrl {
    scheme: String,
    host: String,
    port: u16,
}

impl ReceiverUrl {
    /// Parses and validates a single URL.
    ///
    /// ## Rules
    /// - Must parse as an absolute URL with an authority component
    /// - Host is required, port is required
    /// - No user info, path (other than `/`), query or fragment
    pub fn parse(raw: &str) -> Result<Self, UrlError> {
        let raw = raw.trim();
        let url = Url::parse(raw).map_err(|e| UrlError::Unparseable {
            url: raw.to_string(),
            reason: e.to_string(),
        })?;

        if url.cannot_be_a_base() {
            return Err(UrlError::Unparseable {
                url: raw.to_string(),
                reason: "expected scheme://host:port".to_string(),
            });
        }

        let scheme = url.scheme();
        if !scheme
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '.' | '-'))
        {
            return Err(UrlError::InvalidScheme {
                url: raw.to_string(),
            });
        }

        let host = match url.host_str() {
            Some(host) if !host.is_empty() => host.to_string(),
            _ => {
                return Err(UrlError::MissingHost {
                    url: raw.to_string(),
                })
            }
        };

        let port = url.port().ok_or_else(|| UrlError::MissingPort {
            url: raw.to_string(),
        })?;

        let has_path = !(url.path().is_empty() || url.path() == "/");
        if has_path
            || url.query().is_some()
            || url.fragment().is_some()
            || !url.username().is_empty()
            || url.password().is_some()
        {
            return Err(UrlError::UnexpectedComponent {
                url: raw.to_string(),
            });
        }

        Ok(ReceiverUrl {
            scheme: scheme.to_string(),
            host,
            port,
        })
    }

    /// Creates a URL from already-validated parts.
    pub fn new(scheme: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        ReceiverUrl {
            scheme: scheme.into(),
            host: host.into(),
            port,
        }
    }

    /// URL scheme (`tcp`, `ssl`, ...).
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Host name or address. IPv6 hosts keep their brackets.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port number.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns `host:port`, suitable for `TcpStream::connect`.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Returns true for the secure (`ssl`) scheme.
    pub fn is_secure(&self) -> bool {
        self.scheme == SECURE_SCHEME
    }

    /// Derives the default control channel URL for this receiver.
    ///
    /// ```rust
    /// use databridge_core::topology::ReceiverUrl;
    ///
    /// let data = ReceiverUrl::parse("tcp://localhost:7611").unwrap();
    /// let auth = data.derive_secure().unwrap();
    /// assert_eq!(auth.to_string(), "ssl://localhost:7711");
    /// ```
    pub fn derive_secure(&self) -> Result<ReceiverUrl, UrlError> {
        let port = self
            .port
            .checked_add(SECURE_PORT_OFFSET)
            .ok_or_else(|| UrlError::Unparseable {
                url: self.to_string(),
                reason: format!("port {} + {} overflows", self.port, SECURE_PORT_OFFSET),
            })?;

        Ok(ReceiverUrl::new(SECURE_SCHEME, self.host.clone(), port))
    }
}

impl fmt::Display for ReceiverUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

impl FromStr for ReceiverUrl {
    type Err = UrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReceiverUrl::parse(s)
    }
}

// =============================================================================
// Topology Shape
// =============================================================================

/// Parses one topology expression into its nested shape.
///
/// The outer vector holds failover alternatives in priority order, the inner
/// vectors the load-balanced URLs of each alternative in declaration order.
pub fn parse_expression(expression: &str) -> CoreResult<Vec<Vec<ReceiverUrl>>> {
    let malformed = |reason: &str| CoreError::MalformedTopology {
        expression: expression.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = expression.trim();
    if trimmed.is_empty() {
        return Err(malformed("expression is empty"));
    }

    let body = match trimmed.strip_prefix('{') {
        Some(rest) => rest
            .strip_suffix('}')
            .ok_or_else(|| malformed("missing closing brace"))?,
        None => trimmed,
    };

    if body.contains(['{', '}']) {
        return Err(malformed("braces may only wrap the whole expression"));
    }

    let mut groups = Vec::new();
    for alternative in body.split(ALTERNATIVE_SEPARATOR) {
        let alternative = alternative.trim();
        if alternative.is_empty() {
            return Err(malformed("empty failover alternative"));
        }

        let mut urls = Vec::new();
        for raw in alternative.split(LOAD_BALANCE_SEPARATOR) {
            let raw = raw.trim();
            if raw.is_empty() {
                return Err(malformed("empty load-balanced endpoint"));
            }
            urls.push(ReceiverUrl::parse(raw)?);
        }
        groups.push(urls);
    }

    Ok(groups)
}

// =============================================================================
// Validated Topology
// =============================================================================

/// One receiver with the control channel it authenticates through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointUrls {
    /// Data channel (events are sent here).
    pub receiver: ReceiverUrl,
    /// Control channel (sessions are obtained here).
    pub auth: ReceiverUrl,
}

/// One failover tier: endpoints load-balanced with each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyGroup {
    endpoints: Vec<EndpointUrls>,
}

impl TopologyGroup {
    /// Endpoints in declaration order. Never empty.
    pub fn endpoints(&self) -> &[EndpointUrls] {
        &self.endpoints
    }

    /// Number of endpoints in this tier.
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    /// Always false for a parsed group; kept for API symmetry.
    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }
}

/// A validated receiver topology.
///
/// ## Invariants
/// - At least one group, every group non-empty
/// - Receiver and auth expressions had identical shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    groups: Vec<TopologyGroup>,
}

impl Topology {
    /// Parses a receiver expression and an optional auth expression.
    ///
    /// When `auth_expression` is `None` (or blank), each receiver's control
    /// channel is derived with [`ReceiverUrl::derive_secure`].
    pub fn parse(receiver_expression: &str, auth_expression: Option<&str>) -> CoreResult<Self> {
        let receivers = parse_expression(receiver_expression)?;

        let auths = match auth_expression.map(str::trim).filter(|s| !s.is_empty()) {
            Some(expr) => parse_expression(expr)?,
            None => receivers
                .iter()
                .map(|group| {
                    group
                        .iter()
                        .map(|url| url.derive_secure().map_err(CoreError::from))
                        .collect::<CoreResult<Vec<_>>>()
                })
                .collect::<CoreResult<Vec<_>>>()?,
        };

        Self::pair(receivers, auths)
    }

    /// Zips two parsed shapes, rejecting any cardinality mismatch.
    pub fn pair(
        receivers: Vec<Vec<ReceiverUrl>>,
        auths: Vec<Vec<ReceiverUrl>>,
    ) -> CoreResult<Self> {
        if receivers.len() != auths.len() {
            return Err(CoreError::GroupCountMismatch {
                receiver: receivers.len(),
                auth: auths.len(),
            });
        }

        let mut groups = Vec::with_capacity(receivers.len());
        for (index, (receiver_group, auth_group)) in
            receivers.into_iter().zip(auths).enumerate()
        {
            if receiver_group.len() != auth_group.len() {
                return Err(CoreError::EndpointCountMismatch {
                    group: index,
                    receiver: receiver_group.len(),
                    auth: auth_group.len(),
                });
            }
            if receiver_group.is_empty() {
                return Err(CoreError::MalformedTopology {
                    expression: format!("group {}", index),
                    reason: "empty failover alternative".to_string(),
                });
            }

            let endpoints = receiver_group
                .into_iter()
                .zip(auth_group)
                .map(|(receiver, auth)| EndpointUrls { receiver, auth })
                .collect();
            groups.push(TopologyGroup { endpoints });
        }

        if groups.is_empty() {
            return Err(CoreError::MalformedTopology {
                expression: String::new(),
                reason: "no failover groups".to_string(),
            });
        }

        Ok(Topology { groups })
    }

    /// Failover tiers in priority order (index 0 = primary).
    pub fn groups(&self) -> &[TopologyGroup] {
        &self.groups
    }

    /// Number of failover tiers.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Total number of endpoints across all tiers.
    pub fn endpoint_count(&self) -> usize {
        self.groups.iter().map(TopologyGroup::len).sum()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
