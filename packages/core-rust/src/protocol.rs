//! Transport protocol enumeration for inbound units of work.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Transport family of an inbound request, message, or call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KoattyProtocol {
    Http,
    Https,
    Ws,
    Wss,
    Grpc,
    Graphql,
}

impl KoattyProtocol {
    /// Every supported protocol, in declaration order.
    pub const ALL: [KoattyProtocol; 6] = [
        Self::Http,
        Self::Https,
        Self::Ws,
        Self::Wss,
        Self::Grpc,
        Self::Graphql,
    ];

    /// Lowercase wire name (`"http"`, `"grpc"`, ...).
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Https => "https",
            Self::Ws => "ws",
            Self::Wss => "wss",
            Self::Grpc => "grpc",
            Self::Graphql => "graphql",
        }
    }

    /// `ws` or `wss`.
    #[must_use]
    pub fn is_websocket(self) -> bool {
        matches!(self, Self::Ws | Self::Wss)
    }

    /// Whether the protocol is carried over a TLS listener.
    #[must_use]
    pub fn is_secure(self) -> bool {
        matches!(self, Self::Https | Self::Wss)
    }
}

impl fmt::Display for KoattyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a protocol string is outside the supported set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported protocol `{0}`, expected one of http, https, ws, wss, grpc, graphql")]
pub struct UnknownProtocol(pub String);

impl FromStr for KoattyProtocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| UnknownProtocol(s.to_string()))
    }
}
