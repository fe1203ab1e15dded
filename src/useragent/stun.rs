use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use webrtc::ice::url::{ProtoType, SchemeType, Url};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StunScheme {
    Stun,
    Stuns,
    Turn,
    Turns,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StunTransport {
    Udp,
    Tcp,
}

/// STUN/TURN server URI, RFC 7064 / RFC 7065:
/// `stun:host[:port]`, `turn:host[:port][?transport=udp|tcp]`.
/// Parsed by the ICE agent's URL parser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StunUri {
    pub scheme: StunScheme,
    pub host: String,
    pub port: u16,
    pub transport: StunTransport,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StunUriError {
    #[error("unsupported scheme in `{0}`")]
    Scheme(String),
    #[error("invalid STUN uri `{uri}`: {reason}")]
    Invalid { uri: String, reason: String },
}

impl fmt::Display for StunScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StunScheme::Stun => "stun",
            StunScheme::Stuns => "stuns",
            StunScheme::Turn => "turn",
            StunScheme::Turns => "turns",
        };
        f.write_str(s)
    }
}

impl fmt::Display for StunTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StunTransport::Udp => f.write_str("udp"),
            StunTransport::Tcp => f.write_str("tcp"),
        }
    }
}

impl TryFrom<Url> for StunUri {
    type Error = StunUriError;

    fn try_from(url: Url) -> Result<Self, Self::Error> {
        let scheme = match url.scheme {
            SchemeType::Stun => StunScheme::Stun,
            SchemeType::Stuns => StunScheme::Stuns,
            SchemeType::Turn => StunScheme::Turn,
            SchemeType::Turns => StunScheme::Turns,
            _ => return Err(StunUriError::Scheme(url.host)),
        };
        let transport = match url.proto {
            ProtoType::Tcp => StunTransport::Tcp,
            _ => StunTransport::Udp,
        };
        Ok(StunUri {
            scheme,
            host: url.host,
            port: url.port,
            transport,
        })
    }
}

impl FromStr for StunUri {
    type Err = StunUriError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let url = Url::parse_url(s).map_err(|e| StunUriError::Invalid {
            uri: s.to_string(),
            reason: e.to_string(),
        })?;
        StunUri::try_from(url).map_err(|_| StunUriError::Scheme(s.to_string()))
    }
}

impl fmt::Display for StunUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}:[{}]:{}", self.scheme, self.host, self.port)?;
        } else {
            write!(f, "{}:{}:{}", self.scheme, self.host, self.port)?;
        }
        match self.scheme {
            StunScheme::Turn | StunScheme::Turns => write!(f, "?transport={}", self.transport),
            StunScheme::Stun | StunScheme::Stuns => Ok(()),
        }
    }
}
