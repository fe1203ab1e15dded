use anyhow::Error;
use clap::Parser;
use serde::{Deserialize, Serialize};

pub(crate) const USER_AGENT: &str = concat!("sipua-gateway/", env!("CARGO_PKG_VERSION"));
const DEFAULT_RTP_PORT_MIN: u16 = 10000;
const DEFAULT_RTP_PORT_MAX: u16 = 20000;
const DEFAULT_RTP_TIMEOUT: u32 = 0;
const DEFAULT_COMMAND_QUEUE_CAPACITY: usize = 1024;

#[derive(Parser, Debug)]
#[command(version)]
pub struct Cli {
    #[clap(long, default_value = "sipua-gateway.toml")]
    pub conf: Option<String>,
    /// Place a call to this URI once the first account is registered
    #[clap(long)]
    pub call: Option<String>,
    /// Request audio only when placing the call
    #[clap(long, default_value_t = false)]
    pub no_video: bool,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    #[serde(default)]
    pub sip: GatewayConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

/// Process-wide SIP/media settings, applied once before any agent starts.
/// Zero ports or timeout keep the built-in defaults.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub prefer_ipv6: bool,
    #[serde(default, rename = "minport")]
    pub min_port: u32,
    #[serde(default, rename = "maxport")]
    pub max_port: u32,
    #[serde(default, rename = "rtp_timeout")]
    pub rtp_timeout_secs: u32,
    /// Media NAT plugin appended to every agent account, e.g. `ice`
    #[serde(default, rename = "mnat")]
    pub media_nat: Option<String>,
    pub user_agent: Option<String>,
    pub command_queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccountConfig {
    pub server: String,
    pub username: String,
    pub password: String,
    pub display_name: Option<String>,
    pub transport: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            prefer_ipv6: false,
            min_port: 0,
            max_port: 0,
            rtp_timeout_secs: 0,
            media_nat: None,
            user_agent: Some(USER_AGENT.to_string()),
            command_queue_capacity: Some(DEFAULT_COMMAND_QUEUE_CAPACITY),
        }
    }
}

impl GatewayConfig {
    /// RTP port range after applying defaults. An inverted or out of range
    /// pair falls back to the default range.
    pub fn rtp_port_range(&self) -> (u16, u16) {
        let min = match self.min_port {
            0 => DEFAULT_RTP_PORT_MIN,
            p => u16::try_from(p).unwrap_or(DEFAULT_RTP_PORT_MIN),
        };
        let max = match self.max_port {
            0 => DEFAULT_RTP_PORT_MAX,
            p => u16::try_from(p).unwrap_or(DEFAULT_RTP_PORT_MAX),
        };
        if min > max {
            (DEFAULT_RTP_PORT_MIN, DEFAULT_RTP_PORT_MAX)
        } else {
            (min, max)
        }
    }

    pub fn rtp_timeout(&self) -> u32 {
        match self.rtp_timeout_secs {
            0 => DEFAULT_RTP_TIMEOUT,
            t => t,
        }
    }

    pub fn media_nat(&self) -> Option<&str> {
        self.media_nat.as_deref().filter(|m| !m.is_empty())
    }

    pub fn user_agent(&self) -> &str {
        self.user_agent.as_deref().unwrap_or(USER_AGENT)
    }

    pub fn command_queue_capacity(&self) -> usize {
        self.command_queue_capacity
            .unwrap_or(DEFAULT_COMMAND_QUEUE_CAPACITY)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            log_file: None,
            sip: GatewayConfig::default(),
            accounts: vec![],
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self, Error> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }
}
