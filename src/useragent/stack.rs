use super::account::Account;
use super::command::CallId;
use super::resolver::ResolverHandle;
use crate::config::GatewayConfig;
use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;

/// Transports an agent binds. Built from the transport name given to
/// `register`; an unknown name selects nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportMask {
    pub udp: bool,
    pub tcp: bool,
    pub tls: bool,
}

impl TransportMask {
    pub fn from_name(name: &str) -> Self {
        Self {
            udp: name == "udp",
            tcp: name == "tcp",
            tls: name == "tls",
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.udp || self.tcp || self.tls)
    }
}

impl fmt::Display for TransportMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [(self.udp, "udp"), (self.tcp, "tcp"), (self.tls, "tls")]
            .iter()
            .filter(|(on, _)| *on)
            .map(|(_, n)| *n)
            .collect();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join(","))
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MediaFlags {
    pub audio: bool,
    pub video: bool,
}

/// Protocol events a session reports to its agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UaEvent {
    Registered { expires: u32 },
    RegisterFailed { reason: String },
    Incoming { call_id: CallId, peer: String },
    Established { call_id: CallId },
    Updated { call_id: CallId },
    Terminated { call_id: CallId, reason: String },
}

pub type UaEventSender = UnboundedSender<UaEvent>;
pub type UaEventReceiver = UnboundedReceiver<UaEvent>;

/// Everything a stack needs to bind one agent's protocol context.
#[derive(Clone)]
pub struct StackContext {
    pub account: Arc<Account>,
    pub transports: TransportMask,
    pub config: Arc<GatewayConfig>,
    pub resolver: ResolverHandle,
    pub events: UaEventSender,
    pub cancel_token: CancellationToken,
}

/// Factory for per-agent protocol contexts. Called on the agent thread,
/// inside its event loop.
#[async_trait]
pub trait SipStack: Send + Sync {
    /// Allocates transports and the user-agent context for one account.
    async fn bind(&self, ctx: StackContext) -> Result<Box<dyn UaSession>>;
}

/// A live protocol context owned by exactly one agent thread. Methods
/// submit work and return; outcomes arrive later as [`UaEvent`]s.
#[async_trait]
pub trait UaSession: Send {
    fn local_addr(&self) -> Option<String>;

    async fn register(&mut self) -> Result<()>;

    async fn invite(&mut self, call_id: CallId, callee: &str, media: MediaFlags) -> Result<()>;

    async fn answer(&mut self, call_id: CallId) -> Result<()>;

    /// Ends a call in any state: cancel, reject or bye.
    async fn hangup(&mut self, call_id: CallId) -> Result<()>;

    async fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_mask() {
        assert_eq!(
            TransportMask::from_name("udp"),
            TransportMask {
                udp: true,
                tcp: false,
                tls: false
            }
        );
        assert!(TransportMask::from_name("tls").tls);
        assert!(TransportMask::from_name("UDP").is_empty());
        assert!(TransportMask::from_name("sctp").is_empty());
        assert_eq!(TransportMask::from_name("tcp").to_string(), "tcp");
        assert_eq!(TransportMask::default().to_string(), "none");
    }
}
