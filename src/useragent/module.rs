use super::agent::{self, AgentHandle, AgentId, AgentSpec, SpawnError};
use super::registration::RegisterOption;
use super::registry::AgentRegistry;
use super::resolver::Resolver;
use super::rsip_stack::RsipStack;
use super::stack::SipStack;
use crate::config::GatewayConfig;
use crate::event::EventSender;
use anyhow::Result;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Process-wide SIP context: settings, the DNS helper thread and every
/// running agent. Settings are fixed before the first agent starts.
pub struct SipModule {
    config: Arc<GatewayConfig>,
    registry: AgentRegistry,
    resolver: Resolver,
    stack: Arc<dyn SipStack>,
    token: CancellationToken,
    closed: AtomicBool,
}

impl SipModule {
    pub fn new(config: GatewayConfig) -> Result<Self> {
        Self::with_stack(config, Arc::new(RsipStack))
    }

    pub fn with_stack(config: GatewayConfig, stack: Arc<dyn SipStack>) -> Result<Self> {
        let (min_port, max_port) = config.rtp_port_range();
        info!(
            prefer_ipv6 = config.prefer_ipv6,
            min_port,
            max_port,
            rtp_timeout = config.rtp_timeout(),
            media_nat = ?config.media_nat(),
            "sip module: initialized"
        );
        let resolver = Resolver::start(config.prefer_ipv6)?;
        Ok(Self {
            config: Arc::new(config),
            registry: AgentRegistry::new(),
            resolver,
            stack,
            token: CancellationToken::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Spawns an agent for `option` and records it once it reports ready.
    /// A failed spawn leaves the registry untouched.
    pub fn spawn_agent(
        &self,
        option: RegisterOption,
        events: EventSender,
    ) -> Result<Arc<AgentHandle>, SpawnError> {
        if self.is_closed() {
            return Err(SpawnError::Thread("sip module is shut down".to_string()));
        }
        let spec = AgentSpec {
            option,
            config: self.config.clone(),
            resolver: self.resolver.handle(),
            events,
            cancel_token: self.token.child_token(),
        };
        let agent = Arc::new(agent::spawn(spec, self.stack.clone())?);
        self.registry.insert(agent.clone());
        Ok(agent)
    }

    /// Terminates one agent and forgets it.
    pub fn remove_agent(&self, id: AgentId) {
        if let Some(agent) = self.registry.remove(id) {
            agent.terminate();
        }
    }

    pub fn agent_count(&self) -> usize {
        self.registry.len()
    }

    pub fn has_agent(&self, id: AgentId) -> bool {
        self.registry.contains(id)
    }

    /// Stops every agent, then the resolver thread. Safe to call twice.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.registry.teardown();
        self.token.cancel();
        self.resolver.stop();
        info!("sip module: shut down");
    }
}

impl Drop for SipModule {
    fn drop(&mut self) {
        self.shutdown();
    }
}
