//! Per-instance facade over one SIP agent.
//!
//! Every operation translates internal results into `bool` (or nothing for
//! fire-and-forget operations). Work is handed to the agent thread as
//! commands; outcomes arrive later as [`crate::event::GatewayEvent`]s.
use crate::config::GatewayConfig;
use crate::event::{EventReceiver, EventSender};
use crate::useragent::{
    AgentHandle, CallCommand, CallRef, OwnerRef, RegisterOption, SipModule,
};
use anyhow::Result;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{info, warn};

#[cfg(test)]
mod tests;

const EVENT_CAPACITY: usize = 128;

enum GatewayState {
    Uninitialized,
    Active(Arc<AgentHandle>),
    Closed,
}

pub struct Gateway {
    module: Arc<SipModule>,
    state: Mutex<GatewayState>,
    events: EventSender,
}

impl Gateway {
    /// Creates a gateway with its own [`SipModule`].
    pub fn new(config: GatewayConfig) -> Result<Self> {
        Ok(Self::with_module(Arc::new(SipModule::new(config)?)))
    }

    /// Creates a gateway sharing `module` with other gateways.
    pub fn with_module(module: Arc<SipModule>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            module,
            state: Mutex::new(GatewayState::Uninitialized),
            events,
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        self.events.subscribe()
    }

    fn state(&self) -> MutexGuard<'_, GatewayState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn agent(&self) -> Option<Arc<AgentHandle>> {
        match &*self.state() {
            GatewayState::Active(agent) => Some(agent.clone()),
            _ => None,
        }
    }

    fn push(&self, command: CallCommand) -> bool {
        match self.agent() {
            Some(agent) => agent.push(command),
            None => {
                warn!(command = command.name(), "gateway: no agent, command dropped");
                false
            }
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(&*self.state(), GatewayState::Active(_))
    }

    pub fn aor(&self) -> Option<String> {
        self.agent().map(|agent| agent.aor().to_string())
    }

    /// Starts the agent and submits its registration. Blocks for the agent
    /// startup handshake only; the state lock is not held meanwhile.
    pub fn register(
        &self,
        server: &str,
        username: &str,
        password: &str,
        display_name: &str,
        transport: &str,
    ) -> bool {
        if !self.can_register() {
            return false;
        }
        let option = RegisterOption {
            server: server.to_string(),
            username: username.to_string(),
            password: password.to_string(),
            display_name: Some(display_name.to_string()).filter(|n| !n.is_empty()),
            transport: transport.to_string(),
        };
        let agent = match self.module.spawn_agent(option, self.events.clone()) {
            Ok(agent) => agent,
            Err(e) => {
                warn!(server, username, "gateway: register failed: {}", e);
                return false;
            }
        };
        let mut state = self.state();
        if matches!(&*state, GatewayState::Uninitialized) {
            info!(aor = %agent.aor(), id = agent.id(), "gateway: registered agent");
            *state = GatewayState::Active(agent);
            return true;
        }
        // closed or registered by another caller while the agent started
        drop(state);
        warn!(aor = %agent.aor(), "gateway: state changed during register, dropping agent");
        self.module.remove_agent(agent.id());
        false
    }

    fn can_register(&self) -> bool {
        match &*self.state() {
            GatewayState::Uninitialized => true,
            GatewayState::Active(agent) => {
                warn!(aor = %agent.aor(), "gateway: already registered");
                false
            }
            GatewayState::Closed => {
                warn!("gateway: register on closed gateway");
                false
            }
        }
    }

    pub fn make_call(&self, callee: &str, audio: bool, video: bool) -> bool {
        self.push(CallCommand::Call {
            callee_uri: callee.to_string(),
            audio,
            video,
        })
    }

    pub fn hangup(&self, callee: &str) {
        self.push(CallCommand::Hangup {
            call: CallRef::Peer(callee.to_string()),
        });
    }

    /// Queues an answer for the ringing call from `callee`. Establishment is
    /// reported later as a `CallEstablished` event.
    pub fn accept(&self, callee: &str) -> bool {
        self.push(CallCommand::Answer {
            peer_uri: callee.to_string(),
        })
    }

    pub fn reject(&self, callee: &str) {
        self.push(CallCommand::Hangup {
            call: CallRef::Peer(callee.to_string()),
        });
    }

    /// Associates (or clears) the owner routing events of the call with
    /// `callee`.
    pub fn set_call_owner(&self, callee: &str, owner: Option<OwnerRef>) -> bool {
        let call = CallRef::Peer(callee.to_string());
        match owner {
            Some(owner) => self.push(CallCommand::ConnectOwner { call, owner }),
            None => self.push(CallCommand::DisconnectOwner { call }),
        }
    }

    /// Terminates the agent and joins its thread. A closed gateway stays
    /// closed; calling again does nothing.
    pub fn close(&self) {
        let previous = std::mem::replace(&mut *self.state(), GatewayState::Closed);
        if let GatewayState::Active(agent) = previous {
            let id = agent.id();
            agent.terminate();
            self.module.remove_agent(id);
            info!(aor = %agent.aor(), "gateway: closed");
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.close();
    }
}
