use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// Callee URIs are copied into a buffer of this many bytes; longer URIs are
/// truncated rather than rejected.
pub const CALLEE_URI_MAX: usize = 256;

static NEXT_CALL_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub u64);

impl CallId {
    pub fn next() -> Self {
        CallId(NEXT_CALL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call-{}", self.0)
    }
}

/// Opaque reference the host application uses to route media/session
/// events of a call.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerRef(pub String);

/// Identifies a call either by id or by the remote party's URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallRef {
    Id(CallId),
    Peer(String),
}

impl fmt::Display for CallRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallRef::Id(id) => write!(f, "{}", id),
            CallRef::Peer(peer) => write!(f, "{}", peer),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallCommand {
    Call {
        callee_uri: String,
        audio: bool,
        video: bool,
    },
    Hangup {
        call: CallRef,
    },
    Answer {
        peer_uri: String,
    },
    ConnectOwner {
        call: CallRef,
        owner: OwnerRef,
    },
    DisconnectOwner {
        call: CallRef,
    },
    Terminate,
}

impl CallCommand {
    pub fn name(&self) -> &'static str {
        match self {
            CallCommand::Call { .. } => "call",
            CallCommand::Hangup { .. } => "hangup",
            CallCommand::Answer { .. } => "answer",
            CallCommand::ConnectOwner { .. } => "connect_owner",
            CallCommand::DisconnectOwner { .. } => "disconnect_owner",
            CallCommand::Terminate => "terminate",
        }
    }
}

/// Truncates `uri` to at most [`CALLEE_URI_MAX`] bytes on a char boundary.
pub fn bounded_callee_uri(uri: &str) -> String {
    if uri.len() <= CALLEE_URI_MAX {
        return uri.to_string();
    }
    let mut end = CALLEE_URI_MAX;
    while !uri.is_char_boundary(end) {
        end -= 1;
    }
    warn!(
        len = uri.len(),
        max = CALLEE_URI_MAX,
        "callee uri truncated"
    );
    uri[..end].to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    Starting = 0,
    Running = 1,
    Terminating = 2,
    Terminated = 3,
}

/// Lifecycle shared between an agent thread and its handles.
#[derive(Debug)]
pub struct LifecycleCell(AtomicU8);

impl LifecycleCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(Lifecycle::Starting as u8))
    }

    pub fn get(&self) -> Lifecycle {
        match self.0.load(Ordering::Acquire) {
            0 => Lifecycle::Starting,
            1 => Lifecycle::Running,
            2 => Lifecycle::Terminating,
            _ => Lifecycle::Terminated,
        }
    }

    pub fn set(&self, state: Lifecycle) {
        self.0.store(state as u8, Ordering::Release);
    }

    /// Moves `Running` to `Terminating`; returns false if the agent was not running.
    pub fn begin_terminate(&self) -> bool {
        self.0
            .compare_exchange(
                Lifecycle::Running as u8,
                Lifecycle::Terminating as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

impl Default for LifecycleCell {
    fn default() -> Self {
        Self::new()
    }
}

pub type CommandReceiver = mpsc::Receiver<CallCommand>;

/// Producer side of an agent's command channel. Cloneable; FIFO across
/// producers; consumed by exactly one agent thread.
#[derive(Clone, Debug)]
pub struct CommandQueue {
    sender: mpsc::Sender<CallCommand>,
    lifecycle: Arc<LifecycleCell>,
}

impl CommandQueue {
    /// Allocates a channel bound to `lifecycle`. A zero capacity cannot hold
    /// any command and is refused.
    pub fn channel(
        capacity: usize,
        lifecycle: Arc<LifecycleCell>,
    ) -> Result<(CommandQueue, CommandReceiver), String> {
        if capacity == 0 {
            return Err("command queue capacity must be greater than zero".to_string());
        }
        let (sender, receiver) = mpsc::channel(capacity);
        Ok((CommandQueue { sender, lifecycle }, receiver))
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.get()
    }

    /// Enqueues a command for the agent. Commands pushed to an agent that is
    /// not running are dropped with a warning.
    pub fn push(&self, command: CallCommand) -> bool {
        let state = self.lifecycle.get();
        if state != Lifecycle::Running {
            warn!(
                command = command.name(),
                ?state,
                "useragent: agent not running, command dropped"
            );
            return false;
        }
        self.send(command)
    }

    /// Delivers `Terminate` regardless of lifecycle checks.
    pub(crate) fn push_terminate(&self) -> bool {
        self.send(CallCommand::Terminate)
    }

    fn send(&self, command: CallCommand) -> bool {
        let name = command.name();
        match self.sender.try_send(command) {
            Ok(_) => {
                debug!(command = name, "useragent: command queued");
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(command = name, "useragent: command queue full, command dropped");
                false
            }
            Err(TrySendError::Closed(_)) => {
                warn!(command = name, "useragent: command queue closed, command dropped");
                false
            }
        }
    }
}
