use super::account::{Account, AnswerMode, DecodeError};
use super::command::{
    bounded_callee_uri, CallCommand, CallId, CallRef, CommandQueue, CommandReceiver, Lifecycle,
    LifecycleCell, OwnerRef,
};
use super::registration::RegisterOption;
use super::resolver::ResolverHandle;
use super::stack::{
    MediaFlags, SipStack, StackContext, TransportMask, UaEvent, UaEventReceiver, UaSession,
};
use crate::config::GatewayConfig;
use crate::event::{EventSender, GatewayEvent};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, SyncSender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::select;
use tokio::sync::mpsc::unbounded_channel;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

static NEXT_AGENT_ID: AtomicU64 = AtomicU64::new(1);

const NO_TRANSPORT: &str = "no usable transport";

pub type AgentId = u64;

/// Why an agent failed to start. Reported once through the startup
/// handshake; the agent thread has already released its state.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to build agent runtime: {0}")]
    Runtime(String),
    #[error("invalid account: {0}")]
    Account(#[from] DecodeError),
    #[error("failed to bind transports: {0}")]
    Transport(String),
    #[error("failed to allocate command channel: {0}")]
    Channel(String),
    #[error("failed to start agent thread: {0}")]
    Thread(String),
    #[error("agent thread exited before reporting readiness")]
    Handshake,
}

/// Everything one agent needs, moved into its thread.
pub struct AgentSpec {
    pub option: RegisterOption,
    pub config: Arc<GatewayConfig>,
    pub resolver: ResolverHandle,
    pub events: EventSender,
    pub cancel_token: CancellationToken,
}

struct Ready {
    aor: String,
    queue: CommandQueue,
    local_addr: Option<String>,
}

/// Owner side of a running agent thread.
pub struct AgentHandle {
    id: AgentId,
    aor: String,
    queue: CommandQueue,
    lifecycle: Arc<LifecycleCell>,
    cancel_token: CancellationToken,
    local_addr: Option<String>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl AgentHandle {
    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn aor(&self) -> &str {
        &self.aor
    }

    pub fn local_addr(&self) -> Option<&str> {
        self.local_addr.as_deref()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle.get()
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn push(&self, command: CallCommand) -> bool {
        self.queue.push(command)
    }

    /// Asks the agent to stop and joins its thread. Concurrent callers
    /// block until the join completes; later calls return immediately.
    pub fn terminate(&self) {
        if self.lifecycle.begin_terminate() && !self.queue.push_terminate() {
            self.cancel_token.cancel();
        }
        // held across the join
        let mut thread = self.thread.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(thread) = thread.take() {
            if thread.join().is_err() {
                warn!(user = %self.aor, "useragent: agent thread panicked");
            }
            info!(user = %self.aor, id = self.id, "useragent: agent terminated");
        }
    }
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Starts an agent on a dedicated thread and blocks until it reports
/// readiness or failure.
pub fn spawn(spec: AgentSpec, stack: Arc<dyn SipStack>) -> Result<AgentHandle, SpawnError> {
    let id = NEXT_AGENT_ID.fetch_add(1, Ordering::Relaxed);
    let user = spec.option.aor();
    let lifecycle = Arc::new(LifecycleCell::new());
    let cancel_token = spec.cancel_token.clone();
    let thread_name: String = format!("sipua-{}", spec.option.username)
        .chars()
        .filter(|c| *c != '\0')
        .collect();

    let (handshake_tx, handshake_rx) = sync_channel(1);
    let thread_lifecycle = lifecycle.clone();
    let thread = std::thread::Builder::new()
        .name(thread_name)
        .spawn(move || run_agent(spec, stack, thread_lifecycle, handshake_tx))
        .map_err(|e| SpawnError::Thread(e.to_string()))?;

    let outcome = handshake_rx.recv();
    drop(handshake_rx);

    let error = match outcome {
        Ok(Ok(ready)) => {
            info!(user = %ready.aor, id, local_addr = ?ready.local_addr, "useragent: agent running");
            return Ok(AgentHandle {
                id,
                aor: ready.aor,
                queue: ready.queue,
                lifecycle,
                cancel_token,
                local_addr: ready.local_addr,
                thread: Mutex::new(Some(thread)),
            });
        }
        Ok(Err(e)) => e,
        Err(_) => SpawnError::Handshake,
    };
    if thread.join().is_err() {
        warn!(%user, "useragent: agent thread panicked during startup");
    }
    warn!(%user, "useragent: failed to start agent: {}", error);
    Err(error)
}

fn run_agent(
    spec: AgentSpec,
    stack: Arc<dyn SipStack>,
    lifecycle: Arc<LifecycleCell>,
    handshake: SyncSender<Result<Ready, SpawnError>>,
) {
    let fail = |lifecycle: &LifecycleCell, error: SpawnError| {
        lifecycle.set(Lifecycle::Terminated);
        handshake.send(Err(error)).ok();
    };

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            fail(&lifecycle, SpawnError::Runtime(e.to_string()));
            return;
        }
    };

    runtime.block_on(async {
        let source = spec.option.account_string(spec.config.media_nat());
        let decoded = match Account::decode(&source) {
            Ok(decoded) => decoded,
            Err(e) => {
                fail(&lifecycle, SpawnError::Account(e));
                return;
            }
        };
        if !decoded.report.is_clean() {
            debug!(
                user = %decoded.account.aor(),
                issues = decoded.report.issues().len(),
                "useragent: account decoded with warnings"
            );
        }
        let account = Arc::new(decoded.account);

        let transports = spec.option.transports();
        if transports.is_empty() {
            warn!(transport = %spec.option.transport, "useragent: unknown transport, none selected");
        }

        let (ua_sender, ua_receiver) = unbounded_channel();
        let ctx = StackContext {
            account: account.clone(),
            transports,
            config: spec.config.clone(),
            resolver: spec.resolver.clone(),
            events: ua_sender.clone(),
            cancel_token: spec.cancel_token.clone(),
        };
        let mut session = match stack.bind(ctx).await {
            Ok(session) => session,
            Err(e) => {
                fail(&lifecycle, SpawnError::Transport(e.to_string()));
                return;
            }
        };

        let (queue, commands) =
            match CommandQueue::channel(spec.config.command_queue_capacity(), lifecycle.clone()) {
                Ok(pair) => pair,
                Err(e) => {
                    session.close().await;
                    fail(&lifecycle, SpawnError::Channel(e));
                    return;
                }
            };

        if transports.is_empty() {
            ua_sender
                .send(UaEvent::RegisterFailed {
                    reason: NO_TRANSPORT.to_string(),
                })
                .ok();
        } else if account.registration_interval() > 0 {
            if let Err(e) = session.register().await {
                warn!(user = %account.aor(), "useragent: failed to submit registration: {}", e);
                ua_sender
                    .send(UaEvent::RegisterFailed {
                        reason: e.to_string(),
                    })
                    .ok();
            }
        }

        lifecycle.set(Lifecycle::Running);
        let ready = Ready {
            aor: account.aor().to_string(),
            queue,
            local_addr: session.local_addr(),
        };
        if handshake.send(Ok(ready)).is_err() {
            lifecycle.set(Lifecycle::Terminated);
            session.close().await;
            return;
        }

        let dispatcher = Dispatcher {
            account,
            session,
            transports,
            calls: HashMap::new(),
            events: spec.events,
            registered: false,
        };
        dispatcher
            .run(commands, ua_receiver, spec.cancel_token)
            .await;
        lifecycle.set(Lifecycle::Terminated);
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    Calling,
    Ringing,
    Established,
}

#[derive(Debug)]
struct CallRecord {
    peer: String,
    direction: Direction,
    state: CallState,
    owner: Option<OwnerRef>,
    media: MediaFlags,
}

/// Compares peer URIs ignoring a leading `sip:`/`sips:` scheme.
fn same_peer(a: &str, b: &str) -> bool {
    fn strip(s: &str) -> &str {
        s.strip_prefix("sips:")
            .or_else(|| s.strip_prefix("sip:"))
            .unwrap_or(s)
    }
    strip(a.trim()) == strip(b.trim())
}

/// Command and event loop of one agent. Owns the call table.
struct Dispatcher {
    account: Arc<Account>,
    session: Box<dyn UaSession>,
    transports: TransportMask,
    calls: HashMap<CallId, CallRecord>,
    events: EventSender,
    registered: bool,
}

impl Dispatcher {
    async fn run(
        mut self,
        mut commands: CommandReceiver,
        mut ua_events: UaEventReceiver,
        cancel_token: CancellationToken,
    ) {
        loop {
            select! {
                _ = cancel_token.cancelled() => {
                    info!(user = %self.account.aor(), "useragent: agent cancelled");
                    break;
                }
                command = commands.recv() => match command {
                    Some(CallCommand::Terminate) | None => break,
                    Some(command) => self.handle_command(command).await,
                },
                Some(event) = ua_events.recv() => self.handle_event(event).await,
            }
        }
        commands.close();
        self.shutdown().await;
    }

    fn emit(&self, event: GatewayEvent) {
        debug!(user = %self.account.aor(), ?event, "useragent: event");
        self.events.send(event).ok();
    }

    fn find(&self, call: &CallRef) -> Option<CallId> {
        match call {
            CallRef::Id(id) => self.calls.contains_key(id).then_some(*id),
            CallRef::Peer(peer) => self
                .calls
                .iter()
                .filter(|(_, record)| same_peer(&record.peer, peer))
                .map(|(id, _)| *id)
                .min(),
        }
    }

    /// `bob@example.com` → `sip:bob@example.com`; a bare user gets the
    /// account's domain.
    fn complete_uri(&self, callee: &str) -> String {
        let callee = callee.trim();
        let with_host = if callee.contains('@') || callee.contains(':') {
            callee.to_string()
        } else {
            format!("{}@{}", callee, self.account.host())
        };
        if with_host.starts_with("sip:") || with_host.starts_with("sips:") {
            with_host
        } else {
            format!("sip:{}", with_host)
        }
    }

    async fn handle_command(&mut self, command: CallCommand) {
        debug!(command = command.name(), "useragent: handling command");
        match command {
            CallCommand::Call {
                callee_uri,
                audio,
                video,
            } => {
                let peer = self.complete_uri(&bounded_callee_uri(&callee_uri));
                let media = MediaFlags {
                    audio,
                    video: video && cfg!(feature = "video"),
                };
                if self.transports.is_empty() {
                    warn!(%peer, "useragent: call rejected, no usable transport");
                    self.emit(GatewayEvent::CallClosed {
                        peer,
                        reason: NO_TRANSPORT.to_string(),
                    });
                    return;
                }
                let call_id = CallId::next();
                self.calls.insert(
                    call_id,
                    CallRecord {
                        peer: peer.clone(),
                        direction: Direction::Outgoing,
                        state: CallState::Calling,
                        owner: None,
                        media,
                    },
                );
                info!(%call_id, %peer, audio, video = media.video, "useragent: placing call");
                if let Err(e) = self.session.invite(call_id, &peer, media).await {
                    warn!(%call_id, %peer, "useragent: call failed: {}", e);
                    self.calls.remove(&call_id);
                    self.emit(GatewayEvent::CallClosed {
                        peer,
                        reason: e.to_string(),
                    });
                }
            }
            CallCommand::Hangup { call } => {
                let Some(call_id) = self.find(&call) else {
                    warn!(%call, "useragent: hangup for unknown call");
                    return;
                };
                if let Some(record) = self.calls.remove(&call_id) {
                    if let Err(e) = self.session.hangup(call_id).await {
                        warn!(%call_id, "useragent: hangup failed: {}", e);
                    }
                    self.emit(GatewayEvent::CallClosed {
                        peer: record.peer,
                        reason: "local hangup".to_string(),
                    });
                }
            }
            CallCommand::Answer { peer_uri } => {
                let ringing = self
                    .calls
                    .iter()
                    .filter(|(_, r)| {
                        r.direction == Direction::Incoming
                            && r.state == CallState::Ringing
                            && same_peer(&r.peer, &peer_uri)
                    })
                    .map(|(id, _)| *id)
                    .min();
                match ringing {
                    Some(call_id) => {
                        if let Err(e) = self.session.answer(call_id).await {
                            warn!(%call_id, "useragent: answer failed: {}", e);
                        }
                    }
                    None => warn!(peer = %peer_uri, "useragent: no ringing call to answer"),
                }
            }
            CallCommand::ConnectOwner { call, owner } => {
                match self.find(&call).and_then(|id| self.calls.get_mut(&id)) {
                    Some(record) => record.owner = Some(owner),
                    None => warn!(%call, "useragent: owner for unknown call"),
                }
            }
            CallCommand::DisconnectOwner { call } => {
                if let Some(record) = self.find(&call).and_then(|id| self.calls.get_mut(&id)) {
                    record.owner = None;
                }
            }
            CallCommand::Terminate => {}
        }
    }

    async fn handle_event(&mut self, event: UaEvent) {
        match event {
            UaEvent::Registered { expires } => {
                debug!(user = %self.account.aor(), expires, "useragent: registered");
                if !self.registered {
                    self.registered = true;
                    self.emit(GatewayEvent::RegisterOk {
                        aor: self.account.aor().to_string(),
                    });
                }
            }
            UaEvent::RegisterFailed { reason } => {
                self.registered = false;
                self.emit(GatewayEvent::RegisterFailed {
                    aor: self.account.aor().to_string(),
                    reason,
                });
            }
            UaEvent::Incoming { call_id, peer } => {
                self.calls.insert(
                    call_id,
                    CallRecord {
                        peer: peer.clone(),
                        direction: Direction::Incoming,
                        state: CallState::Ringing,
                        owner: None,
                        media: MediaFlags {
                            audio: true,
                            video: false,
                        },
                    },
                );
                self.emit(GatewayEvent::IncomingCall { peer: peer.clone() });
                match self.account.answer_mode() {
                    AnswerMode::Auto => {
                        info!(%call_id, %peer, "useragent: auto answering");
                        if let Err(e) = self.session.answer(call_id).await {
                            warn!(%call_id, "useragent: auto answer failed: {}", e);
                        }
                    }
                    AnswerMode::Early | AnswerMode::Manual => {}
                }
            }
            UaEvent::Established { call_id } => {
                let Some(record) = self.calls.get_mut(&call_id) else {
                    return;
                };
                if record.state == CallState::Established {
                    return;
                }
                record.state = CallState::Established;
                let event = GatewayEvent::CallEstablished {
                    peer: record.peer.clone(),
                    owner: record.owner.clone(),
                    audio: record.media.audio,
                    video: record.media.video,
                };
                self.emit(event);
            }
            UaEvent::Updated { call_id } => {
                if let Some(record) = self.calls.get(&call_id) {
                    let event = GatewayEvent::CallUpdated {
                        peer: record.peer.clone(),
                    };
                    self.emit(event);
                }
            }
            UaEvent::Terminated { call_id, reason } => {
                if let Some(record) = self.calls.remove(&call_id) {
                    self.emit(GatewayEvent::CallClosed {
                        peer: record.peer,
                        reason,
                    });
                }
            }
        }
    }

    async fn shutdown(mut self) {
        let calls: Vec<(CallId, CallRecord)> = self.calls.drain().collect();
        for (call_id, record) in calls {
            self.session.hangup(call_id).await.ok();
            self.emit(GatewayEvent::CallClosed {
                peer: record.peer,
                reason: "terminated".to_string(),
            });
        }
        self.session.close().await;
        info!(user = %self.account.aor(), "useragent: agent stopped");
    }
}
