use super::account::Account;
use super::command::CallId;
use super::registration::{account_credential, RegistrationHandle};
use super::resolver::ResolverHandle;
use super::stack::{
    MediaFlags, SipStack, StackContext, TransportMask, UaEvent, UaEventSender, UaSession,
};
use crate::net_tool;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rsip::prelude::HeadersExt;
use rsipstack::dialog::dialog::{Dialog, DialogState, DialogStateReceiver, DialogStateSender};
use rsipstack::dialog::dialog_layer::DialogLayer;
use rsipstack::dialog::invitation::InviteOption;
use rsipstack::dialog::DialogId;
use rsipstack::transaction::endpoint::EndpointInnerRef;
use rsipstack::transaction::TransactionReceiver;
use rsipstack::transport::{udp::UdpConnection, TransportLayer};
use rsipstack::EndpointBuilder;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::select;
use tokio::sync::mpsc::unbounded_channel;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const UNREGISTER_TIMEOUT: Duration = Duration::from_secs(2);

/// [`SipStack`] backed by `rsipstack`: one transport layer, endpoint and
/// dialog layer per agent.
#[derive(Default)]
pub struct RsipStack;

enum CallSlot {
    /// INVITE sent, no final response yet. `dialog_id` is the early id the
    /// dialog layer knows the call by.
    Inviting {
        dialog_id: Option<DialogId>,
        cancelled: bool,
    },
    Active(Dialog),
}

#[derive(Default)]
struct CallTable {
    slots: HashMap<CallId, CallSlot>,
    dialogs: HashMap<DialogId, CallId>,
}

type SharedCalls = Arc<Mutex<CallTable>>;

fn lock(calls: &SharedCalls) -> std::sync::MutexGuard<'_, CallTable> {
    calls.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct RsipSession {
    account: Arc<Account>,
    resolver: ResolverHandle,
    rtp_ports: (u16, u16),
    local_ip: IpAddr,
    contact: rsip::Uri,
    transports: TransportMask,
    transport_param: Option<rsip::Param>,
    endpoint_inner: EndpointInnerRef,
    dialog_layer: Arc<DialogLayer>,
    state_sender: DialogStateSender,
    calls: SharedCalls,
    events: UaEventSender,
    registration: Option<RegistrationHandle>,
    token: CancellationToken,
}

#[async_trait]
impl SipStack for RsipStack {
    async fn bind(&self, ctx: StackContext) -> Result<Box<dyn UaSession>> {
        let token = ctx.cancel_token.child_token();
        let prefer_ipv6 = ctx.config.prefer_ipv6;
        let local_ip = match net_tool::get_first_non_loopback_interface(prefer_ipv6) {
            Ok(ip) => ip,
            Err(e) => {
                warn!("rsip: no usable interface, using loopback: {}", e);
                if prefer_ipv6 {
                    IpAddr::V6(Ipv6Addr::LOCALHOST)
                } else {
                    IpAddr::V4(Ipv4Addr::LOCALHOST)
                }
            }
        };
        if net_tool::is_private_ip(&local_ip) && ctx.account.media_nat().is_none() {
            info!(
                user = %ctx.account.aor(),
                %local_ip,
                "rsip: private address without medianat, media may not traverse NAT"
            );
        }

        let transport_layer = TransportLayer::new(token.clone());
        let contact_addr: rsip::HostWithPort = if ctx.transports.udp {
            let udp_conn = UdpConnection::create_connection(SocketAddr::new(local_ip, 0), None)
                .await
                .map_err(|e| anyhow!("failed to create UDP connection: {}", e))?;
            let addr = udp_conn.get_addr().addr.clone();
            transport_layer.add_transport(udp_conn.into());
            addr
        } else {
            // tcp/tls connections are opened per target by the transport layer
            let port = if ctx.transports.tls { 5061 } else { 5060 };
            SocketAddr::new(local_ip, port).into()
        };

        let transport_param = if ctx.transports.tls {
            Some(rsip::Param::Transport(rsip::Transport::Tls))
        } else if ctx.transports.tcp {
            Some(rsip::Param::Transport(rsip::Transport::Tcp))
        } else {
            None
        };
        if ctx.transports.is_empty() {
            warn!(user = %ctx.account.aor(), "rsip: no transport selected, nothing bound");
        }

        let endpoint = EndpointBuilder::new()
            .user_agent(ctx.config.user_agent())
            .cancel_token(token.clone())
            .transport_layer(transport_layer)
            .build();
        let incoming = endpoint.incoming_transactions();
        let endpoint_inner = endpoint.inner.clone();
        let dialog_layer = Arc::new(DialogLayer::new(endpoint.inner.clone()));
        let (state_sender, state_receiver) = unbounded_channel();
        let calls: SharedCalls = Arc::new(Mutex::new(CallTable::default()));

        let contact = rsip::Uri {
            scheme: Some(rsip::Scheme::Sip),
            auth: ctx.account.user().map(|user| rsip::Auth {
                user: user.to_string(),
                password: None,
            }),
            host_with_port: contact_addr,
            params: transport_param.iter().cloned().collect(),
            headers: vec![],
        };
        info!(user = %ctx.account.aor(), contact = %contact, transports = %ctx.transports, "rsip: bound");

        let serve_token = token.clone();
        tokio::spawn(async move {
            select! {
                _ = serve_token.cancelled() => {}
                _ = endpoint.serve() => {
                    info!("rsip: endpoint stopped");
                }
            }
        });
        tokio::spawn(process_incoming_request(
            dialog_layer.clone(),
            incoming,
            state_sender.clone(),
            calls.clone(),
            ctx.events.clone(),
            token.clone(),
        ));
        tokio::spawn(process_dialog_state(
            dialog_layer.clone(),
            state_receiver,
            calls.clone(),
            ctx.events.clone(),
            token.clone(),
        ));

        Ok(Box::new(RsipSession {
            account: ctx.account,
            resolver: ctx.resolver,
            rtp_ports: ctx.config.rtp_port_range(),
            local_ip,
            contact,
            transports: ctx.transports,
            transport_param,
            endpoint_inner,
            dialog_layer,
            state_sender,
            calls,
            events: ctx.events,
            registration: None,
            token,
        }))
    }
}

async fn process_incoming_request(
    dialog_layer: Arc<DialogLayer>,
    mut incoming: TransactionReceiver,
    state_sender: DialogStateSender,
    calls: SharedCalls,
    events: UaEventSender,
    token: CancellationToken,
) {
    loop {
        let mut tx = select! {
            _ = token.cancelled() => break,
            tx = incoming.recv() => match tx {
                Some(tx) => tx,
                None => break,
            },
        };
        debug!("rsip: received transaction: {:?}", tx.key);

        let in_dialog = tx
            .original
            .to_header()
            .ok()
            .and_then(|h| h.tag().ok().flatten())
            .is_some();
        if in_dialog {
            match dialog_layer.match_dialog(&tx.original) {
                Some(mut d) => {
                    tokio::spawn(async move {
                        if let Err(e) = d.handle(tx).await {
                            info!("rsip: error handling transaction: {:?}", e);
                        }
                    });
                }
                None => {
                    info!("rsip: dialog not found: {}", tx.original.method);
                    if let Err(e) = tx.reply(rsip::StatusCode::CallTransactionDoesNotExist).await {
                        info!("rsip: error replying to request: {:?}", e);
                    }
                }
            }
            continue;
        }

        match tx.original.method {
            rsip::Method::Invite | rsip::Method::Ack => {
                let peer = tx
                    .original
                    .from_header()
                    .ok()
                    .and_then(|h| h.uri().ok())
                    .map(|uri| uri.to_string())
                    .unwrap_or_default();
                let is_invite = tx.original.method == rsip::Method::Invite;
                let mut dialog = match dialog_layer.get_or_create_server_invite(
                    &tx,
                    state_sender.clone(),
                    None,
                    None,
                ) {
                    Ok(d) => d,
                    Err(e) => {
                        info!("rsip: failed to obtain dialog: {:?}", e);
                        if let Err(e) = tx.reply(rsip::StatusCode::CallTransactionDoesNotExist).await {
                            info!("rsip: error replying to request: {:?}", e);
                        }
                        continue;
                    }
                };
                if is_invite {
                    let dialog_id = dialog.id();
                    let call_id = {
                        let mut table = lock(&calls);
                        if table.dialogs.contains_key(&dialog_id) {
                            None
                        } else {
                            let call_id = CallId::next();
                            table.dialogs.insert(dialog_id, call_id);
                            table
                                .slots
                                .insert(call_id, CallSlot::Active(Dialog::ServerInvite(dialog.clone())));
                            Some(call_id)
                        }
                    };
                    if let Some(call_id) = call_id {
                        info!(%call_id, %peer, "rsip: incoming call");
                        events.send(UaEvent::Incoming { call_id, peer }).ok();
                    }
                }
                tokio::spawn(async move {
                    if let Err(e) = dialog.handle(tx).await {
                        info!("rsip: error handling invite transaction: {:?}", e);
                    }
                });
            }
            _ => {
                debug!("rsip: received request: {:?}", tx.original.method);
                if let Err(e) = tx.reply(rsip::StatusCode::OK).await {
                    info!("rsip: error replying to request: {:?}", e);
                }
            }
        }
    }
}

async fn process_dialog_state(
    dialog_layer: Arc<DialogLayer>,
    mut state_receiver: DialogStateReceiver,
    calls: SharedCalls,
    events: UaEventSender,
    token: CancellationToken,
) {
    loop {
        let state = select! {
            _ = token.cancelled() => break,
            state = state_receiver.recv() => match state {
                Some(state) => state,
                None => break,
            },
        };
        match state {
            DialogState::Confirmed(id) => {
                if let Some(call_id) = lock(&calls).dialogs.get(&id).copied() {
                    events.send(UaEvent::Established { call_id }).ok();
                }
            }
            DialogState::Updated(id, _) => {
                if let Some(call_id) = lock(&calls).dialogs.get(&id).copied() {
                    events.send(UaEvent::Updated { call_id }).ok();
                }
            }
            DialogState::Terminated(id, reason) => {
                let call_id = {
                    let mut table = lock(&calls);
                    let call_id = table.dialogs.remove(&id);
                    if let Some(call_id) = call_id {
                        table.slots.remove(&call_id);
                    }
                    call_id
                };
                dialog_layer.remove_dialog(&id);
                if let Some(call_id) = call_id {
                    events
                        .send(UaEvent::Terminated {
                            call_id,
                            reason: format!("{:?}", reason),
                        })
                        .ok();
                }
            }
            _ => {
                debug!("rsip: dialog state: {}", state);
            }
        }
    }
}

fn host_port(uri: &rsip::Uri) -> (String, u16) {
    let default_port = match uri.scheme {
        Some(rsip::Scheme::Sips) => 5061,
        _ => 5060,
    };
    let host = uri.host_with_port.host.to_string();
    let port = uri
        .host_with_port
        .port
        .as_ref()
        .and_then(|p| p.to_string().parse().ok())
        .unwrap_or(default_port);
    (host, port)
}

/// Minimal SDP offer/answer advertising the account's codec preferences.
pub fn build_sdp(account: &Account, local_ip: IpAddr, rtp_port: u16, media: MediaFlags) -> String {
    let family = if local_ip.is_ipv6() { "IP6" } else { "IP4" };
    let session_id = session_version();
    let user = account.user().unwrap_or("-");
    let mut sdp = format!(
        "v=0\r\no={} {} {} IN {} {}\r\ns=-\r\nc=IN {} {}\r\nt=0 0\r\n",
        user, session_id, session_id, family, local_ip, family, local_ip
    );
    if media.audio {
        let mut dynamic_pt = 96u8;
        let mut payloads = Vec::new();
        let mut attributes = String::new();
        for codec in account.audio_codec_list() {
            let pt = codec.payload_type.unwrap_or_else(|| {
                let pt = dynamic_pt;
                dynamic_pt += 1;
                pt
            });
            // G.722 keeps its historical 8000 Hz RTP clock
            let clock = if codec.name.eq_ignore_ascii_case("G722") {
                8000
            } else {
                codec.sample_rate
            };
            payloads.push(pt.to_string());
            if codec.channels > 1 {
                attributes.push_str(&format!(
                    "a=rtpmap:{} {}/{}/{}\r\n",
                    pt, codec.name, clock, codec.channels
                ));
            } else {
                attributes.push_str(&format!("a=rtpmap:{} {}/{}\r\n", pt, codec.name, clock));
            }
        }
        sdp.push_str(&format!(
            "m=audio {} RTP/AVP {}\r\n",
            rtp_port,
            payloads.join(" ")
        ));
        sdp.push_str(&attributes);
        sdp.push_str(&format!("a=ptime:{}\r\na=sendrecv\r\n", account.packet_time()));
    }
    if media.video {
        let mut payloads = Vec::new();
        let mut attributes = String::new();
        for (i, codec) in account.video_codec_list().into_iter().enumerate() {
            let pt = 110 + i as u8;
            payloads.push(pt.to_string());
            attributes.push_str(&format!(
                "a=rtpmap:{} {}/{}\r\n",
                pt, codec.name, codec.clock_rate
            ));
        }
        sdp.push_str(&format!(
            "m=video {} RTP/AVP {}\r\n",
            rtp_port.saturating_add(2),
            payloads.join(" ")
        ));
        sdp.push_str(&attributes);
        sdp.push_str("a=sendrecv\r\n");
    }
    sdp
}

fn session_version() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

impl RsipSession {
    fn rtp_port(&self) -> u16 {
        let (min, max) = self.rtp_ports;
        // even ports only, RTCP takes the odd neighbour
        let span = (max - min) / 2;
        min + 2 * (rand::random::<u16>() % span.max(1))
    }

    fn with_transport(&self, mut uri: rsip::Uri) -> rsip::Uri {
        if let Some(param) = &self.transport_param {
            uri.params.push(param.clone());
        }
        uri
    }

    /// Resolves the registrar, or the first outbound proxy when one is
    /// configured, and returns the `host:port[;transport=..]` REGISTER is
    /// sent to.
    async fn registrar(&self) -> Result<String> {
        let (host, port, role) = match self.account.outbound(0) {
            Some(outbound) => {
                let proxy = rsip::Uri::try_from(outbound)
                    .map_err(|e| anyhow!("invalid outbound proxy `{}`: {}", outbound, e))?;
                let (host, port) = host_port(&proxy);
                (host, port, "outbound proxy")
            }
            None => {
                let (host, port) = host_port(self.account.uri());
                (host, port, "registrar")
            }
        };
        let target = self
            .resolver
            .lookup(&host, port)
            .await?
            .first()
            .copied()
            .ok_or_else(|| anyhow!("no address for {} {}", role, host))?;
        Ok(registrar_target(target, self.transport_param.as_ref()))
    }
}

fn registrar_target(addr: SocketAddr, transport: Option<&rsip::Param>) -> String {
    let mut target = rsip::HostWithPort::from(addr).to_string();
    if let Some(param) = transport {
        target.push_str(&param.to_string());
    }
    target
}

/// Sends CANCEL for an outgoing call still waiting for its final response.
fn spawn_cancel(dialog_layer: Arc<DialogLayer>, dialog_id: DialogId, call_id: CallId) {
    tokio::spawn(async move {
        match dialog_layer.get_dialog(&dialog_id) {
            Some(Dialog::ClientInvite(dialog)) => {
                info!(%call_id, "rsip: cancelling outgoing call");
                if let Err(e) = dialog.cancel().await {
                    info!(%call_id, "rsip: cancel failed: {}", e);
                }
            }
            _ => debug!(%call_id, "rsip: no pending dialog to cancel"),
        }
    });
}

#[async_trait]
impl UaSession for RsipSession {
    fn local_addr(&self) -> Option<String> {
        Some(self.contact.host_with_port.to_string())
    }

    async fn register(&mut self) -> Result<()> {
        if let Some(registration) = self.registration.take() {
            registration.stop();
        }
        if self.transports.is_empty() {
            self.events
                .send(UaEvent::RegisterFailed {
                    reason: "no usable transport".to_string(),
                })
                .ok();
            return Ok(());
        }
        let server = match self.registrar().await {
            Ok(server) => server,
            Err(e) => {
                warn!(user = %self.account.aor(), "rsip: registrar lookup failed: {}", e);
                self.events
                    .send(UaEvent::RegisterFailed {
                        reason: e.to_string(),
                    })
                    .ok();
                return Ok(());
            }
        };
        info!(user = %self.account.aor(), server = %server, "rsip: registering");
        self.registration = Some(RegistrationHandle::start(
            self.endpoint_inner.clone(),
            &self.account,
            server,
            self.contact.clone(),
            CancellationToken::new(),
            self.events.clone(),
        ));
        Ok(())
    }

    async fn invite(&mut self, call_id: CallId, callee: &str, media: MediaFlags) -> Result<()> {
        if self.transports.is_empty() {
            return Err(anyhow!("no usable transport"));
        }
        let callee: rsip::Uri = rsip::Uri::try_from(callee)
            .map_err(|e| anyhow!("invalid callee `{}`: {}", callee, e))?;
        let caller = rsip::Uri::try_from(self.account.aor())
            .map_err(|e| anyhow!("invalid caller `{}`: {}", self.account.aor(), e))?;
        let offer = build_sdp(&self.account, self.local_ip, self.rtp_port(), media);
        let invite_option = InviteOption {
            caller,
            callee: self.with_transport(callee),
            content_type: Some("application/sdp".to_string()),
            offer: Some(offer.into_bytes()),
            contact: self.contact.clone(),
            credential: account_credential(&self.account).map(|c| c.into()),
        };

        lock(&self.calls).slots.insert(
            call_id,
            CallSlot::Inviting {
                dialog_id: None,
                cancelled: false,
            },
        );

        // Track the early dialog id so a hangup before the final response
        // can CANCEL, then hand every state to the shared dialog loop.
        let (invite_state_sender, mut invite_states) = unbounded_channel();
        let shared_states = self.state_sender.clone();
        let forward_layer = self.dialog_layer.clone();
        let forward_calls = self.calls.clone();
        tokio::spawn(async move {
            while let Some(state) = invite_states.recv().await {
                if let DialogState::Calling(id) = &state {
                    let cancelled = match lock(&forward_calls).slots.get_mut(&call_id) {
                        Some(CallSlot::Inviting {
                            dialog_id,
                            cancelled,
                        }) => {
                            *dialog_id = Some(id.clone());
                            *cancelled
                        }
                        _ => false,
                    };
                    if cancelled {
                        spawn_cancel(forward_layer.clone(), id.clone(), call_id);
                    }
                }
                if shared_states.send(state).is_err() {
                    break;
                }
            }
        });

        let dialog_layer = self.dialog_layer.clone();
        let state_sender = invite_state_sender;
        let calls = self.calls.clone();
        let events = self.events.clone();
        let token = self.token.clone();
        tokio::spawn(async move {
            let result = select! {
                _ = token.cancelled() => return,
                result = dialog_layer.do_invite(invite_option, state_sender) => result,
            };
            let (dialog, resp) = match result {
                Ok(r) => r,
                Err(e) => {
                    lock(&calls).slots.remove(&call_id);
                    events
                        .send(UaEvent::Terminated {
                            call_id,
                            reason: format!("invite failed: {}", e),
                        })
                        .ok();
                    return;
                }
            };
            let status = resp.as_ref().map(|r| r.status_code.clone());
            let accepted = matches!(
                status.as_ref().map(|s| s.kind()),
                Some(rsip::StatusCodeKind::Successful)
            );
            let (cancelled, unwanted) = {
                let mut table = lock(&calls);
                let cancelled = matches!(
                    table.slots.get(&call_id),
                    Some(CallSlot::Inviting {
                        cancelled: true,
                        ..
                    }) | None
                );
                if accepted && !cancelled {
                    table.dialogs.insert(dialog.id(), call_id);
                    table
                        .slots
                        .insert(call_id, CallSlot::Active(Dialog::ClientInvite(dialog)));
                    (false, None)
                } else {
                    table.slots.remove(&call_id);
                    (cancelled, Some(dialog))
                }
            };
            match unwanted {
                None => {
                    events.send(UaEvent::Established { call_id }).ok();
                }
                Some(dialog) if accepted => {
                    info!(%call_id, "rsip: call answered after local hangup, sending bye");
                    dialog.bye().await.ok();
                }
                Some(_) if !cancelled => {
                    let reason = match status {
                        Some(status) => status.to_string(),
                        None => "no response".to_string(),
                    };
                    events.send(UaEvent::Terminated { call_id, reason }).ok();
                }
                Some(_) => {}
            }
        });
        Ok(())
    }

    async fn answer(&mut self, call_id: CallId) -> Result<()> {
        let dialog = match lock(&self.calls).slots.get(&call_id) {
            Some(CallSlot::Active(Dialog::ServerInvite(d))) => d.clone(),
            _ => return Err(anyhow!("no ringing call {}", call_id)),
        };
        let answer = build_sdp(
            &self.account,
            self.local_ip,
            self.rtp_port(),
            MediaFlags {
                audio: true,
                video: false,
            },
        );
        dialog
            .accept(None, Some(answer.into_bytes()))
            .map_err(|e| anyhow!("failed to accept {}: {}", call_id, e))?;
        Ok(())
    }

    async fn hangup(&mut self, call_id: CallId) -> Result<()> {
        let slot = {
            let mut table = lock(&self.calls);
            match table.slots.get_mut(&call_id) {
                Some(CallSlot::Inviting {
                    dialog_id,
                    cancelled,
                }) => {
                    *cancelled = true;
                    if let Some(dialog_id) = dialog_id.clone() {
                        spawn_cancel(self.dialog_layer.clone(), dialog_id, call_id);
                    }
                    return Ok(());
                }
                Some(CallSlot::Active(_)) => {}
                None => return Err(anyhow!("call {} not found", call_id)),
            }
            let slot = table.slots.remove(&call_id);
            table.dialogs.retain(|_, id| *id != call_id);
            slot
        };
        match slot {
            Some(CallSlot::Active(Dialog::ServerInvite(dialog))) => {
                if dialog.bye().await.is_err() {
                    // not confirmed yet: still ringing
                    dialog
                        .reject()
                        .map_err(|e| anyhow!("failed to reject {}: {}", call_id, e))?;
                }
            }
            Some(CallSlot::Active(Dialog::ClientInvite(dialog))) => {
                dialog
                    .bye()
                    .await
                    .map_err(|e| anyhow!("failed to bye {}: {}", call_id, e))?;
            }
            _ => {}
        }
        Ok(())
    }

    async fn close(&mut self) {
        let active: Vec<CallId> = lock(&self.calls).slots.keys().copied().collect();
        for call_id in active {
            self.hangup(call_id).await.ok();
        }
        if let Some(registration) = self.registration.take() {
            registration.stop_and_wait(UNREGISTER_TIMEOUT).await;
        }
        self.token.cancel();
        info!(user = %self.account.aor(), "rsip: closed");
    }
}
