use crate::config::GatewayConfig;
use crate::event::{EventReceiver, GatewayEvent};
use crate::useragent::command::CallId;
use crate::useragent::stack::{
    MediaFlags, SipStack, StackContext, UaEvent, UaEventSender, UaSession,
};
use crate::useragent::Account;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Operations a [`FakeStack`] session saw, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeOp {
    Bind(String),
    Register,
    Invite {
        call_id: CallId,
        callee: String,
        media: MediaFlags,
    },
    Answer(CallId),
    Hangup(CallId),
    Close,
}

/// In-memory SIP stack: records every operation and answers REGISTER and
/// INVITE immediately.
#[derive(Default)]
pub struct FakeStack {
    pub(crate) ops: Arc<Mutex<Vec<FakeOp>>>,
    pub(crate) events: Mutex<Option<UaEventSender>>,
    pub fail_bind: bool,
    pub fail_register: bool,
    pub establish_on_invite: bool,
    /// Stalls `bind` before it succeeds.
    pub bind_delay: Option<Duration>,
    /// Stalls `close` before it records [`FakeOp::Close`].
    pub close_delay: Option<Duration>,
}

impl FakeStack {
    pub fn ops(&self) -> Vec<FakeOp> {
        self.ops.lock().unwrap().clone()
    }

    pub fn invites(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                FakeOp::Invite { callee, .. } => Some(callee),
                _ => None,
            })
            .collect()
    }

    /// Delivers `event` to the most recently bound session's agent.
    pub fn inject(&self, event: UaEvent) -> bool {
        match self.events.lock().unwrap().as_ref() {
            Some(sender) => sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Polls until `f` holds for the recorded operations.
    pub fn wait_for(&self, f: impl Fn(&[FakeOp]) -> bool) -> bool {
        for _ in 0..500 {
            if f(&self.ops()) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }
}

struct FakeSession {
    account: Arc<Account>,
    ops: Arc<Mutex<Vec<FakeOp>>>,
    events: UaEventSender,
    fail_register: bool,
    establish_on_invite: bool,
    close_delay: Option<Duration>,
}

impl FakeSession {
    fn record(&self, op: FakeOp) {
        self.ops.lock().unwrap().push(op);
    }
}

#[async_trait]
impl SipStack for FakeStack {
    async fn bind(&self, ctx: StackContext) -> Result<Box<dyn UaSession>> {
        if let Some(delay) = self.bind_delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_bind {
            return Err(anyhow!("bind refused"));
        }
        self.ops
            .lock()
            .unwrap()
            .push(FakeOp::Bind(ctx.account.aor().to_string()));
        *self.events.lock().unwrap() = Some(ctx.events.clone());
        Ok(Box::new(FakeSession {
            account: ctx.account,
            ops: self.ops.clone(),
            events: ctx.events,
            fail_register: self.fail_register,
            establish_on_invite: self.establish_on_invite,
            close_delay: self.close_delay,
        }))
    }
}

#[async_trait]
impl UaSession for FakeSession {
    fn local_addr(&self) -> Option<String> {
        Some("127.0.0.1:5060".to_string())
    }

    async fn register(&mut self) -> Result<()> {
        self.record(FakeOp::Register);
        let event = if self.fail_register {
            UaEvent::RegisterFailed {
                reason: "403 Forbidden".to_string(),
            }
        } else {
            UaEvent::Registered {
                expires: self.account.registration_interval(),
            }
        };
        self.events.send(event).ok();
        Ok(())
    }

    async fn invite(&mut self, call_id: CallId, callee: &str, media: MediaFlags) -> Result<()> {
        self.record(FakeOp::Invite {
            call_id,
            callee: callee.to_string(),
            media,
        });
        if self.establish_on_invite {
            self.events.send(UaEvent::Established { call_id }).ok();
        }
        Ok(())
    }

    async fn answer(&mut self, call_id: CallId) -> Result<()> {
        self.record(FakeOp::Answer(call_id));
        self.events.send(UaEvent::Established { call_id }).ok();
        Ok(())
    }

    async fn hangup(&mut self, call_id: CallId) -> Result<()> {
        self.record(FakeOp::Hangup(call_id));
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(delay) = self.close_delay {
            tokio::time::sleep(delay).await;
        }
        self.record(FakeOp::Close);
    }
}

pub fn test_config() -> GatewayConfig {
    GatewayConfig {
        min_port: 10000,
        max_port: 10010,
        ..Default::default()
    }
}

/// Next event matching `f`, skipping others. Panics after five seconds.
pub async fn next_event(
    rx: &mut EventReceiver,
    f: impl Fn(&GatewayEvent) -> bool,
) -> GatewayEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if f(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event channel: {:?}", e),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}
