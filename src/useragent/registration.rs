use super::account::Account;
use super::stack::{TransportMask, UaEvent, UaEventSender};
use anyhow::Result;
use rsip::StatusCodeKind;
use rsipstack::{
    dialog::{authenticate::Credential, registration::Registration},
    transaction::endpoint::EndpointInnerRef,
};
use serde::{Deserialize, Serialize};
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{select, task::JoinHandle, time::sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Parameters of `Gateway::register`, turned into an account string on the
/// agent thread.
#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct RegisterOption {
    pub server: String,
    pub username: String,
    pub password: String,
    pub display_name: Option<String>,
    pub transport: String,
}

impl RegisterOption {
    pub fn aor(&self) -> String {
        format!("{}@{}", self.username, self.server)
    }

    pub fn transports(&self) -> TransportMask {
        TransportMask::from_name(&self.transport)
    }

    /// `"display" <sip:user:password@server>;medianat=id`
    pub fn account_string(&self, media_nat: Option<&str>) -> String {
        let mut s = String::new();
        if let Some(name) = self.display_name.as_deref().filter(|n| !n.is_empty()) {
            s.push('"');
            for c in name.chars() {
                if c == '"' || c == '\\' {
                    s.push('\\');
                }
                s.push(c);
            }
            s.push_str("\" ");
        }
        s.push_str("<sip:");
        s.push_str(&self.username);
        if !self.password.is_empty() {
            s.push(':');
            s.push_str(&self.password);
        }
        s.push('@');
        s.push_str(&self.server);
        s.push('>');
        if let Some(mnat) = media_nat.filter(|m| !m.is_empty()) {
            s.push_str(";medianat=");
            s.push_str(mnat);
        }
        s
    }
}

#[derive(Debug, Deserialize, Clone, Serialize)]
pub struct UserCredential {
    pub username: String,
    pub password: String,
}

impl From<UserCredential> for Credential {
    fn from(c: UserCredential) -> Self {
        Credential {
            username: c.username,
            password: c.password,
        }
    }
}

pub fn account_credential(account: &Account) -> Option<UserCredential> {
    let auth = account.authentication();
    let username = auth.user.clone()?;
    Some(UserCredential {
        username,
        password: auth.password.clone().unwrap_or_default(),
    })
}

pub struct RegistrationHandleInner {
    pub endpoint_inner: EndpointInnerRef,
    pub aor: String,
    /// `host[:port][;transport=..]`, the REGISTER request-URI without scheme
    pub server: String,
    pub contact: rsip::Uri,
    pub credential: Option<UserCredential>,
    pub expires: u32,
    pub cancel_token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct RegistrationHandle {
    inner: Arc<RegistrationHandleInner>,
}

impl RegistrationHandle {
    /// Starts the REGISTER loop for `account`. The binding is refreshed at
    /// 75% of the granted expiry; a failed attempt is reported once and
    /// ends the loop.
    pub fn start(
        endpoint_inner: EndpointInnerRef,
        account: &Account,
        server: String,
        contact: rsip::Uri,
        cancel_token: CancellationToken,
        events: UaEventSender,
    ) -> Self {
        let handle = RegistrationHandle {
            inner: Arc::new(RegistrationHandleInner {
                endpoint_inner,
                aor: account.aor().to_string(),
                server,
                contact,
                credential: account_credential(account),
                expires: account.registration_interval(),
                cancel_token,
                task: Mutex::new(None),
            }),
        };

        let task_handle = handle.clone();
        let task = tokio::spawn(async move {
            let handle = task_handle;
            let mut registered = false;

            select! {
                _ = handle.inner.cancel_token.cancelled() => {}
                _ = async {
                    loop {
                        match handle.do_register(handle.inner.expires).await {
                            Ok(expires) => {
                                info!(user = %handle.inner.aor, expires, "registration refreshed");
                                registered = true;
                                events.send(UaEvent::Registered { expires }).ok();
                                let refresh = (expires as u64 * 3 / 4).max(1);
                                sleep(Duration::from_secs(refresh)).await;
                            }
                            Err(e) => {
                                warn!(user = %handle.inner.aor, "registration failed: {:?}", e);
                                registered = false;
                                events
                                    .send(UaEvent::RegisterFailed { reason: e.to_string() })
                                    .ok();
                                break;
                            }
                        }
                    }
                } => {}
            }
            if registered {
                handle.do_register(0).await.ok();
                info!(user = %handle.inner.aor, "unregistered");
            }
        });
        *handle
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);
        handle
    }

    pub fn stop(&self) {
        self.inner.cancel_token.cancel();
    }

    /// Stops the loop and waits up to `timeout` for the unregister to go out.
    pub async fn stop_and_wait(&self, timeout: Duration) {
        self.stop();
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            if tokio::time::timeout(timeout, task).await.is_err() {
                warn!(user = %self.inner.aor, "registration did not stop in time");
            }
        }
    }

    async fn do_register(&self, expires: u32) -> Result<u32> {
        let mut registration = Registration::new(
            self.inner.endpoint_inner.clone(),
            self.inner.credential.clone().map(|c| c.into()),
        );
        registration.contact = Some(rsip::typed::Contact {
            display_name: None,
            uri: self.inner.contact.clone(),
            params: vec![rsip::Param::Expires(rsip::param::Expires::new(
                expires.to_string(),
            ))],
        });
        let resp = registration
            .register(&self.inner.server)
            .await
            .map_err(|e| anyhow::anyhow!("Registration failed: {}", e))?;

        debug!(user = %self.inner.aor, "registration response: {:?}", resp);
        match resp.status_code.kind() {
            StatusCodeKind::Successful => Ok(registration.expires()),
            _ => Err(anyhow::anyhow!("{}", resp.status_code)),
        }
    }
}
