use anyhow::{anyhow, Result};
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct LookupRequest {
    target: String,
    reply: oneshot::Sender<Result<Vec<SocketAddr>>>,
}

/// Name resolution service running on one background thread shared by
/// every agent of a module.
pub struct Resolver {
    handle: ResolverHandle,
    token: CancellationToken,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Cloneable client side of the [`Resolver`].
#[derive(Clone)]
pub struct ResolverHandle {
    sender: mpsc::UnboundedSender<LookupRequest>,
    prefer_ipv6: bool,
}

impl Resolver {
    pub fn start(prefer_ipv6: bool) -> Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        let thread_token = token.clone();
        let thread = std::thread::Builder::new()
            .name("sipua-dnsc".to_string())
            .spawn(move || serve(receiver, thread_token))
            .map_err(|e| anyhow!("failed to start resolver thread: {}", e))?;
        info!("resolver: started");
        Ok(Self {
            handle: ResolverHandle {
                sender,
                prefer_ipv6,
            },
            token,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn handle(&self) -> ResolverHandle {
        self.handle.clone()
    }

    /// Stops the resolver thread and waits for it. Safe to call twice.
    pub fn stop(&self) {
        self.token.cancel();
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                warn!("resolver: thread panicked");
            }
            info!("resolver: stopped");
        }
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.stop();
    }
}

fn serve(mut receiver: mpsc::UnboundedReceiver<LookupRequest>, token: CancellationToken) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            warn!("resolver: failed to build runtime: {}", e);
            return;
        }
    };
    runtime.block_on(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                request = receiver.recv() => match request {
                    Some(request) => {
                        tokio::spawn(async move {
                            let result = tokio::net::lookup_host(request.target.as_str())
                                .await
                                .map(|addrs| addrs.collect::<Vec<_>>())
                                .map_err(|e| anyhow!("lookup {} failed: {}", request.target, e));
                            debug!(target = %request.target, ok = result.is_ok(), "resolver: lookup done");
                            request.reply.send(result).ok();
                        });
                    }
                    None => break,
                },
            }
        }
    });
}

impl ResolverHandle {
    /// Resolves `host:port`, ordering addresses by the preferred family.
    pub async fn lookup(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
        let target = if host.contains(':') && !host.starts_with('[') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        };
        let (reply, response) = oneshot::channel();
        self.sender
            .send(LookupRequest { target, reply })
            .map_err(|_| anyhow!("resolver stopped"))?;
        let mut addrs = response
            .await
            .map_err(|_| anyhow!("resolver stopped"))??;
        if addrs.is_empty() {
            return Err(anyhow!("no address found for {}", host));
        }
        let prefer_ipv6 = self.prefer_ipv6;
        addrs.sort_by_key(|a| a.is_ipv6() != prefer_ipv6);
        Ok(addrs)
    }
}
