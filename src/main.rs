use anyhow::Result;
use clap::Parser;
use sipua_gateway::config::{Cli, Config};
use sipua_gateway::event::GatewayEvent;
use sipua_gateway::useragent::SipModule;
use sipua_gateway::Gateway;
use std::fs::File;
use std::sync::Arc;
use tokio::select;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, level_filters::LevelFilter, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match cli.conf.as_deref() {
        Some(conf) if std::path::Path::new(conf).exists() => Config::load(conf)?,
        _ => Config::default(),
    };

    let mut log_fmt = tracing_subscriber::fmt();
    if let Some(ref level) = config.log_level {
        if let Ok(lv) = level.as_str().parse::<LevelFilter>() {
            log_fmt = log_fmt.with_max_level(lv);
        }
    }

    let _guard = if let Some(ref log_file) = config.log_file {
        let file = File::create(log_file)?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        log_fmt.with_writer(non_blocking).try_init().ok();
        Some(guard)
    } else {
        log_fmt.try_init().ok();
        None
    };

    if config.accounts.is_empty() {
        warn!("no accounts configured, nothing to do");
        return Ok(());
    }

    let module = Arc::new(SipModule::new(config.sip.clone())?);
    let mut gateways = Vec::new();
    let mut first_events = None;
    for account in &config.accounts {
        let gateway = Gateway::with_module(module.clone());
        let mut events = gateway.subscribe();
        let status_events = gateway.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => match serde_json::to_string(&event) {
                        Ok(line) => println!("{}", line),
                        Err(e) => warn!("failed to encode event: {}", e),
                    },
                    Err(RecvError::Lagged(n)) => warn!(skipped = n, "event receiver lagged"),
                    Err(RecvError::Closed) => break,
                }
            }
        });
        let registered = gateway.register(
            &account.server,
            &account.username,
            &account.password,
            account.display_name.as_deref().unwrap_or_default(),
            account.transport.as_deref().unwrap_or("udp"),
        );
        info!(server = %account.server, username = %account.username, registered, "account started");
        if registered {
            if gateways.is_empty() {
                first_events = Some(status_events);
            }
            gateways.push(gateway);
        }
    }

    if let (Some(callee), Some(gateway), Some(mut events)) =
        (cli.call.as_deref(), gateways.first(), first_events)
    {
        let callee = callee.to_string();
        let video = !cli.no_video;
        let ready = async {
            while let Ok(event) = events.recv().await {
                match event {
                    GatewayEvent::RegisterOk { .. } => return true,
                    GatewayEvent::RegisterFailed { .. } => return false,
                    _ => {}
                }
            }
            false
        };
        select! {
            registered = ready => {
                if registered {
                    let placed = gateway.make_call(&callee, true, video);
                    info!(%callee, placed, "outbound call");
                } else {
                    warn!(%callee, "registration failed, call not placed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received CTRL+C, shutting down");
                shutdown(&gateways, &module);
                return Ok(());
            }
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Received CTRL+C, shutting down");
    shutdown(&gateways, &module);
    Ok(())
}

fn shutdown(gateways: &[Gateway], module: &SipModule) {
    for gateway in gateways {
        gateway.close();
    }
    module.shutdown();
}
