use super::Gateway;
use crate::event::GatewayEvent;
use crate::useragent::tests::common::{next_event, test_config, FakeOp, FakeStack};
use crate::useragent::{OwnerRef, SipModule, UaEvent};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn gateway(stack: Arc<FakeStack>) -> Gateway {
    let module = SipModule::with_stack(test_config(), stack).unwrap();
    Gateway::with_module(Arc::new(module))
}

#[tokio::test]
async fn test_register_call_hangup_close() {
    tracing_subscriber::fmt::try_init().ok();
    let stack = Arc::new(FakeStack::default());
    let gw = gateway(stack.clone());
    let mut rx = gw.subscribe();

    assert!(gw.register("sip.example.com", "alice", "secret", "Alice", "udp"));
    assert!(gw.is_active());
    next_event(&mut rx, |e| matches!(e, GatewayEvent::RegisterOk { .. })).await;

    assert!(gw.make_call("bob@example.com", true, false));
    gw.hangup("bob@example.com");
    let closed = next_event(&mut rx, |e| e.peer() == Some("sip:bob@example.com")).await;
    assert_eq!(
        closed,
        GatewayEvent::CallClosed {
            peer: "sip:bob@example.com".to_string(),
            reason: "local hangup".to_string(),
        }
    );

    gw.close();
    assert!(!gw.is_active());
    let ops = stack.ops();
    assert!(matches!(
        &ops[2],
        FakeOp::Invite { callee, media, .. } if callee == "sip:bob@example.com" && media.audio && !media.video
    ));
    assert!(matches!(ops[3], FakeOp::Hangup(_)));
    assert_eq!(ops.last(), Some(&FakeOp::Close));
    assert!(!gw.make_call("bob@example.com", true, false));
}

#[test]
fn test_close_twice() {
    let stack = Arc::new(FakeStack::default());
    let gw = gateway(stack.clone());
    assert!(gw.register("sip.example.com", "alice", "secret", "", "udp"));
    gw.close();
    gw.close();
    assert_eq!(
        stack
            .ops()
            .iter()
            .filter(|op| **op == FakeOp::Close)
            .count(),
        1
    );
    assert!(!gw.register("sip.example.com", "alice", "secret", "", "udp"));
}

#[test]
fn test_operations_without_agent() {
    let gw = gateway(Arc::new(FakeStack::default()));
    assert!(!gw.make_call("bob@example.com", true, true));
    assert!(!gw.accept("bob@example.com"));
    assert!(!gw.set_call_owner("bob@example.com", None));
    gw.hangup("bob@example.com");
    gw.reject("bob@example.com");
    gw.close();
}

#[test]
fn test_register_twice() {
    let stack = Arc::new(FakeStack::default());
    let gw = gateway(stack);
    assert!(gw.register("sip.example.com", "alice", "secret", "Alice", "udp"));
    assert!(!gw.register("sip.example.com", "alice", "secret", "Alice", "udp"));
    assert_eq!(gw.aor().as_deref(), Some("sip:alice@sip.example.com"));
}

#[tokio::test]
async fn test_unknown_transport_has_no_usable_transport() {
    let stack = Arc::new(FakeStack::default());
    let gw = gateway(stack.clone());
    let mut rx = gw.subscribe();
    assert!(gw.register("sip.example.com", "alice", "secret", "Alice", "sctp"));
    match next_event(&mut rx, |e| matches!(e, GatewayEvent::RegisterFailed { .. })).await {
        GatewayEvent::RegisterFailed { aor, reason } => {
            assert_eq!(aor, "sip:alice@sip.example.com");
            assert_eq!(reason, "no usable transport");
        }
        e => panic!("unexpected event: {:?}", e),
    }
    gw.close();
    assert!(!stack.ops().contains(&FakeOp::Register));
}

#[test]
fn test_close_during_register() {
    let stack = Arc::new(FakeStack {
        bind_delay: Some(Duration::from_millis(300)),
        ..Default::default()
    });
    let module = Arc::new(SipModule::with_stack(test_config(), stack.clone()).unwrap());
    let gw = Gateway::with_module(module.clone());

    std::thread::scope(|s| {
        let register = s.spawn(|| gw.register("sip.example.com", "alice", "secret", "", "udp"));
        std::thread::sleep(Duration::from_millis(50));
        let started = Instant::now();
        gw.close();
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(!register.join().unwrap());
    });
    assert!(!gw.is_active());
    assert_eq!(module.agent_count(), 0);
    assert_eq!(stack.ops().last(), Some(&FakeOp::Close));
}

#[tokio::test]
async fn test_incoming_accept_with_owner() {
    let stack = Arc::new(FakeStack::default());
    let gw = gateway(stack.clone());
    let mut rx = gw.subscribe();
    assert!(gw.register("sip.example.com", "alice", "secret", "Alice", "udp"));

    let call_id = crate::useragent::CallId::next();
    assert!(stack.inject(UaEvent::Incoming {
        call_id,
        peer: "sip:carol@example.com".to_string(),
    }));
    let incoming = next_event(&mut rx, |e| matches!(e, GatewayEvent::IncomingCall { .. })).await;
    assert_eq!(incoming.peer(), Some("sip:carol@example.com"));

    assert!(gw.set_call_owner("carol@example.com", Some(OwnerRef("room-7".to_string()))));
    assert!(gw.accept("carol@example.com"));
    let established =
        next_event(&mut rx, |e| matches!(e, GatewayEvent::CallEstablished { .. })).await;
    assert_eq!(
        established,
        GatewayEvent::CallEstablished {
            peer: "sip:carol@example.com".to_string(),
            owner: Some(OwnerRef("room-7".to_string())),
            audio: true,
            video: false,
        }
    );
    assert!(stack.ops().contains(&FakeOp::Answer(call_id)));

    gw.reject("sip:carol@example.com");
    next_event(&mut rx, |e| matches!(e, GatewayEvent::CallClosed { .. })).await;
    gw.close();
}

#[tokio::test]
async fn test_gateways_share_module() {
    let stack = Arc::new(FakeStack::default());
    let module = Arc::new(SipModule::with_stack(test_config(), stack.clone()).unwrap());
    let first = Gateway::with_module(module.clone());
    let second = Gateway::with_module(module.clone());

    assert!(first.register("sip.example.com", "alice", "secret", "Alice", "udp"));
    assert!(second.register("sip.example.com", "bob", "secret", "Bob", "udp"));
    assert_eq!(module.agent_count(), 2);

    first.close();
    assert_eq!(module.agent_count(), 1);
    module.shutdown();
    assert_eq!(module.agent_count(), 0);
    assert!(!second.make_call("carol@example.com", true, false));
    second.close();
}
