use crate::useragent::OwnerRef;
use serde::{Deserialize, Serialize};

/// GatewayEvent is reported to the owner of a gateway, keyed by peer URI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEvent {
    /// Registration accepted by the server
    RegisterOk { aor: String },
    /// Registration was rejected or could not be sent; never retried
    RegisterFailed { aor: String, reason: String },
    /// A remote party is calling; answer with `accept` or `reject`
    IncomingCall { peer: String },
    CallEstablished {
        peer: String,
        owner: Option<OwnerRef>,
        audio: bool,
        video: bool,
    },
    CallUpdated { peer: String },
    CallClosed { peer: String, reason: String },
}

impl GatewayEvent {
    pub fn peer(&self) -> Option<&str> {
        match self {
            GatewayEvent::IncomingCall { peer }
            | GatewayEvent::CallEstablished { peer, .. }
            | GatewayEvent::CallUpdated { peer }
            | GatewayEvent::CallClosed { peer, .. } => Some(peer),
            GatewayEvent::RegisterOk { .. } | GatewayEvent::RegisterFailed { .. } => None,
        }
    }
}

/// Type alias for the event sender
pub type EventSender = tokio::sync::broadcast::Sender<GatewayEvent>;

/// Type alias for the event receiver
pub type EventReceiver = tokio::sync::broadcast::Receiver<GatewayEvent>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = GatewayEvent::CallClosed {
            peer: "sip:bob@example.com".to_string(),
            reason: "bye".to_string(),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "call_closed");
        assert_eq!(value["peer"], "sip:bob@example.com");
        assert_eq!(event.peer(), Some("sip:bob@example.com"));
    }
}
