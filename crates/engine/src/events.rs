use streams_protocol::AgentPubKey;
use uuid::Uuid;

use crate::error::EngineError;

/// Identifies the peer and handshake a peer-scoped event concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerRef {
    pub peer: AgentPubKey,
    pub connection_id: Uuid,
}

/// Lifecycle notifications emitted to whoever holds the `StreamsStore`
/// handle's event receiver. The registry itself exposes plain snapshot
/// accessors; this is the only reactive surface the engine provides.
#[derive(Debug, Clone)]
pub enum Event {
    MyVideoOn,
    MyVideoOff,
    MyAudioOn,
    MyAudioOff,
    MyScreenShareOn,
    MyScreenShareOff,
    PeerConnected(PeerRef),
    PeerDisconnected(PeerRef),
    PeerAudioOn(PeerRef),
    PeerAudioOff(PeerRef),
    PeerVideoOn(PeerRef),
    PeerVideoOff(PeerRef),
    PeerStream(PeerRef),
    PeerScreenShareStream(PeerRef),
    PeerScreenShareTrack(PeerRef),
    PeerScreenShareConnected(PeerRef),
    PeerScreenShareDisconnected(PeerRef),
    Error(String),
}

impl Event {
    pub fn error(err: impl Into<EngineError>) -> Self {
        Event::Error(err.into().to_string())
    }
}

/// Fan-out channel for engine events. Wraps `tokio::sync::broadcast` so the
/// store task can publish without waiting on a consumer; a caller that never
/// subscribes simply never receives anything, and lagging subscribers only
/// lose history, never block the driver loop.
pub struct EventBus {
    sender: tokio::sync::broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: Event) {
        // No subscribers is a normal, common state (e.g. headless tests);
        // the send error just means the event had nowhere to go.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
