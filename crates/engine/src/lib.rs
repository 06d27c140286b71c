pub mod error;
pub mod events;
pub mod liveness;
pub mod media;
pub mod reconciler;
pub mod registry;
pub mod signal;
pub mod state_machine;
pub mod store;
pub mod webrtc_peer;

pub use error::EngineError;
pub use events::{Event, EventBus, PeerRef};
pub use liveness::LivenessProtocol;
pub use media::{ClonedStream, MediaEngine, MediaSource, ScreenSourceSelector};
pub use reconciler::Reconciler;
pub use registry::{ConnectionRegistry, Direction, OpenConnection, PendingAccept, PendingInit};
pub use signal::SignalTransport;
pub use state_machine::StateMachine;
pub use store::{Command, StreamsStore, StreamsStoreDeps, StreamsStoreHandle};
pub use webrtc_peer::{PeerEvent, StreamHandle, TrackHandle, WebRTCPeer, WebRTCPeerFactory};
