use async_trait::async_trait;
use streams_protocol::{IceServerConfig, TrackKind};
use tokio::sync::mpsc;

/// Opaque handle to a track/stream as seen by a `WebRTCPeer` implementation.
/// The engine only ever passes these back to the same peer instance that
/// produced them (or one of its `MediaEngine` counterparts); it never
/// inspects their contents.
pub type TrackHandle = std::sync::Arc<str>;
pub type StreamHandle = std::sync::Arc<str>;

/// Events a `WebRTCPeer` implementation emits back into the engine.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// An opaque SDP/ICE payload that must be forwarded to the remote peer
    /// via `SignalTransport` as a `RemoteSignal::SdpData`.
    Signal(String),
    Data(Vec<u8>),
    Stream(StreamHandle),
    Track(TrackKind, TrackHandle),
    Connect,
    Close,
    Error(String),
}

/// Per-session WebRTC endpoint. The engine never touches ICE/DTLS/SCTP
/// directly; it only drives this trait and consumes `PeerEvent`s from the
/// channel returned by `events()`.
#[cfg_attr(feature = "mockable", mockall::automock)]
#[async_trait]
pub trait WebRTCPeer: Send + Sync {
    /// Feed an inbound opaque SDP/ICE payload (from `RemoteSignal::SdpData`).
    async fn signal(&self, data: &str) -> anyhow::Result<()>;

    async fn add_stream(&self, stream: StreamHandle) -> anyhow::Result<()>;
    async fn remove_stream(&self, stream: StreamHandle) -> anyhow::Result<()>;
    async fn add_track(&self, track: TrackHandle, stream: StreamHandle) -> anyhow::Result<()>;
    async fn remove_track(&self, track: TrackHandle) -> anyhow::Result<()>;

    async fn send(&self, data: Vec<u8>) -> anyhow::Result<()>;

    /// Tear down the underlying connection. Idempotent.
    async fn destroy(&self);
}

/// Constructs `WebRTCPeer` instances. Kept separate from the trait itself so
/// mocks can swap in without simulating construction.
#[cfg_attr(feature = "mockable", mockall::automock)]
#[async_trait]
pub trait WebRTCPeerFactory: Send + Sync {
    async fn create(
        &self,
        initiator: bool,
        ice_servers: Vec<IceServerConfig>,
        trickle_ice: bool,
    ) -> anyhow::Result<(Box<dyn WebRTCPeer>, mpsc::Receiver<PeerEvent>)>;
}
