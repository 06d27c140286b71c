use streams_protocol::ConnectionFamily;
use uuid::Uuid;

/// Engine failure modes. None of these are fatal to the engine as a whole:
/// every call site that can produce one either logs it via `tracing` or, if
/// a caller needs to observe it, turns it into `Event::Error`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to acquire media: {0}")]
    MediaAcquisition(String),

    #[error("failed to parse peer metadata: {0}")]
    MetadataParse(#[from] serde_json::Error),

    #[error("orphaned {kind} signal for {family:?} family")]
    OrphanedSignal { family: ConnectionFamily, kind: &'static str },

    #[error("peer {peer} connection closed")]
    PeerClosed { peer: String },

    #[error("signal transport error: {0}")]
    Transport(String),

    #[error("no open connection {connection_id} for peer {peer}")]
    UnknownConnection { peer: String, connection_id: Uuid },
}
