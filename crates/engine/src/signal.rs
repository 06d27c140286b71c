use async_trait::async_trait;
use streams_protocol::{AgentPubKey, RemoteSignal};
use tokio::sync::mpsc;

/// Delivers remote signals between peers addressed by `AgentPubKey`.
///
/// Implementations are assumed unreliable (a sent signal may never arrive)
/// but not corrupting: signals that do arrive are well-formed and in the
/// order the sender issued them to a given recipient. The engine never
/// blocks its driver loop on `send`; implementations should buffer or drop
/// rather than apply backpressure.
#[cfg_attr(feature = "mockable", mockall::automock)]
#[async_trait]
pub trait SignalTransport: Send + Sync {
    async fn send(&self, to: AgentPubKey, signal: RemoteSignal) -> anyhow::Result<()>;

    /// Subscribe to inbound signals addressed to us. Only one subscription
    /// is expected to be active per transport instance.
    fn subscribe(&self) -> mpsc::Receiver<RemoteSignal>;
}
