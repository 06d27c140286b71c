use streams_protocol::{AgentPubKey, ConnectionFamily, StreamInfo, TrackKind};
use tracing::info;

use crate::media::{MediaEngine, MediaSource};
use crate::registry::{ConnectionRegistry, Direction};
use crate::webrtc_peer::WebRTCPeer;

/// Detects and repairs asymmetric media-state views: we think a peer should
/// be receiving our stream/tracks, but their self-reported `stream_info`
/// (carried in their `PongUi` metadata) disagrees.
pub struct Reconciler;

impl Reconciler {
    /// Compare `peer`'s reported `stream_info` against our own `main_stream`
    /// and repair any mismatch found. `peer`'s `OpenConnection` on the video
    /// family must exist; callers are expected to have checked that.
    pub async fn reconcile(
        &self,
        peer: AgentPubKey,
        reported: &StreamInfo,
        media: &mut MediaEngine,
        source: &dyn MediaSource,
        registry: &ConnectionRegistry,
    ) -> anyhow::Result<()> {
        let Some(conn) = registry.open_connection(ConnectionFamily::Video, &peer, Direction::Duplex) else {
            return Ok(());
        };

        let main_stream_exists = media.main_stream().is_some();

        if main_stream_exists && reported.stream.is_none() {
            info!(%peer, "reconciling: peer reports no stream, re-adding main stream");
            self.clone_and_reattach(peer, media, source, conn.peer_handle.as_ref()).await?;
            return Ok(());
        }

        let mut needs_reattach = false;
        if media.is_video_enabled() {
            let ok = reported
                .track(TrackKind::Video)
                .map(|t| t.enabled && !t.muted)
                .unwrap_or(false);
            if !ok {
                needs_reattach = true;
            }
        }
        if media.is_audio_enabled() {
            let ok = reported
                .track(TrackKind::Audio)
                .map(|t| t.enabled && !t.muted)
                .unwrap_or(false);
            if !ok {
                needs_reattach = true;
            }
        }

        if needs_reattach {
            info!(%peer, "reconciling: peer reports stale track state, cloning and reattaching");
            self.clone_and_reattach(peer, media, source, conn.peer_handle.as_ref()).await?;
        }

        Ok(())
    }

    /// The clone-and-reattach workaround: removing then re-adding the same
    /// track on the same peer is broken in the underlying WebRTC peer
    /// library, and removing/re-adding the whole stream deactivates it on
    /// the remote side. Instead we clone the stream, retain the clone, and
    /// reattach the clone's individual tracks.
    async fn clone_and_reattach(
        &self,
        peer: AgentPubKey,
        media: &mut MediaEngine,
        source: &dyn MediaSource,
        peer_handle: &dyn WebRTCPeer,
    ) -> anyhow::Result<()> {
        let Some(stream) = media.main_stream().cloned() else {
            return Ok(());
        };
        let _ = peer;

        peer_handle.remove_stream(stream.clone()).await?;
        let clone = source.clone_stream(&stream).await?;
        peer_handle.add_stream(clone.stream.clone()).await?;
        if let Some(track) = &clone.audio_track {
            peer_handle.add_track(track.clone(), clone.stream.clone()).await?;
        }
        if let Some(track) = &clone.video_track {
            peer_handle.add_track(track.clone(), clone.stream.clone()).await?;
        }
        media.retain_clone(clone);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use streams_protocol::StreamSnapshot;
    use uuid::Uuid;

    use super::*;
    use crate::events::EventBus;
    use crate::media::{ClonedStream, MediaSource};
    use crate::registry::OpenConnection;
    use crate::webrtc_peer::{StreamHandle, TrackHandle, WebRTCPeer};

    struct FakePeer {
        remove_stream_calls: Arc<AtomicUsize>,
        add_stream_calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WebRTCPeer for FakePeer {
        async fn signal(&self, _data: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn add_stream(&self, _stream: StreamHandle) -> anyhow::Result<()> {
            self.add_stream_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn remove_stream(&self, _stream: StreamHandle) -> anyhow::Result<()> {
            self.remove_stream_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn add_track(&self, _track: TrackHandle, _stream: StreamHandle) -> anyhow::Result<()> {
            Ok(())
        }
        async fn remove_track(&self, _track: TrackHandle) -> anyhow::Result<()> {
            Ok(())
        }
        async fn send(&self, _data: Vec<u8>) -> anyhow::Result<()> {
            Ok(())
        }
        async fn destroy(&self) {}
    }

    struct FakeMediaSource;

    #[async_trait]
    impl MediaSource for FakeMediaSource {
        async fn acquire_video_track(&self) -> anyhow::Result<TrackHandle> {
            Ok(TrackHandle::from("video"))
        }
        async fn acquire_audio_track(&self) -> anyhow::Result<TrackHandle> {
            Ok(TrackHandle::from("audio"))
        }
        async fn new_stream(&self, _tracks: &[TrackHandle]) -> anyhow::Result<StreamHandle> {
            Ok(StreamHandle::from("stream"))
        }
        async fn clone_stream(&self, stream: &StreamHandle) -> anyhow::Result<ClonedStream> {
            Ok(ClonedStream { stream: stream.clone(), audio_track: None, video_track: None })
        }
        async fn set_track_enabled(&self, _track: &TrackHandle, _enabled: bool) -> anyhow::Result<()> {
            Ok(())
        }
        async fn stop_track(&self, _track: &TrackHandle) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn peer_key(byte: u8) -> AgentPubKey {
        AgentPubKey::new([byte; 32])
    }

    /// Brings up `media.main_stream` via the real `video_on` path against an
    /// empty registry, then inserts the fake peer connection afterwards so
    /// its `add_stream`/`remove_stream` counters start clean for the test.
    async fn media_with_main_stream() -> MediaEngine {
        let mut media = MediaEngine::new();
        let empty_registry = ConnectionRegistry::new();
        media.video_on(&FakeMediaSource, &empty_registry, &EventBus::default()).await.unwrap();
        // Turn video back off so `reconcile`'s track-state comparison is
        // skipped; this fixture only cares about the main-stream presence.
        media.video_off(&FakeMediaSource, &empty_registry, &EventBus::default()).await.unwrap();
        media
    }

    async fn registry_with_video_peer(peer: AgentPubKey, remove_calls: Arc<AtomicUsize>, add_calls: Arc<AtomicUsize>) -> ConnectionRegistry {
        let mut registry = ConnectionRegistry::new();
        registry
            .insert_open_connection(
                ConnectionFamily::Video,
                peer,
                OpenConnection {
                    connection_id: Uuid::new_v4(),
                    peer_handle: Box::new(FakePeer { remove_stream_calls: remove_calls, add_stream_calls: add_calls }),
                    video: false,
                    audio: false,
                    connected: true,
                    direction: Direction::Duplex,
                },
            )
            .await;
        registry
    }

    #[tokio::test]
    async fn reconcile_reattaches_when_peer_reports_no_stream() {
        let peer = peer_key(1);
        let remove_calls = Arc::new(AtomicUsize::new(0));
        let add_calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with_video_peer(peer, remove_calls.clone(), add_calls.clone()).await;
        let mut media = media_with_main_stream().await;

        let reconciler = Reconciler;
        let reported = StreamInfo { stream: None, tracks: Vec::new() };
        reconciler.reconcile(peer, &reported, &mut media, &FakeMediaSource, &registry).await.unwrap();

        assert_eq!(remove_calls.load(Ordering::SeqCst), 1);
        assert_eq!(add_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn reconcile_is_noop_when_reported_state_matches() {
        let peer = peer_key(2);
        let remove_calls = Arc::new(AtomicUsize::new(0));
        let add_calls = Arc::new(AtomicUsize::new(0));
        let registry = registry_with_video_peer(peer, remove_calls.clone(), add_calls.clone()).await;
        let mut media = media_with_main_stream().await;

        let reconciler = Reconciler;
        let reported = StreamInfo { stream: Some(StreamSnapshot { active: true }), tracks: Vec::new() };
        reconciler.reconcile(peer, &reported, &mut media, &FakeMediaSource, &registry).await.unwrap();

        assert_eq!(remove_calls.load(Ordering::SeqCst), 0);
        assert_eq!(add_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reconcile_returns_ok_when_peer_has_no_open_connection() {
        let registry = ConnectionRegistry::new();
        let mut media = MediaEngine::new();
        let reconciler = Reconciler;
        let reported = StreamInfo { stream: None, tracks: Vec::new() };
        let result = reconciler.reconcile(peer_key(9), &reported, &mut media, &FakeMediaSource, &registry).await;
        assert!(result.is_ok());
    }
}
