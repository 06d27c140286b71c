use async_trait::async_trait;
use streams_protocol::{ConnectionFamily, RtcAction, RtcMessage};
use tracing::{debug, info, warn};

use crate::error::EngineError;
use crate::events::{Event, EventBus};
use crate::registry::{ConnectionRegistry, Direction};
use crate::webrtc_peer::{StreamHandle, TrackHandle, WebRTCPeer};

/// A freshly cloned stream together with the individual track handles it
/// carries, as produced by [`MediaSource::clone_stream`]. The clone-and-
/// reattach procedure needs these track handles to re-add them individually
/// via `add_track`, matching the remote side's expectations.
#[derive(Debug, Clone)]
pub struct ClonedStream {
    pub stream: StreamHandle,
    pub audio_track: Option<TrackHandle>,
    pub video_track: Option<TrackHandle>,
}

/// Acquires local audio/video tracks from the host platform. External
/// collaborator: the engine never talks to a camera or microphone directly.
#[cfg_attr(feature = "mockable", mockall::automock)]
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire_video_track(&self) -> anyhow::Result<TrackHandle>;
    async fn acquire_audio_track(&self) -> anyhow::Result<TrackHandle>;
    /// Create a fresh local stream handle containing the given tracks.
    async fn new_stream(&self, tracks: &[TrackHandle]) -> anyhow::Result<StreamHandle>;
    /// Clone an existing stream and its current tracks into a new handle,
    /// used by the clone-and-reattach reconciliation workaround.
    async fn clone_stream(&self, stream: &StreamHandle) -> anyhow::Result<ClonedStream>;
    async fn set_track_enabled(&self, track: &TrackHandle, enabled: bool) -> anyhow::Result<()>;
    async fn stop_track(&self, track: &TrackHandle) -> anyhow::Result<()>;
}

/// User-facing screen-share source picker. External collaborator.
#[cfg_attr(feature = "mockable", mockall::automock)]
#[async_trait]
pub trait ScreenSourceSelector: Send + Sync {
    async fn select_screen_stream(&self) -> anyhow::Result<(StreamHandle, TrackHandle)>;
}

#[derive(Default)]
struct LocalTrack {
    handle: Option<TrackHandle>,
    enabled: bool,
}

/// Owns the local camera/microphone stream, the screen-share stream, and
/// their retained clones, and attaches/detaches tracks across open
/// connections. The engine's only mutable media state.
pub struct MediaEngine {
    main_stream: Option<StreamHandle>,
    video_track: LocalTrack,
    audio_track: LocalTrack,
    /// Clones retained across reconciliation events, so a later `audio_off`
    /// can still disable audio on every clone a peer was reattached to.
    stream_clones: Vec<ClonedStream>,
    screen_stream: Option<StreamHandle>,
    screen_track: Option<TrackHandle>,
}

impl Default for MediaEngine {
    fn default() -> Self {
        Self {
            main_stream: None,
            video_track: LocalTrack::default(),
            audio_track: LocalTrack::default(),
            stream_clones: Vec::new(),
            screen_stream: None,
            screen_track: None,
        }
    }
}

impl MediaEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen_stream.is_some()
    }

    pub fn is_video_enabled(&self) -> bool {
        self.video_track.enabled
    }

    pub fn is_audio_enabled(&self) -> bool {
        self.audio_track.enabled
    }

    pub fn main_stream(&self) -> Option<&StreamHandle> {
        self.main_stream.as_ref()
    }

    async fn attach_video_to_all(
        &self,
        registry: &ConnectionRegistry,
        track: &TrackHandle,
        stream: &StreamHandle,
    ) {
        for (peer, conn) in registry.open_connections(ConnectionFamily::Video) {
            if let Err(err) = conn.peer_handle.add_track(track.clone(), stream.clone()).await {
                warn!(%peer, %err, "failed to attach video track");
            }
        }
    }

    async fn attach_audio_to_all(
        &self,
        registry: &ConnectionRegistry,
        track: &TrackHandle,
        stream: &StreamHandle,
    ) {
        for (peer, conn) in registry.open_connections(ConnectionFamily::Video) {
            if let Err(err) = conn.peer_handle.add_track(track.clone(), stream.clone()).await {
                warn!(%peer, %err, "failed to attach audio track");
            }
        }
    }

    /// Push whatever local media is currently active onto a peer that has
    /// just finished connecting, per the `SdpExchange -> Connected`
    /// transition: a connection that came up after `video_on`/`audio_on`/
    /// `screen_share_on` was already called never otherwise sees that media.
    pub async fn attach_active_media_to(&self, family: ConnectionFamily, peer_handle: &dyn WebRTCPeer) {
        match family {
            ConnectionFamily::Video => {
                let Some(stream) = self.main_stream.clone() else { return };
                if let Err(err) = peer_handle.add_stream(stream.clone()).await {
                    warn!(%err, "failed to attach local stream to newly connected peer");
                    return;
                }
                if self.video_track.enabled {
                    if let Some(track) = self.video_track.handle.clone() {
                        let _ = peer_handle.add_track(track, stream.clone()).await;
                    }
                }
                if self.audio_track.enabled {
                    if let Some(track) = self.audio_track.handle.clone() {
                        let _ = peer_handle.add_track(track, stream).await;
                    }
                }
            }
            ConnectionFamily::Screen => {
                if let Some(stream) = self.screen_stream.clone() {
                    let _ = peer_handle.add_stream(stream).await;
                }
            }
        }
    }

    pub async fn video_on(
        &mut self,
        source: &dyn MediaSource,
        registry: &ConnectionRegistry,
        events: &EventBus,
    ) -> anyhow::Result<()> {
        let result = self.video_on_inner(source, registry).await;
        match result {
            Ok(()) => {
                events.publish(Event::MyVideoOn);
                Ok(())
            }
            Err(err) => {
                events.publish(Event::Error(format!("video_on failed: {err}")));
                Err(err)
            }
        }
    }

    async fn video_on_inner(&mut self, source: &dyn MediaSource, registry: &ConnectionRegistry) -> anyhow::Result<()> {
        if let Some(handle) = self.video_track.handle.clone() {
            source.set_track_enabled(&handle, true).await?;
            self.video_track.enabled = true;
            return Ok(());
        }

        let track = source
            .acquire_video_track()
            .await
            .map_err(|err| EngineError::MediaAcquisition(err.to_string()))?;
        self.video_track.handle = Some(track.clone());
        self.video_track.enabled = true;

        match &self.main_stream {
            Some(stream) => {
                let stream = stream.clone();
                self.attach_video_to_all(registry, &track, &stream).await;
            }
            None => {
                let mut tracks = vec![track.clone()];
                if let Some(audio) = self.audio_track.handle.clone() {
                    tracks.push(audio);
                }
                let stream = source.new_stream(&tracks).await?;
                self.main_stream = Some(stream.clone());
                for (peer, conn) in registry.open_connections(ConnectionFamily::Video) {
                    if let Err(err) = conn.peer_handle.add_stream(stream.clone()).await {
                        warn!(%peer, %err, "failed to attach main stream");
                    }
                }
            }
        }
        info!("local video enabled");
        Ok(())
    }

    pub async fn video_off(
        &mut self,
        source: &dyn MediaSource,
        registry: &ConnectionRegistry,
        events: &EventBus,
    ) -> anyhow::Result<()> {
        if let Some(track) = self.video_track.handle.take() {
            source.stop_track(&track).await?;
            for (peer, conn) in registry.open_connections(ConnectionFamily::Video) {
                if let Err(err) = conn.peer_handle.remove_track(track.clone()).await {
                    debug!(%peer, %err, "best-effort video track removal failed");
                }
                let _ = conn
                    .peer_handle
                    .send(serde_json::to_vec(&RtcMessage::Action { message: RtcAction::VideoOff })?)
                    .await;
            }
        }
        self.video_track.enabled = false;
        events.publish(Event::MyVideoOff);
        Ok(())
    }

    pub async fn audio_on(
        &mut self,
        source: &dyn MediaSource,
        registry: &ConnectionRegistry,
        events: &EventBus,
    ) -> anyhow::Result<()> {
        if let Some(handle) = self.audio_track.handle.clone() {
            source.set_track_enabled(&handle, true).await?;
            self.audio_track.enabled = true;
        } else {
            let track = source
                .acquire_audio_track()
                .await
                .map_err(|err| EngineError::MediaAcquisition(err.to_string()))?;
            self.audio_track.handle = Some(track.clone());
            self.audio_track.enabled = true;

            match &self.main_stream {
                Some(stream) => {
                    let stream = stream.clone();
                    self.attach_audio_to_all(registry, &track, &stream).await;
                }
                None => {
                    let mut tracks = vec![track.clone()];
                    if let Some(video) = self.video_track.handle.clone() {
                        tracks.push(video);
                    }
                    let stream = source.new_stream(&tracks).await?;
                    self.main_stream = Some(stream.clone());
                    for (peer, conn) in registry.open_connections(ConnectionFamily::Video) {
                        if let Err(err) = conn.peer_handle.add_stream(stream.clone()).await {
                            warn!(%peer, %err, "failed to attach main stream");
                        }
                    }
                }
            }
        }
        for (peer, conn) in registry.open_connections(ConnectionFamily::Video) {
            let _ = conn
                .peer_handle
                .send(serde_json::to_vec(&RtcMessage::Action { message: RtcAction::AudioOn })?)
                .await;
        }
        events.publish(Event::MyAudioOn);
        Ok(())
    }

    pub async fn audio_off(
        &mut self,
        source: &dyn MediaSource,
        registry: &ConnectionRegistry,
        events: &EventBus,
    ) -> anyhow::Result<()> {
        if let Some(handle) = &self.audio_track.handle {
            source.set_track_enabled(handle, false).await?;
        }
        for clone in &self.stream_clones {
            if let Some(track) = &clone.audio_track {
                if let Err(err) = source.set_track_enabled(track, false).await {
                    warn!(%err, "failed to disable audio on a retained stream clone");
                }
            }
        }
        self.audio_track.enabled = false;
        for (peer, conn) in registry.open_connections(ConnectionFamily::Video) {
            let _ = conn
                .peer_handle
                .send(serde_json::to_vec(&RtcMessage::Action { message: RtcAction::AudioOff })?)
                .await;
        }
        events.publish(Event::MyAudioOff);
        Ok(())
    }

    /// Part of the clone-and-reattach reconciliation procedure: record a
    /// freshly created clone so a later `audio_off` can reach it.
    pub fn retain_clone(&mut self, clone: ClonedStream) {
        self.stream_clones.push(clone);
    }

    pub fn retained_clones(&self) -> &[ClonedStream] {
        &self.stream_clones
    }

    pub async fn screen_share_on(
        &mut self,
        selector: &dyn ScreenSourceSelector,
        registry: &ConnectionRegistry,
        events: &EventBus,
    ) -> anyhow::Result<()> {
        let (stream, track) = selector
            .select_screen_stream()
            .await
            .map_err(|err| EngineError::MediaAcquisition(err.to_string()))?;
        for (peer, conn) in registry.open_connections(ConnectionFamily::Screen) {
            if conn.direction != Direction::Outgoing {
                continue;
            }
            if let Err(err) = conn.peer_handle.add_stream(stream.clone()).await {
                warn!(%peer, %err, "failed to attach screen-share stream");
            }
        }
        self.screen_stream = Some(stream);
        self.screen_track = Some(track);
        events.publish(Event::MyScreenShareOn);
        Ok(())
    }

    pub async fn screen_share_off(
        &mut self,
        source: &dyn MediaSource,
        registry: &mut ConnectionRegistry,
        events: &EventBus,
    ) -> anyhow::Result<()> {
        if let Some(track) = self.screen_track.take() {
            source.stop_track(&track).await?;
        }
        self.screen_stream = None;

        let peers: Vec<_> = registry
            .open_connections(ConnectionFamily::Screen)
            .filter(|(_, conn)| conn.direction == Direction::Outgoing)
            .map(|(peer, _)| *peer)
            .collect();
        for peer in peers {
            if let Some(conn) = registry.remove_open_connection(ConnectionFamily::Screen, &peer, Direction::Outgoing) {
                conn.peer_handle.destroy().await;
            }
        }
        events.publish(Event::MyScreenShareOff);
        Ok(())
    }
}
