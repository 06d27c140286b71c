use std::time::Duration;

use streams_protocol::{
    AgentPubKey, ConnectionFamily, PongMetaData, RemoteSignal, RtcAction, StreamInfo,
    StreamSnapshot, TrackKind, TrackReadyState, TrackSnapshot,
};
use tracing::{debug, warn};

use crate::media::{MediaEngine, MediaSource};
use crate::reconciler::Reconciler;
use crate::registry::{ConnectionRegistry, Direction};
use crate::signal::SignalTransport;
use crate::state_machine::StateMachine;

/// Periodic ping sweep plus pong handling: liveness, peer discovery, and the
/// dispatch into reconciliation and handshake driving described in the pong
/// handler (see the component design for the exact ordering of its steps).
pub struct LivenessProtocol {
    pub ping_interval: Duration,
}

impl LivenessProtocol {
    pub fn new(ping_interval_ms: u64) -> Self {
        Self { ping_interval: Duration::from_millis(ping_interval_ms) }
    }

    /// Send `PingUi` to every known, non-blocked peer other than ourselves.
    pub async fn sweep(
        &self,
        self_id: AgentPubKey,
        registry: &ConnectionRegistry,
        transport: &dyn SignalTransport,
    ) {
        let peers: Vec<_> = registry.known_peers().filter(|p| *p != self_id).collect();
        for peer in peers {
            if registry.is_blocked(&peer) {
                continue;
            }
            if let Err(err) = transport.send(peer, RemoteSignal::PingUi { from_agent: self_id }).await {
                warn!(%peer, %err, "failed to send PingUi");
            }
        }
    }

    /// Respond to an inbound `PingUi`. Blocked senders never get a pong.
    pub async fn handle_ping(
        &self,
        self_id: AgentPubKey,
        from: AgentPubKey,
        registry: &ConnectionRegistry,
        media: &MediaEngine,
        transport: &dyn SignalTransport,
        app_version: Option<&str>,
    ) -> anyhow::Result<()> {
        if from == self_id || registry.is_blocked(&from) {
            return Ok(());
        }
        let meta = self.build_pong_metadata(from, registry, media, app_version);
        let meta_data = serde_json::to_string(&meta)?;
        transport.send(from, RemoteSignal::PongUi { from_agent: self_id, meta_data }).await?;
        Ok(())
    }

    fn build_pong_metadata(
        &self,
        peer: AgentPubKey,
        registry: &ConnectionRegistry,
        media: &MediaEngine,
        app_version: Option<&str>,
    ) -> PongMetaData {
        let stream_info = registry.open_connection(ConnectionFamily::Video, &peer, Direction::Duplex).map(|conn| {
            let mut tracks = Vec::new();
            tracks.push(TrackSnapshot {
                kind: TrackKind::Audio,
                enabled: conn.audio,
                muted: !conn.audio,
                ready_state: TrackReadyState::Live,
            });
            tracks.push(TrackSnapshot {
                kind: TrackKind::Video,
                enabled: conn.video,
                muted: !conn.video,
                ready_state: TrackReadyState::Live,
            });
            StreamInfo { stream: Some(StreamSnapshot { active: conn.connected }), tracks }
        });

        PongMetaData {
            connection_statuses: registry.statuses(ConnectionFamily::Video).clone(),
            screen_share_connection_statuses: Some(registry.statuses(ConnectionFamily::Screen).clone()),
            known_agents: Some(registry.known_peers().collect()),
            app_version: app_version.map(str::to_string),
            stream_info,
            audio: Some(media.is_audio_enabled()),
            video: Some(media.is_video_enabled()),
        }
    }

    /// Handle an inbound `PongUi`, per the component design's ordered steps:
    /// parse metadata, update the peer's reported statuses, merge known
    /// agents, then drive handshakes/reconciliation/audio correction.
    #[allow(clippy::too_many_arguments)]
    pub async fn handle_pong(
        &self,
        self_id: AgentPubKey,
        from: AgentPubKey,
        meta_data: &str,
        registry: &mut ConnectionRegistry,
        media: &mut MediaEngine,
        source: &dyn MediaSource,
        state_machine: &StateMachine,
        reconciler: &Reconciler,
        transport: &dyn SignalTransport,
        now_ms: u64,
    ) -> anyhow::Result<()> {
        if registry.is_blocked(&from) {
            return Ok(());
        }

        let meta: PongMetaData = match serde_json::from_str(meta_data) {
            Ok(meta) => meta,
            Err(err) => {
                warn!(%from, %err, "failed to parse pong metadata, dropping");
                return Ok(());
            }
        };

        if let Some(status) = meta.connection_statuses.get(&self_id) {
            registry.set_others_status(ConnectionFamily::Video, from, *status);
        }
        if let Some(statuses) = &meta.screen_share_connection_statuses {
            if let Some(status) = statuses.get(&self_id) {
                registry.set_others_status(ConnectionFamily::Screen, from, *status);
            }
        }
        if let Some(known) = &meta.known_agents {
            for peer in known {
                if *peer != self_id {
                    registry.mark_told(*peer);
                }
            }
        }
        registry.mark_known(from, now_ms, meta.app_version.clone());

        // Step 1/2: drive the video handshake.
        state_machine
            .drive_video(self_id, from, registry, transport)
            .await?;

        // Step 3: reconcile if an open connection exists and stream_info was reported.
        if registry.open_connection(ConnectionFamily::Video, &from, Direction::Duplex).is_some() {
            if let Some(reported) = &meta.stream_info {
                reconciler.reconcile(from, reported, media, source, registry).await?;
            }
        }

        // Step 4: if the peer believes our audio is on but it's actually off, correct them.
        if meta.audio == Some(true) && !media.is_audio_enabled() {
            if let Some(conn) = registry.open_connection(ConnectionFamily::Video, &from, Direction::Duplex) {
                let msg = serde_json::to_vec(&streams_protocol::RtcMessage::Action { message: RtcAction::AudioOff })?;
                if let Err(err) = conn.peer_handle.send(msg).await {
                    debug!(%from, %err, "failed to send audio-off correction");
                }
            }
        }

        // Step 5: drive the screen-share handshake if we're sharing and have
        // no outgoing screen session with this peer yet. An incoming share
        // from this peer never gates our own outgoing one.
        if media.is_screen_sharing()
            && registry.open_connection(ConnectionFamily::Screen, &from, Direction::Outgoing).is_none()
        {
            state_machine
                .drive_screen(self_id, from, registry, transport)
                .await?;
        }

        Ok(())
    }

    /// Ensure every known peer has an initialized status entry in both
    /// families, as the ping loop is documented to do.
    pub fn refresh_statuses(&self, registry: &mut ConnectionRegistry) {
        let peers: Vec<_> = registry.known_peers().collect();
        for peer in peers {
            registry.ensure_status_initialized(ConnectionFamily::Video, peer);
            registry.ensure_status_initialized(ConnectionFamily::Screen, peer);
        }
    }
}
