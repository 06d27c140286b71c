use std::sync::Arc;

use streams_protocol::{AgentPubKey, ConnectionFamily, EngineConfig, RemoteSignal, TrackKind};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::events::{Event, EventBus};
use crate::liveness::LivenessProtocol;
use crate::media::{MediaEngine, MediaSource, ScreenSourceSelector};
use crate::reconciler::Reconciler;
use crate::registry::{ConnectionRegistry, Direction};
use crate::signal::SignalTransport;
use crate::state_machine::StateMachine;
use crate::webrtc_peer::{PeerEvent, WebRTCPeerFactory};

/// Commands a [`StreamsStoreHandle`] sends into the running driver task.
/// This, together with inbound signals and the ping timer, is the complete
/// set of inputs the single `run` task selects over.
pub enum Command {
    VideoOn,
    VideoOff,
    AudioOn,
    AudioOff,
    ScreenShareOn,
    ScreenShareOff,
    Block(AgentPubKey),
    Unblock(AgentPubKey),
    DisconnectFromPeer { peer: AgentPubKey, family: ConnectionFamily },
    ObserveRoomMembers(Vec<AgentPubKey>),
    Disconnect,
}

/// External handle to a running engine. Cloneable; every clone sends into
/// the same command channel. Never touches engine state directly.
#[derive(Clone)]
pub struct StreamsStoreHandle {
    cmd_tx: mpsc::Sender<Command>,
    events: Arc<EventBus>,
}

impl StreamsStoreHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub async fn send(&self, command: Command) {
        if self.cmd_tx.send(command).await.is_err() {
            warn!("StreamsStore driver task has stopped; dropping command");
        }
    }

    pub async fn video_on(&self) {
        self.send(Command::VideoOn).await;
    }

    pub async fn video_off(&self) {
        self.send(Command::VideoOff).await;
    }

    pub async fn audio_on(&self) {
        self.send(Command::AudioOn).await;
    }

    pub async fn audio_off(&self) {
        self.send(Command::AudioOff).await;
    }

    pub async fn screen_share_on(&self) {
        self.send(Command::ScreenShareOn).await;
    }

    pub async fn screen_share_off(&self) {
        self.send(Command::ScreenShareOff).await;
    }

    pub async fn block(&self, peer: AgentPubKey) {
        self.send(Command::Block(peer)).await;
    }

    pub async fn unblock(&self, peer: AgentPubKey) {
        self.send(Command::Unblock(peer)).await;
    }

    pub async fn observe_room_members(&self, members: Vec<AgentPubKey>) {
        self.send(Command::ObserveRoomMembers(members)).await;
    }

    pub async fn disconnect(&self) {
        self.send(Command::Disconnect).await;
    }
}

/// The collaborators an embedder must supply; everything the engine cannot
/// reasonably own itself (see the purpose/scope notes on out-of-scope
/// components).
pub struct StreamsStoreDeps {
    pub self_id: AgentPubKey,
    pub config: EngineConfig,
    pub app_version: Option<String>,
    pub transport: Arc<dyn SignalTransport>,
    pub peer_factory: Arc<dyn WebRTCPeerFactory>,
    pub media_source: Arc<dyn MediaSource>,
    pub screen_selector: Arc<dyn ScreenSourceSelector>,
}

/// Owns all mutable engine state. Runs on a single task; the registry is
/// never wrapped in a lock because nothing else ever touches it directly.
pub struct StreamsStore {
    self_id: AgentPubKey,
    app_version: Option<String>,
    registry: ConnectionRegistry,
    media: MediaEngine,
    state_machine: StateMachine,
    liveness: LivenessProtocol,
    reconciler: Reconciler,
    events: Arc<EventBus>,
    transport: Arc<dyn SignalTransport>,
    peer_factory: Arc<dyn WebRTCPeerFactory>,
    media_source: Arc<dyn MediaSource>,
    screen_selector: Arc<dyn ScreenSourceSelector>,
    peer_events: tokio_stream::StreamMap<(ConnectionFamily, AgentPubKey, Direction), ReceiverStream<PeerEvent>>,
}

impl StreamsStore {
    /// Build the store and spawn its driver task, returning a handle.
    pub fn spawn(deps: StreamsStoreDeps) -> StreamsStoreHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(64);
        let events = Arc::new(EventBus::default());

        let store = StreamsStore {
            self_id: deps.self_id,
            app_version: deps.app_version,
            registry: ConnectionRegistry::new(),
            media: MediaEngine::new(),
            state_machine: StateMachine::new(
                deps.config.init_retry_threshold_ms,
                deps.config.ice_servers.clone(),
                deps.config.trickle_ice,
            ),
            liveness: LivenessProtocol::new(deps.config.ping_interval_ms),
            reconciler: Reconciler,
            events: events.clone(),
            transport: deps.transport,
            peer_factory: deps.peer_factory,
            media_source: deps.media_source,
            screen_selector: deps.screen_selector,
            peer_events: tokio_stream::StreamMap::new(),
        };

        tokio::spawn(store.run(cmd_rx));

        StreamsStoreHandle { cmd_tx, events }
    }

    fn now_ms(&self) -> u64 {
        // Wall-clock time is only ever used as an opaque, monotonically
        // increasing "last seen" marker in metadata; callers never compare
        // it across processes.
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    fn track_peer_events(
        &mut self,
        family: ConnectionFamily,
        peer: AgentPubKey,
        direction: Direction,
        rx: mpsc::Receiver<PeerEvent>,
    ) {
        self.peer_events.insert((family, peer, direction), ReceiverStream::new(rx));
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        let mut signal_rx = self.transport.subscribe();
        let mut ping_timer = tokio::time::interval(self.liveness.ping_interval);

        info!(self_id = %self.self_id, "StreamsStore driver task started");

        loop {
            tokio::select! {
                _ = ping_timer.tick() => {
                    self.liveness.refresh_statuses(&mut self.registry);
                    self.liveness.sweep(self.self_id, &self.registry, self.transport.as_ref()).await;
                }
                signal = signal_rx.recv() => {
                    match signal {
                        Some(signal) => self.handle_signal(signal).await,
                        None => {
                            warn!("signal transport closed, stopping driver task");
                            break;
                        }
                    }
                }
                Some((key, event)) = self.peer_events.next() => {
                    self.handle_peer_event(key, event).await;
                }
                command = cmd_rx.recv() => {
                    match command {
                        Some(Command::Disconnect) => {
                            self.registry.disconnect_all().await;
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                        None => {
                            debug!("command channel closed, stopping driver task");
                            break;
                        }
                    }
                }
            }
        }

        info!("StreamsStore driver task stopped");
    }

    async fn handle_signal(&mut self, signal: RemoteSignal) {
        let from = signal.from_agent();
        if self.registry.is_blocked(&from) {
            return;
        }
        let family = signal.family();

        let result = match signal {
            RemoteSignal::PingUi { from_agent } => {
                self.liveness
                    .handle_ping(
                        self.self_id,
                        from_agent,
                        &self.registry,
                        &self.media,
                        self.transport.as_ref(),
                        self.app_version.as_deref(),
                    )
                    .await
            }
            RemoteSignal::PongUi { from_agent, meta_data } => {
                let now_ms = self.now_ms();
                self.liveness
                    .handle_pong(
                        self.self_id,
                        from_agent,
                        &meta_data,
                        &mut self.registry,
                        &mut self.media,
                        self.media_source.as_ref(),
                        &self.state_machine,
                        &self.reconciler,
                        self.transport.as_ref(),
                        now_ms,
                    )
                    .await
            }
            RemoteSignal::InitRequest { from_agent, connection_id, .. } => {
                self.state_machine
                    .handle_init_request(
                        self.self_id,
                        from_agent,
                        family,
                        connection_id,
                        &mut self.registry,
                        self.transport.as_ref(),
                        self.peer_factory.as_ref(),
                    )
                    .await
            }
            RemoteSignal::InitAccept { from_agent, connection_id, .. } => {
                match self
                    .state_machine
                    .handle_init_accept(from_agent, family, connection_id, &mut self.registry, self.peer_factory.as_ref())
                    .await
                {
                    Ok(Some((direction, rx))) => {
                        self.track_peer_events(family, from_agent, direction, rx);
                        Ok(())
                    }
                    Ok(None) => Ok(()),
                    Err(err) => Err(err),
                }
            }
            RemoteSignal::SdpData { from_agent, connection_id, data } => {
                self.state_machine
                    .handle_sdp_data(from_agent, family, connection_id, &data, &mut self.registry)
                    .await
            }
        };

        if let Err(err) = result {
            warn!(%from, %err, "error handling inbound signal");
            self.events.publish(Event::error(crate::error::EngineError::Transport(err.to_string())));
        }
    }

    async fn handle_peer_event(
        &mut self,
        (family, peer, direction): (ConnectionFamily, AgentPubKey, Direction),
        event: PeerEvent,
    ) {
        use crate::events::PeerRef;

        match event {
            PeerEvent::Signal(data) => {
                let connection_id = self.registry.open_connection(family, &peer, direction).map(|c| c.connection_id);
                if let Some(connection_id) = connection_id {
                    let _ = self
                        .transport
                        .send(peer, RemoteSignal::SdpData { from_agent: self.self_id, connection_id, data })
                        .await;
                }
            }
            PeerEvent::Connect => {
                self.state_machine
                    .handle_connected(peer, family, direction, &mut self.registry, &self.media, &self.events)
                    .await;
            }
            PeerEvent::Close | PeerEvent::Error(_) => {
                if let PeerEvent::Error(msg) = &event {
                    let err = crate::error::EngineError::PeerClosed { peer: peer.to_string() };
                    warn!(%peer, %err, detail = %msg, "peer connection closed by library error");
                }
                self.state_machine.handle_closed(peer, family, direction, &mut self.registry, &self.events);
                self.peer_events.remove(&(family, peer, direction));
            }
            PeerEvent::Stream(_) => {
                if let Some(conn) = self.registry.open_connection(family, &peer, direction) {
                    let connection_id = conn.connection_id;
                    let event = match family {
                        ConnectionFamily::Video => Event::PeerStream(PeerRef { peer, connection_id }),
                        ConnectionFamily::Screen => Event::PeerScreenShareStream(PeerRef { peer, connection_id }),
                    };
                    self.events.publish(event);
                }
            }
            PeerEvent::Track(kind, _) => {
                if let Some(conn) = self.registry.open_connection_mut(family, &peer, direction) {
                    let connection_id = conn.connection_id;
                    let event = match family {
                        ConnectionFamily::Screen => Event::PeerScreenShareTrack(PeerRef { peer, connection_id }),
                        ConnectionFamily::Video => match kind {
                            TrackKind::Video => {
                                conn.video = true;
                                Event::PeerVideoOn(PeerRef { peer, connection_id })
                            }
                            TrackKind::Audio => {
                                conn.audio = true;
                                Event::PeerAudioOn(PeerRef { peer, connection_id })
                            }
                        },
                    };
                    self.events.publish(event);
                }
            }
            PeerEvent::Data(bytes) => {
                self.handle_datachannel_message(peer, family, direction, &bytes);
            }
        }
    }

    /// Datachannel actions (`VideoOff`/`AudioOff`/`AudioOn`) only ever travel
    /// over the video family's single duplex connection.
    fn handle_datachannel_message(&mut self, peer: AgentPubKey, family: ConnectionFamily, direction: Direction, bytes: &[u8]) {
        use crate::events::PeerRef;
        use streams_protocol::{RtcAction, RtcMessage};

        let Ok(msg) = serde_json::from_slice::<RtcMessage>(bytes) else {
            debug!(%peer, "dropping malformed datachannel message");
            return;
        };
        let RtcMessage::Action { message } = msg else { return };

        let Some(conn) = self.registry.open_connection_mut(family, &peer, direction) else { return };
        let connection_id = conn.connection_id;
        match message {
            RtcAction::VideoOff => {
                conn.video = false;
                self.events.publish(Event::PeerVideoOff(PeerRef { peer, connection_id }));
            }
            RtcAction::AudioOff => {
                conn.audio = false;
                self.events.publish(Event::PeerAudioOff(PeerRef { peer, connection_id }));
            }
            RtcAction::AudioOn => {
                conn.audio = true;
                self.events.publish(Event::PeerAudioOn(PeerRef { peer, connection_id }));
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        let result: anyhow::Result<()> = match command {
            Command::VideoOn => self.media.video_on(self.media_source.as_ref(), &self.registry, &self.events).await,
            Command::VideoOff => self.media.video_off(self.media_source.as_ref(), &self.registry, &self.events).await,
            Command::AudioOn => self.media.audio_on(self.media_source.as_ref(), &self.registry, &self.events).await,
            Command::AudioOff => self.media.audio_off(self.media_source.as_ref(), &self.registry, &self.events).await,
            Command::ScreenShareOn => {
                self.media.screen_share_on(self.screen_selector.as_ref(), &self.registry, &self.events).await
            }
            Command::ScreenShareOff => {
                self.media.screen_share_off(self.media_source.as_ref(), &mut self.registry, &self.events).await
            }
            Command::Block(peer) => {
                self.registry.block(peer);
                for family in [ConnectionFamily::Video, ConnectionFamily::Screen] {
                    for conn in self.registry.remove_open_connections_for_peer(family, &peer) {
                        let direction = conn.direction;
                        conn.peer_handle.destroy().await;
                        self.peer_events.remove(&(family, peer, direction));
                    }
                }
                Ok(())
            }
            Command::Unblock(peer) => {
                self.registry.unblock(&peer);
                Ok(())
            }
            Command::DisconnectFromPeer { peer, family } => {
                for conn in self.registry.remove_open_connections_for_peer(family, &peer) {
                    let direction = conn.direction;
                    conn.peer_handle.destroy().await;
                    self.peer_events.remove(&(family, peer, direction));
                }
                Ok(())
            }
            Command::ObserveRoomMembers(members) => {
                let now = self.now_ms();
                for member in members {
                    if member != self.self_id {
                        self.registry.mark_known(member, now, None);
                    }
                }
                Ok(())
            }
            Command::Disconnect => unreachable!("handled in run() before dispatch"),
        };

        if let Err(err) = result {
            self.events.publish(Event::Error(err.to_string()));
        }
    }
}
