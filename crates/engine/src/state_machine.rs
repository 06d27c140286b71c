use std::time::{Duration, Instant};

use streams_protocol::{AgentPubKey, ConnectionFamily, ConnectionStatus, IceServerConfig, RemoteSignal};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::EngineError;
use crate::events::{Event, EventBus, PeerRef};
use crate::media::MediaEngine;
use crate::registry::{ConnectionRegistry, Direction, OpenConnection, PendingAccept, PendingInit};
use crate::signal::SignalTransport;
use crate::webrtc_peer::{PeerEvent, WebRTCPeerFactory};

/// Drives the per-peer, per-family handshake automaton described in the
/// data model: `Disconnected -> InitSent/AwaitingInit -> AcceptSent/SdpExchange
/// -> Connected`, with teardown back to `Disconnected` on `close`/`error`.
///
/// Stateless by itself; every method takes the registry, transport, and peer
/// factory it needs to mutate. This keeps the automaton a plain set of
/// transition functions the driver loop calls synchronously-up-to-an-await,
/// matching the single-task, no-locking scheduling model.
pub struct StateMachine {
    pub init_retry_threshold: Duration,
    /// ICE servers and trickle-ICE preference passed to every freshly
    /// constructed `WebRTCPeer`, sourced from `EngineConfig`.
    ice_servers: Vec<IceServerConfig>,
    trickle_ice: bool,
}

impl StateMachine {
    pub fn new(init_retry_threshold_ms: u64, ice_servers: Vec<IceServerConfig>, trickle_ice: bool) -> Self {
        Self {
            init_retry_threshold: Duration::from_millis(init_retry_threshold_ms),
            ice_servers,
            trickle_ice,
        }
    }

    /// Entry point for a freshly-received `PongUi` from `peer`, for the
    /// `Video` family (ordering rule applies; see [`Self::drive_screen`] for
    /// the unordered screen-share variant).
    pub async fn drive_video(
        &self,
        self_id: AgentPubKey,
        peer: AgentPubKey,
        registry: &mut ConnectionRegistry,
        transport: &dyn SignalTransport,
    ) -> anyhow::Result<()> {
        if registry.open_connection(ConnectionFamily::Video, &peer, Direction::Duplex).is_some() {
            return Ok(());
        }

        let status = registry.status(ConnectionFamily::Video, &peer);
        match status {
            None | Some(ConnectionStatus::Disconnected) if peer < self_id => {
                self.send_init(ConnectionFamily::Video, self_id, peer, registry, transport).await
            }
            None | Some(ConnectionStatus::Disconnected) => {
                registry.set_status(ConnectionFamily::Video, peer, ConnectionStatus::AwaitingInit);
                Ok(())
            }
            Some(ConnectionStatus::InitSent { attempt }) => {
                let stale = registry
                    .pending_inits(ConnectionFamily::Video, &peer)
                    .iter()
                    .map(|p| p.sent_at)
                    .max()
                    .map(|t0| t0.elapsed() > self.init_retry_threshold)
                    .unwrap_or(true);
                if stale {
                    self.send_init_retry(ConnectionFamily::Video, self_id, peer, attempt, registry, transport)
                        .await
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    /// Screen-share initiation: the sharer unilaterally initiates on any
    /// peer pong when no *outgoing* screen session exists with that peer yet,
    /// with no lexicographic ordering rule. An `Incoming` screen share this
    /// peer is already sending us never gates our own `Outgoing` one -- the
    /// two directions are independent sessions. Callers gate this on
    /// `is_screen_sharing` before invoking it.
    pub async fn drive_screen(
        &self,
        self_id: AgentPubKey,
        peer: AgentPubKey,
        registry: &mut ConnectionRegistry,
        transport: &dyn SignalTransport,
    ) -> anyhow::Result<()> {
        if registry.open_connection(ConnectionFamily::Screen, &peer, Direction::Outgoing).is_some() {
            return Ok(());
        }
        let status = registry.status(ConnectionFamily::Screen, &peer);
        match status {
            None | Some(ConnectionStatus::Disconnected) => {
                self.send_init(ConnectionFamily::Screen, self_id, peer, registry, transport).await
            }
            Some(ConnectionStatus::InitSent { attempt }) => {
                let stale = registry
                    .pending_inits(ConnectionFamily::Screen, &peer)
                    .iter()
                    .map(|p| p.sent_at)
                    .max()
                    .map(|t0| t0.elapsed() > self.init_retry_threshold)
                    .unwrap_or(true);
                if stale {
                    self.send_init_retry(ConnectionFamily::Screen, self_id, peer, attempt, registry, transport)
                        .await
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }

    async fn send_init(
        &self,
        family: ConnectionFamily,
        self_id: AgentPubKey,
        peer: AgentPubKey,
        registry: &mut ConnectionRegistry,
        transport: &dyn SignalTransport,
    ) -> anyhow::Result<()> {
        let connection_id = Uuid::new_v4();
        info!(%peer, ?family, %connection_id, "sending InitRequest");
        transport
            .send(
                peer,
                RemoteSignal::InitRequest {
                    from_agent: self_id,
                    connection_id,
                    connection_type: Some(family),
                },
            )
            .await?;
        registry.push_pending_init(family, peer, PendingInit { connection_id, sent_at: Instant::now() });
        registry.set_status(family, peer, ConnectionStatus::InitSent { attempt: 1 });
        Ok(())
    }

    async fn send_init_retry(
        &self,
        family: ConnectionFamily,
        self_id: AgentPubKey,
        peer: AgentPubKey,
        attempt: u32,
        registry: &mut ConnectionRegistry,
        transport: &dyn SignalTransport,
    ) -> anyhow::Result<()> {
        let connection_id = Uuid::new_v4();
        debug!(%peer, ?family, %connection_id, attempt, "retrying InitRequest");
        transport
            .send(
                peer,
                RemoteSignal::InitRequest {
                    from_agent: self_id,
                    connection_id,
                    connection_type: Some(family),
                },
            )
            .await?;
        registry.push_pending_init(family, peer, PendingInit { connection_id, sent_at: Instant::now() });
        registry.set_status(family, peer, ConnectionStatus::InitSent { attempt: attempt + 1 });
        Ok(())
    }

    /// Handle an inbound `InitRequest` from `peer` for `family`.
    ///
    /// `Video` only accepts from a higher-ordered peer (invariant 3); the
    /// caller is expected to have already checked that before invoking this
    /// for `Video`, but it is re-checked here defensively. `Screen` accepts
    /// unconditionally.
    pub async fn handle_init_request(
        &self,
        self_id: AgentPubKey,
        peer: AgentPubKey,
        family: ConnectionFamily,
        connection_id: Uuid,
        registry: &mut ConnectionRegistry,
        transport: &dyn SignalTransport,
        factory: &dyn WebRTCPeerFactory,
    ) -> anyhow::Result<()> {
        if family == ConnectionFamily::Video && peer < self_id {
            warn!(%peer, %connection_id, "ignoring InitRequest from lower-ordered peer");
            return Ok(());
        }

        let (peer_handle, _rx) = factory.create(false, self.ice_servers.clone(), self.trickle_ice).await?;
        registry.push_pending_accept(family, peer, PendingAccept { connection_id, peer: peer_handle });

        let attempt = match registry.status(family, &peer) {
            Some(ConnectionStatus::AcceptSent { attempt }) => attempt + 1,
            _ => 1,
        };
        transport
            .send(
                peer,
                RemoteSignal::InitAccept {
                    from_agent: self_id,
                    connection_id,
                    connection_type: Some(family),
                },
            )
            .await?;
        registry.set_status(family, peer, ConnectionStatus::AcceptSent { attempt });
        Ok(())
    }

    /// Handle an inbound `InitAccept` matching one of our pending inits.
    pub async fn handle_init_accept(
        &self,
        peer: AgentPubKey,
        family: ConnectionFamily,
        connection_id: Uuid,
        registry: &mut ConnectionRegistry,
        factory: &dyn WebRTCPeerFactory,
    ) -> anyhow::Result<Option<(Direction, tokio::sync::mpsc::Receiver<PeerEvent>)>> {
        let matches = registry
            .pending_inits(family, &peer)
            .iter()
            .any(|p| p.connection_id == connection_id);
        if !matches {
            let err = EngineError::OrphanedSignal { family, kind: "InitAccept" };
            debug!(%peer, %connection_id, %err, "dropping orphaned signal");
            return Ok(None);
        }

        let (peer_handle, rx) = factory.create(true, self.ice_servers.clone(), self.trickle_ice).await?;
        let direction = match family {
            ConnectionFamily::Video => Direction::Duplex,
            ConnectionFamily::Screen => Direction::Outgoing,
        };
        registry
            .insert_open_connection(
                family,
                peer,
                OpenConnection {
                    connection_id,
                    peer_handle,
                    video: false,
                    audio: false,
                    connected: false,
                    direction,
                },
            )
            .await;
        registry.set_status(family, peer, ConnectionStatus::SdpExchange);
        Ok(Some((direction, rx)))
    }

    /// Handle inbound `SdpData`. Routes to an existing `OpenConnection` by
    /// connection id, or attempts to promote a matching `PendingAccept`.
    pub async fn handle_sdp_data(
        &self,
        peer: AgentPubKey,
        family: ConnectionFamily,
        connection_id: Uuid,
        data: &str,
        registry: &mut ConnectionRegistry,
    ) -> anyhow::Result<()> {
        if let Some(conn) = registry.open_connection_by_id_mut(family, &peer, connection_id) {
            conn.peer_handle.signal(data).await?;
            return Ok(());
        }

        if let Some(peer_handle) = registry.promote_pending_accept(family, &peer, connection_id) {
            peer_handle.signal(data).await?;
            let direction = match family {
                ConnectionFamily::Video => Direction::Duplex,
                ConnectionFamily::Screen => Direction::Incoming,
            };
            registry
                .insert_open_connection(
                    family,
                    peer,
                    OpenConnection { connection_id, peer_handle, video: false, audio: false, connected: false, direction },
                )
                .await;
            registry.set_status(family, peer, ConnectionStatus::SdpExchange);
            return Ok(());
        }

        let err = EngineError::UnknownConnection { peer: peer.to_string(), connection_id };
        warn!(%err, "dropping SdpData with no matching open or pending connection");
        Ok(())
    }

    /// Handle a `PeerEvent::Connect` from a peer's underlying connection.
    /// `direction` identifies which of the peer's (at most two, for
    /// screen-share) open connections this event belongs to.
    pub async fn handle_connected(
        &self,
        peer: AgentPubKey,
        family: ConnectionFamily,
        direction: Direction,
        registry: &mut ConnectionRegistry,
        media: &MediaEngine,
        events: &EventBus,
    ) {
        registry.clear_pending_inits(family, &peer);
        let connection_id = registry.open_connection(family, &peer, direction).map(|c| c.connection_id);
        if let Some(conn) = registry.open_connection_mut(family, &peer, direction) {
            conn.connected = true;
        }
        registry.set_status(family, peer, ConnectionStatus::Connected);

        if let Some(conn) = registry.open_connection(family, &peer, direction) {
            media.attach_active_media_to(family, conn.peer_handle.as_ref()).await;
        }

        if let Some(connection_id) = connection_id {
            let event = match family {
                ConnectionFamily::Video => Event::PeerConnected(PeerRef { peer, connection_id }),
                ConnectionFamily::Screen => Event::PeerScreenShareConnected(PeerRef { peer, connection_id }),
            };
            events.publish(event);
        }
    }

    /// Handle a `PeerEvent::Close`/`Error`: destroy the peer, clear state.
    /// `direction` identifies which of the peer's open connections closed.
    pub fn handle_closed(
        &self,
        peer: AgentPubKey,
        family: ConnectionFamily,
        direction: Direction,
        registry: &mut ConnectionRegistry,
        events: &EventBus,
    ) {
        let connection_id = registry.remove_open_connection(family, &peer, direction).map(|c| c.connection_id);
        if registry.is_blocked(&peer) {
            registry.set_status(family, peer, ConnectionStatus::Blocked);
        } else {
            registry.set_status(family, peer, ConnectionStatus::Disconnected);
        }
        if let Some(connection_id) = connection_id {
            let event = match family {
                ConnectionFamily::Video => Event::PeerDisconnected(PeerRef { peer, connection_id }),
                ConnectionFamily::Screen => Event::PeerScreenShareDisconnected(PeerRef { peer, connection_id }),
            };
            events.publish(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_retry_threshold_from_config() {
        let sm = StateMachine::new(5_000, Vec::new(), true);
        assert_eq!(sm.init_retry_threshold, Duration::from_millis(5_000));
    }

    #[test]
    fn handle_closed_restores_blocked_status_for_blocked_peer() {
        let sm = StateMachine::new(5_000, Vec::new(), true);
        let mut registry = ConnectionRegistry::new();
        let events = EventBus::new(8);
        let peer = AgentPubKey::new([9u8; 32]);
        registry.block(peer);

        sm.handle_closed(peer, ConnectionFamily::Video, Direction::Duplex, &mut registry, &events);

        assert_eq!(registry.status(ConnectionFamily::Video, &peer), Some(ConnectionStatus::Blocked));
    }
}

#[cfg(all(test, feature = "mockable"))]
mod mock_tests {
    use super::*;
    use crate::signal::MockSignalTransport;
    use crate::webrtc_peer::MockWebRTCPeerFactory;

    fn key(byte: u8) -> AgentPubKey {
        AgentPubKey::new([byte; 32])
    }

    #[tokio::test]
    async fn lower_peer_sends_init_higher_peer_awaits() {
        let low = key(1);
        let high = key(2);
        let sm = StateMachine::new(5_000, Vec::new(), true);
        let events = EventBus::new(8);

        let mut transport = MockSignalTransport::new();
        transport
            .expect_send()
            .withf(move |to, signal| *to == high && matches!(signal, RemoteSignal::InitRequest { .. }))
            .returning(|_, _| Ok(()));

        let mut registry = ConnectionRegistry::new();
        sm.drive_video(low, high, &mut registry, &transport).await.unwrap();
        assert!(matches!(
            registry.status(ConnectionFamily::Video, &high),
            Some(ConnectionStatus::InitSent { attempt: 1 })
        ));

        let mut registry2 = ConnectionRegistry::new();
        let transport2 = MockSignalTransport::new();
        sm.drive_video(high, low, &mut registry2, &transport2).await.unwrap();
        assert_eq!(registry2.status(ConnectionFamily::Video, &low), Some(ConnectionStatus::AwaitingInit));
        let _ = events;
    }

    #[tokio::test]
    async fn init_request_from_lower_peer_is_rejected_for_video() {
        let low = key(1);
        let high = key(2);
        let sm = StateMachine::new(5_000, Vec::new(), true);
        let transport = MockSignalTransport::new();
        let factory = MockWebRTCPeerFactory::new();
        let mut registry = ConnectionRegistry::new();

        // We are `high`; an InitRequest claiming to be from `low` must be
        // ignored per the ordering invariant.
        sm.handle_init_request(high, low, ConnectionFamily::Video, Uuid::new_v4(), &mut registry, &transport, &factory)
            .await
            .unwrap();

        assert!(registry.open_connection(ConnectionFamily::Video, &low, Direction::Duplex).is_none());
        assert!(registry.status(ConnectionFamily::Video, &low).is_none());
    }

    #[tokio::test]
    async fn drive_screen_ignores_existing_incoming_share_from_same_peer() {
        let self_id = key(1);
        let peer = key(2);
        let sm = StateMachine::new(5_000, Vec::new(), true);
        let mut registry = ConnectionRegistry::new();

        let mut factory = MockWebRTCPeerFactory::new();
        factory.expect_create().returning(|_, _, _| {
            let mut mock = crate::webrtc_peer::MockWebRTCPeer::new();
            mock.expect_destroy().returning(|| ());
            mock.expect_signal().returning(|_| Ok(()));
            let (_tx, rx) = tokio::sync::mpsc::channel(1);
            Ok((Box::new(mock) as Box<dyn crate::webrtc_peer::WebRTCPeer>, rx))
        });

        // peer's InitRequest for an incoming screen share is accepted and
        // promoted into an OpenConnection with Direction::Incoming.
        let connection_id = Uuid::new_v4();
        let mut transport = MockSignalTransport::new();
        transport.expect_send().returning(|_, _| Ok(()));
        sm.handle_init_request(self_id, peer, ConnectionFamily::Screen, connection_id, &mut registry, &transport, &factory)
            .await
            .unwrap();
        sm.handle_sdp_data(peer, ConnectionFamily::Screen, connection_id, "offer", &mut registry)
            .await
            .unwrap();
        assert!(registry.open_connection(ConnectionFamily::Screen, &peer, Direction::Incoming).is_some());

        // Our own outgoing share to the same peer must still be drivable.
        let mut transport2 = MockSignalTransport::new();
        transport2.expect_send().returning(|_, _| Ok(()));
        sm.drive_screen(self_id, peer, &mut registry, &transport2).await.unwrap();
        assert!(matches!(
            registry.status(ConnectionFamily::Screen, &peer),
            Some(ConnectionStatus::InitSent { attempt: 1 })
        ));
    }
}
