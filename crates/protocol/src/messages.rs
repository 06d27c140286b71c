use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::AgentPubKey;

/// Which connection kind a handshake or session belongs to.
///
/// `Video` is the duplex main audio/video connection; `Screen` is the
/// unidirectional screen-share connection, always initiated by the sharer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionFamily {
    #[default]
    Video,
    Screen,
}

/// Remote signals exchanged through the application-level signal transport.
///
/// `connection_type` is absent on messages from peers running older code;
/// absence is treated as `Video` for backward compatibility (see
/// [`RemoteSignal::family`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum RemoteSignal {
    PingUi {
        from_agent: AgentPubKey,
    },
    PongUi {
        from_agent: AgentPubKey,
        meta_data: String,
    },
    InitRequest {
        from_agent: AgentPubKey,
        connection_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_type: Option<ConnectionFamily>,
    },
    InitAccept {
        from_agent: AgentPubKey,
        connection_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        connection_type: Option<ConnectionFamily>,
    },
    SdpData {
        from_agent: AgentPubKey,
        connection_id: Uuid,
        data: String,
    },
}

impl RemoteSignal {
    pub fn from_agent(&self) -> AgentPubKey {
        match self {
            RemoteSignal::PingUi { from_agent }
            | RemoteSignal::PongUi { from_agent, .. }
            | RemoteSignal::InitRequest { from_agent, .. }
            | RemoteSignal::InitAccept { from_agent, .. }
            | RemoteSignal::SdpData { from_agent, .. } => *from_agent,
        }
    }

    /// `connection_type` resolved with the backward-compatible `Video` default.
    pub fn family(&self) -> ConnectionFamily {
        match self {
            RemoteSignal::InitRequest { connection_type, .. }
            | RemoteSignal::InitAccept { connection_type, .. } => {
                connection_type.unwrap_or_default()
            }
            _ => ConnectionFamily::Video,
        }
    }
}

/// Per-peer, per-family connection state. Mirrors the state machine's
/// transitions one-to-one; this is the type persisted into
/// `PongMetaData::connection_statuses` and the registry's status maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state")]
pub enum ConnectionStatus {
    Disconnected,
    Blocked,
    AwaitingInit,
    InitSent { attempt: u32 },
    AcceptSent { attempt: u32 },
    SdpExchange,
    Connected,
}

impl ConnectionStatus {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionStatus::Connected)
    }
}

/// How a peer entered our known-agents table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    /// Observed directly via the room membership anchor.
    Known,
    /// Only learned via another peer's pong metadata.
    Told,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    pub pubkey: AgentPubKey,
    pub kind: AgentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackReadyState {
    Live,
    Ended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackSnapshot {
    pub kind: TrackKind,
    pub enabled: bool,
    pub muted: bool,
    pub ready_state: TrackReadyState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSnapshot {
    pub active: bool,
}

/// The remote peer's self-reported view of the stream they receive from us.
/// Compared against our own `MainStream` by the Reconciler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamInfo {
    #[serde(default)]
    pub stream: Option<StreamSnapshot>,
    #[serde(default)]
    pub tracks: Vec<TrackSnapshot>,
}

impl StreamInfo {
    pub fn track(&self, kind: TrackKind) -> Option<&TrackSnapshot> {
        self.tracks.iter().find(|t| t.kind == kind)
    }
}

/// PongMetaData v1, carried JSON-encoded inside `RemoteSignal::PongUi::meta_data`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PongMetaData {
    #[serde(default)]
    pub connection_statuses: HashMap<AgentPubKey, ConnectionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_share_connection_statuses: Option<HashMap<AgentPubKey, ConnectionStatus>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_agents: Option<Vec<AgentPubKey>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_info: Option<StreamInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video: Option<bool>,
}

/// Action values sent over the datachannel to reconcile cosmetic peer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RtcAction {
    VideoOff,
    AudioOff,
    AudioOn,
}

/// Datachannel message envelope. `Action` drives cosmetic video/audio
/// booleans on the receiving side; `Text` is informational only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RtcMessage {
    Action { message: RtcAction },
    Text { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_request_without_connection_type_is_video() {
        let json = r#"{"type":"InitRequest","from_agent":"QUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUFBQUE","connection_id":"3fa85f64-5717-4562-b3fc-2c963f66afa6"}"#;
        let signal: RemoteSignal = serde_json::from_str(json).unwrap();
        assert_eq!(signal.family(), ConnectionFamily::Video);
    }

    #[test]
    fn init_request_with_screen_connection_type() {
        let sig = RemoteSignal::InitRequest {
            from_agent: AgentPubKey::new([1u8; 32]),
            connection_id: Uuid::nil(),
            connection_type: Some(ConnectionFamily::Screen),
        };
        let json = serde_json::to_string(&sig).unwrap();
        assert!(json.contains(r#""type":"InitRequest""#));
        let parsed: RemoteSignal = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.family(), ConnectionFamily::Screen);
    }

    #[test]
    fn rtc_action_serializes_kebab_case() {
        let msg = RtcMessage::Action {
            message: RtcAction::VideoOff,
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""message":"video-off""#));
    }

    #[test]
    fn pong_metadata_roundtrip_with_stream_info() {
        let mut meta = PongMetaData::default();
        meta.audio = Some(true);
        meta.stream_info = Some(StreamInfo {
            stream: None,
            tracks: vec![TrackSnapshot {
                kind: TrackKind::Audio,
                enabled: true,
                muted: true,
                ready_state: TrackReadyState::Live,
            }],
        });
        let json = serde_json::to_string(&meta).unwrap();
        let parsed: PongMetaData = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.audio, Some(true));
        let info = parsed.stream_info.unwrap();
        assert!(info.stream.is_none());
        assert!(info.track(TrackKind::Audio).unwrap().muted);
    }
}
