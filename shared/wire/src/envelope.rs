//! JSON control envelope over the framed transport.
//!
//! Inbound and outbound messages are tagged unions keyed by a `type` string.
//! An unknown inbound type lands in the single `Ignored` branch with a log
//! entry at the call site; a known type with malformed fields is an error.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    Auth {
        player_id: Uuid,
        name: String,
        #[serde(default)]
        token: Option<String>,
        /// Requested sample rate; 0 or absent means server choice.
        #[serde(default)]
        sample_rate: u32,
        #[serde(default)]
        media: MediaMode,
    },
    Disconnect,
    ListGroups,
    ListPlayers,
    CreateGroup {
        name: String,
        #[serde(default)]
        permanent: bool,
        #[serde(default)]
        isolated: bool,
        #[serde(default)]
        max_members: u16,
    },
    JoinGroup { group_id: Uuid },
    LeaveGroup,
    GroupSettings { group_id: Uuid, isolated: bool },
    UpdateMute { muted: bool },
    UpdateSpeaking { speaking: bool },
    SdpOffer { sdp: String },
    IceCandidate { candidate: Value },
    Resume,
    Ping { nonce: u64 },
}

/// Media transport requested at auth time; fixed for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MediaMode {
    #[default]
    Datagram,
    Framed,
    DataChannel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    Hello {
        server_name: String,
        proximity_range: f32,
        frame_ms: u32,
        jitter_buffer_ms: u32,
    },
    Authenticated {
        sample_rate: u32,
        media_port: u16,
        short_id: u32,
        /// Presented in the binary AUTH packet on the datagram transport.
        media_secret: String,
        fec_percent: u32,
    },
    PendingGameSession,
    GameSessionReady,
    GroupCreated { group: GroupStateJson },
    GroupJoined { group: GroupStateJson },
    GroupLeft { group_id: Uuid },
    GroupMembersUpdated { group: GroupStateJson },
    GroupList { groups: Vec<GroupSummaryJson> },
    PlayerList { players: Vec<PlayerEntry> },
    UserSpeakingStatus { player_id: Uuid, speaking: bool },
    UserMuteStatus { player_id: Uuid, muted: bool },
    SetMicMute { muted: bool },
    PositionUpdate { position: [f32; 3], world: String },
    /// Media fallback for framed-transport sessions.
    Audio {
        #[serde(skip_serializing_if = "Option::is_none")]
        short_id: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        player_id: Option<Uuid>,
        seq: u32,
        codec: String,
        /// Base64 payload.
        data: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        position: Option<[f32; 3]>,
        test: bool,
    },
    SdpAnswer { sdp: String },
    IceCandidate { candidate: Value },
    Latency { nonce: u64, server_time_ms: u64 },
    Error { code: String, message: String },
    Disconnected { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupStateJson {
    pub group_id: Uuid,
    pub name: String,
    pub creator_id: Uuid,
    pub permanent: bool,
    pub isolated: bool,
    pub max_members: u16,
    pub members: Vec<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSummaryJson {
    pub group_id: Uuid,
    pub name: String,
    pub permanent: bool,
    pub isolated: bool,
    pub member_count: u16,
    pub max_members: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerEntry {
    pub player_id: Uuid,
    pub short_id: u32,
    pub name: String,
    pub muted: bool,
    pub speaking: bool,
}

const KNOWN_INBOUND: &[&str] = &[
    "auth",
    "disconnect",
    "list_groups",
    "list_players",
    "create_group",
    "join_group",
    "leave_group",
    "group_settings",
    "update_mute",
    "update_speaking",
    "sdp_offer",
    "ice_candidate",
    "resume",
    "ping",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Msg(ClientEnvelope),
    /// Unknown `type`; logged and skipped, never an error.
    Ignored { ty: String },
}

pub fn parse_client(text: &str) -> Result<Inbound, serde_json::Error> {
    let value: Value = serde_json::from_str(text)?;
    let ty = value.get("type").and_then(Value::as_str).map(str::to_owned);
    match serde_json::from_value::<ClientEnvelope>(value) {
        Ok(msg) => Ok(Inbound::Msg(msg)),
        Err(e) => match ty {
            Some(ty) if !KNOWN_INBOUND.contains(&ty.as_str()) => Ok(Inbound::Ignored { ty }),
            _ => Err(e),
        },
    }
}

pub fn encode_server(msg: &ServerEnvelope) -> String {
    // Serialization of these enums cannot fail; the fallback keeps the
    // writer loop total.
    serde_json::to_string(msg).unwrap_or_else(|_| {
        "{\"type\":\"error\",\"code\":\"internal\",\"message\":\"encode failed\"}".to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_parses_with_defaults() {
        let text = r#"{"type":"auth","player_id":"8e5f0f2e-9f5a-4f3c-9b6e-8d4f77f5b111","name":"alice"}"#;
        match parse_client(text).unwrap() {
            Inbound::Msg(ClientEnvelope::Auth { name, token, sample_rate, media, .. }) => {
                assert_eq!(name, "alice");
                assert_eq!(token, None);
                assert_eq!(sample_rate, 0);
                assert_eq!(media, MediaMode::Datagram);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_ignored_not_error() {
        let text = r#"{"type":"dance_emote","intensity":11}"#;
        assert_eq!(parse_client(text).unwrap(), Inbound::Ignored { ty: "dance_emote".into() });
    }

    #[test]
    fn known_type_with_bad_fields_is_error() {
        let text = r#"{"type":"join_group","group_id":42}"#;
        assert!(parse_client(text).is_err());
    }

    #[test]
    fn missing_type_is_error() {
        assert!(parse_client(r#"{"group_id":"x"}"#).is_err());
        assert!(parse_client("not json").is_err());
    }

    #[test]
    fn every_listed_inbound_type_is_known() {
        // Keep KNOWN_INBOUND in sync with the enum's serde tags.
        let samples = [
            r#"{"type":"disconnect"}"#,
            r#"{"type":"list_groups"}"#,
            r#"{"type":"list_players"}"#,
            r#"{"type":"leave_group"}"#,
            r#"{"type":"resume"}"#,
            r#"{"type":"update_mute","muted":true}"#,
            r#"{"type":"update_speaking","speaking":false}"#,
            r#"{"type":"ping","nonce":7}"#,
            r#"{"type":"sdp_offer","sdp":"v=0"}"#,
            r#"{"type":"ice_candidate","candidate":{"c":"x"}}"#,
            r#"{"type":"group_settings","group_id":"8e5f0f2e-9f5a-4f3c-9b6e-8d4f77f5b111","isolated":true}"#,
            r#"{"type":"create_group","name":"g"}"#,
        ];
        for s in samples {
            assert!(matches!(parse_client(s).unwrap(), Inbound::Msg(_)), "failed: {s}");
        }
    }

    #[test]
    fn server_envelope_round_trip() {
        let msg = ServerEnvelope::Authenticated {
            sample_rate: 48_000,
            media_port: 24_454,
            short_id: 0xDEADBEEF,
            media_secret: "s".into(),
            fec_percent: 10,
        };
        let text = encode_server(&msg);
        assert!(text.contains("\"type\":\"authenticated\""));
        let back: ServerEnvelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn audio_envelope_omits_absent_fields() {
        let msg = ServerEnvelope::Audio {
            short_id: Some(7),
            player_id: None,
            seq: 1,
            codec: "opus".into(),
            data: "AAAA".into(),
            position: None,
            test: false,
        };
        let text = encode_server(&msg);
        assert!(!text.contains("player_id"));
        assert!(!text.contains("position"));
    }
}
