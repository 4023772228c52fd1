//! Gateway payload envelope and outbound command bodies.
//!
//! Every payload travels in the same envelope of `op`, `d`, `s` and `t`
//! fields. The `d` field is kept as a generic [`Value`] tree: dispatch events
//! are handed to the user untouched, and only the handful of opcodes the
//! connection handles itself get a typed view.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::intents::Intents;
use crate::snowflake::Snowflake;

/// The gateway payload envelope.
///
/// `s` and `t` are only present on DISPATCH payloads. `op` stays a raw byte
/// so payloads with opcodes this library does not know about still reach the
/// user intact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayPayload {
    /// Opcode for the payload.
    pub op: u8,

    /// Event data; `Value::Null` when absent.
    #[serde(default)]
    pub d: Value,

    /// Sequence number, present on dispatches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s: Option<u64>,

    /// Event name, present on dispatches.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t: Option<String>,
}

/// `d` of the HELLO payload (op 10).
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Hello {
    /// Interval in milliseconds at which to send heartbeats.
    pub heartbeat_interval: u64,
}

/// The slice of the READY dispatch the connection itself consumes.
#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Ready {
    /// Session id for resuming.
    pub session_id: String,

    /// Endpoint to reconnect to when resuming this session.
    #[serde(default)]
    pub resume_gateway_url: Option<String>,
}

/// Body of the IDENTIFY command (op 2).
#[derive(Debug, Clone, Serialize)]
pub struct Identify {
    /// Authentication token.
    pub token: String,

    /// Gateway intents.
    pub intents: Intents,

    /// Connection properties.
    pub properties: ConnectionProperties,

    /// Whether to enable payload compression.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compress: Option<bool>,

    /// Member count above which a guild is considered large (50-250).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_threshold: Option<u8>,

    /// Shard information: [shard_id, total_shards].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<[u32; 2]>,

    /// Initial presence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<UpdatePresence>,
}

impl Identify {
    /// Create an IDENTIFY body with required fields.
    pub fn new(token: impl Into<String>, intents: Intents) -> Self {
        Self {
            token: token.into(),
            intents,
            properties: ConnectionProperties::default(),
            compress: None,
            large_threshold: Some(50),
            shard: None,
            presence: None,
        }
    }

    /// Set shard information.
    pub fn with_shard(mut self, shard_id: u32, total_shards: u32) -> Self {
        self.shard = Some([shard_id, total_shards]);
        self
    }

    /// Request per-message payload compression.
    pub fn with_compress(mut self, compress: bool) -> Self {
        self.compress = Some(compress);
        self
    }

    /// Set the initial presence.
    pub fn with_presence(mut self, presence: UpdatePresence) -> Self {
        self.presence = Some(presence);
        self
    }
}

/// Connection properties sent with IDENTIFY.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionProperties {
    /// Operating system.
    pub os: String,

    /// Library name.
    pub browser: String,

    /// Library name again, as the device.
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "tantalum-rs".to_string(),
            device: "tantalum-rs".to_string(),
        }
    }
}

/// Body of the PRESENCE UPDATE command (op 3), also embeddable in IDENTIFY.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePresence {
    /// Unix timestamp in milliseconds of when the client went idle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub since: Option<u64>,

    /// The user's activities.
    pub activities: Vec<Activity>,

    /// The user's status.
    pub status: Status,

    /// Whether the client is AFK.
    pub afk: bool,
}

impl UpdatePresence {
    /// A plain online presence with no activity.
    pub fn online() -> Self {
        Self {
            since: None,
            activities: Vec::new(),
            status: Status::Online,
            afk: false,
        }
    }
}

/// An activity shown on the presence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    /// Activity name.
    pub name: String,

    /// Activity type.
    #[serde(rename = "type")]
    pub kind: ActivityType,

    /// Stream URL, only used with [`ActivityType::Streaming`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Activity type.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    serde_repr::Serialize_repr,
    serde_repr::Deserialize_repr,
)]
#[repr(u8)]
pub enum ActivityType {
    /// Playing {name}
    Playing = 0,
    /// Streaming {name}
    Streaming = 1,
    /// Listening to {name}
    Listening = 2,
    /// Watching {name}
    Watching = 3,
    /// {emoji} {name}
    Custom = 4,
    /// Competing in {name}
    Competing = 5,
}

/// User status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// Online.
    #[default]
    Online,
    /// Do Not Disturb.
    Dnd,
    /// Away / idle.
    Idle,
    /// Invisible (shown as offline).
    Invisible,
    /// Offline.
    Offline,
}

/// Body of the VOICE STATE UPDATE command (op 4).
///
/// `channel_id` is serialized even when `None`: a null channel id is how a
/// client disconnects from voice.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateVoiceState {
    /// Guild whose voice state to change.
    pub guild_id: Snowflake,

    /// Channel to join, or `None` to disconnect.
    pub channel_id: Option<Snowflake>,

    /// Whether the client is muted.
    pub self_mute: bool,

    /// Whether the client is deafened.
    pub self_deaf: bool,
}

impl UpdateVoiceState {
    /// Join (or move to) a voice channel.
    pub fn join(guild_id: Snowflake, channel_id: Snowflake) -> Self {
        Self {
            guild_id,
            channel_id: Some(channel_id),
            self_mute: false,
            self_deaf: false,
        }
    }

    /// Disconnect from voice in the guild.
    pub fn leave(guild_id: Snowflake) -> Self {
        Self {
            guild_id,
            channel_id: None,
            self_mute: false,
            self_deaf: false,
        }
    }
}

/// Body of the REQUEST GUILD MEMBERS command (op 8).
#[derive(Debug, Clone, Serialize)]
pub struct RequestGuildMembers {
    /// Guild to request members for.
    pub guild_id: Snowflake,

    /// Username prefix filter; an empty string matches all members.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,

    /// Maximum number of members to return (0 for all with an empty query).
    pub limit: u32,

    /// Whether to include presence data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presences: Option<bool>,

    /// Specific members to fetch instead of a query.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_ids: Option<Vec<Snowflake>>,

    /// Nonce echoed in the GUILD_MEMBERS_CHUNK responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
}

impl RequestGuildMembers {
    /// Request members whose usernames start with `query`.
    pub fn query(guild_id: Snowflake, query: impl Into<String>, limit: u32) -> Self {
        Self {
            guild_id,
            query: Some(query.into()),
            limit,
            presences: None,
            user_ids: None,
            nonce: None,
        }
    }

    /// Request a specific set of members.
    pub fn user_ids(guild_id: Snowflake, user_ids: Vec<Snowflake>) -> Self {
        Self {
            guild_id,
            query: None,
            limit: 0,
            presences: None,
            user_ids: Some(user_ids),
            nonce: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_defaults() {
        let payload: GatewayPayload =
            serde_json::from_str(r#"{"op":10,"d":{"heartbeat_interval":41250}}"#).unwrap();
        assert_eq!(payload.op, 10);
        assert_eq!(payload.d, json!({"heartbeat_interval": 41250}));
        assert_eq!(payload.s, None);
        assert_eq!(payload.t, None);
    }

    #[test]
    fn test_envelope_null_data() {
        let payload: GatewayPayload = serde_json::from_str(r#"{"op":11,"d":null}"#).unwrap();
        assert_eq!(payload.op, 11);
        assert!(payload.d.is_null());
    }

    #[test]
    fn test_identify_serialization() {
        let identify = Identify::new("token", Intents::GUILDS | Intents::GUILD_MESSAGES)
            .with_shard(0, 1);
        let value = serde_json::to_value(&identify).unwrap();

        assert_eq!(value["token"], "token");
        assert_eq!(value["intents"], 513);
        assert_eq!(value["shard"], json!([0, 1]));
        assert_eq!(value["large_threshold"], 50);
        assert!(value.get("compress").is_none());
        assert!(value["properties"]["browser"].is_string());
    }

    #[test]
    fn test_voice_state_null_channel() {
        let leave = UpdateVoiceState::leave(Snowflake::new(41771983423143937));
        let value = serde_json::to_value(&leave).unwrap();

        assert_eq!(value["guild_id"], "41771983423143937");
        assert_eq!(value["channel_id"], Value::Null);
    }

    #[test]
    fn test_request_guild_members_query() {
        let request = RequestGuildMembers::query(Snowflake::new(1), "ada", 25);
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value["query"], "ada");
        assert_eq!(value["limit"], 25);
        assert!(value.get("user_ids").is_none());
    }

    #[test]
    fn test_presence_serialization() {
        let presence = UpdatePresence {
            since: None,
            activities: vec![Activity {
                name: "with bytes".to_string(),
                kind: ActivityType::Playing,
                url: None,
            }],
            status: Status::Idle,
            afk: true,
        };
        let value = serde_json::to_value(&presence).unwrap();

        assert_eq!(value["status"], "idle");
        assert_eq!(value["activities"][0]["type"], 0);
        assert_eq!(value["afk"], true);
    }
}
