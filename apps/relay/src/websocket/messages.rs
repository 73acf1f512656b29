//! WebSocket message types for the pairing protocol
//!
//! This module defines the closed set of messages exchanged between a
//! primary (the media player), its observers (remote controls) and the
//! relay. Messages are JSON objects carrying a `type` discriminator.
//!
//! Decoding is lenient: unknown fields are ignored and the discriminator
//! is matched regardless of case, surrounding whitespace or separator
//! style. Encoding always emits every field, including defaults.

use serde::{de, Deserialize, Deserializer, Serialize};
use serde_json::Value;

// =============================================================================
// Playback Model
// =============================================================================

/// Track metadata as reported by the primary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub album: String,
    #[serde(default, deserialize_with = "lenient_millis")]
    pub duration_ms: u64,
    #[serde(default)]
    pub artwork_url: Option<String>,
}

/// Repeat mode options
#[derive(Debug, Clone, Copy, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepeatMode {
    #[default]
    Off,
    One,
    All,
}

impl RepeatMode {
    const WIRE_NAMES: &'static [&'static str] = &["OFF", "ONE", "ALL"];

    pub fn from_wire(raw: &str) -> Option<Self> {
        match fold_discriminator(raw).as_str() {
            "off" => Some(RepeatMode::Off),
            "one" => Some(RepeatMode::One),
            "all" => Some(RepeatMode::All),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for RepeatMode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::from_wire(&raw).ok_or_else(|| de::Error::unknown_variant(&raw, Self::WIRE_NAMES))
    }
}

/// Snapshot of the primary's playback state
///
/// A session never edits a stored snapshot in place; every update builds a
/// new value through one of the `with_*` methods and swaps it in whole.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerState {
    pub is_playing: bool,
    /// Position in the current track, in milliseconds
    pub current_position: u64,
    pub current_track: Option<Track>,
    pub playlist: Vec<Track>,
    pub current_index: i32,
    pub shuffle: bool,
    pub repeat_mode: RepeatMode,
    pub volume: f32,
}

impl Default for PlayerState {
    fn default() -> Self {
        Self {
            is_playing: false,
            current_position: 0,
            current_track: None,
            playlist: Vec::new(),
            current_index: 0,
            shuffle: false,
            repeat_mode: RepeatMode::Off,
            volume: 1.0,
        }
    }
}

impl PlayerState {
    pub fn with_playback(&self, update: &PlaybackStateUpdate) -> Self {
        Self {
            is_playing: update.is_playing,
            current_position: update.position,
            current_track: update.track.clone(),
            ..self.clone()
        }
    }

    pub fn with_playlist(&self, update: &PlaylistUpdate) -> Self {
        Self {
            playlist: update.tracks.clone(),
            current_index: update.current_index,
            ..self.clone()
        }
    }

    pub fn with_mode(&self, update: &PlaybackModeUpdate) -> Self {
        Self {
            shuffle: update.shuffle,
            repeat_mode: update.repeat_mode,
            ..self.clone()
        }
    }

    pub fn with_position(&self, position: u64) -> Self {
        Self {
            current_position: position,
            ..self.clone()
        }
    }

    pub fn with_volume(&self, volume: f32) -> Self {
        Self {
            volume,
            ..self.clone()
        }
    }

    /// Messages that bring a freshly attached observer up to date, in order
    pub fn catch_up_messages(&self) -> [RemoteMessage; 3] {
        [
            RemoteMessage::PlaybackStateUpdate(PlaybackStateUpdate {
                is_playing: self.is_playing,
                position: self.current_position,
                track: self.current_track.clone(),
            }),
            RemoteMessage::PlaylistUpdate(PlaylistUpdate {
                tracks: self.playlist.clone(),
                current_index: self.current_index,
            }),
            RemoteMessage::PlaybackModeUpdate(PlaybackModeUpdate {
                shuffle: self.shuffle,
                repeat_mode: self.repeat_mode,
            }),
        ]
    }
}

// =============================================================================
// Message Envelope
// =============================================================================

/// Every message the relay understands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RemoteMessage {
    PrimaryConnect(PrimaryConnect),
    PrimaryConnectResponse(PrimaryConnectResponse),
    ObserverConnect(ObserverConnect),

    PlaybackStateUpdate(PlaybackStateUpdate),
    PlaylistUpdate(PlaylistUpdate),
    PlaybackModeUpdate(PlaybackModeUpdate),
    PositionUpdate(PositionUpdate),
    VolumeUpdate(VolumeUpdate),

    PlaybackCommand(PlaybackCommand),
    SeekCommand(SeekCommand),
    PlaylistMoveCommand(PlaylistMoveCommand),
    PlaylistRemoveCommand(PlaylistRemoveCommand),
    ShuffleCommand(ShuffleCommand),
    RepeatCommand(RepeatCommand),
    VolumeCommand(VolumeCommand),
    RequestCurrentState,

    ErrorMessage(ErrorMessage),
}

/// Fieldless mirror of [`RemoteMessage`] used for role tables
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    PrimaryConnect,
    PrimaryConnectResponse,
    ObserverConnect,
    PlaybackStateUpdate,
    PlaylistUpdate,
    PlaybackModeUpdate,
    PositionUpdate,
    VolumeUpdate,
    PlaybackCommand,
    SeekCommand,
    PlaylistMoveCommand,
    PlaylistRemoveCommand,
    ShuffleCommand,
    RepeatCommand,
    VolumeCommand,
    RequestCurrentState,
    ErrorMessage,
}

impl MessageKind {
    pub const ALL: [MessageKind; 17] = [
        MessageKind::PrimaryConnect,
        MessageKind::PrimaryConnectResponse,
        MessageKind::ObserverConnect,
        MessageKind::PlaybackStateUpdate,
        MessageKind::PlaylistUpdate,
        MessageKind::PlaybackModeUpdate,
        MessageKind::PositionUpdate,
        MessageKind::VolumeUpdate,
        MessageKind::PlaybackCommand,
        MessageKind::SeekCommand,
        MessageKind::PlaylistMoveCommand,
        MessageKind::PlaylistRemoveCommand,
        MessageKind::ShuffleCommand,
        MessageKind::RepeatCommand,
        MessageKind::VolumeCommand,
        MessageKind::RequestCurrentState,
        MessageKind::ErrorMessage,
    ];

    /// Canonical discriminator written on the wire
    pub fn wire_name(self) -> &'static str {
        match self {
            MessageKind::PrimaryConnect => "primary-connect",
            MessageKind::PrimaryConnectResponse => "primary-connect-response",
            MessageKind::ObserverConnect => "observer-connect",
            MessageKind::PlaybackStateUpdate => "playback-state-update",
            MessageKind::PlaylistUpdate => "playlist-update",
            MessageKind::PlaybackModeUpdate => "playback-mode-update",
            MessageKind::PositionUpdate => "position-update",
            MessageKind::VolumeUpdate => "volume-update",
            MessageKind::PlaybackCommand => "playback-command",
            MessageKind::SeekCommand => "seek-command",
            MessageKind::PlaylistMoveCommand => "playlist-move-command",
            MessageKind::PlaylistRemoveCommand => "playlist-remove-command",
            MessageKind::ShuffleCommand => "shuffle-command",
            MessageKind::RepeatCommand => "repeat-command",
            MessageKind::VolumeCommand => "volume-command",
            MessageKind::RequestCurrentState => "request-current-state",
            MessageKind::ErrorMessage => "error-message",
        }
    }

    /// Resolve a discriminator leniently (`PLAYLIST_UPDATE`, ` PlaylistUpdate `)
    pub fn from_wire(raw: &str) -> Option<Self> {
        let wanted = fold_discriminator(raw);
        Self::ALL
            .into_iter()
            .find(|kind| fold_discriminator(kind.wire_name()) == wanted)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

fn fold_discriminator(raw: &str) -> String {
    raw.chars()
        .filter(|c| !matches!(c, '-' | '_' | ' ' | '\t' | '\n' | '\r'))
        .flat_map(char::to_lowercase)
        .collect()
}

impl RemoteMessage {
    pub fn kind(&self) -> MessageKind {
        match self {
            RemoteMessage::PrimaryConnect(_) => MessageKind::PrimaryConnect,
            RemoteMessage::PrimaryConnectResponse(_) => MessageKind::PrimaryConnectResponse,
            RemoteMessage::ObserverConnect(_) => MessageKind::ObserverConnect,
            RemoteMessage::PlaybackStateUpdate(_) => MessageKind::PlaybackStateUpdate,
            RemoteMessage::PlaylistUpdate(_) => MessageKind::PlaylistUpdate,
            RemoteMessage::PlaybackModeUpdate(_) => MessageKind::PlaybackModeUpdate,
            RemoteMessage::PositionUpdate(_) => MessageKind::PositionUpdate,
            RemoteMessage::VolumeUpdate(_) => MessageKind::VolumeUpdate,
            RemoteMessage::PlaybackCommand(_) => MessageKind::PlaybackCommand,
            RemoteMessage::SeekCommand(_) => MessageKind::SeekCommand,
            RemoteMessage::PlaylistMoveCommand(_) => MessageKind::PlaylistMoveCommand,
            RemoteMessage::PlaylistRemoveCommand(_) => MessageKind::PlaylistRemoveCommand,
            RemoteMessage::ShuffleCommand(_) => MessageKind::ShuffleCommand,
            RemoteMessage::RepeatCommand(_) => MessageKind::RepeatCommand,
            RemoteMessage::VolumeCommand(_) => MessageKind::VolumeCommand,
            RemoteMessage::RequestCurrentState => MessageKind::RequestCurrentState,
            RemoteMessage::ErrorMessage(_) => MessageKind::ErrorMessage,
        }
    }

    pub fn error(payload: ErrorMessage) -> Self {
        RemoteMessage::ErrorMessage(payload)
    }
}

// =============================================================================
// Codec
// =============================================================================

/// Reasons a text frame could not be turned into a [`RemoteMessage`]
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[source] serde_json::Error),

    #[error("payload must be a JSON object")]
    NotAnObject,

    #[error("missing message type")]
    MissingType,

    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("invalid {kind} payload: {source}")]
    InvalidPayload {
        kind: MessageKind,
        #[source]
        source: serde_json::Error,
    },
}

/// Decode a text frame into a message
pub fn decode(text: &str) -> Result<RemoteMessage, DecodeError> {
    let mut value: Value = serde_json::from_str(text).map_err(DecodeError::Json)?;
    let object = value.as_object_mut().ok_or(DecodeError::NotAnObject)?;

    let raw_type = object
        .get("type")
        .and_then(Value::as_str)
        .ok_or(DecodeError::MissingType)?;
    let kind = MessageKind::from_wire(raw_type)
        .ok_or_else(|| DecodeError::UnknownType(raw_type.to_string()))?;

    object.insert("type".to_string(), Value::from(kind.wire_name()));
    serde_json::from_value(value).map_err(|source| DecodeError::InvalidPayload { kind, source })
}

/// Millisecond fields accept any JSON number; negatives clamp to zero
fn lenient_millis<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    let millis = f64::deserialize(deserializer)?;
    if millis.is_finite() && millis > 0.0 {
        Ok(millis as u64)
    } else {
        Ok(0)
    }
}

/// Encode a message into a text frame
pub fn encode(message: &RemoteMessage) -> Result<String, serde_json::Error> {
    serde_json::to_string(message)
}

// =============================================================================
// Payload Types
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PrimaryConnect {
    /// Key from a previous session, used to reattach after a reconnect
    #[serde(default)]
    pub existing_key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrimaryConnectResponse {
    pub key: String,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObserverConnect {
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackStateUpdate {
    #[serde(default)]
    pub is_playing: bool,
    /// Milliseconds into the current track
    #[serde(default, deserialize_with = "lenient_millis")]
    pub position: u64,
    #[serde(default)]
    pub track: Option<Track>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistUpdate {
    pub tracks: Vec<Track>,
    #[serde(default)]
    pub current_index: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackModeUpdate {
    pub shuffle: bool,
    pub repeat_mode: RepeatMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionUpdate {
    #[serde(deserialize_with = "lenient_millis")]
    pub position: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeUpdate {
    pub volume: f32,
}

/// Transport actions an observer can ask the primary to perform
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlaybackAction {
    Play,
    Pause,
    Toggle,
    Next,
    Previous,
    Stop,
}

impl PlaybackAction {
    const WIRE_NAMES: &'static [&'static str] =
        &["PLAY", "PAUSE", "TOGGLE", "NEXT", "PREVIOUS", "STOP"];

    pub fn from_wire(raw: &str) -> Option<Self> {
        match fold_discriminator(raw).as_str() {
            "play" => Some(PlaybackAction::Play),
            "pause" => Some(PlaybackAction::Pause),
            "toggle" => Some(PlaybackAction::Toggle),
            "next" => Some(PlaybackAction::Next),
            "previous" => Some(PlaybackAction::Previous),
            "stop" => Some(PlaybackAction::Stop),
            _ => None,
        }
    }
}

impl<'de> Deserialize<'de> for PlaybackAction {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::from_wire(&raw).ok_or_else(|| de::Error::unknown_variant(&raw, Self::WIRE_NAMES))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackCommand {
    pub action: PlaybackAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeekCommand {
    #[serde(deserialize_with = "lenient_millis")]
    pub position: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistMoveCommand {
    pub from_index: i32,
    pub to_index: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistRemoveCommand {
    pub index: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShuffleCommand {
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepeatCommand {
    pub repeat_mode: RepeatMode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeCommand {
    pub volume: f32,
}

/// Payload for error messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: String,
    pub message: String,
}

impl ErrorMessage {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// A recognised message the connection's role may not send
    pub fn invalid_command(kind: MessageKind) -> Self {
        Self::new(
            "INVALID_COMMAND",
            format!("{} is not allowed for this connection", kind),
        )
    }

    pub fn invalid_message(message: impl Into<String>) -> Self {
        Self::new("INVALID_MESSAGE", message)
    }
}
