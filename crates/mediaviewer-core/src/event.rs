//! Inbound room message model
//!
//! Only the parts of `m.room.message` the forwarder needs are typed; the
//! content object itself is kept verbatim so it can be re-serialized for the
//! self-encrypt path.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

static CONTENT_URI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^mxc://(.+?)/(.+)$").expect("content uri regex"));

static SERVER_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}|\[[0-9A-Fa-f:.]{2,45}\]|[A-Za-z0-9\-.]{1,255})(:\d{1,5})?$",
    )
    .expect("server name regex")
});

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EventError {
    #[error("invalid user id: {0}")]
    InvalidUserId(String),

    #[error("event content must be a JSON object")]
    ContentNotObject,

    #[error("event has no encrypted file")]
    MissingFile,

    #[error("malformed encrypted file: {0}")]
    MalformedFile(String),

    #[error("invalid content URI: {0}")]
    InvalidContentUri(String),

    #[error("failed to serialize event content: {0}")]
    Serialize(String),
}

impl EventError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidUserId(_) => "invalid_user_id",
            Self::ContentNotObject => "content_not_object",
            Self::MissingFile => "missing_file",
            Self::MalformedFile(_) => "malformed_file",
            Self::InvalidContentUri(_) => "invalid_content_uri",
            Self::Serialize(_) => "serialize",
        }
    }
}

/// A Matrix user id, `@localpart:server.name`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId {
    raw: String,
    sep: usize,
}

impl UserId {
    pub fn parse(raw: &str) -> Result<Self, EventError> {
        let raw = raw.trim();
        let Some(rest) = raw.strip_prefix('@') else {
            return Err(EventError::InvalidUserId(raw.to_string()));
        };
        let Some((localpart, server)) = rest.split_once(':') else {
            return Err(EventError::InvalidUserId(raw.to_string()));
        };
        if localpart.is_empty() || server.is_empty() {
            return Err(EventError::InvalidUserId(raw.to_string()));
        }
        Ok(Self {
            raw: raw.to_string(),
            sep: 1 + localpart.len(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn localpart(&self) -> &str {
        &self.raw[1..self.sep]
    }

    /// Everything after the first `:`, including any port
    pub fn server_name(&self) -> &str {
        &self.raw[self.sep + 1..]
    }
}

impl TryFrom<String> for UserId {
    type Error = EventError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<UserId> for String {
    fn from(value: UserId) -> Self {
        value.raw
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// `msgtype` of a room message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageType {
    Image,
    Video,
    Audio,
    File,
    Sticker,
    Text,
    Notice,
    Emote,
    Location,
    Other(String),
}

impl MessageType {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "m.image" => Self::Image,
            "m.video" => Self::Video,
            "m.audio" => Self::Audio,
            "m.file" => Self::File,
            "m.sticker" => Self::Sticker,
            "m.text" => Self::Text,
            "m.notice" => Self::Notice,
            "m.emote" => Self::Emote,
            "m.location" => Self::Location,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_media(&self) -> bool {
        matches!(
            self,
            Self::Image | Self::Video | Self::Audio | Self::File | Self::Sticker
        )
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Image => "m.image",
            Self::Video => "m.video",
            Self::Audio => "m.audio",
            Self::File => "m.file",
            Self::Sticker => "m.sticker",
            Self::Text => "m.text",
            Self::Notice => "m.notice",
            Self::Emote => "m.emote",
            Self::Location => "m.location",
            Self::Other(raw) => raw,
        }
    }
}

/// The `file` object of an encrypted attachment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedFile {
    pub url: String,
    pub key: JsonWebKey,
    pub iv: String,
    pub hashes: FileHashes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<String>,
}

/// The file key. Other JWK members (`alg`, `kty`, `key_ops`, `ext`) are
/// ignored; the key itself is all either mode needs.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonWebKey {
    /// Raw key, base64url without padding
    #[serde(rename = "k")]
    pub key: String,
}

impl std::fmt::Debug for JsonWebKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonWebKey").field("key", &"***").finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHashes {
    pub sha256: String,
}

impl EncryptedFile {
    /// Reject file references the viewer would refuse anyway
    pub fn validate_url(&self) -> Result<(), EventError> {
        validate_content_uri(&self.url)
    }
}

/// Check that `url` is `mxc://<server-name>/<media-id>` with a plausible server name
pub fn validate_content_uri(url: &str) -> Result<(), EventError> {
    let Some(parts) = CONTENT_URI.captures(url) else {
        return Err(EventError::InvalidContentUri(url.to_string()));
    };
    if !SERVER_NAME.is_match(&parts[1]) {
        return Err(EventError::InvalidContentUri(url.to_string()));
    }
    Ok(())
}

/// Why an event was not forwarded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    OwnMessage,
    NotMedia(String),
    Unencrypted,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OwnMessage => "own_message",
            Self::NotMedia(_) => "not_media",
            Self::Unencrypted => "unencrypted",
        }
    }
}

/// An inbound `m.room.message` event
#[derive(Debug, Clone, PartialEq)]
pub struct MediaEvent {
    pub event_id: String,
    pub room_id: String,
    pub sender: UserId,
    content: Map<String, Value>,
}

impl MediaEvent {
    pub fn new(
        event_id: impl Into<String>,
        room_id: impl Into<String>,
        sender: UserId,
        content: Value,
    ) -> Result<Self, EventError> {
        let Value::Object(content) = content else {
            return Err(EventError::ContentNotObject);
        };
        Ok(Self {
            event_id: event_id.into(),
            room_id: room_id.into(),
            sender,
            content,
        })
    }

    pub fn content(&self) -> &Map<String, Value> {
        &self.content
    }

    pub fn msgtype(&self) -> MessageType {
        MessageType::parse(
            self.content
                .get("msgtype")
                .and_then(Value::as_str)
                .unwrap_or_default(),
        )
    }

    pub fn body(&self) -> Option<&str> {
        self.content.get("body").and_then(Value::as_str)
    }

    pub fn info(&self) -> Option<&Map<String, Value>> {
        self.content.get("info").and_then(Value::as_object)
    }

    pub fn has_file(&self) -> bool {
        self.content.get("file").is_some_and(Value::is_object)
    }

    /// Typed view of `content.file`
    pub fn file(&self) -> Result<EncryptedFile, EventError> {
        let raw = self.content.get("file").ok_or(EventError::MissingFile)?;
        serde_json::from_value(raw.clone()).map_err(|e| EventError::MalformedFile(e.to_string()))
    }

    /// The content object as UTF-8 JSON, members in their inbound order
    pub fn content_json(&self) -> Result<Vec<u8>, EventError> {
        serde_json::to_vec(&self.content).map_err(|e| EventError::Serialize(e.to_string()))
    }

    /// Returns why this event must not be forwarded, if it must not
    pub fn skip_reason(&self, bot_user_id: &UserId) -> Option<SkipReason> {
        if &self.sender == bot_user_id {
            return Some(SkipReason::OwnMessage);
        }
        let msgtype = self.msgtype();
        if !msgtype.is_media() {
            return Some(SkipReason::NotMedia(msgtype.as_str().to_string()));
        }
        if !self.has_file() {
            return Some(SkipReason::Unencrypted);
        }
        None
    }
}
