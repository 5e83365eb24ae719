//! Database model types.

use crate::DatabaseError;
use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Maximum length of `Chat::last_message_preview`, in characters.
pub const PREVIEW_MAX_CHARS: usize = 120;

/// Current time at the precision stored in the database.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// A conversation with one model provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub provider: String,
    pub model: String,
    pub is_archived: bool,
    pub archived_at: Option<DateTime<Utc>>,
    /// Derived from the chat's messages on every message write.
    pub message_count: i64,
    /// Newest message content, truncated to [`PREVIEW_MAX_CHARS`].
    pub last_message_preview: Option<String>,
}

impl Chat {
    pub fn new(title: impl Into<String>, provider: impl Into<String>, model: impl Into<String>) -> Self {
        let now = now();
        Self {
            id: Uuid::new_v4().to_string(),
            title: title.into(),
            created_at: now,
            updated_at: now,
            provider: provider.into(),
            model: model.into(),
            is_archived: false,
            archived_at: None,
            message_count: 0,
            last_message_preview: None,
        }
    }
}

/// Delivery state of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    #[default]
    Sent,
    Streaming,
    Failed,
    Edited,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Streaming => "streaming",
            Self::Failed => "failed",
            Self::Edited => "edited",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sending" => Ok(Self::Sending),
            "sent" => Ok(Self::Sent),
            "streaming" => Ok(Self::Streaming),
            "failed" => Ok(Self::Failed),
            "edited" => Ok(Self::Edited),
            other => Err(DatabaseError::InvalidData(format!(
                "Unknown message status: {}",
                other
            ))),
        }
    }
}

/// Provider response details attached to assistant messages.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<i64>,
}

/// A chat message as seen by callers. `attachment` is plaintext.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub content: String,
    pub is_from_user: bool,
    pub timestamp: DateTime<Utc>,
    pub attachment: Option<Vec<u8>>,
    pub status: MessageStatus,
    pub edited_at: Option<DateTime<Utc>>,
    pub response_metadata: Option<ResponseMetadata>,
}

impl Message {
    pub fn new(chat_id: impl Into<String>, content: impl Into<String>, is_from_user: bool) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.into(),
            content: content.into(),
            is_from_user,
            timestamp: now(),
            attachment: None,
            status: MessageStatus::Sent,
            edited_at: None,
            response_metadata: None,
        }
    }
}

/// Attachment bytes sealed with the key whose hash is `key_hash`.
#[derive(Debug, Clone, PartialEq)]
pub struct SealedAttachment {
    pub ciphertext: Vec<u8>,
    pub nonce: Vec<u8>,
    pub key_hash: String,
}

/// A message row as stored. Attachments stay sealed until they leave
/// the writer thread.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub id: String,
    pub chat_id: String,
    pub content: String,
    pub is_from_user: bool,
    pub timestamp: DateTime<Utc>,
    pub attachment: Option<SealedAttachment>,
    pub status: MessageStatus,
    pub edited_at: Option<DateTime<Utc>>,
    pub response_metadata: Option<ResponseMetadata>,
}

/// Outcome recorded for a migration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationStatus {
    Completed,
    Failed,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for MigrationStatus {
    type Err = DatabaseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(DatabaseError::InvalidData(format!(
                "Unknown migration status: {}",
                other
            ))),
        }
    }
}

/// One row of `migration_records`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationRecord {
    pub version: i64,
    pub description: String,
    pub applied_at: DateTime<Utc>,
    pub status: MigrationStatus,
    pub error_message: Option<String>,
}

/// The single active row of `encryption_metadata`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptionMetadata {
    pub key_hash: String,
    pub encrypted_at: DateTime<Utc>,
}

/// Audit entry appended on every key rotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRotationRecord {
    pub previous_key_hash: String,
    pub new_key_hash: String,
    pub rotated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_status_parses_known_values() {
        for status in [
            MessageStatus::Sending,
            MessageStatus::Sent,
            MessageStatus::Streaming,
            MessageStatus::Failed,
            MessageStatus::Edited,
        ] {
            assert_eq!(status.as_str().parse::<MessageStatus>().unwrap(), status);
        }
    }

    #[test]
    fn message_status_rejects_unknown_values() {
        let err = "delivered".parse::<MessageStatus>().unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidData(_)));
        assert!("SENT".parse::<MessageStatus>().is_err());
    }

    #[test]
    fn new_chat_starts_empty() {
        let chat = Chat::new("Title", "openai", "gpt-4o");
        assert_eq!(chat.created_at, chat.updated_at);
        assert_eq!(chat.message_count, 0);
        assert!(!chat.is_archived);
        assert!(Uuid::parse_str(&chat.id).is_ok());
    }

    #[test]
    fn response_metadata_skips_missing_fields() {
        let meta = ResponseMetadata {
            model: Some("claude".into()),
            latency_ms: Some(420),
            ..Default::default()
        };
        let json = serde_json::to_string(&meta).unwrap();
        assert_eq!(json, r#"{"model":"claude","latency_ms":420}"#);

        let parsed: ResponseMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, meta);
    }
}
