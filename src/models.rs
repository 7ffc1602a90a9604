//! Core data models used throughout Ethos.
//!
//! These types represent the messages, retrieval units, chunks, and search
//! results that flow through the ingestion and retrieval pipeline.

use serde::{Deserialize, Serialize};

/// A message as captured from the messaging platform.
///
/// Field names follow the Slack Web API so captured files load unchanged;
/// `is_thread_reply`, `parent_ts`, `user_name` and `channel_name` are added
/// by the fetch pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default)]
    pub ts: String,
    #[serde(default, alias = "channel_id", skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_count: Option<u32>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_thread_reply: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_ts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
}

impl RawMessage {
    /// Display name, falling back to the raw user id.
    pub fn author(&self) -> &str {
        self.user_name
            .as_deref()
            .or(self.user.as_deref())
            .unwrap_or("Unknown")
    }

    pub fn author_id(&self) -> &str {
        self.user.as_deref().unwrap_or("Unknown")
    }

    pub fn reply_count(&self) -> u32 {
        self.reply_count.unwrap_or(0)
    }
}

/// Per-channel entry in a fetch summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub channel_id: String,
    pub channel_name: String,
    pub message_count: usize,
}

/// Header of a wrapped message file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch_timestamp: Option<String>,
    #[serde(default)]
    pub total_messages: usize,
    #[serde(default)]
    pub total_channels: usize,
    #[serde(default)]
    pub channels: Vec<ChannelSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_per_channel: Option<usize>,
}

/// The two accepted shapes of a captured message file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageFile {
    Wrapped {
        #[serde(default)]
        metadata: FetchMetadata,
        messages: Vec<RawMessage>,
    },
    Legacy(Vec<RawMessage>),
}

impl MessageFile {
    pub fn metadata(&self) -> Option<&FetchMetadata> {
        match self {
            MessageFile::Wrapped { metadata, .. } => Some(metadata),
            MessageFile::Legacy(_) => None,
        }
    }

    pub fn into_messages(self) -> Vec<RawMessage> {
        match self {
            MessageFile::Wrapped { messages, .. } => messages,
            MessageFile::Legacy(messages) => messages,
        }
    }
}

/// Metadata carried by a retrievable unit and every chunk cut from it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitMetadata {
    pub author: String,
    pub author_id: String,
    pub channel_id: String,
    pub channel_name: String,
    /// Raw platform timestamp of the (root) message.
    pub timestamp: String,
    pub formatted_time: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<String>,
    #[serde(default)]
    pub is_thread: bool,
    #[serde(default)]
    pub reply_count: usize,
}

/// One standalone message or one serialized thread.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievableUnit {
    pub text: String,
    pub metadata: UnitMetadata,
}

/// A bounded-length slice of a unit's text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub text: String,
    pub metadata: UnitMetadata,
    pub chunk_index: usize,
    pub total_chunks: usize,
}

/// A search hit. Constructed per query, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchResult {
    pub chunk: Chunk,
    /// Squared L2 distance to the query.
    pub distance: f32,
    /// Ranking score after the priority adjustment (lower is better).
    pub score: f32,
    /// 1-based position after filtering and re-ranking.
    pub rank: usize,
    pub is_priority: bool,
}
