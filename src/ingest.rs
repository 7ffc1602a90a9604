//! Ingestion pipeline: captured messages → retrievable units.
//!
//! ```text
//! load_messages → validate + clean → group_threads → serialize → chunk → index
//! ```
//!
//! Invalid messages are dropped before grouping and counted per reason in
//! [`IngestStats`]. A thread whose replies were all rejected (or never
//! captured) degenerates to a plain standalone unit.

use std::collections::HashMap;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::Result;
use chrono::DateTime;
use regex::Regex;

use crate::chunk::{chunk_units, ChunkStats};
use crate::config::Config;
use crate::error::Error;
use crate::index::VectorIndex;
use crate::models::{MessageFile, RawMessage, RetrievableUnit, UnitMetadata};
use crate::progress::BuildProgressReporter;
use crate::setup;

/// Minimum cleaned text length for a message to be indexed.
pub const MIN_MESSAGE_LENGTH: usize = 10;

/// Subtypes the platform uses for membership and housekeeping notices.
const SYSTEM_SUBTYPES: &[&str] = &[
    "channel_join",
    "channel_leave",
    "channel_topic",
    "channel_purpose",
    "channel_name",
    "channel_archive",
    "channel_unarchive",
    "pinned_item",
    "unpinned_item",
];

static USER_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<@[A-Z0-9]+(?:\|[^>]*)?>").unwrap());
static CHANNEL_MENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<#[A-Z0-9]+\|([^>]+)>").unwrap());
static LINK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<(https?://[^|>]+)(?:\|[^>]+)?>").unwrap());
static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

pub async fn run_index(config: &Config, progress: &dyn BuildProgressReporter) -> Result<()> {
    let file = load_messages(&config.ingest.messages_file)?;
    let messages = file.into_messages();

    let (units, stats) = build_units(&messages, config.ingest.min_message_length);
    let chunks = chunk_units(
        &units,
        config.chunking.chunk_size,
        config.chunking.chunk_overlap,
    );
    let chunk_stats = ChunkStats::from_chunks(&chunks);

    let guards = setup::guards(config);
    let embedder = setup::embedding_provider(config)?;
    let mut index = VectorIndex::new(embedder, guards.embedding, guards.storage)
        .with_batch_size(config.embedding.batch_size);

    index.build(chunks, progress).await?;
    index.persist(&config.index.path).await?;

    println!("index {}", config.ingest.messages_file.display());
    println!("  messages: {}", stats.total);
    println!(
        "  rejected: {} (empty {}, bot {}, system {}, too short {})",
        stats.rejected(),
        stats.rejected_empty,
        stats.rejected_bot,
        stats.rejected_system,
        stats.rejected_too_short
    );
    println!(
        "  units: {} ({} threads, {} standalone)",
        stats.units, stats.threads, stats.standalone
    );
    println!(
        "  chunks: {} (avg {:.0} chars, {} authors, {} channels)",
        chunk_stats.total_chunks,
        chunk_stats.avg_length,
        chunk_stats.unique_authors,
        chunk_stats.unique_channels
    );
    println!("  saved to: {}", config.index.path.display());
    println!("ok");
    Ok(())
}

/// Strip platform markup from message text.
///
/// User mentions are removed, channel mentions become their display name,
/// links become the bare URL, and whitespace runs collapse to one space.
pub fn clean_slack_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let text = USER_MENTION.replace_all(text, "");
    let text = CHANNEL_MENTION.replace_all(&text, "$1");
    let text = LINK.replace_all(&text, "$1");
    let text = WHITESPACE.replace_all(&text, " ");
    text.trim().to_string()
}

/// Why a message was left out of the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rejection {
    Empty,
    Bot,
    System,
    TooShort,
}

/// Check a message and return its cleaned text if it should be indexed.
pub fn validate_message(msg: &RawMessage, min_length: usize) -> Result<String, Rejection> {
    if msg.text.trim().is_empty() {
        return Err(Rejection::Empty);
    }
    if msg.bot_id.is_some() || msg.subtype.as_deref() == Some("bot_message") {
        return Err(Rejection::Bot);
    }
    if msg
        .subtype
        .as_deref()
        .is_some_and(|s| SYSTEM_SUBTYPES.contains(&s))
    {
        return Err(Rejection::System);
    }
    let cleaned = clean_slack_text(&msg.text);
    if cleaned.chars().count() < min_length {
        return Err(Rejection::TooShort);
    }
    Ok(cleaned)
}

pub fn is_valid_message(msg: &RawMessage, min_length: usize) -> bool {
    validate_message(msg, min_length).is_ok()
}

/// Where a message lands during grouping. Every message has exactly one role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageRole {
    Standalone,
    /// Root of a thread, keyed by its thread timestamp.
    Parent(String),
    /// Reply to the thread with this root timestamp.
    Reply(String),
}

pub fn classify(msg: &RawMessage) -> MessageRole {
    if msg.is_thread_reply {
        // A reply whose root cannot be identified has nowhere to go.
        return match msg.parent_ts.as_ref().or(msg.thread_ts.as_ref()) {
            Some(root) => MessageRole::Reply(root.clone()),
            None => MessageRole::Standalone,
        };
    }
    if msg.reply_count() > 0 {
        let root = msg.thread_ts.clone().unwrap_or_else(|| msg.ts.clone());
        return MessageRole::Parent(root);
    }
    MessageRole::Standalone
}

/// A thread root plus its replies, or a single standalone message.
#[derive(Debug, Clone, PartialEq)]
pub struct ThreadGroup {
    pub root_ts: Option<String>,
    /// Root first (when it was captured), replies in arrival order.
    pub messages: Vec<RawMessage>,
}

/// Group messages in a single pass.
///
/// Groups are returned in order of first appearance. A parent is always
/// placed at index 0 of its group, even if some replies arrived before it.
pub fn group_threads(messages: Vec<RawMessage>) -> Vec<ThreadGroup> {
    enum Slot {
        Single(RawMessage),
        Thread(String),
    }

    let mut order: Vec<Slot> = Vec::new();
    let mut threads: HashMap<String, Vec<RawMessage>> = HashMap::new();

    for msg in messages {
        let (root, is_parent) = match classify(&msg) {
            MessageRole::Standalone => {
                order.push(Slot::Single(msg));
                continue;
            }
            MessageRole::Parent(root) => (root, true),
            MessageRole::Reply(root) => (root, false),
        };

        let members = threads.entry(root.clone()).or_insert_with(|| {
            order.push(Slot::Thread(root));
            Vec::new()
        });
        if is_parent {
            members.insert(0, msg);
        } else {
            members.push(msg);
        }
    }

    order
        .into_iter()
        .filter_map(|slot| match slot {
            Slot::Single(msg) => Some(ThreadGroup {
                root_ts: None,
                messages: vec![msg],
            }),
            Slot::Thread(root) => threads.remove(&root).map(|messages| ThreadGroup {
                root_ts: Some(root),
                messages,
            }),
        })
        .collect()
}

/// Serialize a group into one retrievable unit.
///
/// Expects already-cleaned text. Returns `None` for an empty group.
pub fn serialize_group(group: &ThreadGroup) -> Option<RetrievableUnit> {
    let first = group.messages.first()?;
    let mut metadata = message_metadata(first);

    if group.messages.len() == 1 {
        return Some(RetrievableUnit {
            text: first.text.clone(),
            metadata,
        });
    }

    let mut parts = Vec::with_capacity(group.messages.len());
    // a root that was never captured leaves a reply at index 0
    if first.is_thread_reply {
        parts.push(format!("Reply by {}:\n{}", first.author(), first.text));
    } else {
        parts.push(format!("Thread started by {}:\n{}", first.author(), first.text));
    }
    for reply in &group.messages[1..] {
        parts.push(format!("\nReply by {}:\n{}", reply.author(), reply.text));
    }

    metadata.is_thread = true;
    metadata.reply_count = group.messages.len() - 1;
    if metadata.thread_ts.is_none() {
        metadata.thread_ts = group.root_ts.clone();
    }

    Some(RetrievableUnit {
        text: parts.join("\n"),
        metadata,
    })
}

fn message_metadata(msg: &RawMessage) -> UnitMetadata {
    let channel_id = msg.channel.clone().unwrap_or_else(|| "Unknown".to_string());
    let channel_name = msg
        .channel_name
        .clone()
        .unwrap_or_else(|| channel_id.clone());
    UnitMetadata {
        author: msg.author().to_string(),
        author_id: msg.author_id().to_string(),
        channel_id,
        channel_name,
        timestamp: msg.ts.clone(),
        formatted_time: format_timestamp(&msg.ts),
        thread_ts: msg.thread_ts.clone(),
        is_thread: false,
        reply_count: 0,
    }
}

/// Render a platform timestamp (`"1699999999.000100"`) as UTC
/// `YYYY-MM-DD HH:MM:SS`, or `"Unknown"` if it does not parse.
pub fn format_timestamp(ts: &str) -> String {
    let Ok(secs) = ts.trim().parse::<f64>() else {
        return "Unknown".to_string();
    };
    if !secs.is_finite() {
        return "Unknown".to_string();
    }
    let whole = secs.trunc() as i64;
    let nanos = ((secs - secs.trunc()) * 1e9) as u32;
    match DateTime::from_timestamp(whole, nanos) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => "Unknown".to_string(),
    }
}

/// Counters collected while turning messages into units.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub total: usize,
    pub rejected_empty: usize,
    pub rejected_bot: usize,
    pub rejected_system: usize,
    pub rejected_too_short: usize,
    /// Groups with at least one surviving reply.
    pub threads: usize,
    pub standalone: usize,
    pub units: usize,
}

impl IngestStats {
    pub fn rejected(&self) -> usize {
        self.rejected_empty + self.rejected_bot + self.rejected_system + self.rejected_too_short
    }

    fn record(&mut self, rejection: Rejection) {
        match rejection {
            Rejection::Empty => self.rejected_empty += 1,
            Rejection::Bot => self.rejected_bot += 1,
            Rejection::System => self.rejected_system += 1,
            Rejection::TooShort => self.rejected_too_short += 1,
        }
    }
}

/// Filter, clean, group, and serialize messages into retrievable units.
pub fn build_units(messages: &[RawMessage], min_length: usize) -> (Vec<RetrievableUnit>, IngestStats) {
    let mut stats = IngestStats {
        total: messages.len(),
        ..Default::default()
    };

    let mut valid = Vec::with_capacity(messages.len());
    for msg in messages {
        match validate_message(msg, min_length) {
            Ok(text) => valid.push(RawMessage {
                text,
                ..msg.clone()
            }),
            Err(rejection) => stats.record(rejection),
        }
    }
    tracing::info!(
        rejected = stats.rejected(),
        remaining = valid.len(),
        "filtered messages"
    );

    let groups = group_threads(valid);
    let mut units = Vec::with_capacity(groups.len());
    for group in &groups {
        if let Some(unit) = serialize_group(group) {
            if unit.metadata.is_thread {
                stats.threads += 1;
            } else {
                stats.standalone += 1;
            }
            units.push(unit);
        }
    }
    stats.units = units.len();

    tracing::info!(
        units = stats.units,
        threads = stats.threads,
        standalone = stats.standalone,
        "built retrievable units"
    );
    (units, stats)
}

/// Load a captured message file.
///
/// Accepts a bare JSON list of messages or an object with `metadata` and
/// `messages` keys.
pub fn load_messages(path: &Path) -> Result<MessageFile, Error> {
    let content = std::fs::read_to_string(path).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let file = parse_message_file(&content).map_err(|message| Error::InvalidMessageFile {
        path: path.to_path_buf(),
        message,
    })?;
    log_loaded(path, &file);
    Ok(file)
}

fn parse_message_file(content: &str) -> Result<MessageFile, String> {
    let value: serde_json::Value = serde_json::from_str(content).map_err(|e| e.to_string())?;
    match value {
        serde_json::Value::Array(_) => serde_json::from_value::<Vec<RawMessage>>(value)
            .map(MessageFile::Legacy)
            .map_err(|e| e.to_string()),
        serde_json::Value::Object(ref map) if map.contains_key("messages") => {
            serde_json::from_value::<MessageFile>(value).map_err(|e| e.to_string())
        }
        _ => Err("expected a list of messages or an object with a 'messages' key".to_string()),
    }
}

fn log_loaded(path: &Path, file: &MessageFile) {
    match file {
        MessageFile::Legacy(messages) => tracing::info!(
            path = %path.display(),
            messages = messages.len(),
            "loaded messages (legacy format)"
        ),
        MessageFile::Wrapped { metadata, messages } => tracing::info!(
            path = %path.display(),
            messages = messages.len(),
            channels = metadata.total_channels,
            fetched_at = metadata.fetch_timestamp.as_deref().unwrap_or("unknown"),
            "loaded messages"
        ),
    }
}
