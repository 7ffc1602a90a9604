//! Workspace capture from the messaging platform.
//!
//! `ethos fetch` walks every visible channel (or the configured subset),
//! pulls channel history and thread replies, resolves author names, and
//! writes one wrapped message file that `ethos index` consumes.
//!
//! The platform is reached through the [`MessagingPlatform`] trait so the
//! walk can be driven by an in-memory fake in tests; [`SlackClient`] is the
//! Slack Web API implementation. Every platform call goes through the
//! Slack [`Guard`], so rate limits are retried with the server's
//! `Retry-After` as a floor and a dead workspace trips the breaker.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;

use crate::config::Config;
use crate::error::{Error, FailureKind, Result, ServiceError};
use crate::http;
use crate::models::{ChannelSummary, FetchMetadata, MessageFile, RawMessage};
use crate::resilience::Guard;
use crate::setup;

const SERVICE: &str = "slack";

/// Largest page the history endpoint returns.
const PAGE_SIZE: usize = 100;

const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Channel {
    pub id: String,
    pub name: String,
}

/// One page of a cursor-paginated listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_cursor: None,
        }
    }
}

/// Read access to a chat workspace.
#[async_trait]
pub trait MessagingPlatform: Send + Sync {
    async fn list_channels(&self, cursor: Option<&str>) -> Result<Page<Channel>, ServiceError>;

    /// Newest-first channel history, at most `limit` messages per page.
    async fn history(
        &self,
        channel_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<RawMessage>, ServiceError>;

    /// Messages of a thread. The first item is usually the thread root.
    async fn replies(
        &self,
        channel_id: &str,
        thread_ts: &str,
        cursor: Option<&str>,
    ) -> Result<Page<RawMessage>, ServiceError>;

    /// Display name for a user id.
    async fn user_name(&self, user_id: &str) -> Result<String, ServiceError>;
}

// ============ Slack Web API ============

/// [`MessagingPlatform`] over the Slack Web API.
///
/// Calls `GET {url}/{method}` (default `https://slack.com/api`) with a bot
/// token. Slack reports most failures as HTTP 200 with `"ok": false`; those
/// are classified by their `error` code.
pub struct SlackClient {
    token: String,
    url: String,
    client: reqwest::Client,
}

impl SlackClient {
    pub fn new(token: String, url: Option<String>, timeout_secs: u64) -> anyhow::Result<Self> {
        let url = url.unwrap_or_else(|| "https://slack.com/api".to_string());
        Ok(Self {
            token,
            url: url.trim_end_matches('/').to_string(),
            client: http::client(timeout_secs)?,
        })
    }

    async fn call(&self, method: &str, params: &[(&str, String)]) -> Result<serde_json::Value, ServiceError> {
        let request = self
            .client
            .get(format!("{}/{}", self.url, method))
            .bearer_auth(&self.token)
            .query(params);
        let json = http::send_json(SERVICE, request).await?;
        check_ok(method, json)
    }
}

#[async_trait]
impl MessagingPlatform for SlackClient {
    async fn list_channels(&self, cursor: Option<&str>) -> Result<Page<Channel>, ServiceError> {
        let mut params = vec![
            ("types", "public_channel,private_channel".to_string()),
            ("exclude_archived", "true".to_string()),
            ("limit", "200".to_string()),
        ];
        push_cursor(&mut params, cursor);
        let json = self.call("conversations.list", &params).await?;
        parse_page(&json, "channels")
    }

    async fn history(
        &self,
        channel_id: &str,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Page<RawMessage>, ServiceError> {
        let mut params = vec![
            ("channel", channel_id.to_string()),
            ("limit", limit.to_string()),
        ];
        push_cursor(&mut params, cursor);
        let json = self.call("conversations.history", &params).await?;
        parse_page(&json, "messages")
    }

    async fn replies(
        &self,
        channel_id: &str,
        thread_ts: &str,
        cursor: Option<&str>,
    ) -> Result<Page<RawMessage>, ServiceError> {
        let mut params = vec![
            ("channel", channel_id.to_string()),
            ("ts", thread_ts.to_string()),
            ("limit", PAGE_SIZE.to_string()),
        ];
        push_cursor(&mut params, cursor);
        let json = self.call("conversations.replies", &params).await?;
        parse_page(&json, "messages")
    }

    async fn user_name(&self, user_id: &str) -> Result<String, ServiceError> {
        let json = self
            .call("users.info", &[("user", user_id.to_string())])
            .await?;
        Ok(display_name(&json, user_id))
    }
}

fn push_cursor(params: &mut Vec<(&str, String)>, cursor: Option<&str>) {
    if let Some(cursor) = cursor {
        params.push(("cursor", cursor.to_string()));
    }
}

/// Turn an `"ok": false` envelope into a classified error.
fn check_ok(method: &str, json: serde_json::Value) -> Result<serde_json::Value, ServiceError> {
    if json.get("ok").and_then(|v| v.as_bool()) == Some(true) {
        return Ok(json);
    }
    let code = json
        .get("error")
        .and_then(|v| v.as_str())
        .unwrap_or("unknown_error");
    Err(ServiceError::new(
        SERVICE,
        kind_for_error_code(code),
        format!("{}: {}", method, code),
    ))
}

fn kind_for_error_code(code: &str) -> FailureKind {
    match code {
        "ratelimited" | "rate_limited" => FailureKind::RateLimited,
        "invalid_auth" | "not_authed" | "account_inactive" | "token_revoked" | "token_expired"
        | "missing_scope" | "not_in_channel" => FailureKind::Unauthorized,
        "internal_error" | "fatal_error" | "service_unavailable" | "request_timeout" => {
            FailureKind::Api
        }
        _ => FailureKind::InvalidRequest,
    }
}

fn parse_page<T: serde::de::DeserializeOwned>(
    json: &serde_json::Value,
    field: &str,
) -> Result<Page<T>, ServiceError> {
    let items = json
        .get(field)
        .cloned()
        .ok_or_else(|| ServiceError::new(SERVICE, FailureKind::InvalidResponse, format!("missing '{}'", field)))?;
    let items: Vec<T> = serde_json::from_value(items).map_err(|e| {
        ServiceError::new(SERVICE, FailureKind::InvalidResponse, format!("bad '{}': {}", field, e))
    })?;
    let next_cursor = json
        .pointer("/response_metadata/next_cursor")
        .and_then(|c| c.as_str())
        .filter(|c| !c.is_empty())
        .map(str::to_string);
    Ok(Page { items, next_cursor })
}

/// `real_name`, then `profile.display_name`, then `name`, then the id.
fn display_name(json: &serde_json::Value, user_id: &str) -> String {
    ["/user/real_name", "/user/profile/display_name", "/user/name"]
        .iter()
        .filter_map(|p| json.pointer(p).and_then(|v| v.as_str()))
        .find(|name| !name.trim().is_empty())
        .unwrap_or(user_id)
        .to_string()
}

// ============ Workspace walk ============

/// Which channels a fetch covers. Empty means every visible channel.
fn wanted(channel: &Channel, filter: &[String]) -> bool {
    filter.is_empty()
        || filter.iter().any(|f| {
            let f = f.trim().trim_start_matches('#');
            f.eq_ignore_ascii_case(&channel.name) || f == channel.id
        })
}

async fn list_all_channels(platform: &dyn MessagingPlatform, guard: &Guard) -> Result<Vec<Channel>> {
    let mut channels = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = guard
            .call(|| platform.list_channels(cursor.as_deref()))
            .await?;
        channels.extend(page.items);
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    Ok(channels)
}

/// Up to `limit` messages of one channel, newest first.
async fn channel_history(
    platform: &dyn MessagingPlatform,
    guard: &Guard,
    channel_id: &str,
    limit: usize,
) -> Result<Vec<RawMessage>> {
    let mut messages = Vec::new();
    let mut cursor: Option<String> = None;
    while messages.len() < limit {
        let page_limit = PAGE_SIZE.min(limit - messages.len());
        let page = guard
            .call(|| platform.history(channel_id, cursor.as_deref(), page_limit))
            .await?;
        let empty = page.items.is_empty();
        messages.extend(page.items);
        match page.next_cursor {
            Some(next) if !empty => cursor = Some(next),
            _ => break,
        }
    }
    messages.truncate(limit);
    Ok(messages)
}

/// Replies of one thread, excluding the root, marked as thread replies.
async fn thread_replies(
    platform: &dyn MessagingPlatform,
    guard: &Guard,
    channel_id: &str,
    parent_ts: &str,
) -> Result<Vec<RawMessage>> {
    let mut replies = Vec::new();
    let mut cursor: Option<String> = None;
    loop {
        let page = guard
            .call(|| platform.replies(channel_id, parent_ts, cursor.as_deref()))
            .await?;
        replies.extend(page.items.into_iter().filter(|m| m.ts != parent_ts).map(|mut m| {
            m.is_thread_reply = true;
            m.parent_ts = Some(parent_ts.to_string());
            m.thread_ts.get_or_insert_with(|| parent_ts.to_string());
            m
        }));
        match page.next_cursor {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    Ok(replies)
}

fn is_thread_root(msg: &RawMessage) -> bool {
    msg.reply_count() > 0 && msg.thread_ts.as_deref().map_or(true, |t| t == msg.ts)
}

/// Capture a workspace into a wrapped message file.
///
/// The channel listing must succeed. A channel whose history or threads
/// cannot be read is logged and skipped, and an unresolvable user keeps
/// the raw id as the display name.
pub async fn fetch_workspace(
    platform: &dyn MessagingPlatform,
    guard: &Guard,
    channel_filter: &[String],
    limit_per_channel: usize,
) -> Result<MessageFile> {
    let channels: Vec<Channel> = list_all_channels(platform, guard)
        .await?
        .into_iter()
        .filter(|c| wanted(c, channel_filter))
        .collect();
    tracing::info!(channels = channels.len(), "fetching channels");

    let mut messages = Vec::new();
    let mut summaries = Vec::new();
    for channel in &channels {
        match fetch_channel(platform, guard, channel, limit_per_channel).await {
            Ok(mut channel_messages) => {
                tracing::info!(
                    channel = %channel.name,
                    messages = channel_messages.len(),
                    "fetched channel"
                );
                summaries.push(ChannelSummary {
                    channel_id: channel.id.clone(),
                    channel_name: channel.name.clone(),
                    message_count: channel_messages.len(),
                });
                messages.append(&mut channel_messages);
            }
            Err(e) => {
                tracing::warn!(channel = %channel.name, error = %e, "skipping channel");
            }
        }
    }

    resolve_user_names(platform, guard, &mut messages).await;

    let metadata = FetchMetadata {
        fetch_timestamp: Some(chrono::Utc::now().to_rfc3339()),
        total_messages: messages.len(),
        total_channels: summaries.len(),
        channels: summaries,
        limit_per_channel: Some(limit_per_channel),
    };
    Ok(MessageFile::Wrapped { metadata, messages })
}

async fn fetch_channel(
    platform: &dyn MessagingPlatform,
    guard: &Guard,
    channel: &Channel,
    limit: usize,
) -> Result<Vec<RawMessage>> {
    let history = channel_history(platform, guard, &channel.id, limit).await?;
    let mut messages = Vec::with_capacity(history.len());
    for msg in history {
        let replies = if is_thread_root(&msg) {
            thread_replies(platform, guard, &channel.id, &msg.ts).await?
        } else {
            Vec::new()
        };
        messages.push(msg);
        messages.extend(replies);
    }
    for msg in &mut messages {
        msg.channel = Some(channel.id.clone());
        msg.channel_name = Some(channel.name.clone());
    }
    Ok(messages)
}

async fn resolve_user_names(platform: &dyn MessagingPlatform, guard: &Guard, messages: &mut [RawMessage]) {
    let user_ids: BTreeSet<String> = messages.iter().filter_map(|m| m.user.clone()).collect();
    let mut names = HashMap::with_capacity(user_ids.len());
    for id in user_ids {
        let name = match guard.call(|| platform.user_name(&id)).await {
            Ok(name) => name,
            Err(e) => {
                tracing::warn!(user = %id, error = %e, "could not resolve user name");
                id.clone()
            }
        };
        names.insert(id, name);
    }
    for msg in messages {
        if let Some(name) = msg.user.as_ref().and_then(|id| names.get(id)) {
            msg.user_name = Some(name.clone());
        }
    }
}

/// Write a message file as pretty-printed JSON, creating parent directories.
pub fn save_messages(path: &Path, file: &MessageFile) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| Error::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let json = serde_json::to_string_pretty(file)?;
    std::fs::write(path, json).map_err(|source| Error::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// CLI entry point for `ethos fetch`.
pub async fn run_fetch(config: &Config, channels: &[String], limit: Option<usize>) -> anyhow::Result<()> {
    let token = std::env::var(&config.slack.token_env)
        .with_context(|| format!("{} environment variable not set", config.slack.token_env))?;
    let client = SlackClient::new(token, config.slack.url.clone(), REQUEST_TIMEOUT_SECS)?;
    let guards = setup::guards(config);

    let channels = if channels.is_empty() {
        config.slack.channels.as_slice()
    } else {
        channels
    };
    let limit = limit.unwrap_or(config.slack.limit_per_channel);

    let file = fetch_workspace(&client, &guards.slack, channels, limit).await?;
    let metadata = file.metadata().cloned().unwrap_or_default();
    if metadata.total_messages == 0 {
        anyhow::bail!("No messages fetched; check the token scopes and channel membership");
    }

    let path = &config.ingest.messages_file;
    save_messages(path, &file)?;

    println!(
        "Fetched {} messages from {} channels",
        metadata.total_messages, metadata.total_channels
    );
    for channel in &metadata.channels {
        println!("  #{:<24} {:>6}", channel.channel_name, channel.message_count);
    }
    println!("Saved to {}", path.display());
    println!("ok");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_ok_classifies_errors() {
        let ok = serde_json::json!({ "ok": true, "channels": [] });
        assert!(check_ok("conversations.list", ok).is_ok());

        let cases = [
            ("ratelimited", FailureKind::RateLimited),
            ("invalid_auth", FailureKind::Unauthorized),
            ("not_in_channel", FailureKind::Unauthorized),
            ("internal_error", FailureKind::Api),
            ("channel_not_found", FailureKind::InvalidRequest),
        ];
        for (code, kind) in cases {
            let json = serde_json::json!({ "ok": false, "error": code });
            let err = check_ok("conversations.history", json).unwrap_err();
            assert_eq!(err.kind, kind, "{}", code);
            assert!(err.message.contains(code));
        }
    }

    #[test]
    fn test_parse_history_page() {
        let json = serde_json::json!({
            "ok": true,
            "messages": [
                { "type": "message", "user": "U1", "text": "hello", "ts": "1700000000.000100",
                  "thread_ts": "1700000000.000100", "reply_count": 2 },
                { "type": "message", "bot_id": "B1", "text": "beep", "ts": "1700000001.000100" }
            ],
            "response_metadata": { "next_cursor": "abc" }
        });
        let page: Page<RawMessage> = parse_page(&json, "messages").unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.items[0].reply_count(), 2);
        assert!(is_thread_root(&page.items[0]));
        assert_eq!(page.items[1].bot_id.as_deref(), Some("B1"));
        assert_eq!(page.next_cursor.as_deref(), Some("abc"));
    }

    #[test]
    fn test_empty_cursor_ends_pagination() {
        let json = serde_json::json!({
            "ok": true,
            "channels": [{ "id": "C1", "name": "general", "is_channel": true }],
            "response_metadata": { "next_cursor": "" }
        });
        let page: Page<Channel> = parse_page(&json, "channels").unwrap();
        assert_eq!(page.items[0].name, "general");
        assert_eq!(page.next_cursor, None);
    }

    #[test]
    fn test_display_name_fallbacks() {
        let full = serde_json::json!({ "user": { "name": "jd", "real_name": "Jane Doe",
            "profile": { "display_name": "jane" } } });
        assert_eq!(display_name(&full, "U1"), "Jane Doe");

        let display = serde_json::json!({ "user": { "name": "jd", "real_name": "",
            "profile": { "display_name": "jane" } } });
        assert_eq!(display_name(&display, "U1"), "jane");

        let bare = serde_json::json!({ "user": {} });
        assert_eq!(display_name(&bare, "U1"), "U1");
    }

    #[test]
    fn test_channel_filter() {
        let c = Channel {
            id: "C42".to_string(),
            name: "dev-team".to_string(),
        };
        assert!(wanted(&c, &[]));
        assert!(wanted(&c, &["#Dev-Team".to_string()]));
        assert!(wanted(&c, &["C42".to_string()]));
        assert!(!wanted(&c, &["dev".to_string()]));
    }

    #[test]
    fn test_save_messages_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data").join("messages.json");
        let file = MessageFile::Wrapped {
            metadata: FetchMetadata::default(),
            messages: vec![RawMessage {
                text: "hello".to_string(),
                ts: "1.0".to_string(),
                ..Default::default()
            }],
        };
        save_messages(&path, &file).unwrap();
        let back = crate::ingest::load_messages(&path).unwrap();
        assert_eq!(back.into_messages()[0].text, "hello");
    }
}
