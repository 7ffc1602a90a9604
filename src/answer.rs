//! Question answering over the index.
//!
//! [`Orchestrator::ask`] retrieves the nearest chunks, formats them into a
//! context block, asks the chat model to answer from that context only, and
//! attaches a distance-based confidence plus citations.
//!
//! `ask` never returns an error. Every failure reachable from a question
//! (empty index hit, exhausted retries, open breaker, caller timeout)
//! becomes a degraded [`Answer`] with `confidence == 0.0` and an `error`
//! tag, so callers only ever render answers.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::error::{Error, FailureKind, ServiceError};
use crate::index::VectorIndex;
use crate::llm::ChatCompletion;
use crate::models::SearchResult;
use crate::resilience::{Guard, RetryObserver};

pub const SYSTEM_PROMPT: &str = "You are Ethos, an AI assistant that helps teams remember past conversations.

Instructions:
- Answer ONLY based on the context provided above
- If you can't find the answer in the context, say \"I couldn't find that information in the conversation history.\"
- Be concise and specific
- Include relevant details like who said what and when
- Don't make up information";

pub const NOT_FOUND: &str = "I couldn't find that information in the conversation history.";

const RATE_LIMITED: &str =
    "⏸️ I'm currently rate-limited by the AI service. Please wait a minute and try again.";
const SERVICE_FAILED: &str =
    "❌ I encountered an error while processing your question. Please try again in a moment.";
const TIMED_OUT: &str = "⌛ Answering took too long and was abandoned. Please try again.";
const EMPTY_QUESTION: &str = "Please ask a question.";

/// Citations returned per answer, at most.
pub const MAX_SOURCES: usize = 5;

/// Preview length for citation text, in characters.
pub const PREVIEW_CHARS: usize = 150;

pub const DEFAULT_MAX_QUERY_LENGTH: usize = 500;

/// Error tag for rate-limit degradation.
pub const RATE_LIMIT_TAG: &str = "rate_limit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    High,
    Moderate,
    Low,
}

impl ConfidenceLevel {
    pub fn from_score(confidence: f32) -> Self {
        if confidence >= 0.8 {
            ConfidenceLevel::High
        } else if confidence >= 0.5 {
            ConfidenceLevel::Moderate
        } else {
            ConfidenceLevel::Low
        }
    }

    pub fn indicator(&self) -> &'static str {
        match self {
            ConfidenceLevel::High => "✅ High confidence answer",
            ConfidenceLevel::Moderate => "⚠️ Moderate confidence - verify if critical",
            ConfidenceLevel::Low => "⚠️ Low confidence - information may be incomplete",
        }
    }
}

/// A citation for one retrieved chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Source {
    pub author: String,
    pub timestamp: String,
    pub channel: String,
    pub preview: String,
    /// Raw squared L2 distance.
    pub score: f32,
    /// Distance after the priority adjustment.
    pub adjusted_score: f32,
    pub is_priority: bool,
}

impl Source {
    fn from_result(result: &SearchResult) -> Self {
        let meta = &result.chunk.metadata;
        Self {
            author: meta.author.clone(),
            timestamp: meta.formatted_time.clone(),
            channel: meta.channel_name.clone(),
            preview: truncate_text(&result.chunk.text, PREVIEW_CHARS),
            score: result.distance,
            adjusted_score: result.score,
            is_priority: result.is_priority,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Answer {
    pub answer: String,
    pub sources: Vec<Source>,
    pub confidence: f32,
    pub confidence_level: ConfidenceLevel,
    pub confidence_indicator: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Answer {
    fn new(answer: impl Into<String>, sources: Vec<Source>, confidence: f32) -> Self {
        let level = ConfidenceLevel::from_score(confidence);
        Self {
            answer: answer.into(),
            sources,
            confidence,
            confidence_level: level,
            confidence_indicator: level.indicator(),
            error: None,
        }
    }

    fn degraded(answer: &str, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(answer, Vec::new(), 0.0)
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }
}

/// Confidence from the raw distances of the returned results, in rank order.
///
/// `1 − d0/10`, boosted by 1.2 when at least three results all sit within
/// 1.5 of the query, clamped to `[0, 1]`.
pub fn calculate_confidence(distances: &[f32]) -> f32 {
    let Some(&best) = distances.first() else {
        return 0.0;
    };
    let mut confidence = (1.0 - best / 10.0).clamp(0.0, 1.0);
    if distances.len() >= 3 && distances[..3].iter().all(|&d| d < 1.5) {
        confidence = (confidence * 1.2).min(1.0);
    }
    confidence
}

/// Cut `text` to at most `max_chars` characters at a word boundary,
/// appending `...` when anything was removed.
pub fn truncate_text(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    let head = match cut.rfind(' ') {
        Some(pos) if pos > 0 => &cut[..pos],
        _ => cut.as_str(),
    };
    format!("{}...", head.trim_end())
}

/// Trim and cap a question at `max_chars` characters. `None` when blank.
pub fn sanitize_query(question: &str, max_chars: usize) -> Option<String> {
    let trimmed = question.trim();
    if trimmed.is_empty() {
        return None;
    }
    let count = trimmed.chars().count();
    if count > max_chars {
        tracing::warn!(length = count, max = max_chars, "question truncated");
        return Some(trimmed.chars().take(max_chars).collect::<String>().trim_end().to_string());
    }
    Some(trimmed.to_string())
}

/// One labeled segment per result, separated by blank lines.
pub fn format_context(results: &[SearchResult]) -> String {
    results
        .iter()
        .enumerate()
        .map(|(i, r)| {
            let meta = &r.chunk.metadata;
            format!(
                "[Message {}]\nText: {}\nFrom: {}\nTime: {}\nChannel: {}\n---",
                i + 1,
                r.chunk.text,
                meta.author,
                meta.formatted_time,
                meta.channel_name
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn user_prompt(context: &str, question: &str) -> String {
    format!(
        "Context from previous Slack messages:\n{}\n\nQuestion: {}",
        context, question
    )
}

fn not_found(channel_filter: Option<&str>) -> String {
    match channel_filter {
        Some(channel) => format!("{} No matching messages in channels matching '{}'.", NOT_FOUND, channel),
        None => NOT_FOUND.to_string(),
    }
}

/// Callback fired before each chat-completion retry.
pub type RetryNotice = Arc<dyn Fn(&ServiceError, u32) + Send + Sync>;

/// Retrieval plus chat completion behind one guard.
///
/// Clones share the index and the guard's breaker.
#[derive(Clone)]
pub struct Orchestrator {
    index: Arc<VectorIndex>,
    chat: Arc<dyn ChatCompletion>,
    guard: Guard,
    max_query_length: usize,
    on_retry: Option<RetryNotice>,
}

impl Orchestrator {
    pub fn new(index: Arc<VectorIndex>, chat: Arc<dyn ChatCompletion>, guard: Guard) -> Self {
        Self {
            index,
            chat,
            guard,
            max_query_length: DEFAULT_MAX_QUERY_LENGTH,
            on_retry: None,
        }
    }

    pub fn with_max_query_length(mut self, max: usize) -> Self {
        self.max_query_length = max.max(1);
        self
    }

    pub fn with_retry_notice(mut self, notice: RetryNotice) -> Self {
        self.on_retry = Some(notice);
        self
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub fn guard(&self) -> &Guard {
        &self.guard
    }

    /// Answer `question` from the `k` nearest chunks.
    pub async fn ask(&self, question: &str, k: usize, channel_filter: Option<&str>) -> Answer {
        let Some(question) = sanitize_query(question, self.max_query_length) else {
            return Answer::degraded(EMPTY_QUESTION, "empty_query");
        };
        let channel_filter = channel_filter.map(str::trim).filter(|c| !c.is_empty());
        tracing::info!(
            question = %truncate_text(&question, 100),
            k,
            channel = channel_filter.unwrap_or(""),
            "answering question"
        );

        let results = match self.index.search(&question, k, channel_filter).await {
            Ok(results) => results,
            Err(e) => return degrade(&e),
        };
        if results.is_empty() {
            tracing::warn!("no results for question");
            return Answer::new(not_found(channel_filter), Vec::new(), 0.0);
        }

        let context = format_context(&results);
        let prompt = user_prompt(&context, &question);
        let chat = &self.chat;
        let notice = self.on_retry.as_deref();
        let observer: &RetryObserver<'_, ServiceError> = &|err: &ServiceError, attempt: u32| {
            if let Some(notice) = notice {
                notice(err, attempt);
            }
        };

        let text = match self
            .guard
            .call_observed(|| chat.complete(SYSTEM_PROMPT, &prompt), Some(observer))
            .await
        {
            Ok(text) => text,
            Err(e) => return degrade(&Error::from(e)),
        };

        // raw distances: the priority boost affects ranking only
        let distances: Vec<f32> = results.iter().map(|r| r.distance).collect();
        let confidence = calculate_confidence(&distances);
        let sources = results
            .iter()
            .take(MAX_SOURCES.min(k))
            .map(Source::from_result)
            .collect();
        tracing::info!(confidence, results = results.len(), "answer generated");
        Answer::new(text, sources, confidence)
    }

    /// [`ask`](Self::ask) abandoned after `timeout`.
    ///
    /// Abandoning a call in flight does not count as a failure toward the
    /// breaker.
    pub async fn ask_with_timeout(
        &self,
        question: &str,
        k: usize,
        channel_filter: Option<&str>,
        timeout: Duration,
    ) -> Answer {
        match tokio::time::timeout(timeout, self.ask(question, k, channel_filter)).await {
            Ok(answer) => answer,
            Err(_) => {
                tracing::warn!(timeout_secs = timeout.as_secs_f64(), "question abandoned");
                Answer::degraded(TIMED_OUT, "timeout")
            }
        }
    }

    /// Answer questions one at a time, in order.
    pub async fn ask_batch(&self, questions: &[String], k: usize) -> Vec<Answer> {
        let mut answers = Vec::with_capacity(questions.len());
        for (i, question) in questions.iter().enumerate() {
            tracing::info!(n = i + 1, total = questions.len(), "batch question");
            answers.push(self.ask(question, k, None).await);
        }
        answers
    }
}

fn degrade(err: &Error) -> Answer {
    tracing::error!(error = %err, "question failed");
    match err.failure_kind() {
        Some(FailureKind::RateLimited) => Answer::degraded(RATE_LIMITED, RATE_LIMIT_TAG),
        _ => Answer::degraded(SERVICE_FAILED, err.to_string()),
    }
}

/// CLI entry point for `ethos ask`.
pub async fn run_ask(
    config: &crate::config::Config,
    question: &str,
    k: Option<usize>,
    channel: Option<&str>,
    timeout: Option<Duration>,
    json: bool,
) -> anyhow::Result<()> {
    let orchestrator = crate::setup::orchestrator(config)
        .await?
        .with_retry_notice(Arc::new(|err: &ServiceError, attempt: u32| {
            eprintln!("ask  {} ({}), retrying (attempt {})", err.service, err.kind, attempt + 2);
        }));
    let k = k.unwrap_or(config.retrieval.top_k);
    let answer = match timeout {
        Some(timeout) => orchestrator.ask_with_timeout(question, k, channel, timeout).await,
        None => orchestrator.ask(question, k, channel).await,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&answer)?);
        return Ok(());
    }

    println!("{}", answer.answer);
    println!();
    println!("{} ({:.2})", answer.confidence_indicator, answer.confidence);
    if !answer.sources.is_empty() {
        println!();
        println!("Sources:");
        for (i, source) in answer.sources.iter().enumerate() {
            let star = if source.is_priority { " *" } else { "" };
            println!(
                "  {}. {} in #{}{} at {} (distance {:.3})",
                i + 1,
                source.author,
                source.channel,
                star,
                source.timestamp,
                source.score
            );
            println!("     {}", source.preview);
        }
    }
    Ok(())
}
