//! Answer orchestration against scripted chat-completion fakes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use ethos::answer::{ConfidenceLevel, Orchestrator, NOT_FOUND, RATE_LIMIT_TAG, SYSTEM_PROMPT};
use ethos::chunk::chunk_units;
use ethos::embedding::{EmbeddingProvider, HashEmbedder};
use ethos::error::{FailureKind, ServiceError};
use ethos::index::{PriorityPolicy, VectorIndex};
use ethos::ingest::build_units;
use ethos::llm::ChatCompletion;
use ethos::models::RawMessage;
use ethos::progress::NoProgress;
use ethos::resilience::{
    CircuitBreakerConfig, CircuitState, Guard, RetryConfig, EMBEDDING_RETRYABLE, LLM_RETRYABLE,
    STORAGE_RETRYABLE,
};

/// Replays scripted outcomes, then answers "fallback".
struct ScriptedChat {
    script: Mutex<VecDeque<Result<String, ServiceError>>>,
    calls: AtomicU32,
    prompts: Mutex<Vec<(String, String)>>,
}

impl ScriptedChat {
    fn new(script: Vec<Result<String, ServiceError>>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            calls: AtomicU32::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatCompletion for ScriptedChat {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .unwrap()
            .push((system.to_string(), user.to_string()));
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("fallback".to_string()))
    }
}

/// Never answers.
struct HangingChat;

#[async_trait]
impl ChatCompletion for HangingChat {
    fn model_name(&self) -> &str {
        "hanging"
    }

    async fn complete(&self, _system: &str, _user: &str) -> Result<String, ServiceError> {
        std::future::pending::<()>().await;
        Ok(String::new())
    }
}

fn msg(ts: &str, user: &str, channel: &str, text: &str) -> RawMessage {
    RawMessage {
        text: text.to_string(),
        user: Some(user.to_string()),
        user_name: Some(user.to_string()),
        ts: ts.to_string(),
        channel_name: Some(channel.to_string()),
        ..Default::default()
    }
}

async fn built_index() -> Arc<VectorIndex> {
    let messages = vec![
        msg("1700000000.000100", "alice", "dev-team", "The deploy freeze starts on Friday afternoon"),
        msg("1700000100.000100", "bob", "general", "Team lunch moved to the rooftop on Thursday"),
        msg("1700000200.000100", "carol", "leadership", "Hiring plan for next quarter is approved"),
    ];
    let (units, _) = build_units(&messages, 10);
    let mut index = VectorIndex::new(
        Arc::new(HashEmbedder::new(128)),
        Guard::new("embedding", RetryConfig::embedding(), CircuitBreakerConfig::default(), EMBEDDING_RETRYABLE),
        Guard::new("storage", RetryConfig::storage(), CircuitBreakerConfig::default(), STORAGE_RETRYABLE),
    );
    index.build(chunk_units(&units, 500, 50), &NoProgress).await.unwrap();
    Arc::new(index)
}

/// Embeds a text as `[x, 0]`, where `x` is its leading number.
struct LeadingNumberEmbedder;

#[async_trait]
impl EmbeddingProvider for LeadingNumberEmbedder {
    fn model_name(&self) -> &str {
        "leading-number"
    }

    fn dims(&self) -> usize {
        2
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ServiceError> {
        Ok(texts
            .iter()
            .map(|t| {
                let x = t
                    .split_whitespace()
                    .next()
                    .and_then(|w| w.parse::<f32>().ok())
                    .unwrap_or(0.0);
                vec![x, 0.0]
            })
            .collect())
    }
}

fn llm_guard(max_attempts: u32, failure_threshold: u32) -> Guard {
    Guard::new(
        "llm",
        RetryConfig {
            max_attempts,
            initial_delay_secs: 10.0,
            max_delay_secs: 120.0,
            exponential_base: 2.0,
            jitter: false,
        },
        CircuitBreakerConfig {
            failure_threshold,
            recovery_timeout_secs: 60.0,
        },
        LLM_RETRYABLE,
    )
}

fn rate_limited() -> ServiceError {
    ServiceError::new("llm", FailureKind::RateLimited, "HTTP 429")
}

#[tokio::test]
async fn answers_with_sources_and_confidence() {
    let chat = ScriptedChat::new(vec![Ok("Alice said the freeze starts Friday.".to_string())]);
    let orchestrator = Orchestrator::new(built_index().await, chat.clone(), llm_guard(3, 5));

    let answer = orchestrator.ask("When does the deploy freeze start?", 2, None).await;
    assert_eq!(answer.answer, "Alice said the freeze starts Friday.");
    assert!(answer.error.is_none());
    assert_eq!(answer.sources.len(), 2);
    assert_eq!(answer.sources[0].author, "alice");
    assert_eq!(answer.sources[0].channel, "dev-team");
    assert!(answer.confidence > 0.0 && answer.confidence <= 1.0);
    assert_eq!(answer.confidence_level, ConfidenceLevel::from_score(answer.confidence));

    let prompts = chat.prompts.lock().unwrap();
    let (system, user) = &prompts[0];
    assert_eq!(system, SYSTEM_PROMPT);
    assert!(user.starts_with("Context from previous Slack messages:\n[Message 1]\n"));
    assert!(user.ends_with("Question: When does the deploy freeze start?"));
}

#[tokio::test]
async fn sources_capped_at_five() {
    let chat = ScriptedChat::new(vec![]);
    let orchestrator = Orchestrator::new(built_index().await, chat, llm_guard(3, 5));
    let answer = orchestrator.ask("anything at all", 10, None).await;
    // only three chunks exist
    assert_eq!(answer.sources.len(), 3);
}

#[tokio::test]
async fn blank_question_is_degraded_without_calls() {
    let chat = ScriptedChat::new(vec![]);
    let orchestrator = Orchestrator::new(built_index().await, chat.clone(), llm_guard(3, 5));
    let answer = orchestrator.ask("   ", 5, None).await;
    assert!(answer.is_degraded());
    assert_eq!(answer.confidence, 0.0);
    assert_eq!(chat.calls(), 0);
}

#[tokio::test]
async fn filter_without_matches_returns_not_found() {
    let chat = ScriptedChat::new(vec![]);
    let orchestrator = Orchestrator::new(built_index().await, chat.clone(), llm_guard(3, 5));
    let answer = orchestrator.ask("deploy freeze", 5, Some("marketing")).await;
    assert!(answer.answer.starts_with(NOT_FOUND));
    assert!(answer.answer.contains("marketing"));
    assert_eq!(answer.confidence, 0.0);
    assert!(answer.sources.is_empty());
    assert_eq!(chat.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_rate_limit_is_retried_and_observed() {
    let chat = ScriptedChat::new(vec![Err(rate_limited()), Err(rate_limited()), Ok("done".to_string())]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let orchestrator = Orchestrator::new(built_index().await, chat.clone(), llm_guard(3, 5))
        .with_retry_notice(Arc::new(move |err: &ServiceError, attempt: u32| {
            sink.lock().unwrap().push((err.kind, attempt));
        }));

    let answer = orchestrator.ask("deploy freeze", 3, None).await;
    assert_eq!(answer.answer, "done");
    assert_eq!(chat.calls(), 3);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(FailureKind::RateLimited, 0), (FailureKind::RateLimited, 1)]
    );
}

#[tokio::test(start_paused = true)]
async fn exhausted_rate_limit_degrades() {
    let chat = ScriptedChat::new(vec![Err(rate_limited()), Err(rate_limited()), Err(rate_limited())]);
    let orchestrator = Orchestrator::new(built_index().await, chat.clone(), llm_guard(3, 5));
    let answer = orchestrator.ask("deploy freeze", 3, None).await;
    assert_eq!(answer.error.as_deref(), Some(RATE_LIMIT_TAG));
    assert_eq!(answer.confidence, 0.0);
    assert!(answer.sources.is_empty());
    assert_eq!(chat.calls(), 3);
}

#[tokio::test]
async fn permanent_failure_is_not_retried() {
    let chat = ScriptedChat::new(vec![Err(ServiceError::new(
        "llm",
        FailureKind::Unauthorized,
        "HTTP 401",
    ))]);
    let orchestrator = Orchestrator::new(built_index().await, chat.clone(), llm_guard(3, 5));
    let answer = orchestrator.ask("deploy freeze", 3, None).await;
    assert!(answer.is_degraded());
    assert_ne!(answer.error.as_deref(), Some(RATE_LIMIT_TAG));
    assert!(answer.error.unwrap().contains("401"));
    assert_eq!(chat.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn open_breaker_fails_fast_then_recovers() {
    let failures: Vec<Result<String, ServiceError>> = (0..2)
        .map(|_| Err(ServiceError::new("llm", FailureKind::Api, "HTTP 503")))
        .collect();
    let chat = ScriptedChat::new(failures);
    let orchestrator = Orchestrator::new(built_index().await, chat.clone(), llm_guard(1, 2));

    for _ in 0..2 {
        assert!(orchestrator.ask("deploy freeze", 3, None).await.is_degraded());
    }
    assert_eq!(orchestrator.guard().breaker().state(), CircuitState::Open);

    // rejected without reaching the chat service
    let answer = orchestrator.ask("deploy freeze", 3, None).await;
    assert!(answer.error.unwrap().contains("circuit_open"));
    assert_eq!(chat.calls(), 2);

    tokio::time::advance(Duration::from_secs(61)).await;
    let answer = orchestrator.ask("deploy freeze", 3, None).await;
    assert_eq!(answer.answer, "fallback");
    assert_eq!(orchestrator.guard().breaker().state(), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn timeout_abandons_without_tripping_breaker() {
    let orchestrator = Orchestrator::new(built_index().await, Arc::new(HangingChat), llm_guard(3, 1));
    let answer = orchestrator
        .ask_with_timeout("deploy freeze", 3, None, Duration::from_secs(5))
        .await;
    assert_eq!(answer.error.as_deref(), Some("timeout"));
    assert_eq!(orchestrator.guard().breaker().state(), CircuitState::Closed);
    assert_eq!(orchestrator.guard().breaker().failure_count(), 0);
}

#[tokio::test]
async fn batch_answers_in_order() {
    let chat = ScriptedChat::new(vec![Ok("one".to_string()), Ok("two".to_string())]);
    let orchestrator = Orchestrator::new(built_index().await, chat, llm_guard(3, 5));
    let answers = orchestrator
        .ask_batch(&["first question".to_string(), "second question".to_string()], 2)
        .await;
    let texts: Vec<&str> = answers.iter().map(|a| a.answer.as_str()).collect();
    assert_eq!(texts, vec!["one", "two"]);
}

#[tokio::test]
async fn concurrent_questions_share_one_index() {
    let chat = ScriptedChat::new(vec![]);
    let orchestrator = Orchestrator::new(built_index().await, chat.clone(), llm_guard(3, 5));
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let o = orchestrator.clone();
            tokio::spawn(async move { o.ask(&format!("question {} about lunch", i), 2, None).await })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.await.unwrap().answer, "fallback");
    }
    assert_eq!(chat.calls(), 4);
}

#[tokio::test]
async fn priority_boost_does_not_raise_confidence() {
    let messages = vec![msg(
        "1700000300.000100",
        "dave",
        "leadership",
        "3.15 offsite agenda is still being drafted",
    )];
    let (units, _) = build_units(&messages, 10);
    let mut index = VectorIndex::new(
        Arc::new(LeadingNumberEmbedder),
        Guard::new("embedding", RetryConfig::embedding(), CircuitBreakerConfig::default(), EMBEDDING_RETRYABLE),
        Guard::new("storage", RetryConfig::storage(), CircuitBreakerConfig::default(), STORAGE_RETRYABLE),
    )
    .with_priority(PriorityPolicy::new(&["leadership"], 0.9));
    index.build(chunk_units(&units, 500, 50), &NoProgress).await.unwrap();

    let chat = ScriptedChat::new(vec![Ok("The agenda is not final.".to_string())]);
    let orchestrator = Orchestrator::new(Arc::new(index), chat, llm_guard(3, 5));
    let answer = orchestrator.ask("0 what is on the offsite agenda", 3, None).await;

    let source = &answer.sources[0];
    assert!(source.is_priority);
    assert!((source.score - 9.9225).abs() < 1e-3);
    assert!(source.adjusted_score < 1.0);
    // 1 - 9.9225 / 10
    assert!((answer.confidence - 0.00775).abs() < 1e-3);
    assert_eq!(answer.confidence_level, ConfidenceLevel::Low);
}
