//! `ethos search`: raw retrieval without an LLM call.
//!
//! Prints the ranked chunks for a query with their raw distance, adjusted
//! score and priority flag, which is the quickest way to see what the
//! answer orchestrator would be given as context.

use anyhow::Result;
use serde::Serialize;

use crate::answer::truncate_text;
use crate::config::Config;
use crate::models::SearchResult;
use crate::setup;

/// JSON shape of one hit for `--json`.
#[derive(Debug, Serialize)]
pub struct SearchHit {
    pub rank: usize,
    pub distance: f32,
    pub score: f32,
    pub is_priority: bool,
    pub author: String,
    pub channel: String,
    pub time: String,
    pub is_thread: bool,
    pub chunk: String,
    pub text: String,
}

impl From<&SearchResult> for SearchHit {
    fn from(r: &SearchResult) -> Self {
        let meta = &r.chunk.metadata;
        Self {
            rank: r.rank,
            distance: r.distance,
            score: r.score,
            is_priority: r.is_priority,
            author: meta.author.clone(),
            channel: meta.channel_name.clone(),
            time: meta.formatted_time.clone(),
            is_thread: meta.is_thread,
            chunk: format!("{}/{}", r.chunk.chunk_index + 1, r.chunk.total_chunks),
            text: r.chunk.text.clone(),
        }
    }
}

pub async fn run_search(
    config: &Config,
    query: &str,
    channel: Option<&str>,
    limit: Option<usize>,
    json: bool,
) -> Result<()> {
    if query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let guards = setup::guards(config);
    let index = setup::open_index(config, &guards).await?;
    let k = limit.unwrap_or(config.retrieval.top_k);
    let results = index.search(query, k, channel).await?;

    if json {
        let hits: Vec<SearchHit> = results.iter().map(SearchHit::from).collect();
        println!("{}", serde_json::to_string_pretty(&hits)?);
        return Ok(());
    }

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }

    for r in &results {
        let meta = &r.chunk.metadata;
        let marker = if r.is_priority { " [priority]" } else { "" };
        println!(
            "{}. [{:.3} -> {:.3}] #{}{} / {}",
            r.rank, r.distance, r.score, meta.channel_name, marker, meta.author
        );
        println!("    time: {}", meta.formatted_time);
        if meta.is_thread {
            println!("    thread: {} replies", meta.reply_count);
        }
        if r.chunk.total_chunks > 1 {
            println!("    chunk: {}/{}", r.chunk.chunk_index + 1, r.chunk.total_chunks);
        }
        println!(
            "    excerpt: \"{}\"",
            truncate_text(&r.chunk.text.replace('\n', " "), 200).trim()
        );
        println!();
    }
    Ok(())
}
