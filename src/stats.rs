//! Index statistics and channel listing.
//!
//! `ethos stats` summarizes the persisted index (vector count, dimension,
//! model, build id, on-disk size) and breaks chunks down per channel.
//! `ethos channels` lists the channel names a `--channel` filter can match.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;

use crate::config::Config;
use crate::index::{DOCUMENTS_FILE, VECTORS_FILE};
use crate::setup;

pub async fn run_stats(config: &Config) -> Result<()> {
    let guards = setup::guards(config);
    let index = setup::open_index(config, &guards).await?;
    let stats = index.stats();
    let dir = &config.index.path;

    println!("Ethos Index Stats");
    println!("=================");
    println!();
    println!("  Index:       {}", dir.display());
    println!("  Size:        {}", format_bytes(index_size(dir)));
    println!("  Model:       {}", stats.model);
    println!("  Dimensions:  {}", stats.dims);
    println!("  Vectors:     {}", stats.total_vectors);
    if let Some(build_id) = &stats.build_id {
        println!("  Build:       {}", build_id);
    }
    if let Some(created_at) = stats.created_at {
        println!("  Built at:    {}", created_at.format("%Y-%m-%d %H:%M UTC"));
    }

    let policy = index.priority();
    if policy.is_active() {
        println!(
            "  Priority:    {} (boost {:.2})",
            config.retrieval.priority_channels.join(", "),
            policy.boost()
        );
    }

    let per_channel = channel_counts(index.chunks().map(|c| c.metadata.channel_name.as_str()));
    if !per_channel.is_empty() {
        println!();
        println!("  By channel:");
        println!("  {:<32} {:>8}", "CHANNEL", "CHUNKS");
        println!("  {}", "-".repeat(41));
        for (channel, count) in &per_channel {
            let star = if policy.is_priority(channel) { " *" } else { "" };
            println!("  {:<32} {:>8}", format!("#{}{}", channel, star), count);
        }
    }

    println!();
    Ok(())
}

pub async fn run_channels(config: &Config) -> Result<()> {
    let guards = setup::guards(config);
    let index = setup::open_index(config, &guards).await?;
    let channels = index.channels();
    if channels.is_empty() {
        println!("No channels.");
        return Ok(());
    }
    for channel in channels {
        println!("#{}", channel);
    }
    Ok(())
}

fn channel_counts<'a>(names: impl Iterator<Item = &'a str>) -> BTreeMap<&'a str, usize> {
    let mut counts = BTreeMap::new();
    for name in names {
        *counts.entry(name).or_insert(0) += 1;
    }
    counts
}

fn index_size(dir: &Path) -> u64 {
    [VECTORS_FILE, DOCUMENTS_FILE]
        .iter()
        .filter_map(|f| std::fs::metadata(dir.join(f)).ok())
        .map(|m| m.len())
        .sum()
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
