//! Operator CLI: inspect and maintain a playbook store
//!
//! None of these commands need the generation model; they wire the store,
//! retriever, and refiner directly.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

use crate::config::AceConfig;
use crate::embeddings::{Embedder, HashEmbedder, HttpEmbedder};
use crate::refiner::{RefineOutcome, Refiner};
use crate::retriever::Retriever;
use crate::store::BulletStore;
use crate::types::{Bullet, Section};

#[derive(Parser)]
#[command(name = "ace-playbook", version, about = "Self-curating agentic context playbook")]
pub struct Cli {
    /// Path to a config file (defaults to the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the database path
    #[arg(long, global = true, env = "ACE_DB")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Show store statistics
    Stats,
    /// List active bullets
    List {
        /// Restrict to one section (strategy, api_usage, mistake, pattern, other)
        #[arg(long)]
        section: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Add an insight directly
    Add {
        section: String,
        content: String,
    },
    /// Retrieve the top-k bullets for a query
    Search {
        query: String,
        #[arg(long, default_value_t = 5)]
        k: usize,
        #[arg(long)]
        section: Option<String>,
    },
    /// Run a refinement pass (dedup, prune, evict)
    Refine {
        #[arg(long)]
        section: Option<String>,
    },
    /// Physically remove pruned bullets past the retention window
    Compact,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut config = AceConfig::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.store.database_path = db;
    }

    let store = BulletStore::open(&config.store.database_path, config.store.scan_page_size)
        .await
        .with_context(|| {
            format!(
                "Failed to open store at {}",
                config.store.database_path.display()
            )
        })?;

    match cli.command {
        Command::Stats => {
            let stats = store
                .stats(chrono::Utc::now(), config.retriever.recency_half_life_secs)
                .await?;
            println!("Active bullets:  {}", stats.active_count);
            println!("Pruned bullets:  {}", stats.pruned_count);
            println!("Avg quality:     {:.3}", stats.avg_quality_score);
            for section in Section::ALL {
                if let Some(count) = stats.by_section.get(&section) {
                    println!("  {:<10} {}", section.as_str(), count);
                }
            }
        }

        Command::List { section, limit } => {
            let section = parse_section_opt(section.as_deref())?;
            let mut scan = store.scan_active(section);
            let mut shown = 0;
            while shown < limit {
                match scan.next().await? {
                    Some(bullet) => {
                        print_bullet(&bullet);
                        shown += 1;
                    }
                    None => break,
                }
            }
            if shown == 0 {
                println!("(no active bullets)");
            }
        }

        Command::Add { section, content } => {
            let section = parse_section(&section)?;
            let mut bullet = Bullet::new(section, content.trim(), chrono::Utc::now());
            if let Ok(embedding) = embedder(&config).embed(&bullet.content).await {
                bullet.embedding = Some(embedding);
            }
            match store.add(&bullet).await {
                Ok(id) => println!("Added {id}"),
                Err(crate::error::PlaybookError::DuplicateContent { existing_id }) => {
                    println!("Already present as {existing_id}")
                }
                Err(e) => return Err(e.into()),
            }
        }

        Command::Search { query, k, section } => {
            let section = parse_section_opt(section.as_deref())?;
            let query_embedding = match embedder(&config).embed(&query).await {
                Ok(embedding) => embedding,
                Err(e) => {
                    warn!("Embedding failed, searching on quality/recency only: {e}");
                    Vec::new()
                }
            };
            let retriever = Retriever::new(store, config.retriever.clone());
            let results = retriever.retrieve(&query_embedding, k, section).await?;
            if results.is_empty() {
                println!("(no matches)");
            }
            for bullet in results {
                print_bullet(&bullet);
            }
        }

        Command::Refine { section } => {
            let refiner = Refiner::new(
                store,
                config.refiner.clone(),
                config.retriever.recency_half_life_secs,
                config.store.pruned_retention_secs,
            );
            match section {
                Some(section) => {
                    let section = parse_section(&section)?;
                    match refiner.run_section(section).await? {
                        RefineOutcome::Completed(report) => println!(
                            "Refined {}: merged {}, pruned {}, evicted {}",
                            section, report.merged, report.pruned, report.evicted
                        ),
                        RefineOutcome::SkippedBusy => println!("Refinement already running"),
                    }
                }
                None => {
                    let report = refiner.run_all().await?;
                    println!(
                        "Refined all sections: merged {}, pruned {}, evicted {}, compacted {}",
                        report.merged, report.pruned, report.evicted, report.compacted
                    );
                }
            }
        }

        Command::Compact => {
            let cutoff = chrono::Utc::now()
                - chrono::Duration::seconds(config.store.pruned_retention_secs as i64);
            let removed = store.compact(cutoff).await?;
            println!("Compacted {removed} pruned bullets");
        }
    }

    Ok(())
}

fn embedder(config: &AceConfig) -> Arc<dyn Embedder> {
    match HttpEmbedder::new(config.embedding.clone()) {
        Ok(embedder) => Arc::new(embedder),
        Err(_) => Arc::new(HashEmbedder::new(config.embedding.embedding_dim)),
    }
}

fn parse_section(s: &str) -> Result<Section> {
    match Section::parse(s) {
        Some(section) => Ok(section),
        None => bail!(
            "Unknown section '{s}' (expected one of: strategy, api_usage, mistake, pattern, other)"
        ),
    }
}

fn parse_section_opt(s: Option<&str>) -> Result<Option<Section>> {
    s.map(parse_section).transpose()
}

fn print_bullet(bullet: &Bullet) {
    println!(
        "[{}] ({}) +{}/-{} {}",
        bullet.id,
        bullet.section,
        bullet.helpful_count,
        bullet.harmful_count,
        bullet.content
    );
}
