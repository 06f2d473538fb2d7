//! The playbook engine: an injected service instance wiring retrieval,
//! generation, reflection, curation, and refinement together
//!
//! Never an ambient singleton; callers hold an `Arc<AceEngine>` and share it
//! across tasks. Learning-path failures are logged and never block the
//! primary task; retrieval failures degrade to an empty context.

use chrono::{Duration, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AceConfig;
use crate::curator::curate;
use crate::embeddings::{Embedder, HashEmbedder, HttpEmbedder};
use crate::error::{PlaybookError, Result};
use crate::generator::Generator;
use crate::llm::{LanguageModel, OpenAiCompatClient};
use crate::reflector::Reflector;
use crate::refiner::{RefineOutcome, RefineReport, Refiner};
use crate::retriever::Retriever;
use crate::store::BulletStore;
use crate::types::{Bullet, BulletId, Section, Trajectory};

/// What one learning pass changed in the store
#[derive(Debug, Clone, Default)]
pub struct LearnReport {
    pub bullets_added: usize,
    pub counters_updated: usize,
}

/// Observability snapshot
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub active_bullet_count: usize,
    pub avg_quality_score: f64,
    pub pruned_count: usize,
}

pub struct AceEngine {
    config: AceConfig,
    store: BulletStore,
    embedder: Arc<dyn Embedder>,
    retriever: Retriever,
    reflector: Reflector,
    refiner: Refiner,
    generator: Generator,
}

impl AceEngine {
    /// Build an engine from configuration: opens the store, connects the
    /// generation client, and falls back to the offline hash embedder when
    /// no embedding key is configured (semantic retrieval degrades, nothing
    /// breaks).
    pub async fn new(config: AceConfig) -> Result<Self> {
        let store = BulletStore::open(
            &config.store.database_path,
            config.store.scan_page_size,
        )
        .await?;

        let embedder: Arc<dyn Embedder> = match HttpEmbedder::new(config.embedding.clone()) {
            Ok(embedder) => Arc::new(embedder),
            Err(e) => {
                warn!("Embedding client unavailable ({e}); using hash embedder");
                Arc::new(HashEmbedder::new(config.embedding.embedding_dim))
            }
        };

        let model: Arc<dyn LanguageModel> = Arc::new(OpenAiCompatClient::new(config.llm.clone())?);

        Ok(Self::with_parts(config, store, embedder, model))
    }

    /// Assemble an engine from injected parts. This is the seam tests and
    /// embedding hosts use.
    pub fn with_parts(
        config: AceConfig,
        store: BulletStore,
        embedder: Arc<dyn Embedder>,
        model: Arc<dyn LanguageModel>,
    ) -> Self {
        let retriever = Retriever::new(store.clone(), config.retriever.clone());
        let reflector = Reflector::new(model.clone(), config.reflector.clone());
        let refiner = Refiner::new(
            store.clone(),
            config.refiner.clone(),
            config.retriever.recency_half_life_secs,
            config.store.pruned_retention_secs,
        );
        let generator = Generator::new(model, config.reflector.max_tokens);
        Self {
            config,
            store,
            embedder,
            retriever,
            reflector,
            refiner,
            generator,
        }
    }

    /// Bounded context for a query. Failures degrade: an embedding error
    /// retrieves on quality and recency alone, a store error returns an
    /// empty context. The primary task is never blocked on this path.
    pub async fn retrieve_context(&self, query: &str, k: usize) -> Vec<Bullet> {
        let query_embedding = match self.embedder.embed(query).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!("Query embedding failed, retrieving without similarity: {e}");
                Vec::new()
            }
        };

        match self.retriever.retrieve(&query_embedding, k, None).await {
            Ok(bullets) => bullets,
            Err(e) => {
                warn!("Retrieval failed, continuing with empty context: {e}");
                Vec::new()
            }
        }
    }

    /// Retrieve context, run the task, and return its trajectory
    pub async fn execute_task(&self, task: &str, k: usize) -> Trajectory {
        let context = self.retrieve_context(task, k).await;
        self.generator.execute(task, &context).await
    }

    /// Full learning pipeline: reflect, curate, embed the additions, apply.
    /// Sections pushed over their ceiling trigger a background refinement.
    pub async fn learn_from_trajectory(&self, trajectory: &Trajectory) -> Result<LearnReport> {
        let reflection = self.reflector.reflect(trajectory).await;
        if reflection.is_empty() {
            return Ok(LearnReport::default());
        }

        // Point lookups for the curator's duplicate check; the hot path
        // stays O(reflection size)
        let candidate_ids: Vec<BulletId> = reflection
            .insights
            .iter()
            .map(|i| {
                let normalized = i.normalized();
                Bullet::derive_id(normalized.section, &normalized.content)
            })
            .collect();
        let known_active = self.store.filter_active(&candidate_ids).await?;

        let mut delta = curate(&reflection, &known_active, Utc::now());

        // Embeddings are attached outside the pure curation step; a failure
        // leaves the bullet unembedded rather than losing the insight
        for bullet in &mut delta.additions {
            match self.embedder.embed(&bullet.content).await {
                Ok(embedding) => bullet.embedding = Some(embedding),
                Err(e) => warn!("Embedding failed for new bullet {}: {e}", bullet.id),
            }
        }

        let applied = self.store.apply_delta(&delta, Utc::now()).await?;
        let report = LearnReport {
            bullets_added: applied.additions_applied,
            counters_updated: applied.counters_applied,
        };
        debug!(
            "Learned from task {}: +{} bullets, {} counter updates",
            trajectory.task_id, report.bullets_added, report.counters_updated
        );

        let mut sections: Vec<Section> = delta.additions.iter().map(|b| b.section).collect();
        sections.sort();
        sections.dedup();
        for section in sections {
            if self.refiner.over_ceiling(section).await.unwrap_or(false) {
                let refiner = self.refiner.clone();
                tokio::spawn(async move {
                    if let Err(e) = refiner.run_section(section).await {
                        warn!("Ceiling-triggered refinement of {section} failed: {e}");
                    }
                });
            }
        }

        Ok(report)
    }

    /// Fire-and-forget learning; the caller does not block on the result.
    /// The outcome is logged, failures included.
    pub fn learn_in_background(self: &Arc<Self>, trajectory: Trajectory) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            match engine.learn_from_trajectory(&trajectory).await {
                Ok(report) => debug!(
                    "Background learning done: +{} bullets, {} counters",
                    report.bullets_added, report.counters_updated
                ),
                Err(e) => warn!("Background learning failed: {e}"),
            }
        });
    }

    /// Direct insight insertion (operator path). A byte-identical duplicate
    /// is a no-op success returning the existing id.
    pub async fn add_insight(&self, section: Section, content: &str) -> Result<BulletId> {
        let content = content.trim();
        if content.is_empty() {
            return Err(PlaybookError::InvalidBullet("empty content".to_string()));
        }

        let mut bullet = Bullet::new(section, content, Utc::now());
        if let Ok(embedding) = self.embedder.embed(content).await {
            bullet.embedding = Some(embedding);
        }

        match self.store.add(&bullet).await {
            Ok(id) => Ok(id),
            Err(PlaybookError::DuplicateContent { existing_id }) => {
                debug!("Insight already present as {existing_id}");
                Ok(existing_id)
            }
            Err(e) => Err(e),
        }
    }

    /// Observability snapshot
    pub async fn stats(&self) -> Result<EngineStats> {
        let stats = self
            .store
            .stats(Utc::now(), self.config.retriever.recency_half_life_secs)
            .await?;
        Ok(EngineStats {
            active_bullet_count: stats.active_count,
            avg_quality_score: stats.avg_quality_score,
            pruned_count: stats.pruned_count,
        })
    }

    /// Manual refinement entry point
    pub async fn refine(&self, section: Option<Section>) -> Result<RefineReport> {
        match section {
            Some(section) => match self.refiner.run_section(section).await? {
                RefineOutcome::Completed(report) => Ok(report),
                RefineOutcome::SkippedBusy => Ok(RefineReport::default()),
            },
            None => self.refiner.run_all().await,
        }
    }

    /// Physically remove pruned bullets past the retention window
    pub async fn compact(&self) -> Result<usize> {
        let cutoff = Utc::now() - Duration::seconds(self.config.store.pruned_retention_secs as i64);
        self.store.compact(cutoff).await
    }

    pub fn store(&self) -> &BulletStore {
        &self.store
    }

    pub fn config(&self) -> &AceConfig {
        &self.config
    }
}

/// Spawn the periodic refinement loop. Runs until the handle is aborted;
/// each tick refines every section and compacts expired pruned rows.
pub fn start_refiner(engine: Arc<AceEngine>) -> JoinHandle<()> {
    let interval_secs = engine.config.refiner.interval_secs.max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(interval_secs));
        // The first tick fires immediately; skip straight to the cadence
        interval.tick().await;
        loop {
            interval.tick().await;
            match engine.refiner.run_all().await {
                Ok(report) => {
                    if report.merged + report.pruned + report.evicted + report.compacted > 0 {
                        info!(
                            "Refinement pass: merged {}, pruned {}, evicted {}, compacted {}",
                            report.merged, report.pruned, report.evicted, report.compacted
                        );
                    }
                }
                Err(e) => warn!("Scheduled refinement failed: {e}"),
            }
        }
    })
}
