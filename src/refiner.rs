//! Refiner: asynchronous compaction of the bullet store
//!
//! Dedup, prune, evict. Scores against a read-only snapshot, then applies
//! every decision through the same atomic delta path the curator uses, with
//! version guards on each touched bullet. No store lock is held while
//! scoring; a guard conflict re-scores once, then gives up until next run.

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::RefinerConfig;
use crate::embeddings::cosine_similarity;
use crate::error::{PlaybookError, Result};
use crate::store::BulletStore;
use crate::types::{Bullet, BulletId, CounterUpdate, Delta, Section, VersionGuard};

/// What one refinement run did
#[derive(Debug, Clone, Default)]
pub struct RefineReport {
    pub merged: usize,
    pub pruned: usize,
    pub evicted: usize,
    pub compacted: usize,
}

/// Result of asking for a refinement run
#[derive(Debug)]
pub enum RefineOutcome {
    Completed(RefineReport),
    /// Another run for the same section is in flight
    SkippedBusy,
}

/// Clones share the per-section locks, so single-flight holds across them
#[derive(Clone)]
pub struct Refiner {
    store: BulletStore,
    config: RefinerConfig,
    /// Half-life feeding quality scores, shared with the retriever so both
    /// rank bullets the same way
    quality_half_life_secs: u64,
    /// Audit window for soft-deleted bullets
    pruned_retention_secs: u64,
    section_locks: HashMap<Section, Arc<tokio::sync::Mutex<()>>>,
}

impl Refiner {
    pub fn new(
        store: BulletStore,
        config: RefinerConfig,
        quality_half_life_secs: u64,
        pruned_retention_secs: u64,
    ) -> Self {
        let section_locks = Section::ALL
            .iter()
            .map(|s| (*s, Arc::new(tokio::sync::Mutex::new(()))))
            .collect();
        Self {
            store,
            config,
            quality_half_life_secs,
            pruned_retention_secs,
            section_locks,
        }
    }

    /// Whether a section has outgrown its ceiling
    pub async fn over_ceiling(&self, section: Section) -> Result<bool> {
        Ok(self.store.count_active(Some(section)).await? > self.config.section_ceiling)
    }

    /// Refine every section, then compact expired pruned rows
    pub async fn run_all(&self) -> Result<RefineReport> {
        let mut total = RefineReport::default();
        for section in Section::ALL {
            if let RefineOutcome::Completed(report) = self.run_section(section).await? {
                total.merged += report.merged;
                total.pruned += report.pruned;
                total.evicted += report.evicted;
            }
        }

        let cutoff = Utc::now() - Duration::seconds(self.pruned_retention_secs as i64);
        total.compacted = self.store.compact(cutoff).await?;
        if total.compacted > 0 {
            info!("Compacted {} expired pruned bullets", total.compacted);
        }
        Ok(total)
    }

    /// Refine one section. Single-flight: a run already in progress for this
    /// section makes this call a no-op.
    pub async fn run_section(&self, section: Section) -> Result<RefineOutcome> {
        let lock = match self.section_locks.get(&section) {
            Some(lock) => lock.clone(),
            None => return Ok(RefineOutcome::SkippedBusy),
        };
        let _guard = match lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!("Refinement of {section} already in flight, skipping");
                return Ok(RefineOutcome::SkippedBusy);
            }
        };

        // Score against a snapshot, apply guarded; one retry on conflict
        for attempt in 0..2 {
            let snapshot = self.store.snapshot_section(section).await?;
            let now = Utc::now();
            let (delta, report) = self.plan_section(section, &snapshot, now);

            if delta.is_empty() {
                return Ok(RefineOutcome::Completed(report));
            }

            match self.store.apply_delta(&delta, now).await {
                Ok(applied) => {
                    info!(
                        "Refined {section}: merged {}, pruned {}, evicted {} ({} ops dropped)",
                        report.merged, report.pruned, report.evicted, applied.dropped
                    );
                    return Ok(RefineOutcome::Completed(report));
                }
                Err(PlaybookError::DeltaConflict(reason)) if attempt == 0 => {
                    debug!("Refinement conflict on {section}, re-scoring: {reason}");
                }
                Err(PlaybookError::DeltaConflict(reason)) => {
                    warn!("Refinement of {section} dropped after repeated conflict: {reason}");
                    return Ok(RefineOutcome::Completed(RefineReport::default()));
                }
                Err(e) => return Err(e),
            }
        }

        Ok(RefineOutcome::Completed(RefineReport::default()))
    }

    /// Pure planning over a snapshot: pick merges, prunes, and evictions,
    /// and package them as one guarded delta.
    fn plan_section(
        &self,
        section: Section,
        snapshot: &[Bullet],
        now: DateTime<Utc>,
    ) -> (Delta, RefineReport) {
        let mut report = RefineReport::default();

        // --- Dedup ---
        let pairs = self.candidate_pairs(snapshot);
        let mut similar: Vec<(usize, usize, f32)> = Vec::new();
        for (i, j) in pairs {
            let (a, b) = (&snapshot[i], &snapshot[j]);
            if let (Some(ea), Some(eb)) = (&a.embedding, &b.embedding) {
                let sim = cosine_similarity(ea, eb);
                if sim >= self.config.similarity_threshold {
                    similar.push((i, j, sim));
                }
            }
        }
        // Most-similar first; index order breaks ties so planning is
        // deterministic for a given snapshot
        similar.sort_by(|x, y| {
            y.2.partial_cmp(&x.2)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(x.0.cmp(&y.0))
                .then(x.1.cmp(&y.1))
        });

        let mut touched: HashSet<usize> = HashSet::new();
        let mut losers: HashSet<BulletId> = HashSet::new();
        let mut merges: Vec<CounterUpdate> = Vec::new();
        for (i, j, _) in similar {
            if touched.contains(&i) || touched.contains(&j) {
                continue;
            }
            let (survivor, loser) = self.pick_survivor(&snapshot[i], &snapshot[j], now);
            touched.insert(i);
            touched.insert(j);
            losers.insert(loser.id.clone());
            merges.push(CounterUpdate {
                bullet_id: survivor.id.clone(),
                helpful_delta: loser.helpful_count,
                harmful_delta: loser.harmful_count,
            });
            report.merged += 1;
        }

        // --- Prune ---
        let grace = Duration::seconds(self.config.grace_period_secs as i64);
        let mut pruned: Vec<BulletId> = Vec::new();
        for bullet in snapshot {
            if losers.contains(&bullet.id) {
                continue;
            }
            let observed_enough = bullet.observations() >= self.config.min_observations;
            let out_of_grace = now - bullet.created_at >= grace;
            if bullet.harmful_count > bullet.helpful_count && observed_enough && out_of_grace {
                pruned.push(bullet.id.clone());
                report.pruned += 1;
            }
        }
        let pruned_set: HashSet<&BulletId> = pruned.iter().collect();

        // --- Evict ---
        let mut remaining: Vec<&Bullet> = snapshot
            .iter()
            .filter(|b| !losers.contains(&b.id) && !pruned_set.contains(&b.id))
            .collect();
        let mut evicted: Vec<BulletId> = Vec::new();
        if remaining.len() > self.config.section_ceiling {
            remaining.sort_by(|a, b| {
                let qa = a.quality_score(now, self.quality_half_life_secs);
                let qb = b.quality_score(now, self.quality_half_life_secs);
                qa.partial_cmp(&qb)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.helpful_count.cmp(&b.helpful_count))
                    .then(a.id.cmp(&b.id))
            });
            let excess = remaining.len() - self.config.section_ceiling;
            for bullet in remaining.iter().take(excess) {
                evicted.push(bullet.id.clone());
                report.evicted += 1;
            }
        }

        // --- Package ---
        let mut removals: Vec<BulletId> = losers.into_iter().collect();
        removals.sort();
        removals.extend(pruned);
        removals.extend(evicted);

        let mut guard_ids: HashSet<BulletId> = removals.iter().cloned().collect();
        guard_ids.extend(merges.iter().map(|m| m.bullet_id.clone()));
        let by_id: HashMap<&BulletId, &Bullet> = snapshot.iter().map(|b| (&b.id, b)).collect();
        let mut guards: Vec<VersionGuard> = guard_ids
            .into_iter()
            .filter_map(|id| {
                by_id.get(&id).map(|b| VersionGuard {
                    bullet_id: id.clone(),
                    version: b.version,
                })
            })
            .collect();
        guards.sort_by(|a, b| a.bullet_id.cmp(&b.bullet_id));

        let salt = format!("refine-{}-{}", section.as_str(), now.timestamp_millis());
        let delta = Delta::new(&salt, Vec::new(), merges, removals, guards);
        (delta, report)
    }

    /// Higher quality score survives; ties go to more helpful, then lower id
    fn pick_survivor<'a>(
        &self,
        a: &'a Bullet,
        b: &'a Bullet,
        now: DateTime<Utc>,
    ) -> (&'a Bullet, &'a Bullet) {
        let qa = a.quality_score(now, self.quality_half_life_secs);
        let qb = b.quality_score(now, self.quality_half_life_secs);
        let a_wins = match qa.partial_cmp(&qb) {
            Some(std::cmp::Ordering::Greater) => true,
            Some(std::cmp::Ordering::Less) => false,
            _ => (a.helpful_count, &b.id) > (b.helpful_count, &a.id),
        };
        if a_wins {
            (a, b)
        } else {
            (b, a)
        }
    }

    /// Candidate index pairs for similarity comparison.
    ///
    /// Small sections get the full O(n^2) pairing, fine up to
    /// `brute_force_limit` and NOT scalable beyond it. Larger sections go
    /// through random-hyperplane bucketing: only bullets whose embeddings
    /// land in the same bucket are compared, trading a little recall for a
    /// bound on comparisons. Planes come from a seeded generator so the
    /// bucketing is reproducible.
    fn candidate_pairs(&self, snapshot: &[Bullet]) -> Vec<(usize, usize)> {
        let n = snapshot.len();
        if n <= self.config.brute_force_limit {
            let mut pairs = Vec::with_capacity(n.saturating_mul(n.saturating_sub(1)) / 2);
            for i in 0..n {
                for j in (i + 1)..n {
                    pairs.push((i, j));
                }
            }
            return pairs;
        }

        let dim = snapshot
            .iter()
            .find_map(|b| b.embedding.as_ref().map(Vec::len))
            .unwrap_or(0);
        if dim == 0 {
            return Vec::new();
        }

        let planes = hyperplanes(dim, self.config.lsh_planes, self.config.lsh_seed);
        let mut buckets: HashMap<u64, Vec<usize>> = HashMap::new();
        for (i, bullet) in snapshot.iter().enumerate() {
            if let Some(embedding) = &bullet.embedding {
                if embedding.len() == dim {
                    buckets.entry(signature(embedding, &planes)).or_default().push(i);
                }
            }
        }

        let mut pairs = Vec::new();
        for members in buckets.values() {
            for (a, &i) in members.iter().enumerate() {
                for &j in &members[a + 1..] {
                    pairs.push((i, j));
                }
            }
        }
        pairs
    }
}

/// Seeded random hyperplanes for the bucketing signature
fn hyperplanes(dim: usize, count: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| (0..dim).map(|_| rng.random::<f32>() * 2.0 - 1.0).collect())
        .collect()
}

/// Bit per plane: which side of each hyperplane the embedding falls on
fn signature(embedding: &[f32], planes: &[Vec<f32>]) -> u64 {
    let mut sig = 0u64;
    for (bit, plane) in planes.iter().enumerate().take(64) {
        let dot: f32 = embedding.iter().zip(plane.iter()).map(|(x, y)| x * y).sum();
        if dot >= 0.0 {
            sig |= 1 << bit;
        }
    }
    sig
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn refiner_config() -> RefinerConfig {
        RefinerConfig {
            similarity_threshold: 0.92,
            min_observations: 5,
            grace_period_secs: 24 * 3600,
            section_ceiling: 100,
            ..Default::default()
        }
    }

    async fn store() -> (tempfile::TempDir, BulletStore) {
        let dir = tempdir().unwrap();
        let store = BulletStore::open(dir.path().join("refine.db"), 64)
            .await
            .unwrap();
        (dir, store)
    }

    fn bullet(
        content: &str,
        embedding: Vec<f32>,
        helpful: u32,
        harmful: u32,
        age_hours: i64,
    ) -> Bullet {
        let now = Utc::now();
        let mut b = Bullet::new(Section::Strategy, content, now - Duration::hours(age_hours));
        b.embedding = Some(embedding);
        b.helpful_count = helpful;
        b.harmful_count = harmful;
        b.last_used_at = now;
        b
    }

    #[tokio::test]
    async fn near_duplicates_merge_into_survivor_with_summed_counters() {
        let (_dir, store) = store().await;
        // cos = 0.95 by construction
        let b1 = bullet("cache the index", vec![1.0, 0.0], 2, 0, 0);
        let b2 = bullet("keep the index cached", vec![0.95, 0.312_25], 5, 0, 0);
        store.add(&b1).await.unwrap();
        store.add(&b2).await.unwrap();

        let refiner = Refiner::new(store.clone(), refiner_config(), 3600, 7 * 24 * 3600);
        let outcome = refiner.run_section(Section::Strategy).await.unwrap();
        match outcome {
            RefineOutcome::Completed(report) => assert_eq!(report.merged, 1),
            RefineOutcome::SkippedBusy => panic!("unexpected skip"),
        }

        let active = store.snapshot_section(Section::Strategy).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].helpful_count, 7);
        assert_eq!(active[0].id, b2.id, "higher-quality bullet survives");
    }

    #[tokio::test]
    async fn dissimilar_bullets_are_left_alone() {
        let (_dir, store) = store().await;
        store
            .add(&bullet("one thing", vec![1.0, 0.0], 1, 0, 0))
            .await
            .unwrap();
        store
            .add(&bullet("another thing", vec![0.0, 1.0], 1, 0, 0))
            .await
            .unwrap();

        let refiner = Refiner::new(store.clone(), refiner_config(), 3600, 7 * 24 * 3600);
        refiner.run_section(Section::Strategy).await.unwrap();

        assert_eq!(store.count_active(Some(Section::Strategy)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn harmful_bullet_pruned_only_after_fair_window() {
        let (_dir, store) = store().await;
        // Net harmful, enough observations, old enough
        let condemned = bullet("bad advice", vec![1.0, 0.0], 1, 6, 48);
        // Net harmful but too few observations
        let unproven = bullet("too soon to tell", vec![0.0, 1.0], 1, 2, 48);
        // Net harmful, enough observations, still in grace
        let fresh = bullet("brand new", vec![0.5, 0.5], 1, 6, 1);
        store.add(&condemned).await.unwrap();
        store.add(&unproven).await.unwrap();
        store.add(&fresh).await.unwrap();

        let refiner = Refiner::new(store.clone(), refiner_config(), 3600, 7 * 24 * 3600);
        refiner.run_section(Section::Strategy).await.unwrap();

        let condemned = store.get(&condemned.id).await.unwrap().unwrap();
        assert_eq!(condemned.status, crate::types::BulletStatus::Pruned);
        let unproven = store.get(&unproven.id).await.unwrap().unwrap();
        assert!(unproven.is_active());
        let fresh = store.get(&fresh.id).await.unwrap().unwrap();
        assert!(fresh.is_active());
    }

    #[tokio::test]
    async fn eviction_trims_lowest_quality_to_ceiling() {
        let (_dir, store) = store().await;
        for i in 0..6 {
            // Orthogonal-ish embeddings so nothing merges; helpful count
            // rises with i, so low-i bullets are the eviction candidates
            let mut emb = vec![0.0; 8];
            emb[i] = 1.0;
            store
                .add(&bullet(&format!("insight {i}"), emb, i as u32, 0, 0))
                .await
                .unwrap();
        }

        let config = RefinerConfig {
            section_ceiling: 4,
            ..refiner_config()
        };
        let refiner = Refiner::new(store.clone(), config, 3600, 7 * 24 * 3600);
        let outcome = refiner.run_section(Section::Strategy).await.unwrap();
        match outcome {
            RefineOutcome::Completed(report) => assert_eq!(report.evicted, 2),
            RefineOutcome::SkippedBusy => panic!("unexpected skip"),
        }

        let active = store.snapshot_section(Section::Strategy).await.unwrap();
        assert_eq!(active.len(), 4);
        assert!(active.iter().all(|b| b.helpful_count >= 2));
    }

    #[tokio::test]
    async fn empty_section_refines_to_nothing() {
        let (_dir, store) = store().await;
        let refiner = Refiner::new(store, refiner_config(), 3600, 7 * 24 * 3600);
        let outcome = refiner.run_section(Section::ApiUsage).await.unwrap();
        assert!(matches!(
            outcome,
            RefineOutcome::Completed(RefineReport {
                merged: 0,
                pruned: 0,
                evicted: 0,
                ..
            })
        ));
    }

    #[test]
    fn hyperplane_bucketing_is_deterministic() {
        let planes1 = hyperplanes(16, 8, 42);
        let planes2 = hyperplanes(16, 8, 42);
        assert_eq!(planes1, planes2);

        let emb: Vec<f32> = (0..16).map(|i| (i as f32).sin()).collect();
        assert_eq!(signature(&emb, &planes1), signature(&emb, &planes2));
    }

    #[test]
    fn identical_embeddings_share_a_bucket() {
        let planes = hyperplanes(8, 12, 7);
        let emb = vec![0.3; 8];
        assert_eq!(signature(&emb, &planes), signature(&emb.clone(), &planes));
    }
}
