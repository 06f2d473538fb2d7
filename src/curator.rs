//! Curator: reflection output -> delta
//!
//! A pure function of its inputs. No network, no randomness, no clock reads
//! (`now` is an argument), so the same reflection against the same store
//! snapshot always produces the same delta, id included.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use crate::types::{Bullet, BulletId, CounterUpdate, Delta, Reflection, VerdictOutcome};

/// Convert a reflection into a delta against the store.
///
/// `known_active` holds the ids (content hashes) of active bullets the
/// engine looked up for this reflection's candidates. Point lookups only,
/// so curation stays O(reflection size).
///
/// Verdicts become counter updates; insights become adds, or reinforcing
/// counter updates when the content hash already exists. Removals are never
/// produced here; consolidation is the refiner's job.
pub fn curate(
    reflection: &Reflection,
    known_active: &HashSet<BulletId>,
    now: DateTime<Utc>,
) -> Delta {
    // BTreeMap keeps the operation order canonical so the derived delta id
    // is stable across runs
    let mut counters: BTreeMap<BulletId, (u32, u32)> = BTreeMap::new();
    for verdict in &reflection.verdicts {
        let entry = counters.entry(verdict.bullet_id.clone()).or_insert((0, 0));
        match verdict.outcome {
            VerdictOutcome::Helpful => entry.0 += 1,
            VerdictOutcome::Harmful => entry.1 += 1,
        }
    }

    let mut additions: BTreeMap<BulletId, Bullet> = BTreeMap::new();
    for insight in &reflection.insights {
        let insight = insight.normalized();
        if insight.content.is_empty() {
            continue;
        }
        let id = Bullet::derive_id(insight.section, &insight.content);

        if known_active.contains(&id) {
            // Already in the playbook: reinforce instead of duplicating
            let entry = counters.entry(id).or_insert((0, 0));
            entry.0 += 1;
        } else {
            // Repeated within one reflection: a single add suffices
            additions
                .entry(id.clone())
                .or_insert_with(|| Bullet::new(insight.section, insight.content.clone(), now));
        }
    }

    let counter_updates: Vec<CounterUpdate> = counters
        .into_iter()
        .map(|(bullet_id, (helpful_delta, harmful_delta))| CounterUpdate {
            bullet_id,
            helpful_delta,
            harmful_delta,
        })
        .collect();
    let additions: Vec<Bullet> = additions.into_values().collect();

    debug!(
        "Curated delta: {} additions, {} counter updates",
        additions.len(),
        counter_updates.len()
    );

    Delta::new(
        &reflection.task_id,
        additions,
        counter_updates,
        Vec::new(),
        Vec::new(),
    )
}
