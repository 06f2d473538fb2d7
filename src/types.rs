//! Shared types used across modules
//!
//! The playbook data model: bullets, trajectories, reflections, and the
//! delta that carries one cycle's mutations into the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Stable bullet identifier, derived from section + content.
pub type BulletId = String;

/// Smoothing term for the helpful/harmful ratio so fresh bullets with zero
/// observations score 0 instead of dividing by zero.
pub const QUALITY_EPSILON: f64 = 1e-6;

/// Playbook section a bullet belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Section {
    Strategy,
    ApiUsage,
    Mistake,
    Pattern,
    Other,
}

impl Section {
    /// All sections, in display order
    pub const ALL: [Section; 5] = [
        Section::Strategy,
        Section::ApiUsage,
        Section::Mistake,
        Section::Pattern,
        Section::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Section::Strategy => "strategy",
            Section::ApiUsage => "api_usage",
            Section::Mistake => "mistake",
            Section::Pattern => "pattern",
            Section::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "strategy" => Some(Section::Strategy),
            "api_usage" | "api-usage" => Some(Section::ApiUsage),
            "mistake" => Some(Section::Mistake),
            "pattern" => Some(Section::Pattern),
            "other" => Some(Section::Other),
            _ => None,
        }
    }

    /// Heading used when rendering the playbook into a prompt
    pub fn heading(&self) -> &'static str {
        match self {
            Section::Strategy => "Strategies",
            Section::ApiUsage => "API usage",
            Section::Mistake => "Known mistakes",
            Section::Pattern => "Patterns",
            Section::Other => "Other notes",
        }
    }
}

impl std::fmt::Display for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle status of a bullet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulletStatus {
    Active,
    Pruned,
}

impl BulletStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulletStatus::Active => "active",
            BulletStatus::Pruned => "pruned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(BulletStatus::Active),
            "pruned" => Some(BulletStatus::Pruned),
            _ => None,
        }
    }
}

impl std::fmt::Display for BulletStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An atomic, reusable insight record in the playbook
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bullet {
    /// Content-derived id (see [`Bullet::derive_id`])
    pub id: BulletId,
    /// Section this insight belongs to
    pub section: Section,
    /// One atomic insight, non-empty
    pub content: String,
    /// Embedding of the content, attached after creation
    pub embedding: Option<Vec<f32>>,
    /// Times this bullet was judged helpful after use
    pub helpful_count: u32,
    /// Times this bullet was judged harmful after use
    pub harmful_count: u32,
    /// Incremented on every store mutation; used for optimistic guards
    pub version: u64,
    pub status: BulletStatus,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    /// Set when the bullet is soft-deleted by the refiner
    pub pruned_at: Option<DateTime<Utc>>,
}

impl Bullet {
    /// Create a fresh active bullet. `now` is injected so callers building
    /// deltas stay deterministic.
    pub fn new(section: Section, content: impl Into<String>, now: DateTime<Utc>) -> Self {
        let content = content.into();
        let id = Self::derive_id(section, &content);
        Self {
            id,
            section,
            content,
            embedding: None,
            helpful_count: 0,
            harmful_count: 0,
            version: 1,
            status: BulletStatus::Active,
            created_at: now,
            last_used_at: now,
            pruned_at: None,
        }
    }

    /// Stable content-derived id: SHA-256 over section + content, truncated
    /// to 128 bits of hex. Identical insights in different sections are
    /// distinct records.
    pub fn derive_id(section: Section, content: &str) -> BulletId {
        let mut hasher = Sha256::new();
        hasher.update(section.as_str().as_bytes());
        hasher.update(b"\n");
        hasher.update(content.as_bytes());
        hex::encode(&hasher.finalize()[..16])
    }

    /// Total helpful + harmful observations
    pub fn observations(&self) -> u32 {
        self.helpful_count + self.harmful_count
    }

    /// Derived ranking signal: helpful ratio damped by recency of last use.
    /// Computed on demand, never stored.
    pub fn quality_score(&self, now: DateTime<Utc>, recency_half_life_secs: u64) -> f64 {
        let helpful = f64::from(self.helpful_count);
        let harmful = f64::from(self.harmful_count);
        let ratio = helpful / (helpful + harmful + QUALITY_EPSILON);
        ratio * recency_decay(self.last_used_at, now, recency_half_life_secs)
    }

    pub fn is_active(&self) -> bool {
        self.status == BulletStatus::Active
    }
}

/// Exponential decay of a timestamp's age: 1.0 at `now`, halving every
/// `half_life_secs`. A future timestamp decays as if current.
pub fn recency_decay(at: DateTime<Utc>, now: DateTime<Utc>, half_life_secs: u64) -> f64 {
    if half_life_secs == 0 {
        return 1.0;
    }
    let age_secs = (now - at).num_seconds().max(0) as f64;
    0.5_f64.powf(age_secs / half_life_secs as f64)
}

/// One recorded step of a task execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrajectoryStep {
    pub reasoning: String,
    pub action: String,
    pub tool: Option<String>,
    pub result: String,
    /// Bullets that were in context when this step ran
    pub referenced_bullet_ids: Vec<BulletId>,
}

/// The recorded reasoning/action/result sequence of one task execution.
/// Produced by the generator, consumed once by the reflector, then discarded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trajectory {
    pub task_id: String,
    pub task: String,
    pub steps: Vec<TrajectoryStep>,
    pub started_at: DateTime<Utc>,
}

impl Trajectory {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Union of bullet ids referenced anywhere in the trajectory, in first-seen order
    pub fn referenced_ids(&self) -> Vec<BulletId> {
        let mut seen = std::collections::HashSet::new();
        let mut ids = Vec::new();
        for step in &self.steps {
            for id in &step.referenced_bullet_ids {
                if seen.insert(id.clone()) {
                    ids.push(id.clone());
                }
            }
        }
        ids
    }
}

/// An insight proposed by the reflector, not yet admitted to the store
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CandidateBullet {
    pub section: Section,
    pub content: String,
}

impl CandidateBullet {
    /// Collapse whitespace and trim so near-identical wordings hash alike
    pub fn normalized(&self) -> Self {
        Self {
            section: self.section,
            content: self.content.split_whitespace().collect::<Vec<_>>().join(" "),
        }
    }
}

/// Outcome of using a bullet, as judged by the reflector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictOutcome {
    Helpful,
    Harmful,
}

/// The reflector's judgement of one referenced bullet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub bullet_id: BulletId,
    pub outcome: VerdictOutcome,
}

/// Output of one reflection pass over a trajectory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reflection {
    /// Task the trajectory came from; salts the derived delta id so
    /// identical reflections from distinct tasks both apply.
    pub task_id: String,
    pub insights: Vec<CandidateBullet>,
    pub verdicts: Vec<Verdict>,
}

impl Reflection {
    pub fn empty(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            insights: Vec::new(),
            verdicts: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.insights.is_empty() && self.verdicts.is_empty()
    }
}

/// Relative counter adjustment for one bullet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterUpdate {
    pub bullet_id: BulletId,
    pub helpful_delta: u32,
    pub harmful_delta: u32,
}

/// Optimistic concurrency guard: the delta only applies if the bullet still
/// has this version at apply time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionGuard {
    pub bullet_id: BulletId,
    pub version: u64,
}

/// A small, explicit set of store mutations from one reflection or
/// refinement cycle, applied atomically and exactly once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    /// Deterministic hash of the operations, so a retried delta carries the
    /// same id and replays as a no-op
    pub delta_id: String,
    pub additions: Vec<Bullet>,
    pub counter_updates: Vec<CounterUpdate>,
    pub removal_candidates: Vec<BulletId>,
    /// Empty for curation deltas; refinement deltas guard every bullet they
    /// touch and are rejected whole on any mismatch
    pub guards: Vec<VersionGuard>,
}

impl Delta {
    /// Build a delta, deriving its id from `salt` plus the operation list
    pub fn new(
        salt: &str,
        additions: Vec<Bullet>,
        counter_updates: Vec<CounterUpdate>,
        removal_candidates: Vec<BulletId>,
        guards: Vec<VersionGuard>,
    ) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(salt.as_bytes());
        for b in &additions {
            hasher.update(b"+");
            hasher.update(b.id.as_bytes());
        }
        for u in &counter_updates {
            hasher.update(b"~");
            hasher.update(u.bullet_id.as_bytes());
            hasher.update(u.helpful_delta.to_le_bytes());
            hasher.update(u.harmful_delta.to_le_bytes());
        }
        for r in &removal_candidates {
            hasher.update(b"-");
            hasher.update(r.as_bytes());
        }
        for g in &guards {
            hasher.update(b"=");
            hasher.update(g.bullet_id.as_bytes());
            hasher.update(g.version.to_le_bytes());
        }
        let delta_id = hex::encode(&hasher.finalize()[..16]);
        Self {
            delta_id,
            additions,
            counter_updates,
            removal_candidates,
            guards,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.additions.is_empty()
            && self.counter_updates.is_empty()
            && self.removal_candidates.is_empty()
    }

    pub fn op_count(&self) -> usize {
        self.additions.len() + self.counter_updates.len() + self.removal_candidates.len()
    }
}

/// Read-only projection of the active bullets, grouped by section.
/// Never separately persisted.
#[derive(Debug, Clone, Default)]
pub struct Playbook {
    pub sections: BTreeMap<Section, Vec<Bullet>>,
}

impl Playbook {
    pub fn from_bullets(bullets: impl IntoIterator<Item = Bullet>) -> Self {
        let mut sections: BTreeMap<Section, Vec<Bullet>> = BTreeMap::new();
        for bullet in bullets {
            sections.entry(bullet.section).or_default().push(bullet);
        }
        Self { sections }
    }

    pub fn total(&self) -> usize {
        self.sections.values().map(Vec::len).sum()
    }

    /// Render the playbook as a sectioned prompt preamble. Each bullet is
    /// prefixed with its id so the model can report verdicts against it.
    pub fn render(&self) -> String {
        if self.sections.is_empty() {
            return String::new();
        }
        let mut out = String::from("Playbook of insights from past tasks:\n");
        for (section, bullets) in &self.sections {
            if bullets.is_empty() {
                continue;
            }
            out.push_str(&format!("\n## {}\n", section.heading()));
            for bullet in bullets {
                out.push_str(&format!("- [{}] {}\n", bullet.id, bullet.content));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn derived_id_is_stable_and_section_scoped() {
        let a = Bullet::derive_id(Section::Strategy, "prefer small diffs");
        let b = Bullet::derive_id(Section::Strategy, "prefer small diffs");
        let c = Bullet::derive_id(Section::Mistake, "prefer small diffs");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn quality_score_ratio_and_decay() {
        let now = Utc::now();
        let mut bullet = Bullet::new(Section::Strategy, "x", now);
        bullet.helpful_count = 3;
        bullet.harmful_count = 1;
        let fresh = bullet.quality_score(now, 3600);
        assert!((fresh - 0.75).abs() < 1e-3);

        bullet.last_used_at = now - Duration::hours(1);
        let stale = bullet.quality_score(now, 3600);
        assert!((stale - 0.375).abs() < 1e-3);
    }

    #[test]
    fn quality_score_zero_observations() {
        let now = Utc::now();
        let bullet = Bullet::new(Section::Other, "unseen", now);
        assert_eq!(bullet.quality_score(now, 3600), 0.0);
    }

    #[test]
    fn delta_id_deterministic_and_salted() {
        let now = Utc::now();
        let bullet = Bullet::new(Section::Pattern, "batch writes", now);
        let d1 = Delta::new("task-1", vec![bullet.clone()], vec![], vec![], vec![]);
        let d2 = Delta::new("task-1", vec![bullet.clone()], vec![], vec![], vec![]);
        let d3 = Delta::new("task-2", vec![bullet], vec![], vec![], vec![]);
        assert_eq!(d1.delta_id, d2.delta_id);
        assert_ne!(d1.delta_id, d3.delta_id);
    }

    #[test]
    fn trajectory_referenced_ids_deduplicated() {
        let now = Utc::now();
        let step = |ids: &[&str]| TrajectoryStep {
            reasoning: String::new(),
            action: "act".to_string(),
            tool: None,
            result: "ok".to_string(),
            referenced_bullet_ids: ids.iter().map(|s| s.to_string()).collect(),
        };
        let trajectory = Trajectory {
            task_id: "t".to_string(),
            task: "demo".to_string(),
            steps: vec![step(&["a", "b"]), step(&["b", "c"])],
            started_at: now,
        };
        assert_eq!(trajectory.referenced_ids(), vec!["a", "b", "c"]);
    }

    #[test]
    fn playbook_render_groups_by_section() {
        let now = Utc::now();
        let playbook = Playbook::from_bullets(vec![
            Bullet::new(Section::Mistake, "off-by-one in paging", now),
            Bullet::new(Section::Strategy, "read before write", now),
        ]);
        let rendered = playbook.render();
        let strategies = rendered.find("Strategies").unwrap();
        let mistakes = rendered.find("Known mistakes").unwrap();
        assert!(strategies < mistakes);
        assert!(rendered.contains("read before write"));
    }
}
