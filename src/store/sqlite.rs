//! SQLite backend for the bullet store
//!
//! Counter mutations are expressed as relative increments inside short
//! transactions, so concurrent deltas touching the same bullet commute.
//! Idempotency is a `delta_applications` row written in the same transaction
//! as the delta's operations.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{PlaybookError, Result};
use crate::types::{Bullet, BulletId, BulletStatus, Delta, Section};

/// Outcome of applying one delta
#[derive(Debug, Clone, Default)]
pub struct AppliedDelta {
    pub delta_id: String,
    /// Bullets inserted (or collapsed into a reinforcement)
    pub additions_applied: usize,
    /// Counter updates that hit an active bullet
    pub counters_applied: usize,
    /// Bullets marked pruned
    pub removals_applied: usize,
    /// Operations dropped because their target was missing or pruned
    pub dropped: usize,
    /// True when the delta id had already been applied; nothing was changed
    pub replayed: bool,
}

impl AppliedDelta {
    pub fn applied(&self) -> usize {
        self.additions_applied + self.counters_applied + self.removals_applied
    }
}

/// Store-level statistics
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub active_count: usize,
    pub pruned_count: usize,
    pub by_section: HashMap<Section, usize>,
    pub avg_quality_score: f64,
}

/// SQLite-backed bullet repository
pub struct SqliteBulletStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBulletStore {
    /// Open (or create) the store at the given path
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PlaybookError::StoreUnavailable(e.to_string()))?;
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS bullets (
                id TEXT PRIMARY KEY,
                section TEXT NOT NULL,
                content TEXT NOT NULL,
                embedding BLOB,
                helpful_count INTEGER NOT NULL DEFAULT 0,
                harmful_count INTEGER NOT NULL DEFAULT 0,
                version INTEGER NOT NULL DEFAULT 1,
                status TEXT NOT NULL DEFAULT 'active',
                created_at TEXT NOT NULL,
                last_used_at TEXT NOT NULL,
                pruned_at TEXT
            );

            CREATE TABLE IF NOT EXISTS delta_applications (
                delta_id TEXT PRIMARY KEY,
                applied_at TEXT NOT NULL,
                applied_ops INTEGER NOT NULL,
                dropped_ops INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_bullets_section_status ON bullets(section, status);
            CREATE INDEX IF NOT EXISTS idx_bullets_status ON bullets(status);
            CREATE INDEX IF NOT EXISTS idx_bullets_pruned_at ON bullets(pruned_at);
        "#,
        )?;
        Ok(())
    }

    /// Insert a new bullet. Byte-identical content (same derived id) fails
    /// with `DuplicateContent`; near-duplicates are accepted on purpose and
    /// left to the refiner.
    pub async fn insert(&self, bullet: &Bullet) -> Result<BulletId> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM bullets WHERE id = ?1",
                params![bullet.id],
                |row| row.get(0),
            )
            .optional()?;

        if let Some(existing_id) = existing {
            return Err(PlaybookError::DuplicateContent { existing_id });
        }

        insert_bullet_row(&tx, bullet)?;
        tx.commit()?;
        Ok(bullet.id.clone())
    }

    /// Load a bullet by id, regardless of status
    pub async fn get(&self, id: &str) -> Result<Option<Bullet>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {BULLET_COLUMNS} FROM bullets WHERE id = ?1"
        ))?;
        let bullet = stmt
            .query_row(params![id], row_to_bullet)
            .optional()?;
        Ok(bullet)
    }

    /// Keyset-paginated page of active bullets ordered by id
    pub async fn page_active(
        &self,
        section: Option<Section>,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Bullet>> {
        let conn = self.conn.lock().await;
        let after = after_id.unwrap_or("");

        let bullets = match section {
            Some(section) => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {BULLET_COLUMNS} FROM bullets
                     WHERE status = 'active' AND section = ?1 AND id > ?2
                     ORDER BY id LIMIT ?3"
                ))?;
                let rows = stmt
                    .query_map(params![section.as_str(), after, limit as i64], row_to_bullet)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare_cached(&format!(
                    "SELECT {BULLET_COLUMNS} FROM bullets
                     WHERE status = 'active' AND id > ?1
                     ORDER BY id LIMIT ?2"
                ))?;
                let rows = stmt
                    .query_map(params![after, limit as i64], row_to_bullet)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            }
        };

        Ok(bullets)
    }

    /// Count of active bullets, optionally per section
    pub async fn count_active(&self, section: Option<Section>) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = match section {
            Some(section) => conn.query_row(
                "SELECT COUNT(*) FROM bullets WHERE status = 'active' AND section = ?1",
                params![section.as_str()],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT COUNT(*) FROM bullets WHERE status = 'active'",
                [],
                |row| row.get(0),
            )?,
        };
        Ok(count as usize)
    }

    /// Which of the given ids exist as active bullets. Point lookups only,
    /// so the curation path never scans the store.
    pub async fn filter_active(&self, ids: &[BulletId]) -> Result<HashSet<BulletId>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare_cached("SELECT id FROM bullets WHERE id = ?1 AND status = 'active'")?;
        let mut found = HashSet::new();
        for id in ids {
            let hit: Option<String> = stmt.query_row(params![id], |row| row.get(0)).optional()?;
            if let Some(id) = hit {
                found.insert(id);
            }
        }
        Ok(found)
    }

    /// Apply a delta atomically and idempotently.
    ///
    /// Replay of an already-applied delta id is a no-op. Version guards are
    /// checked first; any mismatch rejects the whole delta with
    /// `DeltaConflict` (the transaction rolls back). Unguarded operations
    /// follow the partial-apply policy: an operation whose target is missing
    /// or pruned is dropped with a warning, everything else applies.
    pub async fn apply_delta(&self, delta: &Delta, now: DateTime<Utc>) -> Result<AppliedDelta> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let prior: Option<String> = tx
            .query_row(
                "SELECT delta_id FROM delta_applications WHERE delta_id = ?1",
                params![delta.delta_id],
                |row| row.get(0),
            )
            .optional()?;
        if prior.is_some() {
            // Nothing changed this time; counts report this application only
            return Ok(AppliedDelta {
                delta_id: delta.delta_id.clone(),
                replayed: true,
                ..Default::default()
            });
        }

        for guard in &delta.guards {
            let version: Option<i64> = tx
                .query_row(
                    "SELECT version FROM bullets WHERE id = ?1",
                    params![guard.bullet_id],
                    |row| row.get(0),
                )
                .optional()?;
            let matches = version.map(|v| v as u64 == guard.version).unwrap_or(false);
            if !matches {
                // Transaction drop rolls everything back
                return Err(PlaybookError::DeltaConflict(format!(
                    "bullet {} version changed since scoring",
                    guard.bullet_id
                )));
            }
        }

        let mut result = AppliedDelta {
            delta_id: delta.delta_id.clone(),
            ..Default::default()
        };

        for bullet in &delta.additions {
            let existing: Option<String> = tx
                .query_row(
                    "SELECT status FROM bullets WHERE id = ?1",
                    params![bullet.id],
                    |row| row.get(0),
                )
                .optional()?;
            match existing.as_deref() {
                None => {
                    insert_bullet_row(&tx, bullet)?;
                    result.additions_applied += 1;
                }
                Some("active") => {
                    // Concurrent add of identical content collapses into a
                    // reinforcement instead of a second record
                    tx.execute(
                        "UPDATE bullets SET helpful_count = helpful_count + 1,
                                version = version + 1
                         WHERE id = ?1",
                        params![bullet.id],
                    )?;
                    result.additions_applied += 1;
                }
                Some(_) => {
                    warn!(
                        "Dropping re-add of pruned bullet {} from delta {}",
                        bullet.id, delta.delta_id
                    );
                    result.dropped += 1;
                }
            }
        }

        for update in &delta.counter_updates {
            let changed = tx.execute(
                "UPDATE bullets SET helpful_count = helpful_count + ?1,
                        harmful_count = harmful_count + ?2,
                        version = version + 1
                 WHERE id = ?3 AND status = 'active'",
                params![update.helpful_delta, update.harmful_delta, update.bullet_id],
            )?;
            if changed == 0 {
                warn!(
                    "Dropping counter update for missing/pruned bullet {} from delta {}",
                    update.bullet_id, delta.delta_id
                );
                result.dropped += 1;
            } else {
                result.counters_applied += 1;
            }
        }

        for id in &delta.removal_candidates {
            let changed = tx.execute(
                "UPDATE bullets SET status = 'pruned', pruned_at = ?1,
                        version = version + 1
                 WHERE id = ?2 AND status = 'active'",
                params![ts_to_sql(now), id],
            )?;
            if changed == 0 {
                warn!(
                    "Dropping removal of missing/pruned bullet {} from delta {}",
                    id, delta.delta_id
                );
                result.dropped += 1;
            } else {
                result.removals_applied += 1;
            }
        }

        tx.execute(
            "INSERT INTO delta_applications (delta_id, applied_at, applied_ops, dropped_ops)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                delta.delta_id,
                ts_to_sql(now),
                result.applied() as i64,
                result.dropped as i64
            ],
        )?;

        tx.commit()?;
        Ok(result)
    }

    /// Soft-delete bullets; they stay queryable until compaction
    pub async fn mark_pruned(&self, ids: &[BulletId], now: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "UPDATE bullets SET status = 'pruned', pruned_at = ?1, version = version + 1
             WHERE id = ?2 AND status = 'active'",
        )?;
        let mut changed = 0;
        for id in ids {
            changed += stmt.execute(params![ts_to_sql(now), id])?;
        }
        Ok(changed)
    }

    /// Best-effort last-used stamp. Does not bump versions so refinement
    /// guards are not invalidated by reads.
    pub async fn touch(&self, ids: &[BulletId], now: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare_cached(
            "UPDATE bullets SET last_used_at = ?1 WHERE id = ?2 AND status = 'active'",
        )?;
        for id in ids {
            stmt.execute(params![ts_to_sql(now), id])?;
        }
        Ok(())
    }

    /// Physically delete pruned bullets older than the retention window.
    /// Returns the number of rows removed.
    pub async fn compact(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM bullets WHERE status = 'pruned' AND pruned_at < ?1",
            params![ts_to_sql(cutoff)],
        )?;
        Ok(deleted)
    }

    /// Aggregate statistics over the store
    pub async fn stats(&self, now: DateTime<Utc>, recency_half_life_secs: u64) -> Result<StoreStats> {
        let conn = self.conn.lock().await;

        let pruned_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM bullets WHERE status = 'pruned'",
            [],
            |row| row.get(0),
        )?;

        let mut stmt = conn.prepare_cached(
            "SELECT section, helpful_count, harmful_count, last_used_at
             FROM bullets WHERE status = 'active'",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let section: String = row.get(0)?;
                let helpful: i64 = row.get(1)?;
                let harmful: i64 = row.get(2)?;
                let last_used: String = row.get(3)?;
                Ok((section, helpful, harmful, last_used))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut stats = StoreStats {
            pruned_count: pruned_count as usize,
            ..Default::default()
        };
        let mut quality_sum = 0.0;
        for (section, helpful, harmful, last_used) in &rows {
            let section = Section::parse(section).unwrap_or(Section::Other);
            *stats.by_section.entry(section).or_insert(0) += 1;

            let helpful = *helpful as f64;
            let harmful = *harmful as f64;
            let ratio = helpful / (helpful + harmful + crate::types::QUALITY_EPSILON);
            let decay =
                crate::types::recency_decay(ts_from_sql(last_used), now, recency_half_life_secs);
            quality_sum += ratio * decay;
        }
        stats.active_count = rows.len();
        stats.avg_quality_score = if rows.is_empty() {
            0.0
        } else {
            quality_sum / rows.len() as f64
        };

        Ok(stats)
    }
}

const BULLET_COLUMNS: &str = "id, section, content, embedding, helpful_count, harmful_count, \
                              version, status, created_at, last_used_at, pruned_at";

fn insert_bullet_row(conn: &Connection, bullet: &Bullet) -> Result<()> {
    let embedding_blob = bullet.embedding.as_ref().map(|e| embedding_to_blob(e));
    conn.execute(
        "INSERT INTO bullets
         (id, section, content, embedding, helpful_count, harmful_count,
          version, status, created_at, last_used_at, pruned_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            bullet.id,
            bullet.section.as_str(),
            bullet.content,
            embedding_blob,
            bullet.helpful_count,
            bullet.harmful_count,
            bullet.version as i64,
            bullet.status.as_str(),
            ts_to_sql(bullet.created_at),
            ts_to_sql(bullet.last_used_at),
            bullet.pruned_at.map(ts_to_sql),
        ],
    )?;
    Ok(())
}

fn row_to_bullet(row: &rusqlite::Row<'_>) -> rusqlite::Result<Bullet> {
    let section: String = row.get(1)?;
    let embedding_blob: Option<Vec<u8>> = row.get(3)?;
    let status: String = row.get(7)?;
    let created_at: String = row.get(8)?;
    let last_used_at: String = row.get(9)?;
    let pruned_at: Option<String> = row.get(10)?;

    Ok(Bullet {
        id: row.get(0)?,
        section: Section::parse(&section).unwrap_or(Section::Other),
        content: row.get(2)?,
        embedding: embedding_blob.as_deref().map(blob_to_embedding),
        helpful_count: row.get::<_, i64>(4)?.max(0) as u32,
        harmful_count: row.get::<_, i64>(5)?.max(0) as u32,
        version: row.get::<_, i64>(6)?.max(0) as u64,
        status: BulletStatus::parse(&status).unwrap_or(BulletStatus::Active),
        created_at: ts_from_sql(&created_at),
        last_used_at: ts_from_sql(&last_used_at),
        pruned_at: pruned_at.as_deref().map(ts_from_sql),
    })
}

/// Uniform-width RFC 3339 so lexicographic SQL comparison matches time order
fn ts_to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn ts_from_sql(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

/// Embedding vector to little-endian f32 blob
fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        blob.extend_from_slice(&val.to_le_bytes());
    }
    blob
}

fn blob_to_embedding(blob: &[u8]) -> Vec<f32> {
    let len = blob.len() / 4;
    let mut embedding = Vec::with_capacity(len);
    for i in 0..len {
        let bytes = &blob[i * 4..(i + 1) * 4];
        let val = f32::from_le_bytes(bytes.try_into().unwrap_or([0; 4]));
        embedding.push(val);
    }
    embedding
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CounterUpdate, VersionGuard};
    use tempfile::tempdir;

    async fn open_store() -> (tempfile::TempDir, SqliteBulletStore) {
        let dir = tempdir().unwrap();
        let store = SqliteBulletStore::new(dir.path().join("test.db"))
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn insert_and_round_trip() {
        let (_dir, store) = open_store().await;
        let now = Utc::now();
        let mut bullet = Bullet::new(Section::Strategy, "check cache before fetch", now);
        bullet.embedding = Some(vec![0.1, -0.2, 0.3]);

        store.insert(&bullet).await.unwrap();
        let loaded = store.get(&bullet.id).await.unwrap().unwrap();

        assert_eq!(loaded.id, bullet.id);
        assert_eq!(loaded.section, Section::Strategy);
        assert_eq!(loaded.content, bullet.content);
        assert_eq!(loaded.embedding, Some(vec![0.1, -0.2, 0.3]));
        assert_eq!(loaded.status, BulletStatus::Active);
        assert_eq!(loaded.helpful_count, 0);
        assert_eq!(
            loaded.created_at.timestamp_millis(),
            now.timestamp_millis()
        );
    }

    #[tokio::test]
    async fn duplicate_insert_carries_existing_id() {
        let (_dir, store) = open_store().await;
        let now = Utc::now();
        let bullet = Bullet::new(Section::Pattern, "same words", now);

        let id = store.insert(&bullet).await.unwrap();
        let err = store.insert(&bullet).await.unwrap_err();
        match err {
            PlaybookError::DuplicateContent { existing_id } => assert_eq!(existing_id, id),
            other => panic!("expected DuplicateContent, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn delta_replay_is_noop() {
        let (_dir, store) = open_store().await;
        let now = Utc::now();
        let bullet = Bullet::new(Section::Strategy, "b", now);
        store.insert(&bullet).await.unwrap();

        let delta = Delta::new(
            "salt",
            vec![],
            vec![CounterUpdate {
                bullet_id: bullet.id.clone(),
                helpful_delta: 2,
                harmful_delta: 0,
            }],
            vec![],
            vec![],
        );

        let first = store.apply_delta(&delta, now).await.unwrap();
        assert!(!first.replayed);
        assert_eq!(first.counters_applied, 1);

        let second = store.apply_delta(&delta, now).await.unwrap();
        assert!(second.replayed);

        let loaded = store.get(&bullet.id).await.unwrap().unwrap();
        assert_eq!(loaded.helpful_count, 2);
    }

    #[tokio::test]
    async fn guard_mismatch_rejects_whole_delta() {
        let (_dir, store) = open_store().await;
        let now = Utc::now();
        let bullet = Bullet::new(Section::Strategy, "guarded", now);
        store.insert(&bullet).await.unwrap();

        let delta = Delta::new(
            "salt",
            vec![],
            vec![CounterUpdate {
                bullet_id: bullet.id.clone(),
                helpful_delta: 1,
                harmful_delta: 0,
            }],
            vec![],
            vec![VersionGuard {
                bullet_id: bullet.id.clone(),
                version: 99,
            }],
        );

        let err = store.apply_delta(&delta, now).await.unwrap_err();
        assert!(matches!(err, PlaybookError::DeltaConflict(_)));

        // Nothing applied
        let loaded = store.get(&bullet.id).await.unwrap().unwrap();
        assert_eq!(loaded.helpful_count, 0);
    }

    #[tokio::test]
    async fn addition_collapses_into_reinforcement() {
        let (_dir, store) = open_store().await;
        let now = Utc::now();
        let bullet = Bullet::new(Section::Mistake, "retry without backoff", now);
        store.insert(&bullet).await.unwrap();

        let delta = Delta::new("other-task", vec![bullet.clone()], vec![], vec![], vec![]);
        let applied = store.apply_delta(&delta, now).await.unwrap();
        assert_eq!(applied.additions_applied, 1);

        let loaded = store.get(&bullet.id).await.unwrap().unwrap();
        assert_eq!(loaded.helpful_count, 1);
        assert_eq!(store.count_active(Some(Section::Mistake)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dropped_ops_do_not_fail_the_delta() {
        let (_dir, store) = open_store().await;
        let now = Utc::now();

        let delta = Delta::new(
            "salt",
            vec![],
            vec![CounterUpdate {
                bullet_id: "nonexistent".to_string(),
                helpful_delta: 1,
                harmful_delta: 0,
            }],
            vec!["also-nonexistent".to_string()],
            vec![],
        );

        let applied = store.apply_delta(&delta, now).await.unwrap();
        assert_eq!(applied.applied(), 0);
        assert_eq!(applied.dropped, 2);
    }

    #[tokio::test]
    async fn prune_compact_lifecycle() {
        let (_dir, store) = open_store().await;
        let now = Utc::now();
        let bullet = Bullet::new(Section::Other, "stale", now);
        store.insert(&bullet).await.unwrap();

        store.mark_pruned(&[bullet.id.clone()], now).await.unwrap();
        let loaded = store.get(&bullet.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, BulletStatus::Pruned);
        assert!(loaded.pruned_at.is_some());

        // Still queryable before the retention cutoff
        let removed = store.compact(now - chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(removed, 0);

        let removed = store.compact(now + chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.get(&bullet.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn paging_walks_all_active_bullets() {
        let (_dir, store) = open_store().await;
        let now = Utc::now();
        for i in 0..7 {
            let bullet = Bullet::new(Section::Strategy, format!("insight {i}"), now);
            store.insert(&bullet).await.unwrap();
        }

        let mut seen = Vec::new();
        let mut after: Option<String> = None;
        loop {
            let page = store
                .page_active(Some(Section::Strategy), after.as_deref(), 3)
                .await
                .unwrap();
            if page.is_empty() {
                break;
            }
            after = page.last().map(|b| b.id.clone());
            seen.extend(page.into_iter().map(|b| b.id));
        }

        assert_eq!(seen.len(), 7);
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted);
    }

    #[tokio::test]
    async fn stats_counts_and_average() {
        let (_dir, store) = open_store().await;
        let now = Utc::now();

        let mut helpful = Bullet::new(Section::Strategy, "good", now);
        helpful.helpful_count = 4;
        store.insert(&helpful).await.unwrap();

        let harmful = Bullet::new(Section::Mistake, "unproven", now);
        store.insert(&harmful).await.unwrap();

        let stats = store.stats(now, 3600).await.unwrap();
        assert_eq!(stats.active_count, 2);
        assert_eq!(stats.pruned_count, 0);
        assert_eq!(stats.by_section.get(&Section::Strategy), Some(&1));
        // One bullet at ~1.0 quality, one at 0.0
        assert!((stats.avg_quality_score - 0.5).abs() < 0.01);
    }
}
