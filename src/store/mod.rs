//! Durable repository of atomic knowledge records
//!
//! Provides:
//! - strict duplicate-checked inserts (near-duplicates pass; the refiner
//!   owns semantic dedup)
//! - atomic, idempotent delta application
//! - a paging cursor over active bullets that never materializes a section
//! - soft-delete with a retention window and physical compaction

pub mod sqlite;

use chrono::{DateTime, Utc};
use futures::Stream;
use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::types::{Bullet, BulletId, Delta, Section};

pub use sqlite::{AppliedDelta, SqliteBulletStore, StoreStats};

/// High-level bullet store facade over the SQLite backend
#[derive(Clone)]
pub struct BulletStore {
    backend: Arc<SqliteBulletStore>,
    scan_page_size: usize,
}

impl BulletStore {
    /// Open (or create) a store at the given database path
    pub async fn open<P: AsRef<Path>>(path: P, scan_page_size: usize) -> Result<Self> {
        let backend = Arc::new(SqliteBulletStore::new(path).await?);
        Ok(Self {
            backend,
            scan_page_size: scan_page_size.max(1),
        })
    }

    /// Insert a new bullet; `DuplicateContent` on byte-identical content
    pub async fn add(&self, bullet: &Bullet) -> Result<BulletId> {
        self.backend.insert(bullet).await
    }

    /// Apply a delta atomically; see [`SqliteBulletStore::apply_delta`]
    pub async fn apply_delta(&self, delta: &Delta, now: DateTime<Utc>) -> Result<AppliedDelta> {
        self.backend.apply_delta(delta, now).await
    }

    /// Load one bullet by id, any status
    pub async fn get(&self, id: &str) -> Result<Option<Bullet>> {
        self.backend.get(id).await
    }

    /// Cursor over active bullets, optionally restricted to a section
    pub fn scan_active(&self, section: Option<Section>) -> BulletScan {
        BulletScan {
            backend: self.backend.clone(),
            section,
            after_id: None,
            buffer: std::collections::VecDeque::new(),
            page_size: self.scan_page_size,
            exhausted: false,
        }
    }

    /// Collect an entire section snapshot through the cursor
    pub async fn snapshot_section(&self, section: Section) -> Result<Vec<Bullet>> {
        let mut scan = self.scan_active(Some(section));
        let mut bullets = Vec::new();
        while let Some(bullet) = scan.next().await? {
            bullets.push(bullet);
        }
        Ok(bullets)
    }

    /// Count of active bullets, optionally per section
    pub async fn count_active(&self, section: Option<Section>) -> Result<usize> {
        self.backend.count_active(section).await
    }

    /// Subset of `ids` that exist as active bullets (point lookups)
    pub async fn filter_active(
        &self,
        ids: &[BulletId],
    ) -> Result<std::collections::HashSet<BulletId>> {
        self.backend.filter_active(ids).await
    }

    /// Soft-delete bullets
    pub async fn mark_pruned(&self, ids: &[BulletId], now: DateTime<Utc>) -> Result<usize> {
        self.backend.mark_pruned(ids, now).await
    }

    /// Best-effort last-used stamp
    pub async fn touch(&self, ids: &[BulletId], now: DateTime<Utc>) -> Result<()> {
        self.backend.touch(ids, now).await
    }

    /// Physically remove pruned bullets older than the cutoff
    pub async fn compact(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.backend.compact(cutoff).await
    }

    /// Aggregate statistics
    pub async fn stats(&self, now: DateTime<Utc>, recency_half_life_secs: u64) -> Result<StoreStats> {
        self.backend.stats(now, recency_half_life_secs).await
    }
}

/// Keyset-paginated cursor over active bullets. Fetches one page at a time;
/// a concurrent mutation may appear or disappear between pages, which is
/// fine for every consumer (scoring runs against what it sees).
pub struct BulletScan {
    backend: Arc<SqliteBulletStore>,
    section: Option<Section>,
    after_id: Option<String>,
    buffer: std::collections::VecDeque<Bullet>,
    page_size: usize,
    exhausted: bool,
}

impl BulletScan {
    /// Next bullet, or `None` when the scan is done
    pub async fn next(&mut self) -> Result<Option<Bullet>> {
        if self.buffer.is_empty() && !self.exhausted {
            let page = self
                .backend
                .page_active(self.section, self.after_id.as_deref(), self.page_size)
                .await?;
            if page.len() < self.page_size {
                self.exhausted = true;
            }
            if let Some(last) = page.last() {
                self.after_id = Some(last.id.clone());
            }
            self.buffer.extend(page);
        }
        Ok(self.buffer.pop_front())
    }

    /// Adapt the cursor into a `Stream` of bullets
    pub fn into_stream(self) -> impl Stream<Item = Result<Bullet>> {
        futures::stream::try_unfold(self, |mut scan| async move {
            match scan.next().await? {
                Some(bullet) => Ok(Some((bullet, scan))),
                None => Ok(None),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use tempfile::tempdir;

    #[tokio::test]
    async fn scan_stream_yields_every_active_bullet() {
        let dir = tempdir().unwrap();
        let store = BulletStore::open(dir.path().join("scan.db"), 2).await.unwrap();
        let now = Utc::now();

        for i in 0..5 {
            let bullet = Bullet::new(Section::Pattern, format!("pattern {i}"), now);
            store.add(&bullet).await.unwrap();
        }
        let pruned = Bullet::new(Section::Pattern, "gone", now);
        store.add(&pruned).await.unwrap();
        store.mark_pruned(&[pruned.id.clone()], now).await.unwrap();

        let bullets: Vec<Bullet> = store
            .scan_active(Some(Section::Pattern))
            .into_stream()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(bullets.len(), 5);
        assert!(bullets.iter().all(|b| b.id != pruned.id));
    }

    #[tokio::test]
    async fn scan_on_empty_store_terminates() {
        let dir = tempdir().unwrap();
        let store = BulletStore::open(dir.path().join("empty.db"), 16).await.unwrap();

        let mut scan = store.scan_active(None);
        assert!(scan.next().await.unwrap().is_none());
    }
}
