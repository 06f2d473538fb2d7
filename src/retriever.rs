//! Retriever: scored top-K selection of playbook context
//!
//! Score = w1 * cosine(query, bullet) + w2 * quality + w3 * recency.
//! Ties break on higher helpful count, then lower id, so the same snapshot
//! and query always produce the same ordered result.

use chrono::Utc;
use tracing::warn;

use crate::config::RetrieverConfig;
use crate::embeddings::cosine_similarity;
use crate::error::Result;
use crate::store::BulletStore;
use crate::types::{recency_decay, Bullet, Section};

pub struct Retriever {
    store: BulletStore,
    config: RetrieverConfig,
}

impl Retriever {
    pub fn new(store: BulletStore, config: RetrieverConfig) -> Self {
        Self { store, config }
    }

    /// Top-k bullets for the query embedding, at most `k` long. Bullets
    /// without an embedding compete on quality and recency alone. Returning
    /// also fires a non-blocking last-used stamp for the selected bullets.
    pub async fn retrieve(
        &self,
        query_embedding: &[f32],
        k: usize,
        section: Option<Section>,
    ) -> Result<Vec<Bullet>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut scored: Vec<(f64, Bullet)> = Vec::new();
        let mut scan = self.store.scan_active(section);
        while let Some(bullet) = scan.next().await? {
            let similarity = bullet
                .embedding
                .as_deref()
                .map(|e| cosine_similarity(query_embedding, e) as f64)
                .unwrap_or(0.0);
            let quality = bullet.quality_score(now, self.config.recency_half_life_secs);
            let recency = recency_decay(bullet.last_used_at, now, self.config.recency_half_life_secs);

            let score = self.config.similarity_weight * similarity
                + self.config.quality_weight * quality
                + self.config.recency_weight * recency;
            scored.push((score, bullet));
        }

        scored.sort_by(|(sa, a), (sb, b)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.helpful_count.cmp(&a.helpful_count))
                .then_with(|| a.id.cmp(&b.id))
        });
        scored.truncate(k);

        let bullets: Vec<Bullet> = scored.into_iter().map(|(_, b)| b).collect();

        if !bullets.is_empty() {
            let ids: Vec<String> = bullets.iter().map(|b| b.id.clone()).collect();
            let store = self.store.clone();
            tokio::spawn(async move {
                if let Err(e) = store.touch(&ids, Utc::now()).await {
                    warn!("Failed to stamp last_used_at: {e}");
                }
            });
        }

        Ok(bullets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    async fn seeded_store() -> (tempfile::TempDir, BulletStore) {
        let dir = tempdir().unwrap();
        let store = BulletStore::open(dir.path().join("retrieve.db"), 64)
            .await
            .unwrap();
        (dir, store)
    }

    fn bullet(content: &str, embedding: Vec<f32>, helpful: u32) -> Bullet {
        let now = Utc::now();
        let mut b = Bullet::new(Section::Strategy, content, now);
        b.embedding = Some(embedding);
        b.helpful_count = helpful;
        b
    }

    #[tokio::test]
    async fn empty_store_returns_empty() {
        let (_dir, store) = seeded_store().await;
        let retriever = Retriever::new(store, RetrieverConfig::default());
        let result = retriever.retrieve(&[1.0, 0.0], 5, None).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn similarity_dominates_with_default_weights() {
        let (_dir, store) = seeded_store().await;
        let near = bullet("close match", vec![1.0, 0.0], 0);
        let far = bullet("unrelated", vec![0.0, 1.0], 0);
        store.add(&near).await.unwrap();
        store.add(&far).await.unwrap();

        let retriever = Retriever::new(store, RetrieverConfig::default());
        let result = retriever.retrieve(&[1.0, 0.0], 1, None).await.unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].id, near.id);
    }

    #[tokio::test]
    async fn k_bounds_the_result() {
        let (_dir, store) = seeded_store().await;
        for i in 0..10 {
            store
                .add(&bullet(&format!("insight {i}"), vec![1.0, 0.0], i))
                .await
                .unwrap();
        }

        let retriever = Retriever::new(store, RetrieverConfig::default());
        let result = retriever.retrieve(&[1.0, 0.0], 3, None).await.unwrap();
        assert_eq!(result.len(), 3);
    }

    #[tokio::test]
    async fn more_helpful_bullet_ranks_first() {
        let (_dir, store) = seeded_store().await;
        let weak = bullet("seldom confirmed", vec![1.0, 0.0], 3);
        let strong = bullet("often confirmed", vec![1.0, 0.0], 9);
        store.add(&weak).await.unwrap();
        store.add(&strong).await.unwrap();

        let retriever = Retriever::new(store, RetrieverConfig::default());
        let result = retriever.retrieve(&[1.0, 0.0], 2, None).await.unwrap();
        assert_eq!(result[0].id, strong.id);
        assert_eq!(result[1].id, weak.id);
    }

    #[tokio::test]
    async fn exact_ties_order_by_id() {
        let (_dir, store) = seeded_store().await;
        let base = Utc::now();
        let mut ids = Vec::new();
        for content in ["one observation", "another observation"] {
            let mut b = Bullet::new(Section::Strategy, content, base);
            b.embedding = Some(vec![1.0, 0.0]);
            b.helpful_count = 4;
            store.add(&b).await.unwrap();
            ids.push(b.id);
        }
        ids.sort();

        let retriever = Retriever::new(store, RetrieverConfig::default());
        let result = retriever.retrieve(&[1.0, 0.0], 2, None).await.unwrap();
        let got: Vec<String> = result.into_iter().map(|b| b.id).collect();
        assert_eq!(got, ids);
    }

    #[tokio::test]
    async fn repeated_retrieval_is_deterministic() {
        let (_dir, store) = seeded_store().await;
        // One shared stamp so ordering falls through to the id tie-break,
        // which the best-effort touch between calls cannot disturb
        let base = Utc::now() - Duration::minutes(5);
        for i in 0..8 {
            let mut b = Bullet::new(Section::Strategy, format!("insight {i}"), base);
            b.embedding = Some(vec![0.7, 0.3]);
            b.helpful_count = 2;
            store.add(&b).await.unwrap();
        }

        let retriever = Retriever::new(store, RetrieverConfig::default());
        let first: Vec<String> = retriever
            .retrieve(&[1.0, 0.0], 5, None)
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.id)
            .collect();
        let second: Vec<String> = retriever
            .retrieve(&[1.0, 0.0], 5, None)
            .await
            .unwrap()
            .into_iter()
            .map(|b| b.id)
            .collect();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn section_filter_is_respected() {
        let (_dir, store) = seeded_store().await;
        store.add(&bullet("strategy note", vec![1.0, 0.0], 1)).await.unwrap();
        let mut mistake = Bullet::new(Section::Mistake, "mistake note", Utc::now());
        mistake.embedding = Some(vec![1.0, 0.0]);
        store.add(&mistake).await.unwrap();

        let retriever = Retriever::new(store, RetrieverConfig::default());
        let result = retriever
            .retrieve(&[1.0, 0.0], 10, Some(Section::Mistake))
            .await
            .unwrap();
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].section, Section::Mistake);
    }
}
