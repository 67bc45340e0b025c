//! The vector index: keeps embedding rows in step with the tool catalog and
//! answers similarity queries for the smart scope.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use manifold_hub::catalog::{CatalogChange, EmbeddingSeed, ToolCatalog};
use manifold_hub::error::{HubError, HubResult};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

use crate::embedder::Embedder;
use crate::store::{EmbeddingRow, EmbeddingStore};

const RETRY_INTERVAL: Duration = Duration::from_secs(60);

/// One similarity-search result.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub upstream: String,
    pub tool: String,
    pub text: String,
    pub similarity: f64,
}

/// Cosine similarity in double precision.
fn cosine(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Embedding store plus reconciliation against the catalog.
pub struct VectorIndex {
    store: EmbeddingStore,
    embedder: Arc<dyn Embedder>,
    catalog: Arc<ToolCatalog>,
    /// Seeds whose embedding failed; retried periodically, never deleted.
    pending: Mutex<HashMap<(String, String), String>>,
}

impl VectorIndex {
    pub fn new(store: EmbeddingStore, embedder: Arc<dyn Embedder>, catalog: Arc<ToolCatalog>) -> Arc<Self> {
        Arc::new(Self {
            store,
            embedder,
            catalog,
            pending: Mutex::new(HashMap::new()),
        })
    }

    /// Upsert rows for the given seeds. Rows whose stored text already
    /// matches are skipped, so re-seeding unchanged tools costs no embedder
    /// calls. Returns the number of rows written.
    pub async fn upsert_many(&self, seeds: &[EmbeddingSeed]) -> HubResult<usize> {
        if seeds.is_empty() {
            return Ok(0);
        }

        let stored: HashMap<(String, String), String> = self
            .store
            .texts()
            .await
            .map_err(|e| HubError::internal(format!("embedding store: {}", e)))?
            .into_iter()
            .map(|(upstream, tool, text)| ((upstream, tool), text))
            .collect();

        let fresh: Vec<&EmbeddingSeed> = seeds
            .iter()
            .filter(|seed| {
                stored
                    .get(&(seed.upstream.clone(), seed.tool.clone()))
                    .map(|text| *text != seed.text)
                    .unwrap_or(true)
            })
            .collect();
        if fresh.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = fresh.iter().map(|seed| seed.text.clone()).collect();
        let vectors = match self.embedder.embed(&texts).await {
            Ok(vectors) => vectors,
            Err(e) => {
                // Stale rows stay; the seeds are parked for retry.
                let mut pending = self.pending.lock().await;
                for seed in fresh {
                    pending.insert(
                        (seed.upstream.clone(), seed.tool.clone()),
                        seed.text.clone(),
                    );
                }
                return Err(HubError::EmbedderUnavailable {
                    message: e.to_string(),
                });
            }
        };

        // The first row fixes the dimensionality; a model change rebuilds.
        if let Some(new_dim) = vectors.first().map(Vec::len) {
            let current = self
                .store
                .dimension()
                .await
                .map_err(|e| HubError::internal(format!("embedding store: {}", e)))?;
            if let Some(current) = current {
                if current != new_dim {
                    tracing::warn!(
                        old = current,
                        new = new_dim,
                        "embedding dimension changed, rebuilding index"
                    );
                    self.store
                        .clear()
                        .await
                        .map_err(|e| HubError::internal(format!("embedding store: {}", e)))?;
                }
            }
        }

        let mut written = 0;
        for (seed, vector) in fresh.iter().zip(vectors) {
            let row = EmbeddingRow {
                upstream: seed.upstream.clone(),
                tool: seed.tool.clone(),
                text: seed.text.clone(),
                vector,
                updated_at: Utc::now(),
            };
            self.store
                .upsert(row)
                .await
                .map_err(|e| HubError::internal(format!("embedding store: {}", e)))?;
            self.pending
                .lock()
                .await
                .remove(&(seed.upstream.clone(), seed.tool.clone()));
            written += 1;
        }
        Ok(written)
    }

    pub async fn delete_by_key(&self, upstream: &str, tool: &str) -> HubResult<()> {
        self.pending
            .lock()
            .await
            .remove(&(upstream.to_string(), tool.to_string()));
        self.store
            .delete_key(upstream, tool)
            .await
            .map_err(|e| HubError::internal(format!("embedding store: {}", e)))
    }

    pub async fn delete_by_upstream(&self, upstream: &str) -> HubResult<()> {
        self.pending
            .lock()
            .await
            .retain(|(u, _), _| u.as_str() != upstream);
        self.store
            .delete_upstream(upstream)
            .await
            .map_err(|e| HubError::internal(format!("embedding store: {}", e)))
    }

    /// k-nearest enabled tools above `threshold`, by cosine similarity.
    ///
    /// Rows may lag the catalog slightly; results are filtered against the
    /// current catalog so a key absent from it is never returned. Equal
    /// similarities tie-break by `(upstream, tool)` ascending.
    pub async fn search(&self, query: &str, k: usize, threshold: f64) -> HubResult<Vec<SearchHit>> {
        let query_vector = self
            .embedder
            .embed(&[query.to_string()])
            .await
            .map_err(|e| HubError::EmbedderUnavailable {
                message: e.to_string(),
            })?
            .into_iter()
            .next()
            .ok_or_else(|| HubError::EmbedderUnavailable {
                message: "embedder returned no vector".to_string(),
            })?;

        let rows = self
            .store
            .all()
            .await
            .map_err(|e| HubError::internal(format!("embedding store: {}", e)))?;
        let catalog = self.catalog.snapshot();

        let mut hits: Vec<SearchHit> = rows
            .into_iter()
            .filter(|row| catalog.contains_enabled(&row.upstream, &row.tool))
            .map(|row| {
                let similarity = cosine(&query_vector, &row.vector);
                SearchHit {
                    upstream: row.upstream,
                    tool: row.tool,
                    text: row.text,
                    similarity,
                }
            })
            .filter(|hit| hit.similarity >= threshold)
            .collect();

        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| (a.upstream.as_str(), a.tool.as_str()).cmp(&(b.upstream.as_str(), b.tool.as_str())))
        });
        hits.truncate(k);
        Ok(hits)
    }

    /// Drop every row and re-embed the current catalog from scratch.
    pub async fn rebuild(&self) -> HubResult<usize> {
        self.store
            .clear()
            .await
            .map_err(|e| HubError::internal(format!("embedding store: {}", e)))?;
        self.resync().await
    }

    /// Seed the index from the whole current catalog (startup path).
    pub async fn resync(&self) -> HubResult<usize> {
        let snapshot = self.catalog.snapshot();
        let seeds: Vec<EmbeddingSeed> = snapshot
            .tools
            .iter()
            .filter(|t| t.enabled)
            .map(|t| EmbeddingSeed {
                upstream: t.upstream.clone(),
                tool: t.name.clone(),
                text: t.embedding_text(),
            })
            .collect();
        self.upsert_many(&seeds).await
    }

    /// Apply one catalog change: deletes first, then upserts.
    pub async fn apply_change(&self, change: &CatalogChange) {
        for (upstream, tool) in &change.deletes {
            if let Err(e) = self.delete_by_key(upstream, tool).await {
                tracing::warn!("embedding delete failed for {}/{}: {}", upstream, tool, e);
            }
        }
        if let Err(e) = self.upsert_many(&change.upserts).await {
            // Parked in `pending`; the reconciler retries.
            tracing::warn!("embedding upsert deferred: {}", e);
        }
    }

    /// Background reconciliation: follow catalog changes and retry parked
    /// seeds on an interval.
    pub fn spawn_reconciler(self: &Arc<Self>) -> JoinHandle<()> {
        let index = Arc::clone(self);
        let mut changes = index.catalog.subscribe();
        tokio::spawn(async move {
            let mut retry = tokio::time::interval(RETRY_INTERVAL);
            retry.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    change = changes.recv() => match change {
                        Ok(change) => index.apply_change(&change).await,
                        Err(broadcast::error::RecvError::Lagged(_)) => {
                            if let Err(e) = index.resync().await {
                                tracing::warn!("vector resync failed: {}", e);
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = retry.tick() => {
                        let parked: Vec<EmbeddingSeed> = index
                            .pending
                            .lock()
                            .await
                            .iter()
                            .map(|((upstream, tool), text)| EmbeddingSeed {
                                upstream: upstream.clone(),
                                tool: tool.clone(),
                                text: text.clone(),
                            })
                            .collect();
                        if !parked.is_empty() {
                            if let Err(e) = index.upsert_many(&parked).await {
                                tracing::debug!("embedding retry still failing: {}", e);
                            }
                        }
                    }
                }
            }
        })
    }
}
