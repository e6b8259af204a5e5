//! Bounded extraction worker pool.
//!
//! Chunks are dispatched to at most `budget.concurrency()` concurrent tasks;
//! further chunks wait for a free slot instead of being spawned. Outcomes are
//! sent over an `mpsc` channel to a single consumer that folds them into the
//! graph. Cancelling the token stops dispatch; tasks already running finish
//! and still report their outcome.

use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ChunkExtraction, EntityExtractor};
use crate::error::GraphRagError;
use crate::graphrag::domain::Chunk;
use crate::graphrag::rag::cache::ExtractionCache;
use crate::llm::ModelBudget;

/// One unit of extraction work.
#[derive(Debug, Clone)]
pub struct ExtractionJob {
    pub chunk: Chunk,
    /// Extraction cache key for the chunk.
    pub cache_key: String,
}

/// Result of extracting one chunk.
#[derive(Debug)]
pub struct ExtractionOutcome {
    pub chunk_id: String,
    pub result: Result<ChunkExtraction, GraphRagError>,
    pub cached: bool,
}

#[derive(Clone)]
pub struct ExtractionPool {
    extractor: Arc<dyn EntityExtractor>,
    budget: ModelBudget,
    cache: Arc<ExtractionCache>,
}

impl std::fmt::Debug for ExtractionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExtractionPool")
            .field("extractor", &self.extractor.name())
            .field("budget", &self.budget)
            .finish()
    }
}

impl ExtractionPool {
    pub fn new(
        extractor: Arc<dyn EntityExtractor>,
        budget: ModelBudget,
        cache: Arc<ExtractionCache>,
    ) -> Self {
        Self {
            extractor,
            budget,
            cache,
        }
    }

    /// Run all jobs, sending each outcome to `tx`. Returns the number of jobs
    /// dispatched, which is less than `jobs.len()` after cancellation.
    pub async fn run(
        &self,
        jobs: Vec<ExtractionJob>,
        force_rebuild: bool,
        cancel: CancellationToken,
        tx: mpsc::Sender<ExtractionOutcome>,
    ) -> usize {
        let slots = Arc::new(Semaphore::new(self.budget.concurrency()));
        let mut tasks = JoinSet::new();
        let mut dispatched = 0usize;
        let total = jobs.len();

        for job in jobs {
            if cancel.is_cancelled() {
                break;
            }

            if !force_rebuild {
                if let Some(result) = self.cache.get(&job.cache_key).await {
                    dispatched += 1;
                    let outcome = ExtractionOutcome {
                        chunk_id: job.chunk.id.clone(),
                        result: Ok(ChunkExtraction {
                            result,
                            ..ChunkExtraction::default()
                        }),
                        cached: true,
                    };
                    if tx.send(outcome).await.is_err() {
                        break;
                    }
                    continue;
                }
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
            };

            dispatched += 1;
            let extractor = Arc::clone(&self.extractor);
            let budget = self.budget.clone();
            let cache = Arc::clone(&self.cache);
            let tx = tx.clone();
            tasks.spawn(async move {
                let _permit = permit;
                let result = extractor.extract(&job.chunk, &budget).await;
                if let Ok(extraction) = &result {
                    cache.put(&job.cache_key, &extraction.result).await;
                }
                debug!(chunk_id = %job.chunk.id, ok = result.is_ok(), "Chunk extracted");
                let outcome = ExtractionOutcome {
                    chunk_id: job.chunk.id,
                    result,
                    cached: false,
                };
                if tx.send(outcome).await.is_err() {
                    warn!("Extraction consumer closed before outcome was delivered");
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Extraction task panicked");
            }
        }

        if dispatched < total {
            info!(dispatched, total, "Extraction dispatch stopped early");
        }
        dispatched
    }
}
