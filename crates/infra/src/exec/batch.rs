//! Sequential chunked processing and bulk-write aggregation.

use std::convert::Infallible;
use std::future::Future;

use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use erpbridge_core::{BulkItemError, BulkResult, ConnectorError};

/// Cumulative progress reported after every chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    pub processed: usize,
    pub total: usize,
    pub chunk: usize,
    pub chunks: usize,
}

/// Split `items` into chunks of `chunk_size` (minimum 1) and run `per_chunk` on
/// each, one after another, concatenating their outputs.
///
/// Stops at the first chunk error; `on_progress` has then been called for every
/// chunk that completed.
pub async fn process_batch<T, R, E, F, Fut, P>(
    items: Vec<T>,
    chunk_size: usize,
    mut per_chunk: F,
    mut on_progress: P,
) -> Result<Vec<R>, E>
where
    F: FnMut(Vec<T>) -> Fut,
    Fut: Future<Output = Result<Vec<R>, E>>,
    P: FnMut(BatchProgress),
{
    let chunk_size = chunk_size.max(1);
    let total = items.len();
    let chunks = total.div_ceil(chunk_size);

    let mut results = Vec::with_capacity(total);
    let mut processed = 0;
    let mut iter = items.into_iter().peekable();
    let mut chunk = 0;

    while iter.peek().is_some() {
        let batch: Vec<T> = iter.by_ref().take(chunk_size).collect();
        processed += batch.len();
        chunk += 1;

        results.extend(per_chunk(batch).await?);

        on_progress(BatchProgress {
            processed,
            total,
            chunk,
            chunks,
        });
    }

    Ok(results)
}

/// Apply `op` to every item in chunks, folding per-item failures into the
/// returned [`BulkResult`] instead of failing the whole batch.
pub async fn run_bulk<T, F, Fut, I>(items: Vec<T>, chunk_size: usize, id_of: I, op: F) -> BulkResult
where
    F: Fn(T) -> Fut,
    Fut: Future<Output = Result<(), ConnectorError>>,
    I: Fn(&T) -> Option<String>,
{
    let started = Instant::now();
    let indexed: Vec<(usize, T)> = items.into_iter().enumerate().collect();
    let op = &op;
    let id_of = &id_of;

    let outcome = process_batch(
        indexed,
        chunk_size,
        move |chunk| async move {
            let mut out = Vec::with_capacity(chunk.len());
            for (index, item) in chunk {
                let entity_id = id_of(&item);
                out.push(op(item).await.map_err(|e| BulkItemError {
                    index,
                    entity_id,
                    message: e.to_string(),
                }));
            }
            Ok::<_, Infallible>(out)
        },
        |p| debug!(processed = p.processed, total = p.total, chunk = p.chunk, "bulk progress"),
    )
    .await;

    let outcomes = match outcome {
        Ok(outcomes) => outcomes,
        Err(never) => match never {},
    };

    let mut result = BulkResult::default();
    for o in outcomes {
        match o {
            Ok(()) => result.succeeded += 1,
            Err(e) => {
                result.failed += 1;
                result.errors.push(e);
            }
        }
    }
    result.duration_ms = started.elapsed().as_millis() as u64;
    result
}
