//! Aggregation of deletion candidates into bulk-delete requests.

use std::collections::HashMap;

use futures::{stream::BoxStream, Stream, StreamExt};
use stevedore_io::{
    BatchDeleteError, BatchDeleteResult, Location, Storage, StorageBackend, MAX_DELETE_BATCH_SIZE,
};
use tokio_util::sync::CancellationToken;

/// Per-key result of an aggregated deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub location: Location,
    pub error: Option<BatchDeleteError>,
}

impl DeleteOutcome {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Turn a stream of deletion candidates into bulk-delete requests of at
/// most [`MAX_DELETE_BATCH_SIZE`] keys, flushed when a batch fills or the
/// input ends. Batches are issued in arrival order; results come back as
/// one item per input key, success/failure classified per key. A request
/// that fails as a whole fans its error out to every key it carried.
///
/// Sources that mix buckets should be partitioned upstream; the expander
/// always feeds keys of a single bucket.
pub fn multi_delete(
    storage: StorageBackend,
    locations: impl Stream<Item = Location> + Send + 'static,
    cancel: CancellationToken,
) -> BoxStream<'static, DeleteOutcome> {
    async_stream::stream! {
        futures::pin_mut!(locations);
        let mut batch: Vec<Location> = Vec::with_capacity(MAX_DELETE_BATCH_SIZE);

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = locations.next() => next,
            };
            let input_done = next.is_none();
            if let Some(location) = next {
                batch.push(location);
            }

            if batch.len() >= MAX_DELETE_BATCH_SIZE || (input_done && !batch.is_empty()) {
                let flushed = std::mem::take(&mut batch);
                for outcome in flush(&storage, flushed).await {
                    yield outcome;
                }
            }
            if input_done {
                break;
            }
        }
    }
    .boxed()
}

async fn flush(storage: &StorageBackend, batch: Vec<Location>) -> Vec<DeleteOutcome> {
    match storage.delete_batch(batch.clone()).await {
        Ok(BatchDeleteResult::AllSuccessful) => batch
            .into_iter()
            .map(|location| DeleteOutcome {
                location,
                error: None,
            })
            .collect(),
        Ok(BatchDeleteResult::PartialFailure { errors, .. }) => {
            let mut failed: HashMap<String, BatchDeleteError> = errors
                .into_iter()
                .filter_map(|error| error.location.clone().map(|key| (key, error)))
                .collect();
            batch
                .into_iter()
                .map(|location| {
                    let error = failed.remove(&location.to_string());
                    DeleteOutcome { location, error }
                })
                .collect()
        }
        Err(e) => {
            let message = e.to_string();
            batch
                .into_iter()
                .map(|location| {
                    let error = Some(BatchDeleteError::new(
                        Some(location.to_string()),
                        None,
                        message.clone(),
                    ));
                    DeleteOutcome { location, error }
                })
                .collect()
        }
    }
}
