use rayon::ThreadPool;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinHandle;

use super::Thumbnailer;
use crate::bundle::Bundle;
use crate::error::{Result, ThumbnailError};

struct ThumbnailJob {
    bundle: Arc<dyn Bundle>,
    response_sender: Option<oneshot::Sender<Result<PathBuf>>>,
}

/// Runs thumbnail jobs for many bundles concurrently.
///
/// Each job is sequential internally; different bundles write disjoint cache
/// paths so jobs need no coordination beyond the in-flight bound.
pub struct ThumbnailWorker {
    sender: mpsc::UnboundedSender<ThumbnailJob>,
    handle: JoinHandle<()>,
}

impl ThumbnailWorker {
    pub async fn new(thumbnailer: Arc<Thumbnailer>, max_in_flight: usize) -> Result<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let max_in_flight = max_in_flight.max(1);

        // Rasterization and PNG encoding are CPU-bound
        let thread_pool = Arc::new(
            rayon::ThreadPoolBuilder::new()
                .num_threads(max_in_flight)
                .thread_name(|i| format!("thumbnail-{}", i))
                .build()
                .map_err(|e| ThumbnailError::Worker(format!("Failed to create thread pool: {}", e)))?,
        );
        let semaphore = Arc::new(Semaphore::new(max_in_flight));

        let handle = Self::spawn_dispatcher(receiver, thumbnailer, thread_pool, semaphore, max_in_flight);

        Ok(ThumbnailWorker { sender, handle })
    }

    fn spawn_dispatcher(
        mut receiver: mpsc::UnboundedReceiver<ThumbnailJob>,
        thumbnailer: Arc<Thumbnailer>,
        thread_pool: Arc<ThreadPool>,
        semaphore: Arc<Semaphore>,
        max_in_flight: usize,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            log::info!("Thumbnail worker started ({} in flight)", max_in_flight);

            while let Some(job) = receiver.recv().await {
                let Ok(permit) = semaphore.clone().acquire_owned().await else {
                    break;
                };

                let thumbnailer = thumbnailer.clone();
                let thread_pool = thread_pool.clone();

                // Permit is released when the job finishes
                tokio::spawn(async move {
                    let start_time = Instant::now();
                    let bundle = job.bundle.clone();
                    let result = tokio::task::spawn_blocking(move || {
                        thread_pool.install(|| thumbnailer.produce(bundle.as_ref()))
                    })
                    .await
                    .unwrap_or_else(|e| Err(ThumbnailError::Worker(format!("Task execution failed: {}", e))));

                    match &result {
                        Ok(path) => log::info!(
                            "Thumbnail for {} written to {} in {} ms",
                            job.bundle.path().display(),
                            path.display(),
                            start_time.elapsed().as_millis()
                        ),
                        Err(e) => log::warn!(
                            "No thumbnail for {}: {}",
                            job.bundle.path().display(),
                            e
                        ),
                    }

                    if let Some(sender) = job.response_sender {
                        let _ = sender.send(result);
                    }
                    drop(permit);
                });
            }

            // Every permit back means every spawned job has finished
            let _ = semaphore.acquire_many(max_in_flight as u32).await;
            log::info!("Thumbnail worker stopped");
        })
    }

    /// Queue `bundle` and wait for its thumbnail.
    pub async fn submit(&self, bundle: Arc<dyn Bundle>) -> Result<PathBuf> {
        let (response_sender, response_receiver) = oneshot::channel();

        self.sender
            .send(ThumbnailJob {
                bundle,
                response_sender: Some(response_sender),
            })
            .map_err(|e| ThumbnailError::Worker(format!("Failed to send job to worker: {}", e)))?;

        response_receiver
            .await
            .map_err(|e| ThumbnailError::Worker(format!("Failed to receive response: {}", e)))?
    }

    /// Queue `bundle` without waiting; the outcome is only logged.
    /// Callable from any thread.
    pub fn submit_detached(&self, bundle: Arc<dyn Bundle>) -> bool {
        self.sender
            .send(ThumbnailJob {
                bundle,
                response_sender: None,
            })
            .is_ok()
    }

    /// Stop accepting jobs and wait until every queued and in-flight job is done.
    pub async fn shutdown(self) {
        drop(self.sender);
        let _ = self.handle.await;
    }
}
