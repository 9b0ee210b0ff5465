//! Work queue and bounded-concurrency worker pool.
//!
//! Delivery is at-least-once. Redelivery count and backoff are properties
//! of the queue (`DeliveryPolicy`); handlers only report failure upward.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

/// Message placed on the queue for every submitted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    #[serde(rename = "jobId")]
    pub job_id: String,
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,

    #[error("queue consumer already taken")]
    ConsumerTaken,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, message: JobMessage) -> Result<(), QueueError>;
}

/// Processes one dequeued job. An `Err` hands the message back to the
/// queue's delivery policy.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, message: &JobMessage) -> crate::error::Result<()>;
}

#[derive(Debug, Clone, Copy)]
pub struct DeliveryPolicy {
    /// Total deliveries per message, including the first.
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            attempts: 1,
            backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone)]
struct Delivery {
    message: JobMessage,
    attempt: u32,
}

/// In-process queue backed by an unbounded channel.
pub struct MemoryQueue {
    tx: mpsc::UnboundedSender<Delivery>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<Delivery>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, message: JobMessage) -> Result<(), QueueError> {
        self.tx
            .send(Delivery {
                message,
                attempt: 1,
            })
            .map_err(|_| QueueError::Closed)
    }
}

/// Consumes a `MemoryQueue`, running at most `concurrency` handlers at once.
pub struct WorkerPool {
    shutdown: CancellationToken,
    tracker: TaskTracker,
    dispatcher: JoinHandle<()>,
}

impl WorkerPool {
    pub async fn spawn(
        queue: &MemoryQueue,
        handler: Arc<dyn JobHandler>,
        concurrency: usize,
        policy: DeliveryPolicy,
    ) -> Result<Self, QueueError> {
        let mut rx = queue.rx.lock().await.take().ok_or(QueueError::ConsumerTaken)?;
        let redeliver = queue.tx.clone();
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let permits = Arc::new(Semaphore::new(concurrency.max(1)));

        let dispatcher = {
            let shutdown = shutdown.clone();
            let tracker = tracker.clone();
            tokio::spawn(async move {
                loop {
                    let permit = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        permit = Arc::clone(&permits).acquire_owned() => match permit {
                            Ok(p) => p,
                            Err(_) => break,
                        },
                    };
                    let delivery = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        delivery = rx.recv() => match delivery {
                            Some(d) => d,
                            None => break,
                        },
                    };

                    let handler = Arc::clone(&handler);
                    let redeliver = redeliver.clone();
                    let shutdown = shutdown.clone();
                    tracker.spawn(async move {
                        let _permit = permit;
                        run_delivery(handler, delivery, redeliver, policy, shutdown).await;
                    });
                }
            })
        };

        info!(concurrency, "Execution worker started");
        Ok(Self {
            shutdown,
            tracker,
            dispatcher,
        })
    }

    /// Stop taking new messages and wait for in-flight jobs to finish.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        let _ = self.dispatcher.await;
        self.tracker.close();
        self.tracker.wait().await;
        info!("Execution worker stopped");
    }
}

async fn run_delivery(
    handler: Arc<dyn JobHandler>,
    delivery: Delivery,
    redeliver: mpsc::UnboundedSender<Delivery>,
    policy: DeliveryPolicy,
    shutdown: CancellationToken,
) {
    let job_id = delivery.message.job_id.clone();
    match handler.handle(&delivery.message).await {
        Ok(()) => info!(job_id = %job_id, "Job completed successfully"),
        Err(e) if delivery.attempt < policy.attempts => {
            warn!(
                job_id = %job_id,
                attempt = delivery.attempt,
                error = %e,
                "Job failed, scheduling redelivery"
            );
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(policy.backoff) => {}
            }
            let next = Delivery {
                message: delivery.message,
                attempt: delivery.attempt + 1,
            };
            if redeliver.send(next).is_err() {
                error!(job_id = %job_id, "Queue closed, dropping redelivery");
            }
        }
        Err(e) => error!(job_id = %job_id, error = %e, "Job failed with error"),
    }
}
