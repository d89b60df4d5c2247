//! Write-batch coalescer.
//!
//! Writes are queued and flushed to the backend in FIFO partitions of up to
//! `max_batch_size` operations, either when the queue fills a partition or
//! when the deadline timer fires. Each queued operation carries a one-shot
//! completion that resolves with its partition's outcome. A full queue makes
//! `submit` back off exponentially before giving up.
//!
//! Flushes never overlap: a flush in progress holds the flush lock, and any
//! trigger that fires meanwhile waits behind it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// One write operation: a key and its encoded value text.
#[derive(Debug, Clone)]
pub struct BatchOp {
    pub key: String,
    pub value: String,
}

/// Why a queued operation did not complete successfully.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BatchError {
    /// The queue stayed full through every enqueue retry.
    #[error("batch queue is full ({0} operations)")]
    QueueFull(usize),
    /// The executor did not finish within the operation timeout.
    #[error("batch flush timed out after {0:?}")]
    Timeout(Duration),
    /// The executor failed; all operations in the partition share this.
    #[error("batch flush failed: {0}")]
    Failed(String),
    /// The queue was cleared while the operation was pending.
    #[error("batch operation cancelled")]
    Cancelled,
}

/// Coalescer tuning parameters.
#[derive(Debug, Clone)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub max_wait_time: Duration,
    pub operation_timeout: Duration,
    /// Defaults to 100 × `max_batch_size`.
    pub max_queue_size: usize,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        let max_batch_size = 100;
        Self {
            max_batch_size,
            max_wait_time: Duration::from_millis(50),
            operation_timeout: Duration::from_secs(30),
            max_queue_size: max_batch_size * 100,
            retry_attempts: 3,
            retry_delay: Duration::from_millis(100),
            max_retry_delay: Duration::from_secs(5),
        }
    }
}

impl BatchConfig {
    /// Build from the façade-level options.
    #[must_use]
    pub fn sized(max_batch_size: usize, max_wait_time: Duration, operation_timeout: Duration) -> Self {
        Self {
            max_batch_size,
            max_wait_time,
            operation_timeout,
            max_queue_size: max_batch_size * 100,
            ..Self::default()
        }
    }
}

/// The flush target: receives one FIFO partition and persists it.
pub type BatchExecutor =
    Arc<dyn Fn(Vec<BatchOp>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

struct Pending {
    op: BatchOp,
    done: oneshot::Sender<Result<(), BatchError>>,
}

/// Coalesces writes into bounded partitions with deadline-based flushing.
pub struct BatchProcessor {
    config: BatchConfig,
    executor: BatchExecutor,
    queue: Mutex<VecDeque<Pending>>,
    /// Serializes flushes; triggers queue behind an in-progress flush.
    flush_lock: tokio::sync::Mutex<()>,
    deadline_timer: Mutex<Option<JoinHandle<()>>>,
    processing: AtomicBool,
}

impl BatchProcessor {
    #[must_use]
    pub fn new(config: BatchConfig, executor: BatchExecutor) -> Arc<Self> {
        Arc::new(Self {
            config,
            executor,
            queue: Mutex::new(VecDeque::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            deadline_timer: Mutex::new(None),
            processing: AtomicBool::new(false),
        })
    }

    /// Queue one operation and wait for its partition's outcome.
    pub async fn submit(self: &Arc<Self>, op: BatchOp) -> Result<(), BatchError> {
        let receiver = self.enqueue(op).await?;
        match receiver.await {
            Ok(outcome) => outcome,
            // Sender dropped without resolution: the queue was cleared.
            Err(_) => Err(BatchError::Cancelled),
        }
    }

    /// Queue one operation, retrying with exponential backoff while the
    /// queue is full. Returns the completion receiver.
    async fn enqueue(
        self: &Arc<Self>,
        op: BatchOp,
    ) -> Result<oneshot::Receiver<Result<(), BatchError>>, BatchError> {
        let mut delay = self.config.retry_delay;
        let mut attempt = 0u32;
        loop {
            let trigger = {
                let mut queue = self.queue.lock();
                if queue.len() < self.config.max_queue_size {
                    let (done, receiver) = oneshot::channel();
                    queue.push_back(Pending {
                        op: op.clone(),
                        done,
                    });
                    let len = queue.len();
                    drop(queue);
                    Some((receiver, len))
                } else {
                    None
                }
            };
            if let Some((receiver, len)) = trigger {
                if len >= self.config.max_batch_size {
                    self.spawn_flush();
                } else {
                    self.arm_deadline();
                }
                return Ok(receiver);
            }
            if attempt >= self.config.retry_attempts {
                warn!(
                    queue = self.config.max_queue_size,
                    "batch queue still full after retries"
                );
                return Err(BatchError::QueueFull(self.config.max_queue_size));
            }
            attempt += 1;
            let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 10);
            trace!(attempt, ?delay, "batch queue full; backing off");
            tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
            delay = (delay * 2).min(self.config.max_retry_delay);
        }
    }

    /// Arm the deadline timer unless one is armed or a flush is running.
    fn arm_deadline(self: &Arc<Self>) {
        let mut timer = self.deadline_timer.lock();
        if timer.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        if self.processing.load(Ordering::Acquire) {
            return;
        }
        let this = Arc::downgrade(self);
        let wait = self.config.max_wait_time;
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            if let Some(this) = this.upgrade() {
                // Detach our own handle first: flush aborts the stored
                // timer, and that must not cancel the task running it.
                this.deadline_timer.lock().take();
                this.flush().await;
            }
        }));
    }

    fn spawn_flush(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.flush().await;
        });
    }

    /// Drain the queue in FIFO partitions. Safe to call concurrently; a
    /// second caller waits for the in-progress flush and then drains
    /// whatever remains.
    pub async fn flush(self: &Arc<Self>) {
        if let Some(timer) = self.deadline_timer.lock().take() {
            timer.abort();
        }
        let _flush_guard = self.flush_lock.lock().await;
        loop {
            let partition: Vec<Pending> = {
                let mut queue = self.queue.lock();
                let take = queue.len().min(self.config.max_batch_size);
                queue.drain(..take).collect()
            };
            if partition.is_empty() {
                return;
            }
            self.processing.store(true, Ordering::Release);
            let outcome = self.run_partition(&partition).await;
            self.processing.store(false, Ordering::Release);
            for pending in partition {
                let _ = pending.done.send(outcome.clone());
            }
            // Let other tasks run between partitions.
            tokio::task::yield_now().await;
        }
    }

    async fn run_partition(&self, partition: &[Pending]) -> Result<(), BatchError> {
        let ops: Vec<BatchOp> = partition.iter().map(|p| p.op.clone()).collect();
        let count = ops.len();
        let exec = (self.executor)(ops);
        tokio::select! {
            result = exec => match result {
                Ok(()) => {
                    debug!(count, "flushed batch partition");
                    Ok(())
                }
                Err(err) => {
                    warn!(count, %err, "batch partition failed");
                    Err(BatchError::Failed(err.to_string()))
                }
            },
            // Dropping the executor future on timeout is the cancellation
            // signal; the backend write is abandoned cooperatively.
            () = tokio::time::sleep(self.config.operation_timeout) => {
                warn!(count, timeout = ?self.config.operation_timeout, "batch partition timed out");
                Err(BatchError::Timeout(self.config.operation_timeout))
            }
        }
    }

    /// Current queue depth.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every queued operation without executing it and disarm the
    /// timer. Pending submitters observe a cancellation.
    pub fn clear(&self) {
        if let Some(timer) = self.deadline_timer.lock().take() {
            timer.abort();
        }
        let dropped = {
            let mut queue = self.queue.lock();
            let dropped = queue.len();
            queue.clear();
            dropped
        };
        if dropped > 0 {
            debug!(dropped, "cleared batch queue");
        }
    }
}
