//! A bounded worker pool (§4.H). `dispatch` fails synchronously with
//! `ResourceExhausted` when the queue is full; a worker that times out is
//! retired and replaced, up to `max_workers`, after which the pool is
//! saturated and further dispatches fail too.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use vda_core::error::{AgentError, AgentResult};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Envelope {
    job: Job,
    timeout: Duration,
}

struct Shared {
    receiver: AsyncMutex<mpsc::Receiver<Envelope>>,
    active_workers: AtomicUsize,
    max_workers: usize,
    last_saturation_log: Mutex<Option<Instant>>,
}

/// A bounded pool of worker tasks dispatching arbitrary async work with a
/// per-task timeout.
pub struct Executor {
    sender: Mutex<Option<mpsc::Sender<Envelope>>>,
    shared: Arc<Shared>,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Executor {
    /// `workers_count` workers start immediately; the pool may grow
    /// replacements up to `max_workers` as workers time out.
    pub fn start(workers_count: usize, max_workers: usize, queue_size: usize) -> Self {
        let (sender, receiver) = mpsc::channel(queue_size);
        let shared = Arc::new(Shared {
            receiver: AsyncMutex::new(receiver),
            active_workers: AtomicUsize::new(workers_count),
            max_workers,
            last_saturation_log: Mutex::new(None),
        });

        let mut worker_handles = Vec::with_capacity(workers_count);
        for _ in 0..workers_count {
            worker_handles.push(tokio::spawn(run_worker(shared.clone())));
        }

        Self {
            sender: Mutex::new(Some(sender)),
            shared,
            worker_handles: Mutex::new(worker_handles),
        }
    }

    /// Enqueues `task` with `timeout`. Fails synchronously if the queue is
    /// full, or if the executor has already been stopped (§4.H).
    pub fn dispatch<F>(&self, task: F, timeout: Duration) -> AgentResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let envelope = Envelope {
            job: Box::pin(task),
            timeout,
        };
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(AgentError::ResourceExhausted("executor is stopped".to_string()));
        };
        sender.try_send(envelope).map_err(|_| {
            self.log_saturation();
            AgentError::ResourceExhausted("executor queue is full".to_string())
        })
    }

    fn log_saturation(&self) {
        let mut last = self.shared.last_saturation_log.lock();
        let now = Instant::now();
        let should_log = last.map(|t| now.duration_since(t) > Duration::from_secs(10)).unwrap_or(true);
        if should_log {
            warn!(
                active_workers = self.shared.active_workers.load(Ordering::SeqCst),
                max_workers = self.shared.max_workers,
                "executor saturated, dispatch rejected"
            );
            *last = Some(now);
        }
    }

    /// Closes the queue (no further dispatches are accepted) and, if
    /// `wait`, joins every worker task once it drains.
    pub async fn stop(&self, wait: bool) {
        self.sender.lock().take();

        if wait {
            let handles = std::mem::take(&mut *self.worker_handles.lock());
            for handle in handles {
                let _ = handle.await;
            }
        }
    }
}

async fn run_worker(shared: Arc<Shared>) {
    loop {
        let envelope = {
            let mut receiver = shared.receiver.lock().await;
            receiver.recv().await
        };
        let Some(envelope) = envelope else {
            return;
        };

        match tokio::time::timeout(envelope.timeout, envelope.job).await {
            Ok(()) => {}
            Err(_) => {
                warn!("worker task exceeded its timeout, retiring");
                let previous = shared.active_workers.fetch_sub(1, Ordering::SeqCst);
                if previous - 1 < shared.max_workers {
                    shared.active_workers.fetch_add(1, Ordering::SeqCst);
                    debug!("spawning replacement worker");
                    tokio::spawn(run_worker(shared.clone()));
                } else {
                    warn!("executor pool saturated, not replacing retired worker");
                }
                return;
            }
        }
    }
}
