//! `Operation(func, period)` (§4.I): layered on the scheduler (G) and the
//! executor (H). Starting immediately dispatches once and schedules the
//! next tick; each tick re-dispatches. `exclusive` operations suppress a
//! tick that fires while the previous dispatch is still in flight.

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use vda_core::error::{AgentError, AgentResult};
use vda_executor::Executor;
use vda_scheduler::{ScheduleHandle, Scheduler};

type TickFn = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

struct Inner {
    scheduler: Scheduler,
    executor: Arc<Executor>,
    func: TickFn,
    period: Duration,
    dispatch_timeout: Duration,
    exclusive: bool,
    in_flight: Arc<AtomicBool>,
    handle: Mutex<Option<ScheduleHandle>>,
}

/// A periodic, executor-backed operation.
#[derive(Clone)]
pub struct Operation {
    inner: Arc<Inner>,
}

impl Operation {
    pub fn new<F, Fut>(
        scheduler: Scheduler,
        executor: Arc<Executor>,
        period: Duration,
        dispatch_timeout: Duration,
        exclusive: bool,
        func: F,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let func: TickFn = Arc::new(move || Box::pin(func()));
        Self {
            inner: Arc::new(Inner {
                scheduler,
                executor,
                func,
                period,
                dispatch_timeout,
                exclusive,
                in_flight: Arc::new(AtomicBool::new(false)),
                handle: Mutex::new(None),
            }),
        }
    }

    /// Dispatches once immediately and schedules the next tick. Fails with
    /// `InvalidValue` if `period <= 0` (§4.I).
    pub fn start(&self) -> AgentResult<()> {
        if self.inner.period.is_zero() {
            return Err(AgentError::InvalidValue("period must be > 0".to_string()));
        }
        self.fire();
        self.schedule_next();
        Ok(())
    }

    /// Cancels the pending scheduler entry. Cannot abort an in-flight
    /// dispatch (§5).
    pub fn stop(&self) {
        if let Some(handle) = self.inner.handle.lock().take() {
            handle.cancel();
        }
    }

    fn schedule_next(&self) {
        let this = self.clone();
        let handle = self.inner.scheduler.schedule(
            self.inner.period,
            Box::new(move || {
                this.on_tick();
            }),
        );
        *self.inner.handle.lock() = Some(handle);
    }

    fn on_tick(&self) {
        self.fire();
        self.schedule_next();
    }

    fn fire(&self) {
        if self.inner.exclusive {
            if self
                .inner
                .in_flight
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                warn!("periodic operation tick suppressed: previous dispatch still in flight");
                return;
            }
        }

        let func = self.inner.func.clone();
        let in_flight = self.inner.in_flight.clone();
        let exclusive = self.inner.exclusive;
        let timeout = self.inner.dispatch_timeout;

        let dispatch_result = self.inner.executor.dispatch(
            async move {
                let _ = tokio::time::timeout(timeout, func()).await;
                if exclusive {
                    in_flight.store(false, Ordering::SeqCst);
                }
            },
            timeout,
        );

        if dispatch_result.is_err() && exclusive {
            self.inner.in_flight.store(false, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test(start_paused = true)]
    async fn start_fires_immediately_then_on_each_period() {
        let scheduler = Scheduler::start();
        let executor = Arc::new(Executor::start(2, 2, 16));
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let op = Operation::new(
            scheduler,
            executor,
            Duration::from_millis(100),
            Duration::from_secs(1),
            false,
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        op.start().unwrap();
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(250)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn zero_period_is_invalid_value() {
        let scheduler = Scheduler::start();
        let executor = Arc::new(Executor::start(1, 1, 4));
        let op = Operation::new(
            scheduler,
            executor,
            Duration::from_secs(0),
            Duration::from_secs(1),
            false,
            || async {},
        );
        assert!(matches!(op.start(), Err(AgentError::InvalidValue(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn exclusive_operation_suppresses_overlapping_tick() {
        let scheduler = Scheduler::start();
        let executor = Arc::new(Executor::start(2, 2, 16));
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let op = Operation::new(
            scheduler,
            executor,
            Duration::from_millis(50),
            Duration::from_secs(5),
            true,
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            },
        );

        op.start().unwrap();
        tokio::task::yield_now().await;

        // Second tick fires at t=50ms while the first dispatch (200ms) is
        // still in flight; it must be suppressed, not queued.
        tokio::time::advance(Duration::from_millis(60)).await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(200)).await;
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
