//! `VmDispatcher(get_vms, executor, make_task, timeout)` (§4.I): fans a
//! single tick out into one independent dispatch per VM, skipping VMs
//! whose constructed task reports `required == false` or
//! `runnable == false`.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use vda_executor::Executor;

/// What `make_task` decides for one VM before the dispatcher commits to
/// running it.
pub struct VmTask<Fut> {
    pub required: bool,
    pub runnable: bool,
    pub run: Fut,
}

impl<Fut> VmTask<Fut> {
    pub fn skip() -> VmTask<Fut>
    where
        Fut: Default,
    {
        VmTask {
            required: false,
            runnable: false,
            run: Fut::default(),
        }
    }
}

pub struct VmDispatcher<Vm, GetVms, MakeTask, Fut>
where
    Fut: Future<Output = ()> + Send + 'static,
{
    get_vms: GetVms,
    executor: Arc<Executor>,
    make_task: MakeTask,
    timeout: Duration,
    _marker: std::marker::PhantomData<(Vm, Fut)>,
}

impl<Vm, GetVms, MakeTask, Fut> VmDispatcher<Vm, GetVms, MakeTask, Fut>
where
    GetVms: Fn() -> Vec<Vm>,
    MakeTask: Fn(&Vm) -> VmTask<Fut>,
    Fut: Future<Output = ()> + Send + 'static,
{
    pub fn new(get_vms: GetVms, executor: Arc<Executor>, make_task: MakeTask, timeout: Duration) -> Self {
        Self {
            get_vms,
            executor,
            make_task,
            timeout,
            _marker: std::marker::PhantomData,
        }
    }

    /// Iterates the current VM set and dispatches each runnable, required
    /// task independently.
    pub async fn tick(&self) {
        for vm in (self.get_vms)() {
            let task = (self.make_task)(&vm);
            if !task.required || !task.runnable {
                debug!("skipping VM task: not required or not runnable");
                continue;
            }
            if let Err(err) = self.executor.dispatch(task.run, self.timeout) {
                debug!(error = %err, "VM task dispatch failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    #[tokio::test]
    async fn skips_vms_whose_task_is_not_required_or_not_runnable() {
        let executor = Arc::new(Executor::start(2, 2, 16));
        let ran = Arc::new(Mutex::new(Vec::new()));

        let vms = vec![("a", true, true), ("b", false, true), ("c", true, false)];
        let r = ran.clone();
        let dispatcher = VmDispatcher::new(
            move || vms.clone(),
            executor,
            move |vm: &(&str, bool, bool)| {
                let name = vm.0.to_string();
                let r = r.clone();
                VmTask {
                    required: vm.1,
                    runnable: vm.2,
                    run: Box::pin(async move {
                        r.lock().unwrap().push(name);
                    }) as std::pin::Pin<Box<dyn Future<Output = ()> + Send>>,
                }
            },
            Duration::from_secs(1),
        );

        dispatcher.tick().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(*ran.lock().unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn dispatches_every_runnable_vm_independently() {
        let executor = Arc::new(Executor::start(4, 4, 16));
        let count = Arc::new(AtomicU32::new(0));

        let vms: Vec<u32> = (0..5).collect();
        let c = count.clone();
        let dispatcher = VmDispatcher::new(
            move || vms.clone(),
            executor,
            move |_vm: &u32| {
                let c = c.clone();
                VmTask {
                    required: true,
                    runnable: true,
                    run: Box::pin(async move {
                        c.fetch_add(1, Ordering::SeqCst);
                    }) as std::pin::Pin<Box<dyn Future<Output = ()> + Send>>,
                }
            },
            Duration::from_secs(1),
        );

        dispatcher.tick().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }
}
