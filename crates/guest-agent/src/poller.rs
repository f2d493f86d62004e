//! The poller's main loop (§4.J): one periodic [`Operation`](vda_ops::Operation)
//! that fans out, via [`VmDispatcher`](vda_ops::VmDispatcher), one
//! independent task per live VM.

use crate::capability::{Capabilities, CapabilityProbeResponse};
use crate::commands::desired_commands;
use crate::state::PollerState;
use crate::translator::GuestInfoTranslator;
use serde_json::Value;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;
use vda_core::vm::{ChannelState, ManagedVm, VmStatus};
use vda_executor::Executor;
use vda_ops::{Operation, VmDispatcher, VmTask};
use vda_scheduler::Scheduler;
use vda_virt::VirtDriver;

/// Timing knobs named directly after the spec's symbols (§4.J, §4.M).
#[derive(Debug, Clone, Copy)]
pub struct GuestAgentTimings {
    /// P_poll
    pub poll_interval: Duration,
    /// P_caps
    pub capability_refresh_interval: Duration,
    /// T_boot
    pub boot_window: Duration,
    /// T_throttle
    pub failure_throttle: Duration,
    /// TCMD
    pub command_timeout: Duration,
    /// Base period for per-field refresh cadence (§4.J desired_commands).
    pub info_refresh_interval: Duration,
}

/// Source of the live VM set, owned by the composition root's VM registry.
pub trait VmSource: Send + Sync {
    fn snapshot(&self) -> Vec<ManagedVm>;
}

/// Invoked when a capability probe transitions a VM from unknown to known
/// capabilities while its lifecycle still looks like "booting" (§4.J,
/// §9 Open Question — retained per DESIGN.md).
pub trait BootPromoter: Send + Sync {
    fn promote_to_up(&self, vm: Uuid);
}

/// A no-op promoter for callers that don't wire VM lifecycle promotion
/// (e.g. unit tests exercising the poller in isolation).
pub struct NoopPromoter;
impl BootPromoter for NoopPromoter {
    fn promote_to_up(&self, _vm: Uuid) {}
}

fn lacks_external_address(info: &std::collections::HashMap<String, Value>) -> bool {
    let Some(Value::Array(ifaces)) = info.get("network-interfaces") else {
        return true;
    };
    !ifaces.iter().any(|iface| {
        iface
            .get("addrs")
            .and_then(Value::as_array)
            .map(|addrs| {
                addrs.iter().any(|a| {
                    a.as_str()
                        .map(|s| !s.starts_with("127.") && !s.starts_with("169.254.") && s != "::1" && !s.starts_with("fe80:"))
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false)
    })
}

/// Per-VM guest-agent poller, wiring (§3/§4.J) state onto the periodic
/// operation engine (§4.I) and the VM lifecycle adapter's `VirtDriver`
/// (§4.K).
pub struct GuestAgentPoller {
    state: Arc<PollerState>,
    operation: Operation,
}

impl GuestAgentPoller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scheduler: Scheduler,
        executor: Arc<Executor>,
        virt: Arc<dyn VirtDriver>,
        translator: Arc<dyn GuestInfoTranslator>,
        vm_source: Arc<dyn VmSource>,
        promoter: Arc<dyn BootPromoter>,
        timings: GuestAgentTimings,
    ) -> Self {
        let state = Arc::new(PollerState::new());

        let tick_state = state.clone();
        let tick_virt = virt.clone();
        let tick_translator = translator.clone();
        let tick_vm_source = vm_source.clone();
        let tick_promoter = promoter.clone();
        let tick_executor = executor.clone();
        let tick_timings = timings;

        let operation = Operation::new(
            scheduler,
            executor,
            timings.poll_interval,
            timings.command_timeout,
            false,
            move || {
                let state = tick_state.clone();
                let virt = tick_virt.clone();
                let translator = tick_translator.clone();
                let vm_source = tick_vm_source.clone();
                let promoter = tick_promoter.clone();
                let executor = tick_executor.clone();
                let timings = tick_timings;
                async move { run_tick(state, virt, translator, vm_source, promoter, executor, timings).await }
            },
        );

        Self { state, operation }
    }

    pub fn start(&self) -> vda_core::error::AgentResult<()> {
        self.operation.start()
    }

    pub fn stop(&self) {
        self.operation.stop()
    }

    /// Out-of-band channel-state hint (e.g. from a side channel other
    /// than the driver's own lifecycle events); adopted only while the
    /// VM's channel state is still unknown (§4.J main loop).
    pub fn hint_channel_state(&self, vm: Uuid, state: ChannelState) {
        self.state.set_channel_hint(vm, state);
    }

    /// Applies a driver-reported channel lifecycle transition (§4.K).
    pub fn on_channel_event(&self, vm: Uuid, state: ChannelState) {
        self.state.set_channel_state(vm, state);
    }

    pub fn guest_info(&self, vm: Uuid) -> std::collections::HashMap<String, Value> {
        self.state.guest_info(vm)
    }

    pub fn capabilities(&self, vm: Uuid) -> Capabilities {
        self.state.capabilities(vm)
    }
}

async fn run_tick(
    state: Arc<PollerState>,
    virt: Arc<dyn VirtDriver>,
    translator: Arc<dyn GuestInfoTranslator>,
    vm_source: Arc<dyn VmSource>,
    promoter: Arc<dyn BootPromoter>,
    executor: Arc<Executor>,
    timings: GuestAgentTimings,
) {
    let vms = vm_source.snapshot();
    let live_ids: HashSet<Uuid> = vms.iter().map(|vm| vm.id).collect();
    let cleanup_state = state.clone();

    let dispatcher = VmDispatcher::new(
        move || vms.clone(),
        executor,
        move |vm: &ManagedVm| {
            let vm = vm.clone();
            let state = state.clone();
            let virt = virt.clone();
            let translator = translator.clone();
            let promoter = promoter.clone();
            let timings = timings;
            let run: Pin<Box<dyn Future<Output = ()> + Send>> =
                Box::pin(async move { poll_one_vm(vm, state, virt, translator, promoter, timings).await });
            VmTask {
                required: true,
                runnable: vm.status != VmStatus::Down,
                run,
            }
        },
        timings.command_timeout,
    );

    dispatcher.tick().await;
    cleanup_state.cleanup_stale(&live_ids);
}

async fn poll_one_vm(
    vm: ManagedVm,
    state: Arc<PollerState>,
    virt: Arc<dyn VirtDriver>,
    translator: Arc<dyn GuestInfoTranslator>,
    promoter: Arc<dyn BootPromoter>,
    timings: GuestAgentTimings,
) {
    let now = Instant::now();
    state.adopt_pending_hint(vm.id);

    let boot_window = vm.age_secs(std::time::SystemTime::now()) < timings.boot_window.as_secs();

    if !state.runnable(vm.id, now, timings.failure_throttle) || !vm.status.is_running() {
        return;
    }

    let Ok(handle) = virt.lookup(vm.id).await else {
        debug!(vm = %vm.id, "guest-agent poll skipped: VM not resolvable against driver");
        return;
    };

    if boot_window || state.caps_due(vm.id, now, timings.capability_refresh_interval) {
        probe_capabilities(&vm, handle, &state, &virt, &promoter, now).await;
    }

    let caps = state.capabilities(vm.id);
    if !caps.is_known() {
        return;
    }

    let mut bitmask: u32 = 0;
    let commands = desired_commands(timings.info_refresh_interval);
    for cmd in &commands {
        if !caps.supports(cmd.name) {
            continue;
        }
        let forced = boot_window && cmd.name == "network-interfaces" && lacks_external_address(&state.guest_info(vm.id));
        if state.command_elapsed(vm.id, cmd.name, now) < cmd.period && !forced {
            continue;
        }
        if cmd.local_only {
            run_local_command(&vm, handle, cmd.name, &state, &virt, &translator, now).await;
        } else {
            bitmask |= cmd.bit;
            // Marked checked eagerly; corrected back out on failure below
            // so `last_check` stays monotonically non-decreasing (§8).
            state.mark_command_checked(vm.id, cmd.name, now);
        }
    }

    if bitmask != 0 {
        match tokio::time::timeout(
            timings.command_timeout,
            virt.guest_info(handle, bitmask, 0),
        )
        .await
        {
            Ok(Ok(info)) => {
                let translated = translator.translate(info);
                state.merge_guest_info(vm.id, translated);
            }
            Ok(Err(err)) => {
                warn!(vm = %vm.id, error = %err, "guest-info query failed");
                state.set_failure(vm.id, now);
            }
            Err(_) => {
                warn!(vm = %vm.id, "guest-info query timed out");
                state.set_failure(vm.id, now);
            }
        }
    }
}

async fn probe_capabilities(
    vm: &ManagedVm,
    handle: vda_virt::DomainHandle,
    state: &Arc<PollerState>,
    virt: &Arc<dyn VirtDriver>,
    promoter: &Arc<dyn BootPromoter>,
    now: Instant,
) {
    let result = virt.agent_command(handle, r#"{"execute":"guest-info"}"#, Duration::from_secs(10), 0).await;
    state.mark_caps_checked(vm.id, now);

    match result {
        Ok(raw) => match serde_json::from_str::<CapabilityProbeResponse>(&raw) {
            Ok(resp) => {
                let became_known = state.set_capabilities(vm.id, resp.into());
                if became_known && matches!(vm.status, VmStatus::WaitForLaunch | VmStatus::RebootInProgress) {
                    promoter.promote_to_up(vm.id);
                }
            }
            Err(err) => {
                warn!(vm = %vm.id, error = %err, "malformed capability probe response");
            }
        },
        Err(err) => {
            debug!(vm = %vm.id, error = %err, "capability probe failed");
            state.set_failure(vm.id, now);
        }
    }
}

async fn run_local_command(
    vm: &ManagedVm,
    handle: vda_virt::DomainHandle,
    name: &'static str,
    state: &Arc<PollerState>,
    virt: &Arc<dyn VirtDriver>,
    translator: &Arc<dyn GuestInfoTranslator>,
    now: Instant,
) {
    debug_assert_eq!(name, "network-interfaces");
    match virt.interface_addresses(handle, 0).await {
        Ok(ifaces) => {
            let raw: std::collections::HashMap<String, Value> = [(
                "network-interfaces".to_string(),
                serde_json::to_value(
                    ifaces
                        .into_iter()
                        .map(|(iface, addr)| {
                            serde_json::json!({
                                "name": iface,
                                "hwaddr": addr.hwaddr,
                                "addrs": addr.addrs,
                            })
                        })
                        .collect::<Vec<_>>(),
                )
                .unwrap_or(Value::Null),
            )]
            .into_iter()
            .collect();
            state.merge_guest_info(vm.id, translator.translate(raw));
            state.mark_command_checked(vm.id, name, now);
        }
        Err(err) => {
            warn!(vm = %vm.id, error = %err, "interface-address refresh failed");
            state.set_failure(vm.id, now);
        }
    }
}

/// Runs the stale-entry sweep (§4.J "Cleanup") against a live-id set.
/// Exposed separately from [`run_tick`] so the composition root can call
/// it from the VM registry's own removal path as well as from the
/// poller's own tick.
pub fn cleanup_stale(state: &PollerState, live: &HashSet<Uuid>) {
    state.cleanup_stale(live);
}
