//! Composition root (§4.O): wires the bus reactor, HTTP image transport,
//! JSON-RPC method registry, guest-agent poller, and recovery store
//! together and drives them until a shutdown signal arrives.

mod reactor;

use clap::Parser;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use vda_bus::BusAdapter;
use vda_config::AgentConfig;
use vda_core::error::{AgentError, AgentResult};
use vda_core::shutdown::{Shutdown, ShutdownCoordinator, ShutdownError, SignalHandler};
use vda_core::vm::ChannelState;
use vda_executor::Executor;
use vda_guest_agent::{GuestAgentPoller, GuestAgentTimings, PassthroughTranslator};
use vda_http_image::ImageTransport;
use vda_node::{register_vm_methods, vm_registry::VmRegistry};
use vda_recovery::RecoveryStore;
use vda_rpc::{Dispatcher, MethodRegistry, OverrideTable};
use vda_scheduler::Scheduler;
use vda_virt::{DriverEvent, MockVirtDriver, VirtDriver};

#[derive(Parser, Debug)]
#[command(name = "vda-node", about = "Virtualization management agent")]
struct Args {
    /// Path to the TOML configuration file. Missing file falls back to
    /// built-in defaults (§4.M).
    #[arg(long, default_value = "/etc/vda/agent.toml")]
    config: PathBuf,
}

struct ComponentShutdown<F> {
    name: &'static str,
    priority: u32,
    func: F,
}

#[async_trait::async_trait]
impl<F, Fut> Shutdown for ComponentShutdown<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), ShutdownError>> + Send,
{
    fn name(&self) -> &str {
        self.name
    }

    fn shutdown_priority(&self) -> u32 {
        self.priority
    }

    async fn shutdown(&self) -> Result<(), ShutdownError> {
        (self.func)().await
    }
}

#[tokio::main]
async fn main() -> AgentResult<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config = match AgentConfig::load(&args.config) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %err, path = %args.config.display(), "using default configuration");
            AgentConfig::default()
        }
    };

    let recovery = Arc::new(RecoveryStore::open(&config.recovery.store_path).map_err(|err| {
        AgentError::Internal(format!("failed to open recovery store: {err}"))
    })?);
    let records = recovery.load_all().unwrap_or_else(|err| {
        warn!(error = %err, "failed to load recovery records, starting with an empty VM set");
        Vec::new()
    });
    let vm_registry = Arc::new(VmRegistry::new(recovery.clone()));
    vm_registry.restore(records);

    // No libvirt binding crate is available in this workspace; the mock
    // driver stands in for the production adapter until one is vendored.
    let virt: Arc<dyn VirtDriver> = Arc::new(MockVirtDriver::new());

    let mut method_registry = MethodRegistry::new();
    register_vm_methods(&mut method_registry, vm_registry.clone());

    let recovering = Arc::new(AtomicBool::new(true));
    let dispatcher = Arc::new(Dispatcher::new(method_registry, OverrideTable::new(), recovering));
    dispatcher.mark_recovery_complete();

    let mut internal_routes = HashSet::new();
    internal_routes.insert("jms.vdsm.requests".to_string());
    let bus_adapter = BusAdapter::new(dispatcher, internal_routes, config.bus.heartbeat_min.as_millis() as u64);

    let scheduler = Scheduler::start();
    let executor = Arc::new(Executor::start(
        config.executor.workers_count,
        config.executor.max_workers,
        config.executor.queue_size,
    ));

    let poller_timings = GuestAgentTimings {
        poll_interval: config.poller.poll_interval,
        capability_refresh_interval: config.poller.capability_refresh_interval,
        boot_window: config.poller.boot_window,
        failure_throttle: config.poller.failure_throttle,
        command_timeout: config.poller.command_timeout,
        info_refresh_interval: config.poller.poll_interval,
    };
    let poller = Arc::new(GuestAgentPoller::new(
        scheduler,
        executor.clone(),
        virt.clone(),
        Arc::new(PassthroughTranslator),
        vm_registry.clone(),
        vm_registry.clone(),
        poller_timings,
    ));
    poller.start()?;

    // Fans the driver's lifecycle notification channel out to every
    // consumer that tracks guest-agent channel state, mirroring the
    // driver's own idea of which VMs are reachable (§4.K).
    let mut driver_events = virt.subscribe_events();
    let event_poller = poller.clone();
    let event_registry = vm_registry.clone();
    tokio::spawn(async move {
        loop {
            match driver_events.recv().await {
                Ok(event) => {
                    let (vm_id, state) = match event {
                        DriverEvent::ChannelConnected(id) => (id, ChannelState::Connected),
                        DriverEvent::ChannelDisconnected(id) => (id, ChannelState::Disconnected),
                    };
                    event_poller.on_channel_event(vm_id, state);
                    event_registry.set_channel_state(vm_id, state);
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "driver event subscriber lagged, events dropped");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let image_transport = Arc::new(ImageTransport::start(virt.clone(), config.http_image.queue_depth, config.executor.workers_count));

    let listener = TcpListener::bind(config.bus.listen_address).await.map_err(|err| {
        AgentError::Internal(format!("failed to bind {}: {err}", config.bus.listen_address))
    })?;
    info!(address = %config.bus.listen_address, "listening");

    let shutdown_coordinator = Arc::new(ShutdownCoordinator::new());
    let shutdown_signal = shutdown_coordinator.get_shutdown_signal();

    let reactor_handle = tokio::spawn(reactor::run(
        listener,
        bus_adapter,
        image_transport,
        config.bus.protocol_detect_window,
        config.bus.heartbeat_min.as_millis() as u64,
        shutdown_signal,
    ));

    shutdown_coordinator
        .register_component(Arc::new(ComponentShutdown {
            name: "reactor",
            priority: 10,
            func: || async { Ok::<(), ShutdownError>(()) },
        }))
        .await;

    let poller_for_shutdown = poller.clone();
    shutdown_coordinator
        .register_component(Arc::new(ComponentShutdown {
            name: "guest-agent-poller",
            priority: 30,
            func: move || {
                let poller = poller_for_shutdown.clone();
                async move {
                    poller.stop();
                    Ok::<(), ShutdownError>(())
                }
            },
        }))
        .await;

    let executor_for_shutdown = executor.clone();
    shutdown_coordinator
        .register_component(Arc::new(ComponentShutdown {
            name: "executor",
            priority: 50,
            func: move || {
                let executor = executor_for_shutdown.clone();
                async move {
                    executor.stop(true).await;
                    Ok::<(), ShutdownError>(())
                }
            },
        }))
        .await;

    let recovery_for_shutdown = recovery.clone();
    shutdown_coordinator
        .register_component(Arc::new(ComponentShutdown {
            name: "recovery-store",
            priority: 70,
            func: move || {
                let recovery = recovery_for_shutdown.clone();
                async move {
                    recovery
                        .flush()
                        .map_err(|err| ShutdownError::ComponentError(err.to_string()))
                }
            },
        }))
        .await;

    SignalHandler::new(shutdown_coordinator.clone()).start().await;

    let _ = reactor_handle.await;
    info!("vda-node exiting");
    Ok(())
}
