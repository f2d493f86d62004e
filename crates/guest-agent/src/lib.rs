//! Guest-agent poller (§4.J): periodically probes each running VM's
//! in-guest agent capabilities and refreshes the guest-info record over
//! the side channel, without ever blocking the reactor or holding a
//! state lock across a driver call.

mod capability;
mod commands;
mod poller;
mod state;
mod translator;

pub use capability::{Capabilities, CapabilityProbeResponse, SupportedCommand};
pub use commands::{desired_commands, CommandSpec};
pub use poller::{BootPromoter, GuestAgentPoller, GuestAgentTimings, NoopPromoter, VmSource};
pub use state::PollerState;
pub use translator::{GuestInfoTranslator, PassthroughTranslator};

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;
    use vda_core::vm::{ChannelState, ManagedVm, VmStatus};
    use vda_executor::Executor;
    use vda_scheduler::Scheduler;
    use vda_virt::MockVirtDriver;

    struct SingleVmSource {
        vm: Mutex<ManagedVm>,
    }

    impl VmSource for SingleVmSource {
        fn snapshot(&self) -> Vec<ManagedVm> {
            vec![self.vm.lock().clone()]
        }
    }

    fn timings() -> GuestAgentTimings {
        GuestAgentTimings {
            poll_interval: Duration::from_millis(10),
            capability_refresh_interval: Duration::from_secs(300),
            boot_window: Duration::from_secs(120),
            failure_throttle: Duration::from_secs(60),
            command_timeout: Duration::from_secs(1),
            info_refresh_interval: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn capability_probe_populates_guest_info_for_connected_vm() {
        let driver = Arc::new(MockVirtDriver::new());
        let (id, handle) = driver.add_domain("<domain/>");
        driver.set_agent_response(
            handle,
            r#"{"version":"1.0","supported":[{"name":"disk-usage","enabled":true}]}"#,
        );
        driver.set_guest_info(handle, {
            let mut m = std::collections::HashMap::new();
            m.insert("disk-usage".to_string(), serde_json::json!({"used": 10}));
            m
        });

        let mut vm = ManagedVm::new(id);
        vm.status = VmStatus::Up;
        vm.channel_state = ChannelState::Connected;
        let vm_source = Arc::new(SingleVmSource { vm: Mutex::new(vm) });

        let scheduler = Scheduler::start();
        let executor = Arc::new(Executor::start(2, 2, 16));
        let poller = GuestAgentPoller::new(
            scheduler,
            executor,
            driver,
            Arc::new(PassthroughTranslator),
            vm_source,
            Arc::new(NoopPromoter),
            timings(),
        );
        poller.hint_channel_state(id, ChannelState::Connected);
        poller.start().unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        poller.stop();

        let caps = poller.capabilities(id);
        assert!(caps.is_known());
        assert!(caps.supports("disk-usage"));

        let info = poller.guest_info(id);
        assert_eq!(info["disk-usage"]["used"], serde_json::json!(10));
    }

    #[tokio::test]
    async fn failure_throttles_further_agent_commands() {
        let driver = Arc::new(MockVirtDriver::new());
        let (id, handle) = driver.add_domain("<domain/>");
        driver.set_fail_agent_commands(true);
        let _ = handle;

        let mut vm = ManagedVm::new(id);
        vm.status = VmStatus::Up;
        vm.channel_state = ChannelState::Connected;
        let vm_source = Arc::new(SingleVmSource { vm: Mutex::new(vm) });

        let scheduler = Scheduler::start();
        let executor = Arc::new(Executor::start(2, 2, 16));
        let poller = GuestAgentPoller::new(
            scheduler,
            executor,
            driver,
            Arc::new(PassthroughTranslator),
            vm_source,
            Arc::new(NoopPromoter),
            timings(),
        );
        poller.hint_channel_state(id, ChannelState::Connected);
        poller.start().unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        poller.stop();

        let caps = poller.capabilities(id);
        assert!(!caps.is_known());
    }
}
