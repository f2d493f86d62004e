//! The managed-VM data model (§3).

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Lifecycle status of a managed VM, as seen by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmStatus {
    WaitForLaunch,
    Up,
    Paused,
    PoweringDown,
    MigrationSource,
    MigrationDestination,
    SavingState,
    RestoringState,
    RebootInProgress,
    Down,
}

impl VmStatus {
    /// Whether the guest-agent poller is allowed to talk to this VM at all
    /// (part of the `runnable` predicate in §4.J).
    pub fn is_running(&self) -> bool {
        matches!(self, VmStatus::Up | VmStatus::RebootInProgress)
    }
}

/// Connectivity state of the in-VM guest-agent side channel (§3, §4.J).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ChannelState {
    #[default]
    Unknown,
    Connected,
    Disconnected,
}

/// A VM as tracked by the core. Mutated only by the VM lifecycle adapter
/// (§4.K) in response to driver events or RPC-invoked actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedVm {
    pub id: Uuid,
    pub status: VmStatus,
    pub last_status_change: SystemTime,
    pub channel_state: ChannelState,
    pub last_hotplug: Option<SystemTime>,
    pub boot_time: SystemTime,
}

impl ManagedVm {
    pub fn new(id: Uuid) -> Self {
        let now = SystemTime::now();
        Self {
            id,
            status: VmStatus::WaitForLaunch,
            last_status_change: now,
            channel_state: ChannelState::Unknown,
            last_hotplug: None,
            boot_time: now,
        }
    }

    pub fn set_status(&mut self, status: VmStatus) {
        if self.status != status {
            self.status = status;
            self.last_status_change = SystemTime::now();
        }
    }

    /// Seconds elapsed since `boot_time`. Used to evaluate the boot window
    /// (§4.J) without pulling a monotonic clock dependency into this crate.
    pub fn age_secs(&self, now: SystemTime) -> u64 {
        now.duration_since(self.boot_time)
            .unwrap_or_default()
            .as_secs()
    }
}

/// Epoch-millisecond timestamp, used in recovery records where a
/// `SystemTime` would not round-trip through `bincode` portably.
pub fn unix_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_status_bumps_timestamp_only_on_change() {
        let mut vm = ManagedVm::new(Uuid::new_v4());
        let t0 = vm.last_status_change;
        vm.set_status(VmStatus::WaitForLaunch);
        assert_eq!(vm.last_status_change, t0);

        std::thread::sleep(std::time::Duration::from_millis(5));
        vm.set_status(VmStatus::Up);
        assert!(vm.last_status_change > t0);
    }

    #[test]
    fn running_statuses() {
        assert!(VmStatus::Up.is_running());
        assert!(VmStatus::RebootInProgress.is_running());
        assert!(!VmStatus::Paused.is_running());
        assert!(!VmStatus::Down.is_running());
    }
}
