//! The live VM set the composition root owns (§3, §6): backs both the
//! guest-agent poller's [`VmSource`] and its [`BootPromoter`] seam, and
//! keeps the recovery store in sync with every status change.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;
use vda_core::vm::{ChannelState, ManagedVm, VmStatus};
use vda_guest_agent::{BootPromoter, VmSource};
use vda_recovery::{RecoveryRecord, RecoveryStore};

pub struct VmRegistry {
    vms: RwLock<HashMap<Uuid, ManagedVm>>,
    recovery: Arc<RecoveryStore>,
}

impl VmRegistry {
    pub fn new(recovery: Arc<RecoveryStore>) -> Self {
        Self {
            vms: RwLock::new(HashMap::new()),
            recovery,
        }
    }

    /// Rehydrates the in-memory set from persisted recovery records at
    /// startup (§6 "Persisted state").
    pub fn restore(&self, records: Vec<RecoveryRecord>) {
        let mut vms = self.vms.write();
        for record in records {
            let mut vm = ManagedVm::new(record.vm_id);
            vm.status = record.status;
            vm.channel_state = record.channel_state;
            vms.insert(record.vm_id, vm);
        }
    }

    pub fn get(&self, id: Uuid) -> Option<ManagedVm> {
        self.vms.read().get(&id).cloned()
    }

    pub fn list(&self) -> Vec<ManagedVm> {
        self.vms.read().values().cloned().collect()
    }

    /// Applies a status transition and persists it, removing the recovery
    /// record once the VM reaches `Down` (§4.L).
    pub fn set_status(&self, id: Uuid, status: VmStatus) {
        let mut vms = self.vms.write();
        let vm = vms.entry(id).or_insert_with(|| ManagedVm::new(id));
        vm.set_status(status);
        let record = RecoveryRecord::new(id, vm.status);
        drop(vms);

        let result = if status == VmStatus::Down {
            self.recovery.remove(id)
        } else {
            self.recovery.put(id, &record)
        };
        if let Err(err) = result {
            warn!(vm = %id, error = %err, "failed to persist VM recovery record");
        }
    }

    pub fn set_channel_state(&self, id: Uuid, state: ChannelState) {
        if let Some(vm) = self.vms.write().get_mut(&id) {
            vm.channel_state = state;
        }
    }
}

impl VmSource for VmRegistry {
    fn snapshot(&self) -> Vec<ManagedVm> {
        self.list()
    }
}

impl BootPromoter for VmRegistry {
    fn promote_to_up(&self, vm: Uuid) {
        self.set_status(vm, VmStatus::Up);
    }
}
