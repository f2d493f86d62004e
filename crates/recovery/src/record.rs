//! The `RecoveryRecord` persisted shape (§4.L, §6).

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vda_core::vm::{unix_millis, ChannelState, VmStatus};

/// Everything the composition root needs to re-synchronize driver state for
/// one VM after a restart, without re-deriving it from the driver alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryRecord {
    pub vm_id: Uuid,
    pub status: VmStatus,
    pub channel_state: ChannelState,
    pub last_status_change_ms: u64,
}

impl RecoveryRecord {
    pub fn new(vm_id: Uuid, status: VmStatus) -> Self {
        Self {
            vm_id,
            status,
            channel_state: ChannelState::Unknown,
            last_status_change_ms: unix_millis(std::time::SystemTime::now()),
        }
    }
}
