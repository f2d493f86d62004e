//! Per-VM poller state (§3 "Guest-Agent Capability Record", "Guest-Info
//! Record", "Failure Ledger"; §4.J). Each map is guarded by its own lock,
//! per §5's "no map lock is held across any driver call".

use crate::capability::Capabilities;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};
use uuid::Uuid;
use vda_core::vm::ChannelState;

#[derive(Default)]
pub struct PollerState {
    capabilities: Mutex<HashMap<Uuid, Capabilities>>,
    channel_state: Mutex<HashMap<Uuid, ChannelState>>,
    channel_hints: Mutex<HashMap<Uuid, ChannelState>>,
    last_failure: Mutex<HashMap<Uuid, Instant>>,
    last_caps_check: Mutex<HashMap<Uuid, Instant>>,
    last_command_check: Mutex<HashMap<Uuid, HashMap<&'static str, Instant>>>,
    guest_info: Mutex<HashMap<Uuid, HashMap<String, Value>>>,
}

impl PollerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the poller may contact this VM's guest agent at all: not
    /// within the post-failure throttle window, and its side channel is
    /// connected (§4.J "Runnable predicate"; VM lifecycle status is
    /// checked by the caller).
    pub fn runnable(&self, vm: Uuid, now: Instant, throttle: Duration) -> bool {
        let throttled = self
            .last_failure
            .lock()
            .get(&vm)
            .map(|&t| now.duration_since(t) < throttle)
            .unwrap_or(false);
        if throttled {
            return false;
        }
        matches!(self.channel_state.lock().get(&vm), Some(ChannelState::Connected))
    }

    /// Adopts a pending out-of-band channel-state hint if the current
    /// state is still `Unknown` (§4.J main loop). The hint is consumed
    /// either way.
    pub fn adopt_pending_hint(&self, vm: Uuid) {
        let Some(hint) = self.channel_hints.lock().remove(&vm) else {
            return;
        };
        let mut states = self.channel_state.lock();
        let current = states.entry(vm).or_insert(ChannelState::Unknown);
        if *current == ChannelState::Unknown {
            *current = hint;
        }
    }

    pub fn set_channel_hint(&self, vm: Uuid, hint: ChannelState) {
        self.channel_hints.lock().insert(vm, hint);
    }

    /// Applies a lifecycle-event-driven channel transition. Clears the
    /// failure throttle on `Disconnected -> Connected` so the VM can
    /// recover promptly (§4.J "Failure throttling").
    pub fn set_channel_state(&self, vm: Uuid, new_state: ChannelState) {
        let previous = {
            let mut states = self.channel_state.lock();
            states.insert(vm, new_state)
        };
        if previous == Some(ChannelState::Disconnected) && new_state == ChannelState::Connected {
            self.last_failure.lock().remove(&vm);
        }
    }

    pub fn channel_state(&self, vm: Uuid) -> ChannelState {
        self.channel_state.lock().get(&vm).copied().unwrap_or_default()
    }

    pub fn set_failure(&self, vm: Uuid, now: Instant) {
        self.last_failure.lock().insert(vm, now);
    }

    pub fn capabilities(&self, vm: Uuid) -> Capabilities {
        self.capabilities.lock().get(&vm).cloned().unwrap_or_default()
    }

    /// Returns whether this probe transitioned capabilities from unknown
    /// to known (used to decide whether to promote VM lifecycle to `Up`).
    pub fn set_capabilities(&self, vm: Uuid, caps: Capabilities) -> bool {
        let mut all = self.capabilities.lock();
        let was_unknown = all.get(&vm).map(|c| !c.is_known()).unwrap_or(true);
        all.insert(vm, caps);
        was_unknown
    }

    pub fn caps_due(&self, vm: Uuid, now: Instant, period: Duration) -> bool {
        match self.last_caps_check.lock().get(&vm) {
            Some(&last) => now.duration_since(last) >= period,
            None => true,
        }
    }

    pub fn mark_caps_checked(&self, vm: Uuid, now: Instant) {
        self.last_caps_check.lock().insert(vm, now);
    }

    pub fn command_elapsed(&self, vm: Uuid, command: &'static str, now: Instant) -> Duration {
        self.last_command_check
            .lock()
            .get(&vm)
            .and_then(|per_vm| per_vm.get(command))
            .map(|&last| now.duration_since(last))
            .unwrap_or(Duration::MAX)
    }

    pub fn mark_command_checked(&self, vm: Uuid, command: &'static str, now: Instant) {
        self.last_command_check
            .lock()
            .entry(vm)
            .or_default()
            .insert(command, now);
    }

    /// Merge-wise update: new keys overlay old, stale keys remain visible
    /// until refreshed (§3 "Guest-Info Record" invariant).
    pub fn merge_guest_info(&self, vm: Uuid, update: HashMap<String, Value>) {
        self.guest_info.lock().entry(vm).or_default().extend(update);
    }

    pub fn guest_info(&self, vm: Uuid) -> HashMap<String, Value> {
        self.guest_info.lock().get(&vm).cloned().unwrap_or_default()
    }

    /// Removes every per-VM entry for ids no longer in `live`. Idempotent:
    /// calling it twice with the same set is a no-op the second time
    /// (§4.J "Cleanup").
    pub fn cleanup_stale(&self, live: &HashSet<Uuid>) {
        self.capabilities.lock().retain(|id, _| live.contains(id));
        self.channel_state.lock().retain(|id, _| live.contains(id));
        self.channel_hints.lock().retain(|id, _| live.contains(id));
        self.last_failure.lock().retain(|id, _| live.contains(id));
        self.last_caps_check.lock().retain(|id, _| live.contains(id));
        self.last_command_check.lock().retain(|id, _| live.contains(id));
        self.guest_info.lock().retain(|id, _| live.contains(id));
    }
}
