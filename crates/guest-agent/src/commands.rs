//! The desired command set (§4.J main loop): each guest-info field the
//! poller refreshes has a name matching a guest-agent capability, a bit in
//! the `guestInfo` types bitmask, a minimum refresh period, and whether it
//! is answered directly by the adapter rather than the guest agent
//! (`local_only`, e.g. network interfaces discovered via `libvirt`'s own
//! `interfaceAddresses` rather than a round-trip through the guest agent).

use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    pub bit: u32,
    pub period: Duration,
    pub local_only: bool,
}

/// The fixed set of guest-info fields this poller knows how to refresh.
/// Extending the set the translator can *produce* is a non-goal (§1); this
/// list only drives the *polling cadence*, not the translated shape.
pub fn desired_commands(info_refresh: Duration) -> Vec<CommandSpec> {
    vec![
        // Answered via the adapter's own `interfaceAddresses` call rather
        // than a `guestInfo` round-trip, so it is "local-only" (§4.J).
        CommandSpec {
            name: "network-interfaces",
            bit: 0,
            period: info_refresh,
            local_only: true,
        },
        CommandSpec {
            name: "disk-usage",
            bit: 1 << 1,
            period: info_refresh,
            local_only: false,
        },
        CommandSpec {
            name: "installed-users",
            bit: 1 << 2,
            period: info_refresh * 6,
            local_only: false,
        },
        CommandSpec {
            name: "os-version",
            bit: 1 << 3,
            period: info_refresh * 6,
            local_only: false,
        },
        CommandSpec {
            name: "timezone",
            bit: 1 << 4,
            period: info_refresh * 6,
            local_only: false,
        },
    ]
}
