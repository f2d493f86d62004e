//! Guest-Agent Capability Record (§3, §4.J "Capability probe").

use std::collections::HashSet;

/// `{version, commands: set}`; `version = None` means "not yet probed".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub version: Option<String>,
    pub commands: HashSet<String>,
}

impl Capabilities {
    pub fn is_known(&self) -> bool {
        self.version.is_some()
    }

    pub fn supports(&self, command: &str) -> bool {
        self.commands.contains(command)
    }
}

/// Raw shape of a `guest-info` capability probe response, as decoded from
/// the guest agent's JSON reply to `agent_command`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct CapabilityProbeResponse {
    pub version: String,
    pub supported: Vec<SupportedCommand>,
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct SupportedCommand {
    pub name: String,
    pub enabled: bool,
}

impl From<CapabilityProbeResponse> for Capabilities {
    fn from(resp: CapabilityProbeResponse) -> Self {
        Self {
            version: Some(resp.version),
            commands: resp
                .supported
                .into_iter()
                .filter(|c| c.enabled)
                .map(|c| c.name)
                .collect(),
        }
    }
}
