//! The guest-OS data-model translator seam (§1, §4.J "Guest-info
//! translation"). Mapping specific guest-OS payloads (Windows vs Linux
//! field names) onto the merged guest-info map is out of scope for the
//! core; only the trait boundary and a fixed output contract live here.

use serde_json::Value;
use std::collections::HashMap;

/// Translates a raw `guestInfo`/`interfaceAddresses` driver response into
/// the keyed map the poller merges into its per-VM guest-info record. One
/// implementation exists per guest-OS family; the poller itself never
/// branches on OS.
pub trait GuestInfoTranslator: Send + Sync {
    fn translate(&self, raw: HashMap<String, Value>) -> HashMap<String, Value>;
}

/// A translator that passes the driver's map through unchanged. Used when
/// no OS-specific field mapping is configured, and by every test in this
/// crate.
#[derive(Debug, Default)]
pub struct PassthroughTranslator;

impl GuestInfoTranslator for PassthroughTranslator {
    fn translate(&self, raw: HashMap<String, Value>) -> HashMap<String, Value> {
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn passthrough_returns_input_unchanged() {
        let mut raw = HashMap::new();
        raw.insert("os".to_string(), json!("linux"));
        let translated = PassthroughTranslator.translate(raw.clone());
        assert_eq!(translated, raw);
    }
}
