//! Protocol detection (§4.C): peek the first bytes of an accepted connection
//! and route it to whichever sub-protocol owns that prefix.

use std::time::Duration;

/// A thing that can claim ownership of a connection based on its prefix.
pub trait ProtocolDetector: Send + Sync {
    /// Human-readable name, used in logs.
    fn name(&self) -> &'static str;

    /// Longest byte count this detector ever needs to make a decision.
    fn prefix_len(&self) -> usize;

    /// Whether `prefix` (which may be shorter than `prefix_len` if the
    /// connection sent less before the idle window elapsed) belongs to
    /// this protocol.
    fn matches(&self, prefix: &[u8]) -> bool;
}

/// Holds the registered detectors in priority order and the shared idle
/// window used when nothing matches (§4.C, default 60s).
pub struct ProtocolRouter {
    detectors: Vec<Box<dyn ProtocolDetector>>,
    idle_window: Duration,
}

impl ProtocolRouter {
    pub fn new(idle_window: Duration) -> Self {
        Self {
            detectors: Vec::new(),
            idle_window,
        }
    }

    pub fn register(&mut self, detector: Box<dyn ProtocolDetector>) {
        self.detectors.push(detector);
    }

    pub fn idle_window(&self) -> Duration {
        self.idle_window
    }

    /// Longest prefix any registered detector needs.
    pub fn max_prefix_len(&self) -> usize {
        self.detectors
            .iter()
            .map(|d| d.prefix_len())
            .max()
            .unwrap_or(0)
    }

    /// First detector (in registration order) whose `matches` returns true.
    pub fn route(&self, prefix: &[u8]) -> Option<&str> {
        self.detectors
            .iter()
            .find(|d| d.matches(prefix))
            .map(|d| d.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Prefixed {
        name: &'static str,
        prefix: &'static [u8],
    }

    impl ProtocolDetector for Prefixed {
        fn name(&self) -> &'static str {
            self.name
        }

        fn prefix_len(&self) -> usize {
            self.prefix.len()
        }

        fn matches(&self, prefix: &[u8]) -> bool {
            prefix.starts_with(self.prefix)
        }
    }

    #[test]
    fn first_registered_match_wins() {
        let mut router = ProtocolRouter::new(Duration::from_secs(60));
        router.register(Box::new(Prefixed {
            name: "bus",
            prefix: b"CONNECT",
        }));
        router.register(Box::new(Prefixed {
            name: "http-image",
            prefix: b"PUT",
        }));

        assert_eq!(router.route(b"CONNECT\naccept"), Some("bus"));
        assert_eq!(router.route(b"PUT /images/foo"), Some("http-image"));
        assert_eq!(router.route(b"GARBAGE"), None);
        assert_eq!(router.max_prefix_len(), 7);
    }
}
