//! VM lifecycle adapter (§4.K): a thin async facade over the
//! virtualization driver, exposing only the operations the core consumes.

mod mock;

pub use mock::MockVirtDriver;

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;
use vda_core::error::AgentResult;

/// Opaque driver-side domain reference. The adapter never interprets this
/// beyond passing it back to later calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DomainHandle(pub u64);

#[derive(Debug, Clone)]
pub struct DomainSummary {
    pub id: Uuid,
    pub xml: String,
}

#[derive(Debug, Clone)]
pub struct InterfaceAddress {
    pub hwaddr: String,
    pub addrs: Vec<String>,
}

/// Lifecycle events delivered on the driver's own notification channel and
/// fanned into the VM registry and the guest-agent poller by the
/// composition root's event-subscriber task (§4.K). Carries the VM's own
/// id rather than a [`DomainHandle`] since every consumer on this side
/// addresses VMs by id, not by driver handle.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    /// The guest-agent side channel came up.
    ChannelConnected(Uuid),
    /// The guest-agent side channel dropped, or the domain stopped.
    ChannelDisconnected(Uuid),
}

/// Facade over the virtualization driver. Errors are always one of
/// [`vda_core::error::AgentError::DriverUnavailable`],
/// [`vda_core::error::AgentError::AgentUnresponsive`], or
/// [`vda_core::error::AgentError::Internal`] — driver-native exceptions
/// never cross this boundary untagged (§4.K).
#[async_trait]
pub trait VirtDriver: Send + Sync {
    async fn list_domains(&self) -> AgentResult<Vec<DomainSummary>>;

    async fn lookup(&self, id: Uuid) -> AgentResult<DomainHandle>;

    async fn xml_desc(&self, handle: DomainHandle) -> AgentResult<String>;

    async fn agent_command(
        &self,
        handle: DomainHandle,
        json_request: &str,
        timeout: std::time::Duration,
        flags: u32,
    ) -> AgentResult<String>;

    async fn guest_info(
        &self,
        handle: DomainHandle,
        types_bitmask: u32,
        flags: u32,
    ) -> AgentResult<HashMap<String, Value>>;

    async fn interface_addresses(
        &self,
        handle: DomainHandle,
        source: u32,
    ) -> AgentResult<HashMap<String, InterfaceAddress>>;

    /// Streams an incoming image payload of `length` bytes from `reader`
    /// into storage, consumed by the HTTP image transport's `PUT` handler
    /// (§4.D). The transport has already buffered any bytes it read ahead
    /// of this call into `reader`'s front.
    async fn download_image_from_stream(
        &self,
        file: &str,
        length: u64,
        reader: &mut (dyn tokio::io::AsyncRead + Unpin + Send),
    ) -> AgentResult<Uuid>;

    /// Streams an existing image of `length` bytes out to `writer`,
    /// consumed by the HTTP image transport's `GET` handler (§4.D), after
    /// the transport has already written the response headers.
    async fn upload_image_to_stream(
        &self,
        file: &str,
        length: u64,
        writer: &mut (dyn tokio::io::AsyncWrite + Unpin + Send),
    ) -> AgentResult<Uuid>;

    /// Subscribes to this driver's lifecycle event stream. Called once by
    /// the composition root at startup; every subscriber sees every event
    /// from the point it subscribed onward (§4.K).
    fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<DriverEvent>;
}
