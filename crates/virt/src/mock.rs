//! A test-only [`VirtDriver`] double (§4.K). Not compiled into the
//! production binary — used by the other crates' test harnesses.

use crate::{DomainHandle, DomainSummary, DriverEvent, InterfaceAddress, VirtDriver};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast;
use uuid::Uuid;
use vda_core::error::{AgentError, AgentResult};

#[derive(Default)]
struct MockState {
    domains: HashMap<DomainHandle, DomainSummary>,
    next_handle: u64,
    agent_responses: HashMap<DomainHandle, String>,
    guest_info: HashMap<DomainHandle, HashMap<String, Value>>,
    fail_agent_commands: bool,
    last_downloaded: Option<Vec<u8>>,
    upload_payload: Option<Vec<u8>>,
}

/// An in-memory stand-in for the virtualization driver, configurable
/// enough to exercise the guest-agent poller and RPC dispatcher in tests
/// without a real hypervisor.
pub struct MockVirtDriver {
    state: Mutex<MockState>,
    events: broadcast::Sender<DriverEvent>,
}

impl Default for MockVirtDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MockVirtDriver {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(MockState::default()),
            events,
        }
    }

    /// Fires a lifecycle event to every current subscriber, for tests that
    /// exercise the event-subscriber wiring.
    pub fn fire_event(&self, event: DriverEvent) {
        let _ = self.events.send(event);
    }

    pub fn add_domain(&self, xml: impl Into<String>) -> (Uuid, DomainHandle) {
        let mut state = self.state.lock();
        let id = Uuid::new_v4();
        let handle = DomainHandle(state.next_handle);
        state.next_handle += 1;
        state.domains.insert(
            handle,
            DomainSummary {
                id,
                xml: xml.into(),
            },
        );
        (id, handle)
    }

    pub fn set_agent_response(&self, handle: DomainHandle, response: impl Into<String>) {
        self.state.lock().agent_responses.insert(handle, response.into());
    }

    pub fn set_guest_info(&self, handle: DomainHandle, info: HashMap<String, Value>) {
        self.state.lock().guest_info.insert(handle, info);
    }

    pub fn set_fail_agent_commands(&self, fail: bool) {
        self.state.lock().fail_agent_commands = fail;
    }

    /// The bytes most recently received by `download_image_from_stream`,
    /// for tests that assert on what actually crossed the wire.
    pub fn last_downloaded(&self) -> Option<Vec<u8>> {
        self.state.lock().last_downloaded.clone()
    }

    /// Overrides the bytes `upload_image_to_stream` writes out, instead of
    /// the zero-filled default, for tests that assert on response bodies.
    pub fn set_upload_payload(&self, bytes: Vec<u8>) {
        self.state.lock().upload_payload = Some(bytes);
    }
}

#[async_trait]
impl VirtDriver for MockVirtDriver {
    async fn list_domains(&self) -> AgentResult<Vec<DomainSummary>> {
        Ok(self.state.lock().domains.values().cloned().collect())
    }

    async fn lookup(&self, id: Uuid) -> AgentResult<DomainHandle> {
        self.state
            .lock()
            .domains
            .iter()
            .find(|(_, summary)| summary.id == id)
            .map(|(handle, _)| *handle)
            .ok_or_else(|| AgentError::DriverUnavailable(id.to_string()))
    }

    async fn xml_desc(&self, handle: DomainHandle) -> AgentResult<String> {
        self.state
            .lock()
            .domains
            .get(&handle)
            .map(|s| s.xml.clone())
            .ok_or_else(|| AgentError::DriverUnavailable(format!("{handle:?}")))
    }

    async fn agent_command(
        &self,
        handle: DomainHandle,
        _json_request: &str,
        _timeout: std::time::Duration,
        _flags: u32,
    ) -> AgentResult<String> {
        let state = self.state.lock();
        if state.fail_agent_commands {
            return Err(AgentError::AgentUnresponsive(format!("{handle:?}")));
        }
        state
            .agent_responses
            .get(&handle)
            .cloned()
            .ok_or_else(|| AgentError::AgentUnresponsive(format!("{handle:?}")))
    }

    async fn guest_info(
        &self,
        handle: DomainHandle,
        _types_bitmask: u32,
        _flags: u32,
    ) -> AgentResult<HashMap<String, Value>> {
        Ok(self.state.lock().guest_info.get(&handle).cloned().unwrap_or_default())
    }

    async fn interface_addresses(
        &self,
        _handle: DomainHandle,
        _source: u32,
    ) -> AgentResult<HashMap<String, InterfaceAddress>> {
        Ok(HashMap::new())
    }

    async fn download_image_from_stream(
        &self,
        _file: &str,
        length: u64,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> AgentResult<Uuid> {
        let mut buf = vec![0u8; length as usize];
        reader
            .read_exact(&mut buf)
            .await
            .map_err(|err| AgentError::Internal(format!("short image read: {err}")))?;
        self.state.lock().last_downloaded = Some(buf);
        Ok(Uuid::new_v4())
    }

    async fn upload_image_to_stream(
        &self,
        _file: &str,
        length: u64,
        writer: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> AgentResult<Uuid> {
        let buf = self
            .state
            .lock()
            .upload_payload
            .clone()
            .unwrap_or_else(|| vec![0u8; length as usize]);
        writer
            .write_all(&buf)
            .await
            .map_err(|err| AgentError::Internal(format!("short image write: {err}")))?;
        Ok(Uuid::new_v4())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<DriverEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lookup_resolves_added_domain() {
        let driver = MockVirtDriver::new();
        let (id, handle) = driver.add_domain("<domain/>");
        assert_eq!(driver.lookup(id).await.unwrap(), handle);
    }

    #[tokio::test]
    async fn agent_command_fails_when_unresponsive_flag_set() {
        let driver = MockVirtDriver::new();
        let (_, handle) = driver.add_domain("<domain/>");
        driver.set_fail_agent_commands(true);
        let err = driver
            .agent_command(handle, "{}", std::time::Duration::from_secs(1), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::AgentUnresponsive(_)));
    }

    #[tokio::test]
    async fn subscribers_see_events_fired_after_they_subscribed() {
        let driver = MockVirtDriver::new();
        let mut rx = driver.subscribe_events();
        let vm = Uuid::new_v4();
        driver.fire_event(DriverEvent::ChannelConnected(vm));
        match rx.recv().await.unwrap() {
            DriverEvent::ChannelConnected(id) => assert_eq!(id, vm),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn download_reads_exactly_length_bytes_from_reader() {
        let driver = MockVirtDriver::new();
        let mut reader = std::io::Cursor::new(b"payload-bytes".to_vec());
        let result = driver.download_image_from_stream("img", 13, &mut reader).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn upload_writes_exactly_length_bytes_to_writer() {
        let driver = MockVirtDriver::new();
        let mut out = Vec::new();
        driver.upload_image_to_stream("img", 10, &mut out).await.unwrap();
        assert_eq!(out.len(), 10);
    }
}
