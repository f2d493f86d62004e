//! The broker side of the text-framed protocol (§4.E).

use crate::heartbeat::{format_heartbeat_header, negotiate, parse_heartbeat_header};
use crate::registry::{ConnectionId, DestinationRegistry, ReplyRoute};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::warn;
use vda_protocol::CommandFrame;
use vda_rpc::{Dispatcher, RpcBody, RpcRequest, RpcResponse};

fn error_frame(message: &str) -> CommandFrame {
    CommandFrame::new("ERROR").with_body(message.as_bytes().to_vec())
}

fn clone_with_header(frame: &CommandFrame, key: &str, value: &str) -> CommandFrame {
    let mut out = CommandFrame::new(frame.command.clone()).with_body(frame.body.clone());
    for (k, v) in frame.headers() {
        out = out.with_header(k.clone(), v.clone());
    }
    out.with_header(key, value)
}

/// Broker state and behavior for one message-bus listener. Owned and driven
/// by a single task (§5 "mutated only from the adapter's owning task").
pub struct BusAdapter {
    registry: DestinationRegistry,
    dispatcher: Arc<Dispatcher>,
    /// Destinations that are internal RPC request queues rather than plain
    /// pub/sub topics (§4.E "configured set of internal request queues").
    internal_routes: HashSet<String>,
    heartbeat_floor_ms: u64,
}

impl BusAdapter {
    pub fn new(dispatcher: Arc<Dispatcher>, internal_routes: HashSet<String>, heartbeat_floor_ms: u64) -> Self {
        Self {
            registry: DestinationRegistry::new(),
            dispatcher,
            internal_routes,
            heartbeat_floor_ms,
        }
    }

    pub fn registry_mut(&mut self) -> &mut DestinationRegistry {
        &mut self.registry
    }

    pub fn on_connection_closed(&mut self, connection: ConnectionId) {
        self.registry.remove_connection(connection);
    }

    pub fn handle_connect(&self, frame: &CommandFrame) -> CommandFrame {
        if frame.header("accept-version") != Some("1.2") {
            return error_frame("unsupported accept-version, expected 1.2");
        }
        let (client_cx, client_cy) = frame
            .header("heart-beat")
            .map(parse_heartbeat_header)
            .unwrap_or((0, 0));
        let server_cx = negotiate(client_cy, self.heartbeat_floor_ms);
        let server_cy = negotiate(client_cx, self.heartbeat_floor_ms);
        CommandFrame::new("CONNECTED")
            .with_header("version", "1.2")
            .with_header("heart-beat", format_heartbeat_header(server_cx, server_cy))
    }

    pub fn handle_subscribe(&mut self, connection: ConnectionId, frame: &CommandFrame) -> Option<CommandFrame> {
        let (Some(destination), Some(id)) = (frame.header("destination"), frame.header("id")) else {
            return Some(error_frame("SUBSCRIBE requires destination and id headers"));
        };
        match self
            .registry
            .subscribe(connection, id.to_string(), destination.to_string())
        {
            Ok(()) => None,
            Err(dup_id) => Some(error_frame(&format!("duplicate subscription id: {dup_id}"))),
        }
    }

    pub fn handle_unsubscribe(&mut self, connection: ConnectionId, frame: &CommandFrame) {
        let Some(id) = frame.header("id") else {
            warn!("UNSUBSCRIBE missing id header, ignoring");
            return;
        };
        if !self.registry.unsubscribe(connection, id) {
            warn!(id, "UNSUBSCRIBE for unknown subscription id, ignoring");
        }
    }

    pub fn handle_disconnect(&self, frame: &CommandFrame) -> Option<CommandFrame> {
        frame
            .header("receipt")
            .map(|receipt_id| CommandFrame::new("RECEIPT").with_header("receipt-id", receipt_id))
    }

    /// Forwards to pub/sub subscribers and/or runs an internal RPC request,
    /// returning every outbound frame produced, each addressed to a
    /// connection.
    pub async fn handle_send(
        &mut self,
        connection: ConnectionId,
        frame: &CommandFrame,
    ) -> Vec<(ConnectionId, CommandFrame)> {
        let Some(destination) = frame.header("destination").map(str::to_string) else {
            return vec![(connection, error_frame("SEND requires a destination header"))];
        };

        let mut out = Vec::new();
        let subscriber_targets: Vec<(ConnectionId, String)> = self
            .registry
            .matches(&destination)
            .into_iter()
            .map(|s| (s.connection, s.id.clone()))
            .collect();

        for (target_conn, sub_id) in &subscriber_targets {
            let forwarded = clone_with_header(frame, "subscription", sub_id);
            out.push((*target_conn, forwarded));
        }

        let is_internal = self.internal_routes.contains(&destination);
        if is_internal {
            if let Some(reply) = self.handle_internal_request(connection, frame).await {
                out.push(reply);
            }
        }

        if subscriber_targets.is_empty() && !is_internal {
            out.push((connection, error_frame("Subscription not available")));
        }

        out
    }

    async fn handle_internal_request(
        &mut self,
        connection: ConnectionId,
        frame: &CommandFrame,
    ) -> Option<(ConnectionId, CommandFrame)> {
        let body: RpcBody = match serde_json::from_slice(&frame.body) {
            Ok(b) => b,
            Err(err) => {
                warn!(error = %err, "malformed JSON-RPC body on internal route");
                return Some((connection, error_frame("malformed JSON-RPC body")));
            }
        };

        let reply_to = frame.header("reply-to").unwrap_or("").to_string();
        let request_id = frame.header("request-id").map(str::to_string);

        if let Some(id) = &request_id {
            self.registry.record_pending(
                id.clone(),
                ReplyRoute {
                    connection,
                    reply_to: reply_to.clone(),
                },
            );
        }

        let result = match body {
            RpcBody::Single(req) => self.dispatcher.dispatch(req).await.map(|r| vec![r]),
            RpcBody::Batch(reqs) => Some(self.dispatcher.dispatch_batch(reqs).await),
        };

        if let Some(id) = &request_id {
            self.registry.take_pending(id);
        }

        let responses = result?;
        self.build_reply(connection, &reply_to, &responses)
    }

    fn build_reply(
        &self,
        connection: ConnectionId,
        reply_to: &str,
        responses: &[RpcResponse],
    ) -> Option<(ConnectionId, CommandFrame)> {
        let sub_id = self.registry.reply_subscription(connection, reply_to)?;
        let body = if responses.len() == 1 {
            serde_json::to_vec(&responses[0]).ok()?
        } else {
            serde_json::to_vec(responses).ok()?
        };
        let frame = CommandFrame::new("MESSAGE")
            .with_header("destination", reply_to)
            .with_header("subscription", sub_id)
            .with_header("content-type", "application/json")
            .with_body(body);
        Some((connection, frame))
    }
}

/// Builds a request envelope directly, for callers (tests, the HTTP image
/// transport's error paths) that need one without going through SEND.
pub fn wrap_request(req: RpcRequest) -> RpcBody {
    RpcBody::Single(req)
}
