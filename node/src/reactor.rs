//! The accept loop and protocol routing (§4.B, §4.C): one task peeks the
//! first bytes of each accepted connection and hands it to the message-bus
//! actor or the HTTP image transport. The bus adapter itself is owned and
//! driven exclusively by one actor task (§5), reached only through a
//! channel from per-connection reader tasks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};
use vda_bus::heartbeat::{negotiate, parse_heartbeat_header, HeartbeatState, DEFAULT_GRACE};
use vda_bus::{BusAdapter, ConnectionId};
use vda_http_image::{ImageConnection, ImageTransport};
use vda_protocol::{encode, encode_heartbeat, Frame, FrameDecoder, ProtocolDetector, ProtocolRouter};

const BUS_DETECTOR: &str = "bus";
const IMAGE_DETECTOR: &str = "http-image";

struct BusPrefixDetector;
impl ProtocolDetector for BusPrefixDetector {
    fn name(&self) -> &'static str {
        BUS_DETECTOR
    }
    fn prefix_len(&self) -> usize {
        8
    }
    fn matches(&self, prefix: &[u8]) -> bool {
        matches!(
            prefix_word(prefix).as_deref(),
            Some("CONNECT") | Some("SUBSCRIBE") | Some("SEND") | Some("DISCONNECT")
        ) || prefix == b"\n"
    }
}

struct ImagePrefixDetector;
impl ProtocolDetector for ImagePrefixDetector {
    fn name(&self) -> &'static str {
        IMAGE_DETECTOR
    }
    fn prefix_len(&self) -> usize {
        4
    }
    fn matches(&self, prefix: &[u8]) -> bool {
        matches!(prefix_word(prefix).as_deref(), Some("PUT") | Some("GET"))
    }
}

fn prefix_word(prefix: &[u8]) -> Option<String> {
    let end = prefix.iter().position(|&b| b == b'\n' || b == b' ')?;
    std::str::from_utf8(&prefix[..end]).ok().map(str::to_string)
}

fn build_router(idle_window: Duration) -> ProtocolRouter {
    let mut router = ProtocolRouter::new(idle_window);
    router.register(Box::new(BusPrefixDetector));
    router.register(Box::new(ImagePrefixDetector));
    router
}

enum BusEvent {
    Connected(ConnectionId, mpsc::UnboundedSender<Vec<u8>>),
    Frame(ConnectionId, vda_protocol::CommandFrame),
    Closed(ConnectionId),
}

async fn bus_actor(mut adapter: BusAdapter, mut events: mpsc::UnboundedReceiver<BusEvent>) {
    let mut writers: HashMap<ConnectionId, mpsc::UnboundedSender<Vec<u8>>> = HashMap::new();

    let send = |writers: &HashMap<ConnectionId, mpsc::UnboundedSender<Vec<u8>>>,
                conn: ConnectionId,
                frame: vda_protocol::CommandFrame| {
        if let Some(tx) = writers.get(&conn) {
            let _ = tx.send(encode(&frame));
        }
    };

    while let Some(event) = events.recv().await {
        match event {
            BusEvent::Connected(id, tx) => {
                writers.insert(id, tx);
            }
            BusEvent::Closed(id) => {
                writers.remove(&id);
                adapter.on_connection_closed(id);
            }
            BusEvent::Frame(id, frame) => match frame.command.as_str() {
                "CONNECT" | "STOMP" => {
                    let reply = adapter.handle_connect(&frame);
                    send(&writers, id, reply);
                }
                "SUBSCRIBE" => {
                    if let Some(reply) = adapter.handle_subscribe(id, &frame) {
                        send(&writers, id, reply);
                    }
                }
                "UNSUBSCRIBE" => {
                    adapter.handle_unsubscribe(id, &frame);
                }
                "SEND" => {
                    for (target, reply) in adapter.handle_send(id, &frame).await {
                        send(&writers, target, reply);
                    }
                }
                "DISCONNECT" => {
                    if let Some(reply) = adapter.handle_disconnect(&frame) {
                        send(&writers, id, reply);
                    }
                    writers.remove(&id);
                    adapter.on_connection_closed(id);
                }
                other => {
                    warn!(command = other, "unrecognized bus frame command, ignoring");
                }
            },
        }
    }
}

async fn run_bus_connection(
    stream: TcpStream,
    id: ConnectionId,
    events: mpsc::UnboundedSender<BusEvent>,
    heartbeat_floor_ms: u64,
    initial: Vec<u8>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Vec<u8>>();

    if events.send(BusEvent::Connected(id, writer_tx.clone())).is_err() {
        return;
    }

    let writer_task = tokio::spawn(async move {
        while let Some(bytes) = writer_rx.recv().await {
            if write_half.write_all(&bytes).await.is_err() {
                break;
            }
        }
    });

    let heartbeat_tx = writer_tx.clone();
    let heartbeat_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_millis(heartbeat_floor_ms.max(1000)));
        loop {
            ticker.tick().await;
            if heartbeat_tx.send(encode_heartbeat()).is_err() {
                break;
            }
        }
    });

    let mut decoder = FrameDecoder::new();
    decoder.push(&initial);
    let mut buf = [0u8; 4096];
    let mut heartbeat: Option<HeartbeatState> = None;
    let mut idle_check = tokio::time::interval(Duration::from_millis(250));

    'outer: loop {
        loop {
            match decoder.next_frame() {
                Ok(Some(Frame::Command(frame))) => {
                    let now = Instant::now();
                    if heartbeat.is_none() && frame.command == "CONNECT" {
                        let (client_cx, _client_cy) = frame
                            .header("heart-beat")
                            .map(parse_heartbeat_header)
                            .unwrap_or((0, 0));
                        let required_client_interval = negotiate(client_cx, heartbeat_floor_ms);
                        heartbeat = Some(HeartbeatState::new(required_client_interval, heartbeat_floor_ms, now));
                    }
                    if let Some(hb) = heartbeat.as_mut() {
                        hb.record_received(now);
                    }
                    if events.send(BusEvent::Frame(id, frame)).is_err() {
                        break 'outer;
                    }
                }
                Ok(Some(Frame::Heartbeat)) => {
                    if let Some(hb) = heartbeat.as_mut() {
                        hb.record_received(Instant::now());
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    debug!(error = %err, "dropping connection on protocol error");
                    let _ = events.send(BusEvent::Closed(id));
                    heartbeat_task.abort();
                    return;
                }
            }
        }

        tokio::select! {
            result = read_half.read(&mut buf) => {
                match result {
                    Ok(0) | Err(_) => break,
                    Ok(n) => decoder.push(&buf[..n]),
                }
            }
            _ = idle_check.tick() => {
                if let Some(hb) = &heartbeat {
                    if hb.client_timed_out(Instant::now(), DEFAULT_GRACE) {
                        debug!(connection = id.0, "client heartbeat timed out (§4.E), closing");
                        break;
                    }
                }
            }
        }
    }

    let _ = events.send(BusEvent::Closed(id));
    heartbeat_task.abort();
}

/// Reads just enough of a fresh connection to classify its protocol, then
/// hands it to the matching transport. Runs off the accept loop's own task
/// so a client that connects and never sends anything cannot stall other
/// accepts (§4.C idle window).
async fn classify_and_dispatch(
    mut stream: TcpStream,
    peer: std::net::SocketAddr,
    id: ConnectionId,
    events_tx: mpsc::UnboundedSender<BusEvent>,
    image_transport: Arc<ImageTransport>,
    router: Arc<ProtocolRouter>,
    heartbeat_floor_ms: u64,
) {
    let mut prefix = vec![0u8; router.max_prefix_len().max(1)];
    let n = match tokio::time::timeout(router.idle_window(), stream.peek(&mut prefix)).await {
        Ok(Ok(n)) => n,
        _ => {
            debug!(%peer, "connection produced no classifiable prefix in time, closing");
            return;
        }
    };
    prefix.truncate(n);

    match router.route(&prefix) {
        Some(BUS_DETECTOR) => {
            debug!(%peer, connection = id.0, "routed to bus");
            let mut consumed = vec![0u8; n];
            let _ = stream.try_read(&mut consumed);
            run_bus_connection(stream, id, events_tx, heartbeat_floor_ms, consumed).await;
        }
        Some(IMAGE_DETECTOR) => {
            debug!(%peer, "routed to http image transport");
            let mut consumed = vec![0u8; n];
            let _ = stream.try_read(&mut consumed);
            let conn = ImageConnection { stream, prefix: consumed };
            if image_transport.submit(conn).await.is_err() {
                warn!("image transport queue rejected connection");
            }
        }
        _ => {
            warn!(%peer, "connection matched no protocol, closing");
        }
    }
}

/// Runs the accept loop until `shutdown` is notified. Each accepted
/// connection is peeked, classified, and handed to the matching transport.
pub async fn run(
    listener: TcpListener,
    adapter: BusAdapter,
    image_transport: Arc<ImageTransport>,
    idle_window: Duration,
    heartbeat_floor_ms: u64,
    shutdown: Arc<Notify>,
) {
    let router = Arc::new(build_router(idle_window));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    tokio::spawn(bus_actor(adapter, events_rx));

    let mut next_id: u64 = 1;
    loop {
        tokio::select! {
            _ = shutdown.notified() => {
                info!("reactor accept loop stopping");
                break;
            }
            accepted = listener.accept() => {
                let Ok((stream, peer)) = accepted else { continue };
                let id = ConnectionId(next_id);
                next_id += 1;
                let events_tx = events_tx.clone();
                let transport = image_transport.clone();
                let router = router.clone();
                tokio::spawn(classify_and_dispatch(stream, peer, id, events_tx, transport, router, heartbeat_floor_ms));
            }
        }
    }
}
