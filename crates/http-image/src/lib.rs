//! HTTP image transport (§4.D): raw PUT/GET streaming over a socket the
//! protocol detector has already classified as HTTP, decoupled from accept
//! by a bounded task queue.

mod request;

pub use request::{ImageRequest, RequestError};

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{error, warn};
use vda_core::error::AgentError;
use vda_virt::VirtDriver;

/// An [`AsyncRead`] over bytes already consumed off a socket's front
/// followed by whatever remains on the socket itself, so a driver can
/// stream a PUT body without the transport re-buffering the whole thing
/// in memory first.
struct PrefixedReader<'a> {
    prefix: Vec<u8>,
    prefix_pos: usize,
    stream: &'a mut TcpStream,
}

impl AsyncRead for PrefixedReader<'_> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.prefix_pos < this.prefix.len() {
            let remaining = &this.prefix[this.prefix_pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.prefix_pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut *this.stream).poll_read(cx, buf)
    }
}

/// One accepted connection, already identified as HTTP by the protocol
/// detector, along with whatever prefix bytes the detector already
/// consumed off the wire.
pub struct ImageConnection {
    pub stream: TcpStream,
    pub prefix: Vec<u8>,
}

/// Bounded queue feeding a fixed pool of connection-handling tasks (§4.D):
/// a full channel blocks new accepts rather than spawning unboundedly.
pub struct ImageTransport {
    sender: mpsc::Sender<ImageConnection>,
}

impl ImageTransport {
    /// Spawns `worker_count` tasks draining a channel of depth
    /// `queue_depth`, each handling one connection to completion before
    /// pulling the next.
    pub fn start(virt: Arc<dyn VirtDriver>, queue_depth: usize, worker_count: usize) -> Self {
        let (sender, receiver) = mpsc::channel(queue_depth.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        for worker in 0..worker_count.max(1) {
            let receiver = receiver.clone();
            let virt = virt.clone();
            tokio::spawn(async move {
                loop {
                    let conn = {
                        let mut rx = receiver.lock().await;
                        rx.recv().await
                    };
                    let Some(conn) = conn else {
                        break;
                    };
                    if let Err(err) = handle_connection(conn, &virt).await {
                        warn!(worker, error = %err, "image connection handling failed");
                    }
                }
            });
        }

        Self { sender }
    }

    /// Enqueues a connection for handling. Blocks (providing backpressure
    /// to the accept loop) when the queue is full.
    pub async fn submit(&self, conn: ImageConnection) -> Result<(), AgentError> {
        self.sender
            .send(conn)
            .await
            .map_err(|_| AgentError::Internal("image transport queue closed".to_string()))
    }
}

async fn handle_connection(mut conn: ImageConnection, virt: &Arc<dyn VirtDriver>) -> std::io::Result<()> {
    let mut buf = conn.prefix.clone();
    let (req, consumed) = loop {
        match request::parse_request(&buf) {
            Ok(parsed) => break parsed,
            Err(RequestError::Incomplete) => {
                let mut chunk = [0u8; 4096];
                let n = conn.stream.read(&mut chunk).await?;
                if n == 0 {
                    return Ok(());
                }
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() > 64 * 1024 {
                    write_error(&mut conn.stream, 400, "request header too large").await?;
                    return Ok(());
                }
            }
            Err(err) => {
                write_error(&mut conn.stream, 400, &err.to_string()).await?;
                return Ok(());
            }
        }
    };
    let leftover = buf[consumed..].to_vec();

    match req {
        ImageRequest::Put { path, content_length } => {
            handle_put(&mut conn.stream, virt, &path, content_length, leftover).await
        }
        ImageRequest::Get {
            path,
            pool,
            domain,
            image,
            range_end,
        } => handle_get(&mut conn.stream, virt, &path, pool, domain, image, range_end).await,
    }
}

async fn handle_put(
    stream: &mut TcpStream,
    virt: &Arc<dyn VirtDriver>,
    path: &str,
    content_length: u64,
    leftover: Vec<u8>,
) -> std::io::Result<()> {
    let mut reader = PrefixedReader {
        prefix: leftover,
        prefix_pos: 0,
        stream: &mut *stream,
    };

    match virt.download_image_from_stream(path, content_length, &mut reader).await {
        Ok(task_id) => {
            let response = format!(
                "HTTP/1.1 200 OK\r\nTask-Id: {task_id}\r\nContent-Length: 0\r\n\r\n"
            );
            stream.write_all(response.as_bytes()).await?;
        }
        Err(err) => {
            error!(path, error = %err, "image download failed");
            write_error(stream, 500, &err.to_string()).await?;
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_get(
    stream: &mut TcpStream,
    virt: &Arc<dyn VirtDriver>,
    path: &str,
    pool: uuid::Uuid,
    domain: uuid::Uuid,
    image: uuid::Uuid,
    range_end: u64,
) -> std::io::Result<()> {
    let _ = (pool, domain, image);
    let length = range_end + 1;

    // The response headers commit to a status and Content-Length before the
    // body is known to exist, so a failure partway through the stream can
    // only be logged, not turned into a different status line.
    let header = format!(
        "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes 0-{range_end}\r\nContent-Length: {length}\r\n\r\n"
    );
    stream.write_all(header.as_bytes()).await?;

    if let Err(err) = virt.upload_image_to_stream(path, length, stream).await {
        error!(path, error = %err, "image upload failed after headers were sent");
    }
    Ok(())
}

async fn write_error(stream: &mut TcpStream, status: u16, message: &str) -> std::io::Result<()> {
    let reason = match status {
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Internal Server Error",
    };
    let body = serde_json::json!({ "error": message }).to_string();
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
    use tokio::net::TcpListener;
    use vda_virt::MockVirtDriver;

    async fn connect_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn put_with_full_body_already_in_prefix_responds_200_with_task_id() {
        let virt: Arc<dyn VirtDriver> = Arc::new(MockVirtDriver::new());
        let (mut client, server) = connect_pair().await;

        let body = b"hello world payload";
        let request = format!(
            "PUT /images/foo HTTP/1.1\r\ncontent-length:{}\r\n\r\n",
            body.len()
        );
        let mut full = request.into_bytes();
        full.extend_from_slice(body);

        let conn = ImageConnection {
            stream: server,
            prefix: full,
        };

        let handle = tokio::spawn(async move { handle_connection(conn, &virt).await });

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        handle.await.unwrap().unwrap();

        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("Task-Id:"));
    }

    #[tokio::test]
    async fn get_with_range_responds_206_with_content_range() {
        let virt: Arc<dyn VirtDriver> = Arc::new(MockVirtDriver::new());
        let (mut client, server) = connect_pair().await;

        let pool = uuid::Uuid::new_v4();
        let domain = uuid::Uuid::new_v4();
        let image = uuid::Uuid::new_v4();
        let request = format!(
            "GET /images/bar HTTP/1.1\r\npool-id:{pool}\r\ndomain-id:{domain}\r\nimage-id:{image}\r\nrange:bytes=0-99\r\n\r\n"
        );

        let conn = ImageConnection {
            stream: server,
            prefix: request.into_bytes(),
        };

        let handle = tokio::spawn(async move { handle_connection(conn, &virt).await });

        client.shutdown().await.ok();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        handle.await.unwrap().unwrap();

        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 206 Partial Content"));
        assert!(response.contains("Content-Range: bytes 0-99"));
        assert!(response.contains("Content-Length: 100"));
    }

    #[tokio::test]
    async fn put_missing_content_length_gets_400() {
        let virt: Arc<dyn VirtDriver> = Arc::new(MockVirtDriver::new());
        let (mut client, server) = connect_pair().await;

        let request = b"PUT /images/foo HTTP/1.1\r\n\r\n".to_vec();
        let conn = ImageConnection {
            stream: server,
            prefix: request,
        };

        let handle = tokio::spawn(async move { handle_connection(conn, &virt).await });

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        handle.await.unwrap().unwrap();

        let response = String::from_utf8(response).unwrap();
        assert!(response.starts_with("HTTP/1.1 400"));
    }

    #[tokio::test]
    async fn put_body_split_across_prefix_and_socket_reaches_the_driver_intact() {
        let mock = Arc::new(MockVirtDriver::new());
        let virt: Arc<dyn VirtDriver> = mock.clone();
        let (mut client, server) = connect_pair().await;

        let body = b"the quick brown fox jumps over the lazy dog";
        let header = format!("PUT /images/foo HTTP/1.1\r\ncontent-length:{}\r\n\r\n", body.len());
        let mut prefix = header.into_bytes();
        prefix.extend_from_slice(&body[..10]);

        let conn = ImageConnection {
            stream: server,
            prefix,
        };
        let handle = tokio::spawn(async move { handle_connection(conn, &virt).await });

        client.write_all(&body[10..]).await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        handle.await.unwrap().unwrap();

        assert!(String::from_utf8_lossy(&response).starts_with("HTTP/1.1 200 OK"));
        assert_eq!(mock.last_downloaded().unwrap(), body);
    }

    #[tokio::test]
    async fn get_response_body_carries_the_driver_payload() {
        let mock = Arc::new(MockVirtDriver::new());
        let payload = b"0123456789".repeat(10);
        mock.set_upload_payload(payload.clone());
        let virt: Arc<dyn VirtDriver> = mock;
        let (mut client, server) = connect_pair().await;

        let pool = uuid::Uuid::new_v4();
        let domain = uuid::Uuid::new_v4();
        let image = uuid::Uuid::new_v4();
        let request = format!(
            "GET /images/bar HTTP/1.1\r\npool-id:{pool}\r\ndomain-id:{domain}\r\nimage-id:{image}\r\nrange:bytes=0-99\r\n\r\n"
        );
        let conn = ImageConnection {
            stream: server,
            prefix: request.into_bytes(),
        };

        let handle = tokio::spawn(async move { handle_connection(conn, &virt).await });

        client.shutdown().await.ok();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        handle.await.unwrap().unwrap();

        let split = response.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        assert_eq!(&response[split..], payload.as_slice());
    }
}
