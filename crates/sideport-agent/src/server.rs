use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use sideport_util::now_millis;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    task::AbortHandle,
};
use tracing::{debug, error, info, warn};

use crate::backend::GestureBackend;
use crate::protocol::{
    decode_request, encode_line, Point, Request, Response, DEFAULT_MULTI_TOUCH_DURATION_MS,
    DEFAULT_SWIPE_DURATION_MS, DEFAULT_TAP_DURATION_MS,
};

pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);
/// Longest accepted request line, newline included. A client that sends more
/// gets an error and is disconnected.
pub const MAX_LINE_BYTES: usize = 64 * 1024;
pub const WELCOME_MESSAGE: &str = "sideport guest agent ready";

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub addr: String,
    /// How long a read waits before the connection re-checks for shutdown.
    pub read_timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            addr: sideport_util::DEFAULT_AGENT_ADDR.into(),
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

struct Connection {
    peer: SocketAddr,
    abort: Option<AbortHandle>,
}

struct Shared {
    backend: Arc<dyn GestureBackend>,
    running: AtomicBool,
    read_timeout: Duration,
    next_id: AtomicU64,
    connections: Mutex<HashMap<u64, Connection>>,
    accept: Mutex<Option<AbortHandle>>,
}

impl Shared {
    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Connection>> {
        self.connections.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Removes a connection from the registry when its task ends, including when
/// the task is aborted.
struct Registration {
    id: u64,
    shared: Arc<Shared>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if let Some(conn) = self.shared.registry().remove(&self.id) {
            debug!("connection {} from {} closed", self.id, conn.peer);
        }
    }
}

/// Handle to a running agent. Clones refer to the same server.
#[derive(Clone)]
pub struct AgentServer {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
}

impl AgentServer {
    /// Binds the listener and starts accepting in the background.
    pub async fn start(config: AgentConfig, backend: Arc<dyn GestureBackend>) -> io::Result<Self> {
        let listener = TcpListener::bind(&config.addr).await?;
        let local_addr = listener.local_addr()?;
        let shared = Arc::new(Shared {
            backend,
            running: AtomicBool::new(true),
            read_timeout: config.read_timeout,
            next_id: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
            accept: Mutex::new(None),
        });

        let task = tokio::spawn(accept_loop(listener, shared.clone()));
        *shared.accept.lock().unwrap_or_else(|p| p.into_inner()) = Some(task.abort_handle());
        info!("guest agent listening on {local_addr}");
        Ok(Self { shared, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn connection_count(&self) -> usize {
        self.shared.registry().len()
    }

    /// Stops accepting and closes every open connection.
    pub fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(accept) = self
            .shared
            .accept
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
        {
            accept.abort();
        }
        let open: Vec<(u64, Connection)> = self.shared.registry().drain().collect();
        for (id, conn) in open {
            debug!("closing connection {id} from {}", conn.peer);
            if let Some(abort) = conn.abort {
                abort.abort();
            }
        }
        info!("guest agent stopped");
    }

    /// Handles one request line the way a connection would.
    pub async fn handle_line(&self, line: &str) -> Response {
        handle_line(&self.shared, line).await
    }
}

/// Errors that describe one failed connection or a momentary resource
/// shortage rather than a broken listener.
fn is_transient_accept_error(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) {
        return true;
    }
    // EMFILE, ENFILE, ENOBUFS, ENOMEM: wait for descriptors or memory to free up.
    matches!(err.raw_os_error(), Some(24 | 23 | 105 | 12))
}

async fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) if is_transient_accept_error(&err) => {
                warn!("accept failed: {err}");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
            Err(err) => {
                error!("listener failed, no longer accepting: {err}");
                shared.running.store(false, Ordering::SeqCst);
                break;
            }
        };
        if !shared.running.load(Ordering::SeqCst) {
            break;
        }

        let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
        shared.registry().insert(id, Connection { peer, abort: None });
        info!("connection {id} from {peer}");

        let registration = Registration {
            id,
            shared: shared.clone(),
        };
        let task = tokio::spawn(handle_connection(stream, registration));
        if let Some(conn) = shared.registry().get_mut(&id) {
            conn.abort = Some(task.abort_handle());
        }
    }
}

async fn handle_connection(stream: TcpStream, registration: Registration) {
    let id = registration.id;
    let shared = registration.shared.clone();
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();

    let welcome = Response::Welcome {
        message: WELCOME_MESSAGE.into(),
        version: env!("CARGO_PKG_VERSION").into(),
    };
    if let Err(err) = write_response(&mut writer, &welcome).await {
        debug!("connection {id}: welcome failed: {err}");
        return;
    }

    loop {
        let read = tokio::time::timeout(
            shared.read_timeout,
            read_bounded_line(&mut reader, &mut buf, MAX_LINE_BYTES),
        )
        .await;
        match read {
            Err(_elapsed) => {
                // Partial input stays in `buf` for the next attempt.
                if shared.running.load(Ordering::SeqCst) {
                    continue;
                }
                break;
            }
            Ok(Ok(LineRead::Line)) => {}
            Ok(Ok(LineRead::Eof)) => break,
            Ok(Ok(LineRead::TooLong)) => {
                warn!("connection {id}: request line over {MAX_LINE_BYTES} bytes; closing");
                let response = Response::Error {
                    message: format!("request line exceeds {MAX_LINE_BYTES} bytes"),
                };
                let _ = write_response(&mut writer, &response).await;
                break;
            }
            Ok(Err(err)) => {
                debug!("connection {id}: read failed: {err}");
                break;
            }
        }
        let raw = std::mem::take(&mut buf);
        let response = match std::str::from_utf8(&raw) {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => handle_line(&shared, line.trim()).await,
            Err(_) => Response::Error {
                message: "request line is not valid UTF-8".into(),
            },
        };
        if let Err(err) = write_response(&mut writer, &response).await {
            debug!("connection {id}: write failed: {err}");
            break;
        }
    }
    drop(registration);
}

#[derive(Debug, PartialEq, Eq)]
enum LineRead {
    Line,
    Eof,
    TooLong,
}

/// Appends bytes up to and including the next newline to `buf`, refusing to
/// grow it past `max` bytes. Bytes already moved into `buf` survive the future
/// being dropped, so a timed-out read can be resumed.
async fn read_bounded_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max: usize,
) -> io::Result<LineRead> {
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(if buf.is_empty() {
                LineRead::Eof
            } else {
                LineRead::Line
            });
        }
        let (used, complete) = match available.iter().position(|b| *b == b'\n') {
            Some(end) => (end + 1, true),
            None => (available.len(), false),
        };
        if buf.len() + used > max {
            return Ok(LineRead::TooLong);
        }
        buf.extend_from_slice(&available[..used]);
        reader.consume(used);
        if complete {
            return Ok(LineRead::Line);
        }
    }
}

async fn write_response<W: AsyncWriteExt + Unpin>(
    writer: &mut W,
    response: &Response,
) -> io::Result<()> {
    let line = encode_line(response).map_err(io::Error::other)?;
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await
}

async fn handle_line(shared: &Shared, line: &str) -> Response {
    match decode_request(line) {
        Ok(request) => dispatch(shared, request).await,
        Err(err) => {
            debug!("rejected request: {err}");
            Response::from(&err)
        }
    }
}

async fn dispatch(shared: &Shared, request: Request) -> Response {
    let backend = shared.backend.as_ref();
    match request {
        Request::Ping => Response::Pong {
            timestamp: now_millis(),
        },
        Request::Tap { x, y, duration } => {
            let duration = duration.unwrap_or(DEFAULT_TAP_DURATION_MS);
            let success = backend
                .tap(Point { x, y }, Duration::from_millis(duration))
                .await;
            Response::TapResponse {
                success,
                x,
                y,
                duration,
            }
        }
        Request::Swipe {
            start_x,
            start_y,
            end_x,
            end_y,
            duration,
        } => {
            let duration = duration.unwrap_or(DEFAULT_SWIPE_DURATION_MS);
            let success = backend
                .swipe(
                    Point {
                        x: start_x,
                        y: start_y,
                    },
                    Point { x: end_x, y: end_y },
                    Duration::from_millis(duration),
                )
                .await;
            Response::SwipeResponse {
                success,
                start_x,
                start_y,
                end_x,
                end_y,
                duration,
            }
        }
        Request::MultiTouch { points, duration } => {
            let duration = duration.unwrap_or(DEFAULT_MULTI_TOUCH_DURATION_MS);
            let success = backend
                .multi_touch(&points, Duration::from_millis(duration))
                .await;
            Response::MultiTouchResponse {
                success,
                points,
                duration,
            }
        }
        Request::Status => Response::StatusResponse {
            injection_ready: backend.is_ready(),
            server_running: shared.running.load(Ordering::SeqCst),
            connections: shared.registry().len(),
        },
    }
}
