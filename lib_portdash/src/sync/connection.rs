//! # Connection Manager
//!
//! Owns the one WebSocket to the dashboard backend. Every text frame it reads
//! is handed to the [`MessageRouter`] on the socket task, so frames are routed
//! in the order they arrive.
//!
//! ## Lifecycle
//!
//! `Uninstantiated -> Connecting -> Open -> Closing -> Closed`, and back to
//! `Connecting` only through a reconnect or a manual [`ConnectionManager::connect`].
//!
//! A close with any code other than [`NORMAL_CLOSURE`] (including a failed
//! handshake or a dropped TCP stream) schedules one reconnect after the fixed
//! policy delay. Successful opens reset the attempt counter. When the budget is
//! spent the manager stays `Closed` and reports [`ConnectionManager::is_exhausted`]
//! until someone calls `connect()` again.
//!
//! All methods except [`ConnectionManager::shutdown`] are synchronous but spawn
//! tokio tasks, so they must be called from within a tokio runtime.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::configs::config_sync::SyncSettings;
use crate::sync::router::MessageRouter;

/// Close code for an intentional shutdown. Suppresses reconnects.
pub const NORMAL_CLOSURE: u16 = 1000;
/// Reported when the server closes without a status code.
pub const NO_STATUS_RECEIVED: u16 = 1005;
/// Reported when the socket fails or ends without a close handshake.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// How long to wait for the server to answer our close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle of the dashboard socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection has been attempted yet.
    Uninstantiated,
    /// A handshake is in flight.
    Connecting,
    /// Frames are flowing.
    Open,
    /// A close frame was sent and we are waiting for the stream to end.
    Closing,
    /// No live socket.
    Closed,
}

/// Fixed-delay, bounded-attempt reconnect strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before each reconnect attempt.
    pub delay: Duration,
    /// Attempts allowed between two successful opens.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(3),
            max_attempts: 5,
        }
    }
}

struct SocketHandle {
    commands: mpsc::UnboundedSender<u16>,
    task: JoinHandle<()>,
}

struct Inner {
    /// Bumped for every socket; tasks from older generations are ignored.
    generation: u64,
    attempts: u32,
    exhausted: bool,
    /// Set by an intentional `disconnect(NORMAL_CLOSURE)`.
    stopped: bool,
    socket: Option<SocketHandle>,
    reconnect: Option<CancellationToken>,
}

struct Shared {
    url: String,
    policy: ReconnectPolicy,
    router: Arc<MessageRouter>,
    state_tx: watch::Sender<ConnectionState>,
    inner: Mutex<Inner>,
}

/// Handle to the dashboard connection. Cloning shares the same connection.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Creates a manager for `url` without connecting.
    pub fn new(url: impl Into<String>, policy: ReconnectPolicy, router: Arc<MessageRouter>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Uninstantiated);
        Self {
            shared: Arc::new(Shared {
                url: url.into(),
                policy,
                router,
                state_tx,
                inner: Mutex::new(Inner {
                    generation: 0,
                    attempts: 0,
                    exhausted: false,
                    stopped: false,
                    socket: None,
                    reconnect: None,
                }),
            }),
        }
    }

    /// Creates a manager from resolved settings.
    pub fn from_settings(settings: &SyncSettings, router: Arc<MessageRouter>) -> Self {
        let policy = ReconnectPolicy {
            delay: settings.reconnect_delay,
            max_attempts: settings.max_reconnect_attempts,
        };
        Self::new(settings.websocket_url.to_string(), policy, router)
    }

    /// The socket URL this manager connects to.
    pub fn websocket_url(&self) -> &str {
        &self.shared.url
    }

    /// The router inbound frames are handed to.
    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.shared.router
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// A receiver that observes every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Reconnect attempts made since the last successful open.
    pub fn attempts(&self) -> u32 {
        self.lock().attempts
    }

    /// True once the reconnect budget is spent. Only `connect()` clears it.
    pub fn is_exhausted(&self) -> bool {
        self.lock().exhausted
    }

    /// Opens the socket unless one is already connecting or open.
    pub fn connect(&self) {
        let mut inner = self.lock();
        if matches!(self.state(), ConnectionState::Connecting | ConnectionState::Open) {
            log::debug!("connect() ignored: already {:?}", self.state());
            return;
        }

        if let Some(timer) = inner.reconnect.take() {
            timer.cancel();
        }
        inner.stopped = false;
        inner.exhausted = false;
        inner.attempts = 0;
        self.open_socket(&mut inner);
    }

    /// Closes the socket with `code`.
    ///
    /// [`NORMAL_CLOSURE`] is an intentional shutdown: pending reconnects are
    /// cancelled and none is scheduled afterwards. Any other code is treated as
    /// an abnormal termination and goes through the reconnect policy.
    pub fn disconnect(&self, code: u16) {
        let mut inner = self.lock();

        if code == NORMAL_CLOSURE {
            inner.stopped = true;
            if let Some(timer) = inner.reconnect.take() {
                log::debug!("Cancelling pending reconnect");
                timer.cancel();
            }
        }

        match self.state() {
            ConnectionState::Open => {
                if let Some(socket) = &inner.socket {
                    log::info!("Closing dashboard socket with code {}", code);
                    if socket.commands.send(code).is_ok() {
                        self.set_state(ConnectionState::Closing);
                    }
                }
            }
            ConnectionState::Connecting => {
                // No handshake yet: drop the attempt outright.
                if let Some(socket) = inner.socket.take() {
                    socket.task.abort();
                }
                inner.generation += 1;
                self.set_state(ConnectionState::Closed);
                if code != NORMAL_CLOSURE {
                    self.schedule_reconnect(&mut inner, code);
                }
            }
            state => log::debug!("disconnect({}) with nothing to close ({:?})", code, state),
        }
    }

    /// Intentional shutdown that waits for the socket to be fully closed.
    pub async fn shutdown(&self) {
        self.disconnect(NORMAL_CLOSURE);
        let mut states = self.watch_state();
        let _ = states
            .wait_for(|s| matches!(s, ConnectionState::Closed | ConnectionState::Uninstantiated))
            .await;
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.shared.state_tx.send_replace(state);
        if previous != state {
            log::debug!("Connection state {:?} -> {:?}", previous, state);
        }
    }

    fn open_socket(&self, inner: &mut Inner) {
        if let Some(old) = inner.socket.take() {
            old.task.abort();
        }
        inner.generation += 1;
        let generation = inner.generation;

        let (commands, rx) = mpsc::unbounded_channel();
        self.set_state(ConnectionState::Connecting);
        log::info!("Connecting to {}", self.shared.url);

        let manager = self.clone();
        let task = tokio::spawn(async move { manager.run_socket(generation, rx).await });
        inner.socket = Some(SocketHandle { commands, task });
    }

    async fn run_socket(self, generation: u64, commands: mpsc::UnboundedReceiver<u16>) {
        let code = match connect_async(self.shared.url.as_str()).await {
            Ok((stream, _)) => {
                if !self.on_open(generation) {
                    return;
                }
                self.pump(generation, stream, commands).await
            }
            Err(e) => {
                log::warn!("Failed to connect to {}: {}", self.shared.url, e);
                ABNORMAL_CLOSURE
            }
        };
        self.on_close(generation, code);
    }

    /// Reads frames until the socket ends. Returns the effective close code.
    async fn pump(
        &self,
        generation: u64,
        stream: WsStream,
        mut commands: mpsc::UnboundedReceiver<u16>,
    ) -> u16 {
        let (mut write, mut read) = stream.split();
        let mut local_code: Option<u16> = None;
        let mut remote_code: Option<u16> = None;
        let mut close_deadline: Option<Instant> = None;
        let mut commands_open = true;

        loop {
            tokio::select! {
                cmd = commands.recv(), if commands_open && local_code.is_none() => {
                    let Some(code) = cmd else {
                        commands_open = false;
                        continue;
                    };
                    local_code = Some(code);
                    close_deadline = Some(Instant::now() + CLOSE_TIMEOUT);
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: Utf8Bytes::from_static("client disconnect"),
                    };
                    if let Err(e) = write.send(Message::Close(Some(frame))).await {
                        log::debug!("Close frame not sent: {}", e);
                        return code;
                    }
                }
                _ = sleep_until(close_deadline.unwrap_or_else(Instant::now)), if close_deadline.is_some() => {
                    log::warn!("Server did not acknowledge close within {:?}", CLOSE_TIMEOUT);
                    return local_code.unwrap_or(ABNORMAL_CLOSURE);
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        self.shared.router.handle_frame(text.as_str());
                    }
                    Some(Ok(Message::Binary(bin))) => {
                        log::debug!("Ignoring {} byte binary frame", bin.len());
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame.map(|f| u16::from(f.code)).unwrap_or(NO_STATUS_RECEIVED);
                        log::info!("Server closed socket (gen {}) with code {}", generation, code);
                        remote_code = Some(code);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::warn!("Socket read error: {}", e);
                        return local_code.or(remote_code).unwrap_or(ABNORMAL_CLOSURE);
                    }
                    None => return local_code.or(remote_code).unwrap_or(ABNORMAL_CLOSURE),
                },
            }
        }
    }

    fn on_open(&self, generation: u64) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            log::debug!("Discarding socket from stale generation {}", generation);
            return false;
        }
        inner.attempts = 0;
        inner.exhausted = false;
        self.set_state(ConnectionState::Open);
        log::info!("Connected to {}", self.shared.url);
        true
    }

    fn on_close(&self, generation: u64, code: u16) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        inner.socket = None;
        self.set_state(ConnectionState::Closed);

        if code == NORMAL_CLOSURE || inner.stopped {
            log::info!("Connection closed normally");
            return;
        }
        self.schedule_reconnect(&mut inner, code);
    }

    fn schedule_reconnect(&self, inner: &mut Inner, code: u16) {
        if let Some(previous) = inner.reconnect.take() {
            previous.cancel();
        }

        let max = self.shared.policy.max_attempts;
        if inner.attempts >= max {
            inner.exhausted = true;
            log::error!(
                "Connection lost (code {}); giving up after {} reconnect attempts",
                code,
                max
            );
            return;
        }

        inner.attempts += 1;
        let attempt = inner.attempts;
        let delay = self.shared.policy.delay;
        log::warn!(
            "Connection lost (code {}). Reconnect attempt {}/{} in {:?}",
            code,
            attempt,
            max,
            delay
        );

        let token = CancellationToken::new();
        inner.reconnect = Some(token.clone());
        let manager = self.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {
                    log::debug!("Reconnect attempt {} cancelled", attempt);
                }
                _ = sleep(delay) => manager.fire_reconnect(&token),
            }
        });
    }

    fn fire_reconnect(&self, token: &CancellationToken) {
        let mut inner = self.lock();
        if token.is_cancelled() {
            return;
        }
        inner.reconnect = None;
        if matches!(self.state(), ConnectionState::Connecting | ConnectionState::Open) {
            return;
        }
        self.open_socket(&mut inner);
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("url", &self.shared.url)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(url: &str, max_attempts: u32) -> ConnectionManager {
        let policy = ReconnectPolicy {
            delay: Duration::from_millis(20),
            max_attempts,
        };
        ConnectionManager::new(url, policy, Arc::new(MessageRouter::new()))
    }

    #[test]
    fn test_starts_uninstantiated() {
        let m = manager("ws://127.0.0.1:1/ws", 3);
        assert_eq!(m.state(), ConnectionState::Uninstantiated);
        assert_eq!(m.attempts(), 0);
        assert!(!m.is_exhausted());
        assert_eq!(m.websocket_url(), "ws://127.0.0.1:1/ws");
    }

    #[tokio::test]
    async fn test_disconnect_before_connect_is_a_no_op() {
        let m = manager("ws://127.0.0.1:1/ws", 3);
        m.disconnect(NORMAL_CLOSURE);
        assert_eq!(m.state(), ConnectionState::Uninstantiated);
    }

    #[tokio::test]
    async fn test_unreachable_server_exhausts_budget() {
        // Bind then drop to get a port nobody listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let m = manager(&format!("ws://127.0.0.1:{}/ws", port), 2);
        m.connect();

        let mut states = m.watch_state();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if m.is_exhausted() {
                    break;
                }
                let _ = states.changed().await;
            }
        })
        .await
        .expect("reconnect budget should run out");

        assert_eq!(m.state(), ConnectionState::Closed);
        assert_eq!(m.attempts(), 2);
    }

    #[tokio::test]
    async fn test_intentional_disconnect_cancels_pending_reconnect() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let policy = ReconnectPolicy {
            delay: Duration::from_millis(200),
            max_attempts: 5,
        };
        let m = ConnectionManager::new(
            format!("ws://127.0.0.1:{}/ws", port),
            policy,
            Arc::new(MessageRouter::new()),
        );
        m.connect();

        let mut states = m.watch_state();
        let _ = tokio::time::timeout(
            Duration::from_secs(2),
            states.wait_for(|s| *s == ConnectionState::Closed),
        )
        .await;
        assert_eq!(m.attempts(), 1);

        m.disconnect(NORMAL_CLOSURE);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(m.state(), ConnectionState::Closed);
        assert_eq!(m.attempts(), 1);
    }
}
