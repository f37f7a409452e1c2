// src/backends/socket.rs

use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use crate::backends::ExecutionBackend;
use crate::config::SocketConfig;
use crate::errors::{Result, RunnerError};
use crate::models::{ExecutionResult, RawResult, SocketReply, Submission};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type ReplySender = oneshot::Sender<Result<SocketReply>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
}

/// Status notices for the screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Connected,
    Disconnected { reason: String },
}

enum Command {
    Send { code: String, reply: ReplySender },
    ReconnectNow,
    Shutdown,
}

enum SessionEnd {
    Shutdown,
    Lost(String),
}

struct Shared {
    state: watch::Sender<ConnectionState>,
    attempts: AtomicU64,
    banner: Mutex<Option<String>>,
    notices: broadcast::Sender<Notice>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn opened(&self) {
        self.set_state(ConnectionState::Open);
        if let Ok(mut banner) = self.banner.lock() {
            *banner = None;
        }
        let _ = self.notices.send(Notice::Connected);
    }

    fn lost(&self, reason: String) {
        self.set_state(ConnectionState::Disconnected);
        if let Ok(mut banner) = self.banner.lock() {
            *banner = Some(reason.clone());
        }
        let _ = self.notices.send(Notice::Disconnected { reason });
    }
}

/// Owns the duplex channel to the execution server for as long as the screen
/// is mounted. The channel itself lives inside a driver task; this handle only
/// talks to it through commands, so nothing else can write to it.
pub struct SocketBackend {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl SocketBackend {
    /// Starts connecting immediately. Must be called inside a Tokio runtime.
    pub fn mount(config: SocketConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (notices, _) = broadcast::channel(16);
        let shared = Arc::new(Shared {
            state,
            attempts: AtomicU64::new(0),
            banner: Mutex::new(None),
            notices,
        });
        let (commands, rx) = mpsc::unbounded_channel();

        log::info!("Mounting execution socket for {}", config.url());
        let driver = tokio::spawn(drive(config, Arc::clone(&shared), rx));

        Self {
            shared,
            commands,
            driver: Mutex::new(Some(driver)),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Number of connection attempts made so far, including the first.
    pub fn connection_attempts(&self) -> u64 {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    /// Reason of the last disconnect, cleared once the channel reopens.
    pub fn banner(&self) -> Option<String> {
        self.shared.banner.lock().ok().and_then(|b| b.clone())
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.shared.notices.subscribe()
    }

    /// Resolves once the channel is open.
    pub async fn wait_until_open(&self) {
        let mut rx = self.shared.state.subscribe();
        let _ = rx.wait_for(|s| *s == ConnectionState::Open).await;
    }

    /// Skips any pending reconnect delay.
    pub fn reconnect_now(&self) {
        let _ = self.commands.send(Command::ReconnectNow);
    }

    /// Closes the channel and cancels any pending reconnect. No connection
    /// attempt is made after this returns.
    pub async fn unmount(&self) {
        let _ = self.commands.send(Command::Shutdown);
        let handle = self.driver.lock().ok().and_then(|mut d| d.take());
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                log::error!("Socket driver task failed: {}", e);
            }
        }
        self.shared.set_state(ConnectionState::Disconnected);
        log::info!("Execution socket unmounted");
    }

    async fn send(&self, code: String) -> Result<SocketReply> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Send { code, reply })
            .map_err(|_| RunnerError::NotConnected)?;
        rx.await.map_err(|_| RunnerError::ChannelClosed)?
    }
}

impl Drop for SocketBackend {
    fn drop(&mut self) {
        if let Ok(slot) = self.driver.get_mut() {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }
}

impl ExecutionBackend for SocketBackend {
    async fn execute(&self, submission: &Submission) -> Result<ExecutionResult> {
        if self.state() != ConnectionState::Open {
            self.reconnect_now();
            return Err(RunnerError::NotConnected);
        }

        log::info!("Sending {} bytes of source over socket", submission.source_code.len());
        let reply = self.send(submission.source_code.clone()).await?;
        Ok(ExecutionResult::from_raw(RawResult::Socket(reply)))
    }
}

/// Connection lifecycle: connect, serve until the channel drops, wait the
/// fixed delay, repeat. Runs until shutdown or until the handle is dropped.
async fn drive(
    config: SocketConfig,
    shared: Arc<Shared>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let url = config.url();

    loop {
        shared.set_state(ConnectionState::Connecting);
        let attempt = shared.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        log::debug!("Connecting to {} (attempt {})", url, attempt);

        let connect = connect_async(url.as_str());
        tokio::pin!(connect);
        let connected = loop {
            tokio::select! {
                res = &mut connect => break res,
                cmd = commands.recv() => match cmd {
                    None | Some(Command::Shutdown) => return,
                    Some(Command::Send { reply, .. }) => {
                        let _ = reply.send(Err(RunnerError::NotConnected));
                    }
                    Some(Command::ReconnectNow) => {}
                },
            }
        };

        let reason = match connected {
            Ok((socket, _)) => {
                log::info!("Connected to execution server at {}", url);
                shared.opened();
                match serve(socket, &mut commands).await {
                    SessionEnd::Shutdown => return,
                    SessionEnd::Lost(reason) => reason,
                }
            }
            Err(e) => e.to_string(),
        };

        log::warn!(
            "Disconnected from {}: {}. Reconnecting in {}ms",
            url,
            reason,
            config.reconnect_delay.as_millis()
        );
        shared.lost(reason);

        let timer = tokio::time::sleep(config.reconnect_delay);
        tokio::pin!(timer);
        loop {
            tokio::select! {
                _ = &mut timer => break,
                cmd = commands.recv() => match cmd {
                    None | Some(Command::Shutdown) => return,
                    Some(Command::Send { reply, .. }) => {
                        let _ = reply.send(Err(RunnerError::NotConnected));
                    }
                    Some(Command::ReconnectNow) => break,
                },
            }
        }
    }
}

/// Pumps one open channel. At most one reply waiter is held, and a send made
/// while it is outstanding fails with `Busy`. A waiter still pending when the
/// channel drops is released with `ChannelClosed`.
async fn serve(socket: Socket, commands: &mut mpsc::UnboundedReceiver<Command>) -> SessionEnd {
    let (mut sink, mut stream) = socket.split();
    let mut pending: Option<ReplySender> = None;

    loop {
        tokio::select! {
            cmd = commands.recv() => match cmd {
                None | Some(Command::Shutdown) => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                Some(Command::Send { reply, .. }) if pending.is_some() => {
                    log::warn!("Rejecting send while a reply is still outstanding");
                    let _ = reply.send(Err(RunnerError::Busy));
                }
                Some(Command::Send { code, reply }) => match sink.send(Message::Text(code)).await {
                    Ok(()) => pending = Some(reply),
                    Err(e) => {
                        let reason = e.to_string();
                        let _ = reply.send(Err(RunnerError::WebSocket(e)));
                        return SessionEnd::Lost(reason);
                    }
                },
                Some(Command::ReconnectNow) => {}
            },
            msg = stream.next() => {
                let payload = match msg {
                    Some(Ok(Message::Text(text))) => serde_json::from_str::<SocketReply>(&text),
                    Some(Ok(Message::Binary(bytes))) => serde_json::from_slice::<SocketReply>(&bytes),
                    Some(Ok(Message::Close(_))) => return SessionEnd::Lost("closed by server".to_string()),
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    None => return SessionEnd::Lost("connection ended".to_string()),
                };
                match pending.take() {
                    Some(waiter) => {
                        let _ = waiter.send(payload.map_err(RunnerError::from));
                    }
                    None => log::warn!("Dropping unsolicited message from execution server"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn config(addr: SocketAddr, delay_ms: u64) -> SocketConfig {
        SocketConfig {
            host: addr.ip().to_string(),
            port: addr.port(),
            reconnect_delay: Duration::from_millis(delay_ms),
        }
    }

    /// Replies to every message with `{"output": "ran: <code>"}`.
    async fn echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut ws = accept_async(tcp).await.unwrap();
                    while let Some(Ok(msg)) = ws.next().await {
                        if let Message::Text(code) = msg {
                            let reply = serde_json::json!({ "output": format!("ran: {code}"), "error": "" });
                            ws.send(Message::Text(reply.to_string())).await.unwrap();
                        }
                    }
                });
            }
        });
        addr
    }

    /// Accepts the handshake, then closes straight away.
    async fn closing_server(accepted: Arc<AtomicUsize>) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                if let Ok(mut ws) = accept_async(tcp).await {
                    let _ = ws.close(None).await;
                }
            }
        });
        addr
    }

    async fn unused_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    async fn test_round_trip_when_open() {
        let addr = echo_server().await;
        let backend = SocketBackend::mount(config(addr, 50));
        let mut notices = backend.notices();

        tokio::time::timeout(Duration::from_secs(2), backend.wait_until_open())
            .await
            .unwrap();

        let result = backend
            .execute(&Submission::python("print(1)"))
            .await
            .unwrap();

        assert_eq!(result.render(), "ran: print(1)");
        assert_eq!(notices.recv().await.unwrap(), Notice::Connected);
        assert!(backend.banner().is_none());
        backend.unmount().await;
    }

    #[tokio::test]
    async fn test_not_open_reports_not_connected() {
        let backend = SocketBackend::mount(config(unused_addr().await, 5_000));

        let err = backend
            .execute(&Submission::python("print(1)"))
            .await
            .unwrap_err();

        assert!(matches!(err, RunnerError::NotConnected));
        backend.unmount().await;
    }

    #[tokio::test]
    async fn test_reconnects_repeatedly_until_unmount() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let addr = closing_server(Arc::clone(&accepted)).await;
        let backend = SocketBackend::mount(config(addr, 30));

        tokio::time::timeout(Duration::from_secs(5), async {
            while accepted.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(backend.connection_attempts() >= 3);

        backend.unmount().await;
        let attempts = backend.connection_attempts();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(backend.connection_attempts(), attempts);
        assert_eq!(backend.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_one_attempt_per_delay_window() {
        let accepted = Arc::new(AtomicUsize::new(0));
        let addr = closing_server(Arc::clone(&accepted)).await;
        let backend = SocketBackend::mount(config(addr, 400));

        tokio::time::sleep(Duration::from_millis(200)).await;

        // First connection dropped; the retry is still waiting out its delay.
        assert_eq!(backend.connection_attempts(), 1);
        assert!(backend.banner().is_some());
        backend.unmount().await;
    }

    #[tokio::test]
    async fn test_close_before_reply_releases_waiter() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            let _ = ws.next().await;
            let _ = ws.close(None).await;
        });

        let backend = SocketBackend::mount(config(addr, 5_000));
        tokio::time::timeout(Duration::from_secs(2), backend.wait_until_open())
            .await
            .unwrap();

        let err = backend
            .execute(&Submission::python("input()"))
            .await
            .unwrap_err();

        assert!(matches!(err, RunnerError::ChannelClosed));
        backend.unmount().await;
    }

    #[tokio::test]
    async fn test_second_send_while_waiting_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let release = Arc::new(tokio::sync::Notify::new());
        let server_release = Arc::clone(&release);
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(tcp).await.unwrap();
            if let Some(Ok(Message::Text(code))) = ws.next().await {
                server_release.notified().await;
                let reply = serde_json::json!({ "output": format!("ran: {code}") });
                ws.send(Message::Text(reply.to_string())).await.unwrap();
            }
            while ws.next().await.is_some() {}
        });

        let backend = SocketBackend::mount(config(addr, 5_000));
        tokio::time::timeout(Duration::from_secs(2), backend.wait_until_open())
            .await
            .unwrap();

        let first_submission = Submission::python("first");
        let second_submission = Submission::python("second");
        let (first, second) = tokio::join!(backend.execute(&first_submission), async {
            let result = backend.execute(&second_submission).await;
            release.notify_one();
            result
        });

        assert!(matches!(second, Err(RunnerError::Busy)));
        assert_eq!(first.unwrap().render(), "ran: first");
        backend.unmount().await;
    }
}
