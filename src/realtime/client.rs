// realtime/client.rs
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{interval, sleep, timeout, Instant, MissedTickBehavior},
};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        protocol::{frame::coding::CloseCode, CloseFrame},
        Message as WsMessage,
    },
    MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    ConnectionState, ConversationTimeline, ReconnectPolicy, TransportConfig, TransportError,
};
use crate::dtos::chatdtos::{ClientFrame, ServerFrame};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOUND_BUFFER: usize = 64;

/// Where a conversation stream lives.
#[derive(Debug, Clone)]
pub struct Endpoint {
    /// `ws://host:port`, without a trailing slash.
    pub base_url: String,
    pub conversation_id: Uuid,
    pub token: String,
}

impl Endpoint {
    pub fn url(&self, after: i64) -> String {
        format!(
            "{}/ws/conversations/{}?after={}&token={}",
            self.base_url.trim_end_matches('/'),
            self.conversation_id,
            after,
            self.token
        )
    }
}

struct Outbound {
    frame: ClientFrame,
    ack: oneshot::Sender<Result<(), TransportError>>,
}

#[derive(Debug)]
enum Control {
    Retry,
    Close,
}

/// How one connected session ended.
enum SessionEnd {
    /// Closed locally or cancelled. Never reconnect.
    Stopped,
    /// Server sent a normal close. Never reconnect.
    ServerClosed,
    Dropped(String),
}

/// Handle to a supervised conversation connection.
///
/// Dropping the handle cancels the supervisor task.
#[derive(Debug)]
pub struct RealtimeClient {
    conversation_id: Uuid,
    state: watch::Receiver<ConnectionState>,
    attempts: watch::Receiver<u32>,
    outbound: mpsc::Sender<Outbound>,
    control: mpsc::UnboundedSender<Control>,
    timeline: Arc<Mutex<ConversationTimeline>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RealtimeClient {
    /// Starts connecting right away. New inbound frames, in sequence order and
    /// without replay duplicates, arrive on the returned receiver.
    ///
    /// `cancel` is usually a child of the session's token. Cancelling it stops
    /// the connection and any pending reconnect.
    pub fn spawn(
        endpoint: Endpoint,
        config: TransportConfig,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<ServerFrame>) {
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (attempts_tx, attempts_rx) = watch::channel(0u32);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_BUFFER);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let timeline = Arc::new(Mutex::new(ConversationTimeline::new()));

        let supervisor = Supervisor {
            conversation_id: endpoint.conversation_id,
            endpoint,
            policy: ReconnectPolicy::new(&config),
            config,
            state: state_tx,
            attempts: attempts_tx,
            outbound: outbound_rx,
            control: control_rx,
            inbound: inbound_tx,
            timeline: timeline.clone(),
            cancel: cancel.clone(),
        };

        let conversation_id = supervisor.conversation_id;
        let task = tokio::spawn(supervisor.run());

        let client = Self {
            conversation_id,
            state: state_rx,
            attempts: attempts_rx,
            outbound: outbound_tx,
            control: control_tx,
            timeline,
            cancel,
            task: Mutex::new(Some(task)),
        };

        (client, inbound_rx)
    }

    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Reconnect attempts made since the last successful connect.
    pub fn attempts(&self) -> u32 {
        *self.attempts.borrow()
    }

    /// Watch channel for UI bindings.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Snapshot of every frame received so far.
    pub fn timeline(&self) -> ConversationTimeline {
        match self.timeline.lock() {
            Ok(timeline) => timeline.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Resolves once connected. Fails with `Failed` when reconnects run out and
    /// with `Closed` when the connection was shut down.
    pub async fn wait_until_connected(&self) -> Result<(), TransportError> {
        let mut state = self.state.clone();
        loop {
            match *state.borrow_and_update() {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Failed => {
                    return Err(TransportError::Failed {
                        attempts: *self.attempts.borrow(),
                    })
                }
                ConnectionState::Disconnected if self.is_finished() => {
                    return Err(TransportError::Closed)
                }
                _ => {}
            }
            if state.changed().await.is_err() {
                return Err(TransportError::Closed);
            }
        }
    }

    /// Sends a chat line. Fails immediately with `NotConnected` unless the
    /// connection is up, and reports a write that never reached the socket.
    pub async fn send(&self, text: impl Into<String>) -> Result<(), TransportError> {
        if self.state() != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }

        let (ack_tx, ack_rx) = oneshot::channel();
        self.outbound
            .send(Outbound {
                frame: ClientFrame::text(text),
                ack: ack_tx,
            })
            .await
            .map_err(|_| TransportError::Closed)?;

        ack_rx.await.map_err(|_| TransportError::Closed)?
    }

    /// Leaves `Failed` and starts a fresh round of reconnect attempts.
    pub fn retry(&self) -> Result<(), TransportError> {
        self.control
            .send(Control::Retry)
            .map_err(|_| TransportError::Closed)
    }

    /// Closes normally and waits for the supervisor to stop. No reconnect follows.
    pub async fn close(&self) {
        let _ = self.control.send(Control::Close);

        let task = match self.task.lock() {
            Ok(mut task) => task.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(conversation_id = %self.conversation_id, error = %e, "Realtime task ended abnormally");
            }
        }
    }

    fn is_finished(&self) -> bool {
        match self.task.lock() {
            Ok(task) => task.as_ref().map_or(true, |t| t.is_finished()),
            Err(_) => true,
        }
    }
}

impl Drop for RealtimeClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Supervisor {
    conversation_id: Uuid,
    endpoint: Endpoint,
    config: TransportConfig,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    attempts: watch::Sender<u32>,
    outbound: mpsc::Receiver<Outbound>,
    control: mpsc::UnboundedReceiver<Control>,
    inbound: mpsc::UnboundedSender<ServerFrame>,
    timeline: Arc<Mutex<ConversationTimeline>>,
    cancel: CancellationToken,
}

impl Supervisor {
    async fn run(mut self) {
        loop {
            self.set_state(ConnectionState::Connecting);

            let url = self.endpoint.url(self.cursor());
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => break,
                connected = connect_async(url) => connected,
            };

            match connected {
                Ok((socket, _)) => {
                    self.policy.reset();
                    let _ = self.attempts.send(0);
                    self.set_state(ConnectionState::Connected);
                    tracing::info!(conversation_id = %self.conversation_id, "Realtime connected");

                    match self.session(socket).await {
                        SessionEnd::Stopped | SessionEnd::ServerClosed => break,
                        SessionEnd::Dropped(reason) => {
                            tracing::warn!(conversation_id = %self.conversation_id, reason = %reason, "Realtime connection dropped");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        conversation_id = %self.conversation_id,
                        attempt = self.policy.attempts(),
                        error = %e,
                        "Realtime connect failed"
                    );
                }
            }

            let keep_going = match self.policy.next_delay() {
                Some(delay) => {
                    let _ = self.attempts.send(self.policy.attempts());
                    tracing::warn!(
                        conversation_id = %self.conversation_id,
                        attempt = self.policy.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "Realtime reconnect scheduled"
                    );
                    self.set_state(ConnectionState::Reconnecting);
                    self.idle(Some(delay)).await
                }
                None => {
                    tracing::error!(
                        conversation_id = %self.conversation_id,
                        attempts = self.policy.attempts(),
                        "Realtime reconnect attempts exhausted"
                    );
                    self.set_state(ConnectionState::Failed);
                    let keep_going = self.idle(None).await;
                    if keep_going {
                        self.policy.reset();
                        let _ = self.attempts.send(0);
                    }
                    keep_going
                }
            };

            if !keep_going {
                break;
            }
        }

        self.set_state(ConnectionState::Disconnected);
        tracing::info!(conversation_id = %self.conversation_id, "Realtime client stopped");
    }

    /// Waits out a backoff delay, or until `retry()` when `delay` is `None`.
    /// Sends arriving meanwhile are refused. Returns `false` when the client
    /// should stop.
    async fn idle(&mut self, delay: Option<std::time::Duration>) -> bool {
        let wake = async {
            match delay {
                Some(delay) => sleep(delay).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(wake);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = &mut wake => return true,
                command = self.control.recv() => match command {
                    Some(Control::Retry) if delay.is_none() => return true,
                    Some(Control::Retry) => {}
                    Some(Control::Close) | None => return false,
                },
                Some(outbound) = self.outbound.recv() => {
                    let _ = outbound.ack.send(Err(TransportError::NotConnected));
                }
            }
        }
    }

    async fn session(&mut self, socket: Socket) -> SessionEnd {
        let (mut write, mut read) = socket.split();

        let mut heartbeat = interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = write.send(normal_close()).await;
                    return SessionEnd::Stopped;
                }
                command = self.control.recv() => match command {
                    Some(Control::Retry) => {}
                    Some(Control::Close) | None => {
                        let _ = timeout(self.config.heartbeat_interval, write.send(normal_close())).await;
                        return SessionEnd::Stopped;
                    }
                },
                Some(outbound) = self.outbound.recv() => {
                    let payload = match serde_json::to_string(&outbound.frame) {
                        Ok(payload) => payload,
                        Err(e) => {
                            let _ = outbound.ack.send(Err(TransportError::Protocol(e.to_string())));
                            continue;
                        }
                    };
                    match write.send(WsMessage::Text(payload)).await {
                        Ok(()) => {
                            let _ = outbound.ack.send(Ok(()));
                        }
                        Err(e) => {
                            let _ = outbound.ack.send(Err(TransportError::NotConnected));
                            return SessionEnd::Dropped(e.to_string());
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if last_seen.elapsed() > self.config.heartbeat_timeout {
                        return SessionEnd::Dropped("heartbeat timed out".into());
                    }
                    if let Err(e) = write.send(WsMessage::Ping(Vec::new())).await {
                        return SessionEnd::Dropped(e.to_string());
                    }
                }
                frame = read.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        last_seen = Instant::now();
                        match serde_json::from_str::<ServerFrame>(&text) {
                            Ok(frame) => self.deliver(frame),
                            Err(e) => {
                                tracing::warn!(conversation_id = %self.conversation_id, error = %e, "Malformed server frame");
                            }
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        // A bare close frame carries no status, so it is not a normal close.
                        let normal = frame.as_ref().map_or(false, |f| f.code == CloseCode::Normal);
                        if normal {
                            return SessionEnd::ServerClosed;
                        }
                        return SessionEnd::Dropped(format!("server closed with {:?}", frame.map(|f| f.code)));
                    }
                    Some(Ok(_)) => last_seen = Instant::now(),
                    Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                    None => return SessionEnd::Dropped("stream ended".into()),
                },
            }
        }
    }

    fn deliver(&self, frame: ServerFrame) {
        let fresh = match self.timeline.lock() {
            Ok(mut timeline) => timeline.insert(frame.clone()),
            Err(poisoned) => poisoned.into_inner().insert(frame.clone()),
        };
        if fresh {
            let _ = self.inbound.send(frame);
        }
    }

    fn cursor(&self) -> i64 {
        match self.timeline.lock() {
            Ok(timeline) => timeline.last_sequence(),
            Err(poisoned) => poisoned.into_inner().last_sequence(),
        }
    }

    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            tracing::debug!(conversation_id = %self.conversation_id, from = ?current, to = ?next, "Realtime state");
            *current = next;
            true
        });
    }
}

fn normal_close() -> WsMessage {
    WsMessage::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "client closed".into(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::{
        extract::ws::{Message as AxumMessage, WebSocketUpgrade},
        response::IntoResponse,
        routing::get,
        Router,
    };

    use crate::{routes::create_router, test_support::TestApp};

    fn fast_config() -> TransportConfig {
        TransportConfig {
            base_delay: Duration::from_millis(10),
            cap_delay: Duration::from_millis(40),
            max_attempts: 3,
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
        }
    }

    async fn serve_on(listener: tokio::net::TcpListener, router: Router) -> String {
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("ws://{}", addr)
    }

    fn endpoint(base_url: String) -> Endpoint {
        Endpoint {
            base_url,
            conversation_id: Uuid::new_v4(),
            token: "unused".into(),
        }
    }

    async fn next_frame(inbound: &mut mpsc::UnboundedReceiver<ServerFrame>) -> ServerFrame {
        timeout(Duration::from_secs(5), inbound.recv())
            .await
            .expect("frame in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn replays_history_then_streams_live_messages() {
        let app = TestApp::new();
        let (client_id, client_token) = app.account("Maria Santos");
        let (worker_id, _) = app.account("Jose Cruz");

        let job = app
            .state
            .job_service
            .hire_directly(client_id, worker_id, "Fix leaking sink", 100_000)
            .await
            .unwrap();
        let conversation = app
            .state
            .chat_service
            .list_conversations(client_id, Default::default())
            .await
            .unwrap()
            .into_iter()
            .find(|c| c.job_id == job.job.id)
            .unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = serve_on(listener, create_router(app.state.clone())).await;
        let (client, mut inbound) = RealtimeClient::spawn(
            Endpoint {
                base_url,
                conversation_id: conversation.id,
                token: client_token,
            },
            fast_config(),
            CancellationToken::new(),
        );
        client.wait_until_connected().await.unwrap();

        // Invitation notice posted at hire time comes first.
        let first = next_frame(&mut inbound).await;
        assert_eq!(first.sequence, 1);

        client.send("See you at nine").await.unwrap();
        let echoed = next_frame(&mut inbound).await;
        assert_eq!(echoed.message, "See you at nine");
        assert_eq!(echoed.sender_id, Some(client_id));
        assert!(echoed.sequence > first.sequence);

        client.close().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert_eq!(client.send("late").await, Err(TransportError::NotConnected));
    }

    #[tokio::test]
    async fn server_normal_close_is_not_reconnected() {
        use axum::extract::ws::CloseFrame as AxumCloseFrame;

        async fn close_right_away(ws: WebSocketUpgrade) -> impl IntoResponse {
            ws.on_upgrade(|mut socket| async move {
                let _ = socket
                    .send(AxumMessage::Close(Some(AxumCloseFrame {
                        code: 1000,
                        reason: "bye".into(),
                    })))
                    .await;
            })
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let router = Router::new().route("/ws/conversations/:id", get(close_right_away));
        let base_url = serve_on(listener, router).await;

        let (client, _inbound) =
            RealtimeClient::spawn(endpoint(base_url), fast_config(), CancellationToken::new());

        let mut state = client.subscribe_state();
        let mut seen = Vec::new();
        let watched = timeout(Duration::from_secs(5), async {
            loop {
                let current = *state.borrow_and_update();
                if seen.last() != Some(&current) {
                    seen.push(current);
                }
                if state.changed().await.is_err() {
                    break;
                }
            }
        })
        .await;
        assert!(watched.is_ok(), "supervisor should stop on its own");
        assert!(!seen.contains(&ConnectionState::Reconnecting));
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts_and_refuses_sends() {
        // Grab a free port and release it so nothing is listening there.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (client, _inbound) = RealtimeClient::spawn(
            endpoint(format!("ws://{}", addr)),
            fast_config(),
            CancellationToken::new(),
        );

        let result = timeout(Duration::from_secs(5), client.wait_until_connected())
            .await
            .unwrap();
        assert_eq!(result, Err(TransportError::Failed { attempts: 3 }));
        assert_eq!(client.state(), ConnectionState::Failed);
        assert_eq!(client.send("hello").await, Err(TransportError::NotConnected));

        client.close().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn cancellation_stops_pending_reconnects() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let session = CancellationToken::new();
        let config = TransportConfig {
            base_delay: Duration::from_secs(30),
            cap_delay: Duration::from_secs(30),
            ..fast_config()
        };
        let (client, _inbound) = RealtimeClient::spawn(
            endpoint(format!("ws://{}", addr)),
            config,
            session.child_token(),
        );

        let mut state = client.subscribe_state();
        timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == ConnectionState::Reconnecting),
        )
        .await
        .unwrap()
        .unwrap();

        session.cancel();
        timeout(Duration::from_secs(5), client.close()).await.unwrap();
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn bare_server_close_is_reconnected() {
        async fn close_without_status(ws: WebSocketUpgrade) -> impl IntoResponse {
            ws.on_upgrade(|mut socket| async move {
                let _ = socket.send(AxumMessage::Close(None)).await;
            })
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let router = Router::new().route("/ws/conversations/:id", get(close_without_status));
        let base_url = serve_on(listener, router).await;

        let config = TransportConfig {
            base_delay: Duration::from_secs(30),
            cap_delay: Duration::from_secs(30),
            ..fast_config()
        };
        let (client, _inbound) = RealtimeClient::spawn(endpoint(base_url), config, CancellationToken::new());

        let mut state = client.subscribe_state();
        timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == ConnectionState::Reconnecting),
        )
        .await
        .expect("a close without status should schedule a reconnect")
        .unwrap();
        assert_eq!(client.attempts(), 1);

        client.close().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn every_reconnect_attempt_reports_connecting() {
        // Accepts TCP but never completes the handshake, so each attempt
        // stays in flight long enough to be observed.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    sleep(Duration::from_millis(100)).await;
                    drop(stream);
                });
            }
        });

        let config = TransportConfig {
            base_delay: Duration::from_millis(50),
            cap_delay: Duration::from_millis(50),
            max_attempts: 2,
            ..fast_config()
        };
        let (client, _inbound) =
            RealtimeClient::spawn(endpoint(format!("ws://{}", addr)), config, CancellationToken::new());

        let mut state = client.subscribe_state();
        let mut seen = Vec::new();
        timeout(Duration::from_secs(5), async {
            loop {
                let current = *state.borrow_and_update();
                if seen.last() != Some(&current) {
                    seen.push(current);
                }
                if current == ConnectionState::Failed {
                    break;
                }
                state.changed().await.unwrap();
            }
        })
        .await
        .expect("client should give up in time");

        let reconnects = seen
            .windows(2)
            .filter(|w| matches!(w, [ConnectionState::Reconnecting, ConnectionState::Connecting]))
            .count();
        assert_eq!(reconnects, 2, "states seen: {:?}", seen);
        assert_eq!(seen.last(), Some(&ConnectionState::Failed));

        client.close().await;
    }

    #[tokio::test]
    async fn retry_after_failure_connects_and_resets_attempts() {
        async fn hold_open(ws: WebSocketUpgrade) -> impl IntoResponse {
            ws.on_upgrade(|mut socket| async move {
                while let Some(Ok(message)) = socket.recv().await {
                    if matches!(message, AxumMessage::Close(_)) {
                        break;
                    }
                }
            })
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (client, _inbound) =
            RealtimeClient::spawn(endpoint(format!("ws://{}", addr)), fast_config(), CancellationToken::new());

        let result = timeout(Duration::from_secs(5), client.wait_until_connected())
            .await
            .unwrap();
        assert_eq!(result, Err(TransportError::Failed { attempts: 3 }));
        assert_eq!(client.attempts(), 3);

        // Bring the server up on the same address, then ask for another round.
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        let router = Router::new().route("/ws/conversations/:id", get(hold_open));
        serve_on(listener, router).await;

        client.retry().unwrap();
        let mut state = client.subscribe_state();
        timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == ConnectionState::Connected),
        )
        .await
        .expect("retry should reconnect")
        .unwrap();
        assert_eq!(client.attempts(), 0);
        client.send("back online").await.unwrap();

        client.close().await;
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }
}
