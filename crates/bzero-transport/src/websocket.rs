//! The websocket transport: connect, pump, reconnect, drain, die.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bzero_types::AgentMessage;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use url::Url;

use crate::backoff::Backoff;
use crate::broker::Broker;
use crate::frame::{self, Frame};
use crate::{TransportError, TransportResult};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Picks the remote invocation target for an outgoing frame.
pub type TargetSelector = Arc<dyn Fn(&AgentMessage) -> String + Send + Sync>;

/// Produces extra query parameters just before each upgrade attempt; the
/// agent control channel uses this to solve the bastion nonce challenge.
pub type ChallengeSolver = Arc<
    dyn Fn() -> Pin<Box<dyn Future<Output = TransportResult<Vec<(String, String)>>> + Send>>
        + Send
        + Sync,
>;

/// Invocation target announcing the agent side of a connection is up.
const TARGET_AGENT_CONNECTED: &str = "AgentConnected";
/// Invocation target killing the whole transport with a reason.
const TARGET_CLOSE_CONNECTION: &str = "CloseConnection";

const OUTBOUND_QUEUE_SIZE: usize = 50;
const AGENT_CONNECTED_TIMEOUT: Duration = Duration::from_secs(30);
const DRAIN_QUIET_WINDOW: Duration = Duration::from_secs(1);
const DRAIN_CEILING: Duration = Duration::from_secs(10);

/// Which endpoint this websocket plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Daemon-side data connection: sends gate on `AgentConnected`.
    DaemonData,
    /// Agent-side data connection.
    AgentData,
    /// Agent control channel: solves the signature challenge on connect.
    AgentControl,
}

pub struct WebsocketConfig {
    pub url: Url,
    pub headers: Vec<(String, String)>,
    pub params: Vec<(String, String)>,
    pub role: Role,
    pub auto_reconnect: bool,
    /// Outer bound on one upgrade attempt; keeps never-responding statuses
    /// (100/102/103) from hanging the client.
    pub connect_timeout: Duration,
    pub backoff: Backoff,
    pub challenge_solver: Option<ChallengeSolver>,
}

impl WebsocketConfig {
    pub fn new(url: Url, role: Role) -> Self {
        Self {
            url,
            headers: Vec::new(),
            params: Vec::new(),
            role,
            auto_reconnect: true,
            connect_timeout: Duration::from_secs(30),
            backoff: Backoff::new(),
            challenge_solver: None,
        }
    }
}

struct Inner {
    config: WebsocketConfig,
    selector: TargetSelector,
    broker: Arc<Broker>,
    outbound_tx: mpsc::Sender<AgentMessage>,
    /// Messages accepted by `send` but not yet written to the socket.
    pending: AtomicUsize,
    ready_tx: watch::Sender<bool>,
    close_requested_tx: watch::Sender<Option<String>>,
    closed_tx: watch::Sender<bool>,
    closing: AtomicBool,
    fallback_tx: Mutex<Option<mpsc::Sender<AgentMessage>>>,
}

/// A connected transport handle. Cloneable; all clones share one socket.
#[derive(Clone)]
pub struct Websocket {
    inner: Arc<Inner>,
}

impl Websocket {
    /// Establish the websocket, perform the framing handshake, and start
    /// the pumps. Retries transient upgrade failures under the configured
    /// backoff before returning.
    pub async fn connect(
        config: WebsocketConfig,
        broker: Arc<Broker>,
        selector: TargetSelector,
    ) -> TransportResult<Self> {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let (ready_tx, _) = watch::channel(config.role != Role::DaemonData);
        let (close_requested_tx, _) = watch::channel(None);
        let (closed_tx, _) = watch::channel(false);

        let mut backoff = config.backoff.clone();
        let inner = Arc::new(Inner {
            config,
            selector,
            broker,
            outbound_tx,
            pending: AtomicUsize::new(0),
            ready_tx,
            close_requested_tx,
            closed_tx,
            closing: AtomicBool::new(false),
            fallback_tx: Mutex::new(None),
        });

        let ws = connect_with_retries(&inner, &mut backoff).await?;
        backoff.reset();

        let task_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            run(task_inner, ws, outbound_rx, backoff).await;
        });

        Ok(Self { inner })
    }

    /// Enqueue a frame for the send pump. Suspends only while the bounded
    /// outbound queue is full.
    pub async fn send(&self, msg: AgentMessage) -> TransportResult<()> {
        if *self.inner.closed_tx.borrow() {
            return Err(TransportError::Closed("transport is closed".into()));
        }
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
        self.inner.outbound_tx.send(msg).await.map_err(|_| {
            self.inner.pending.fetch_sub(1, Ordering::SeqCst);
            TransportError::SendFailed
        })
    }

    /// Install a receiver for frames addressed to channels nobody has
    /// subscribed yet (the agent uses this to open new datachannels).
    pub async fn set_inbound_fallback(&self, tx: mpsc::Sender<AgentMessage>) {
        *self.inner.fallback_tx.lock().await = Some(tx);
    }

    pub fn broker(&self) -> Arc<Broker> {
        Arc::clone(&self.inner.broker)
    }

    /// Begin a graceful close: drain the outbound queue up to a short grace
    /// period, then tear down. Second and later calls are no-ops.
    pub async fn close(&self, reason: &str) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.close_requested_tx.send_replace(Some(reason.to_string()));
        // If the run task is already gone, finish the close here.
        if self.inner.closed_tx.receiver_count() == 0 {
            self.inner.broker.close(reason).await;
            self.inner.closed_tx.send_replace(true);
        }
    }

    /// Resolves once the transport is fully torn down.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed_tx.borrow()
    }
}

/// Session-and-reconnect driver. Owns the websocket and the outbound queue
/// receiver for the life of the transport.
async fn run(
    inner: Arc<Inner>,
    mut ws: WsStream,
    mut outbound_rx: mpsc::Receiver<AgentMessage>,
    mut backoff: Backoff,
) {
    // Keep the closed watch alive so `close` can tell we are running.
    let _closed_guard = inner.closed_tx.subscribe();

    loop {
        let end = run_session(&inner, &mut ws, &mut outbound_rx).await;

        match end {
            SessionEnd::GracefulClose(reason) => {
                drain_outbound(&inner, &mut ws, &mut outbound_rx).await;
                let _ = ws.send(Message::Close(None)).await;
                finish(&inner, &reason).await;
                return;
            }
            SessionEnd::Fatal(reason) => {
                finish(&inner, &reason).await;
                return;
            }
            SessionEnd::Lost(reason) => {
                if !inner.config.auto_reconnect {
                    finish(&inner, &reason).await;
                    return;
                }
                tracing::warn!(reason = %reason, "websocket lost, reconnecting");
                // The daemon must wait for a fresh AgentConnected after the
                // coordinator re-establishes the pairing.
                if inner.config.role == Role::DaemonData {
                    inner.ready_tx.send_replace(false);
                }
                match connect_with_retries(&inner, &mut backoff).await {
                    Ok(new_ws) => {
                        backoff.reset();
                        ws = new_ws;
                    }
                    Err(e) => {
                        finish(&inner, &e.to_string()).await;
                        return;
                    }
                }
            }
        }
    }
}

async fn finish(inner: &Inner, reason: &str) {
    inner.broker.close(reason).await;
    inner.closed_tx.send_replace(true);
}

enum SessionEnd {
    /// `close()` was called locally.
    GracefulClose(String),
    /// The peer or the coordinator killed the connection; do not reconnect.
    Fatal(String),
    /// The socket died underneath us; reconnect if allowed.
    Lost(String),
}

async fn run_session(
    inner: &Inner,
    ws: &mut WsStream,
    outbound_rx: &mut mpsc::Receiver<AgentMessage>,
) -> SessionEnd {
    let mut close_requested = inner.close_requested_tx.subscribe();
    if let Some(reason) = close_requested.borrow().clone() {
        return SessionEnd::GracefulClose(reason);
    }
    let mut ready_rx = inner.ready_tx.subscribe();
    let session_start = Instant::now();

    loop {
        let ready = *ready_rx.borrow();
        tokio::select! {
            biased;

            _ = close_requested.changed() => {
                let reason = close_requested.borrow().clone().unwrap_or_default();
                return SessionEnd::GracefulClose(reason);
            }

            inbound = ws.next() => {
                match inbound {
                    Some(Ok(msg)) => {
                        if let Some(end) = handle_inbound(inner, msg).await {
                            return end;
                        }
                    }
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    None => return SessionEnd::Lost("websocket stream ended".into()),
                }
            }

            outbound = outbound_rx.recv(), if ready => {
                match outbound {
                    Some(msg) => {
                        if let Err(e) = write_message(inner, ws, &msg).await {
                            return SessionEnd::Lost(e.to_string());
                        }
                    }
                    None => return SessionEnd::Fatal("outbound queue dropped".into()),
                }
            }

            _ = ready_rx.changed(), if !ready => {}

            // only armed while a send is actually blocked on the gate
            _ = tokio::time::sleep_until(session_start + AGENT_CONNECTED_TIMEOUT),
                if !ready && inner.pending.load(Ordering::SeqCst) > 0 =>
            {
                return SessionEnd::Fatal(TransportError::AgentConnectedTimeout.to_string());
            }
        }
    }
}

async fn write_message(
    inner: &Inner,
    ws: &mut WsStream,
    msg: &AgentMessage,
) -> Result<(), tungstenite::Error> {
    let target = (inner.selector)(msg);
    let argument = serde_json::to_value(msg).expect("agent message serializes");
    let record = frame::invocation_record(&target, &argument);
    ws.send(Message::Text(String::from_utf8(record).expect("frames are utf-8"))).await?;
    inner.pending.fetch_sub(1, Ordering::SeqCst);
    Ok(())
}

/// Returns Some(end) when the frame terminates the session.
async fn handle_inbound(inner: &Inner, msg: Message) -> Option<SessionEnd> {
    let payload = match msg {
        Message::Text(text) => text.into_bytes(),
        Message::Binary(bytes) => bytes,
        Message::Close(frame) => {
            let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
            return Some(SessionEnd::Lost(format!("peer closed websocket: {}", reason)));
        }
        _ => return None,
    };

    let frames = match frame::parse_records(&payload) {
        Ok(frames) => frames,
        Err(e) => {
            tracing::warn!(error = %e, "dropping malformed inbound payload");
            return None;
        }
    };

    for parsed in frames {
        match parsed {
            Frame::Ping | Frame::HandshakeResponse { .. } => {}
            Frame::Close { error } => {
                return Some(SessionEnd::Lost(error.unwrap_or_else(|| "server close".into())));
            }
            Frame::Invocation { target, arguments } => {
                if let Some(end) = dispatch_invocation(inner, &target, arguments).await {
                    return Some(end);
                }
            }
        }
    }
    None
}

async fn dispatch_invocation(
    inner: &Inner,
    target: &str,
    arguments: Vec<serde_json::Value>,
) -> Option<SessionEnd> {
    match target {
        TARGET_AGENT_CONNECTED => {
            inner.ready_tx.send_replace(true);
            None
        }
        TARGET_CLOSE_CONNECTION => {
            let reason = arguments
                .first()
                .and_then(|v| v.get("reason"))
                .and_then(|v| v.as_str())
                .unwrap_or("closed by coordinator")
                .to_string();
            Some(SessionEnd::Fatal(reason))
        }
        _ => {
            let Some(argument) = arguments.into_iter().next() else {
                tracing::warn!(target, "invocation without arguments");
                return None;
            };
            match serde_json::from_value::<AgentMessage>(argument) {
                Ok(agent_msg) => {
                    let channel_id = agent_msg.channel_id.clone();
                    if let Err(TransportError::UnknownChannel(_)) =
                        inner.broker.direct_message(&channel_id, agent_msg.clone()).await
                    {
                        let fallback = inner.fallback_tx.lock().await.clone();
                        match fallback {
                            Some(tx) => {
                                let _ = tx.send(agent_msg).await;
                            }
                            // Races at channel open/close make this benign.
                            None => tracing::debug!(channel_id, "message for unknown channel"),
                        }
                    }
                }
                Err(e) => tracing::warn!(target, error = %e, "unparseable agent message"),
            }
            None
        }
    }
}

/// Drain the outbound queue after a close request: a ~1 s quiet window per
/// message, bounded by a 10 s absolute ceiling.
async fn drain_outbound(
    inner: &Inner,
    ws: &mut WsStream,
    outbound_rx: &mut mpsc::Receiver<AgentMessage>,
) {
    let deadline = Instant::now() + DRAIN_CEILING;
    loop {
        let wait_until = (Instant::now() + DRAIN_QUIET_WINDOW).min(deadline);
        match tokio::time::timeout_at(wait_until, outbound_rx.recv()).await {
            Ok(Some(msg)) => {
                if write_message(inner, ws, &msg).await.is_err() {
                    return;
                }
                if Instant::now() >= deadline {
                    return;
                }
            }
            Ok(None) | Err(_) => return,
        }
    }
}

async fn connect_with_retries(inner: &Inner, backoff: &mut Backoff) -> TransportResult<WsStream> {
    let mut close_requested = inner.close_requested_tx.subscribe();
    loop {
        match connect_once(inner).await {
            Ok(ws) => return Ok(ws),
            Err((transient, reason)) => {
                if !transient {
                    return Err(TransportError::Connect(reason));
                }
                let Some(delay) = backoff.next_delay() else {
                    return Err(TransportError::RetryBudgetExhausted(reason));
                };
                tracing::info!(reason = %reason, delay_ms = delay.as_millis() as u64, "retrying connect");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = close_requested.changed() => {
                        return Err(TransportError::Closed("closed during connect backoff".into()));
                    }
                }
            }
        }
    }
}

async fn connect_once(inner: &Inner) -> Result<WsStream, (bool, String)> {
    let mut url = inner.config.url.clone();
    {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in &inner.config.params {
            pairs.append_pair(key, value);
        }
    }
    if let Some(solver) = &inner.config.challenge_solver {
        let extra = solver().await.map_err(|e| (false, e.to_string()))?;
        let mut pairs = url.query_pairs_mut();
        for (key, value) in extra {
            pairs.append_pair(&key, &value);
        }
    }

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| (false, e.to_string()))?;
    for (name, value) in &inner.config.headers {
        let name: HeaderName = name.parse().map_err(|_| (false, format!("bad header {}", name)))?;
        let value: HeaderValue = value.parse().map_err(|_| (false, format!("bad header value for {}", name)))?;
        request.headers_mut().insert(name, value);
    }

    let upgrade = tokio_tungstenite::connect_async(request);
    let (mut ws, _response) = match tokio::time::timeout(inner.config.connect_timeout, upgrade).await {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => return Err((is_transient(&e), e.to_string())),
        Err(_) => return Err((true, "connect attempt timed out".into())),
    };

    // Framing handshake before any invocation may flow.
    let record = frame::handshake_record();
    ws.send(Message::Text(String::from_utf8(record).expect("handshake is utf-8")))
        .await
        .map_err(|e| (true, e.to_string()))?;

    match tokio::time::timeout(inner.config.connect_timeout, ws.next()).await {
        Ok(Some(Ok(msg))) => {
            let payload = msg.into_data();
            let frames = frame::parse_records(&payload).map_err(|e| (false, e.to_string()))?;
            match frames.first() {
                Some(Frame::HandshakeResponse { error: None }) => Ok(ws),
                Some(Frame::HandshakeResponse { error: Some(e) }) => {
                    Err((false, format!("handshake refused: {}", e)))
                }
                _ => Err((false, "unexpected first frame".into())),
            }
        }
        Ok(Some(Err(e))) => Err((true, e.to_string())),
        Ok(None) => Err((true, "socket closed during handshake".into())),
        Err(_) => Err((true, "handshake timed out".into())),
    }
}

/// Whether a failed upgrade should be retried: network trouble, any 5xx,
/// or a refused/aborted upgrade. Client-side errors fail fast.
fn is_transient(err: &tungstenite::Error) -> bool {
    match err {
        tungstenite::Error::Io(_) => true,
        tungstenite::Error::Http(response) => response.status().is_server_error(),
        tungstenite::Error::Protocol(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bzero_types::MessageType;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn selector() -> TargetSelector {
        Arc::new(|_msg: &AgentMessage| "ResponseDaemonToBastionV1".to_string())
    }

    fn quick_backoff() -> Backoff {
        Backoff::with(
            Duration::from_millis(10),
            Duration::from_millis(50),
            Duration::from_secs(5),
        )
    }

    fn config(url: Url, role: Role) -> WebsocketConfig {
        let mut config = WebsocketConfig::new(url, role);
        config.backoff = quick_backoff();
        config.connect_timeout = Duration::from_secs(5);
        config
    }

    struct RecordingSubscriber {
        tx: mpsc::UnboundedSender<AgentMessage>,
    }

    impl RecordingSubscriber {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<AgentMessage>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (Arc::new(Self { tx }), rx)
        }
    }

    #[async_trait::async_trait]
    impl crate::broker::Subscriber for RecordingSubscriber {
        async fn receive(&self, msg: AgentMessage) {
            let _ = self.tx.send(msg);
        }

        async fn close(&self, _reason: &str) {}
    }

    /// Accept one websocket, run the framing handshake, and return the
    /// stream plus a channel of invocations the client sent.
    async fn accept_and_handshake(
        listener: &TcpListener,
    ) -> WebSocketStream<TcpStream> {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        // client handshake record
        let _ = ws.next().await.unwrap().unwrap();
        ws.send(Message::Text("{}\u{1e}".into())).await.unwrap();
        ws
    }

    fn invocation_text(target: &str, msg: &AgentMessage) -> Message {
        let record = frame::invocation_record(target, &serde_json::to_value(msg).unwrap());
        Message::Text(String::from_utf8(record).unwrap())
    }

    #[tokio::test]
    async fn test_inbound_frames_reach_subscriber_in_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("ws://{}/hub/agent", listener.local_addr().unwrap())).unwrap();

        let server = tokio::spawn(async move {
            let mut ws = accept_and_handshake(&listener).await;
            for i in 0..3u8 {
                let msg = AgentMessage::for_channel("c1", MessageType::Data, vec![i]);
                ws.send(invocation_text("RequestBastionToAgentV1", &msg)).await.unwrap();
            }
            // hold the socket open until the client is done
            let _ = tokio::time::timeout(Duration::from_secs(2), ws.next()).await;
        });

        let broker = Arc::new(Broker::new());
        let (sub, mut received_rx) = RecordingSubscriber::new();
        broker.subscribe("c1", sub).await;

        let ws = Websocket::connect(config(url, Role::AgentData), broker, selector())
            .await
            .unwrap();

        let mut received = Vec::new();
        while received.len() < 3 {
            received.push(received_rx.recv().await.unwrap());
        }
        assert_eq!(
            received.iter().map(|m| m.payload[0]).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        ws.close("test done").await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_reconnects_through_5xx_storm_and_delivers_first_send() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("ws://{}/hub/daemon", listener.local_addr().unwrap())).unwrap();

        let server = tokio::spawn(async move {
            // three refusals with 500-series statuses
            for status in ["500 Internal Server Error", "502 Bad Gateway", "503 Service Unavailable"] {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut discard = [0u8; 1024];
                use tokio::io::AsyncReadExt;
                let _ = stream.read(&mut discard).await;
                let response = format!("HTTP/1.1 {}\r\ncontent-length: 0\r\n\r\n", status);
                stream.write_all(response.as_bytes()).await.unwrap();
                drop(stream);
            }
            // then a real upgrade
            let mut ws = accept_and_handshake(&listener).await;
            let connected = AgentMessage::control(MessageType::OpenAgentWebsocket, vec![]);
            ws.send(invocation_text(TARGET_AGENT_CONNECTED, &connected)).await.unwrap();
            // expect the client's first invocation
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        let frames = frame::parse_records(text.as_bytes()).unwrap();
                        if let Frame::Invocation { target, .. } = &frames[0] {
                            return target.clone();
                        }
                    }
                    Some(Ok(_)) => continue,
                    other => panic!("server never got the invocation: {:?}", other),
                }
            }
        });

        let broker = Arc::new(Broker::new());
        let ws = Websocket::connect(config(url, Role::DaemonData), broker, selector())
            .await
            .unwrap();
        ws.send(AgentMessage::for_channel("c1", MessageType::Syn, b"syn".to_vec()))
            .await
            .unwrap();

        let target = server.await.unwrap();
        assert_eq!(target, "ResponseDaemonToBastionV1");
        ws.close("test done").await;
    }

    #[tokio::test]
    async fn test_daemon_sends_gate_on_agent_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("ws://{}/hub/daemon", listener.local_addr().unwrap())).unwrap();

        let server = tokio::spawn(async move {
            let mut ws = accept_and_handshake(&listener).await;
            // nothing may arrive before AgentConnected
            let early = tokio::time::timeout(Duration::from_millis(300), ws.next()).await;
            assert!(early.is_err(), "send leaked before AgentConnected");
            let connected = AgentMessage::control(MessageType::OpenAgentWebsocket, vec![]);
            ws.send(invocation_text(TARGET_AGENT_CONNECTED, &connected)).await.unwrap();
            match tokio::time::timeout(Duration::from_secs(2), ws.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    assert!(text.contains("\"Syn\""));
                }
                other => panic!("expected gated invocation, got {:?}", other),
            }
        });

        let broker = Arc::new(Broker::new());
        let ws = Websocket::connect(config(url, Role::DaemonData), broker, selector())
            .await
            .unwrap();
        ws.send(AgentMessage::for_channel("c1", MessageType::Syn, vec![]))
            .await
            .unwrap();
        server.await.unwrap();
        ws.close("test done").await;
    }

    #[tokio::test]
    async fn test_close_connection_invocation_is_fatal() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("ws://{}/hub/agent", listener.local_addr().unwrap())).unwrap();

        tokio::spawn(async move {
            let mut ws = accept_and_handshake(&listener).await;
            let record = frame::invocation_record(
                TARGET_CLOSE_CONNECTION,
                &serde_json::json!({"reason": "target deleted"}),
            );
            ws.send(Message::Text(String::from_utf8(record).unwrap())).await.unwrap();
            let _ = tokio::time::timeout(Duration::from_secs(2), ws.next()).await;
        });

        let broker = Arc::new(Broker::new());
        let ws = Websocket::connect(config(url, Role::AgentData), broker, selector())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), ws.closed())
            .await
            .expect("transport should die on CloseConnection");
        assert!(ws.is_closed());
    }
}
