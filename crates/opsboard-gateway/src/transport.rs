//! Gateway transport: one WebSocket connection, hidden behind a uniform
//! send/call/subscribe contract.
//!
//! Real mode dials the configured URL, answers the `connect.challenge`
//! handshake, and reconnects with capped jittered backoff until the attempt
//! budget is spent, at which point the link is reported unreachable. Mock
//! mode reports connected forever and discards every outbound frame.

use crate::backoff::ReconnectBackoff;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use opsboard_core::wire::{
    map_event, ChallengePayload, GatewayEvent, WireError, WireFrame, CHALLENGE_EVENT,
};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};
use uuid::Uuid;

const NOTICE_CHANNEL_CAPACITY: usize = 256;
const OUTBOUND_CHANNEL_CAPACITY: usize = 64;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub url: String,
    pub token: Option<String>,
    pub mock: bool,
    pub connect_timeout: Duration,
    pub rpc_timeout: Duration,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    /// 0 = retry forever.
    pub max_reconnect_attempts: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:18789/ws".to_string(),
            token: None,
            mock: false,
            connect_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(30),
            reconnect_base: Duration::from_secs(1),
            reconnect_cap: Duration::from_secs(30),
            max_reconnect_attempts: 8,
        }
    }
}

impl GatewayConfig {
    pub fn mock() -> Self {
        Self {
            mock: true,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect attempt budget spent; no further retries.
    Unreachable,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Reconnecting => "reconnecting",
            LinkState::Unreachable => "unreachable",
        }
    }
}

#[derive(Debug)]
pub enum GatewayNotice {
    Link(LinkState),
    Event(GatewayEvent),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("gateway is not connected")]
    NotConnected,
    #[error("rpc '{method}' timed out")]
    RpcTimeout { method: String },
    #[error("gateway rejected call: {code}: {message}")]
    RpcRejected { code: String, message: String },
    #[error("transport task is gone")]
    ChannelClosed,
}

enum Outbound {
    Frame(WireFrame),
    Call {
        id: String,
        method: String,
        params: Value,
        respond: oneshot::Sender<Result<Value, TransportError>>,
    },
    Shutdown,
}

pub struct GatewayHandle {
    outbound_tx: mpsc::Sender<Outbound>,
    link_rx: watch::Receiver<LinkState>,
    rpc_timeout: Duration,
    mock: bool,
    task: JoinHandle<()>,
}

impl GatewayHandle {
    pub fn link_state(&self) -> LinkState {
        *self.link_rx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.link_state() == LinkState::Connected
    }

    pub fn watch_link(&self) -> watch::Receiver<LinkState> {
        self.link_rx.clone()
    }

    /// Fire-and-forget event frame. Dropped with a warning while the link is
    /// down; nothing is queued for later.
    pub async fn send_event(&self, event: &str, payload: Value) {
        if self.mock {
            debug!(event = "mock_send_discarded", name = event);
            return;
        }
        if !self.is_connected() {
            warn!(event = "send_dropped", name = event, link = self.link_state().as_str());
            return;
        }
        let frame = WireFrame::event(event, payload);
        if self.outbound_tx.send(Outbound::Frame(frame)).await.is_err() {
            warn!(event = "send_dropped", name = event, link = "task_gone");
        }
    }

    /// Request-id-correlated RPC with a client-side timeout.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        if self.mock {
            debug!(event = "mock_call", method);
            return Ok(Value::Null);
        }
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let id = Uuid::new_v4().to_string();
        let (respond, rx) = oneshot::channel();
        self.outbound_tx
            .send(Outbound::Call {
                id,
                method: method.to_string(),
                params,
                respond,
            })
            .await
            .map_err(|_| TransportError::ChannelClosed)?;
        match timeout(self.rpc_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(TransportError::ChannelClosed),
            Err(_) => Err(TransportError::RpcTimeout {
                method: method.to_string(),
            }),
        }
    }

    /// Tear the link down, cancelling any scheduled reconnect.
    pub async fn disconnect(self) {
        let _ = self.outbound_tx.send(Outbound::Shutdown).await;
        let _ = self.task.await;
    }
}

/// Start the transport task and hand back its notice stream.
pub fn spawn(config: GatewayConfig) -> (GatewayHandle, mpsc::Receiver<GatewayNotice>) {
    let (notice_tx, notice_rx) = mpsc::channel(NOTICE_CHANNEL_CAPACITY);
    let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
    let initial = if config.mock {
        LinkState::Connected
    } else {
        LinkState::Disconnected
    };
    let (link_tx, link_rx) = watch::channel(initial);
    let rpc_timeout = config.rpc_timeout;
    let mock = config.mock;

    let task = if config.mock {
        tokio::spawn(run_mock(outbound_rx, notice_tx, link_tx))
    } else {
        tokio::spawn(run_gateway(config, outbound_rx, notice_tx, link_tx))
    };

    (
        GatewayHandle {
            outbound_tx,
            link_rx,
            rpc_timeout,
            mock,
            task,
        },
        notice_rx,
    )
}

async fn run_mock(
    mut outbound_rx: mpsc::Receiver<Outbound>,
    notice_tx: mpsc::Sender<GatewayNotice>,
    link_tx: watch::Sender<LinkState>,
) {
    info!(event = "gateway_mock_mode");
    let _ = notice_tx.send(GatewayNotice::Link(LinkState::Connected)).await;
    while let Some(outbound) = outbound_rx.recv().await {
        match outbound {
            Outbound::Frame(_) => debug!(event = "mock_send_discarded"),
            Outbound::Call { method, respond, .. } => {
                debug!(event = "mock_call", method = %method);
                let _ = respond.send(Ok(Value::Null));
            }
            Outbound::Shutdown => break,
        }
    }
    let _ = link_tx.send(LinkState::Disconnected);
}

async fn run_gateway(
    config: GatewayConfig,
    mut outbound_rx: mpsc::Receiver<Outbound>,
    notice_tx: mpsc::Sender<GatewayNotice>,
    link_tx: watch::Sender<LinkState>,
) {
    let mut backoff = ReconnectBackoff::new(
        config.reconnect_base,
        config.reconnect_cap,
        config.max_reconnect_attempts,
    );
    let mut ever_connected = false;

    loop {
        let connecting = if ever_connected {
            LinkState::Reconnecting
        } else {
            LinkState::Connecting
        };
        set_link(&link_tx, &notice_tx, connecting).await;

        let ws = match timeout(config.connect_timeout, connect_async(&config.url)).await {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(err)) => {
                warn!(event = "gateway_connect_error", url = %config.url, error = %err);
                set_link(&link_tx, &notice_tx, LinkState::Disconnected).await;
                match next_retry(&mut backoff, &mut outbound_rx).await {
                    RetryOutcome::Retry => continue,
                    RetryOutcome::Shutdown => return,
                    RetryOutcome::Exhausted => {
                        return give_up(link_tx, notice_tx, outbound_rx).await
                    }
                }
            }
            Err(_) => {
                warn!(event = "gateway_connect_timeout", url = %config.url);
                set_link(&link_tx, &notice_tx, LinkState::Disconnected).await;
                match next_retry(&mut backoff, &mut outbound_rx).await {
                    RetryOutcome::Retry => continue,
                    RetryOutcome::Shutdown => return,
                    RetryOutcome::Exhausted => {
                        return give_up(link_tx, notice_tx, outbound_rx).await
                    }
                }
            }
        };

        info!(event = "gateway_connected", url = %config.url);
        backoff.reset();
        ever_connected = true;
        set_link(&link_tx, &notice_tx, LinkState::Connected).await;

        let (mut sink, mut stream) = ws.split();
        let mut pending = PendingCalls::default();
        let mut shutdown = false;

        loop {
            tokio::select! {
                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            handle_text(&text, &config, &mut sink, &mut pending, &notice_tx).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            let _ = sink.send(Message::Pong(data)).await;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!(event = "gateway_closed");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(event = "gateway_read_error", error = %err);
                            break;
                        }
                    }
                }
                maybe = outbound_rx.recv() => {
                    match maybe {
                        Some(Outbound::Frame(frame)) => {
                            if send_frame(&mut sink, &frame).await.is_err() {
                                break;
                            }
                        }
                        Some(Outbound::Call { id, method, params, respond }) => {
                            let frame = WireFrame::request(id.clone(), method, params);
                            if send_frame(&mut sink, &frame).await.is_err() {
                                let _ = respond.send(Err(TransportError::NotConnected));
                                break;
                            }
                            pending.insert(id, respond);
                        }
                        Some(Outbound::Shutdown) | None => {
                            shutdown = true;
                            break;
                        }
                    }
                }
            }
        }

        pending.fail_all();
        let _ = sink.send(Message::Close(None)).await;
        set_link(&link_tx, &notice_tx, LinkState::Disconnected).await;
        if shutdown {
            return;
        }
        match next_retry(&mut backoff, &mut outbound_rx).await {
            RetryOutcome::Retry => continue,
            RetryOutcome::Shutdown => return,
            RetryOutcome::Exhausted => return give_up(link_tx, notice_tx, outbound_rx).await,
        }
    }
}

async fn handle_text(
    text: &str,
    config: &GatewayConfig,
    sink: &mut WsSink,
    pending: &mut PendingCalls,
    notice_tx: &mpsc::Sender<GatewayNotice>,
) {
    let frame: WireFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            // Malformed payloads never close the connection.
            warn!(event = "gateway_malformed_frame", error = %err);
            return;
        }
    };
    match frame {
        WireFrame::Event { event, payload } if event == CHALLENGE_EVENT => {
            match serde_json::from_value::<ChallengePayload>(payload) {
                Ok(challenge) => {
                    debug!(event = "gateway_challenge", nonce = %challenge.nonce);
                    let auth = WireFrame::auth(challenge.nonce, config.token.clone());
                    let _ = send_frame(sink, &auth).await;
                }
                Err(err) => warn!(event = "gateway_malformed_challenge", error = %err),
            }
        }
        WireFrame::Event { event, payload } => match map_event(&event, payload) {
            Ok(mapped) => {
                if let GatewayEvent::Unknown { event, .. } = &mapped {
                    warn!(event = "unknown_gateway_event", name = %event);
                }
                let _ = notice_tx.send(GatewayNotice::Event(mapped)).await;
            }
            Err(err) => warn!(event = "gateway_event_decode_error", error = %err),
        },
        WireFrame::Res { id, result, error } => pending.complete(&id, result, error),
        WireFrame::Req { method, .. } => {
            // The gateway never calls us; log and drop.
            warn!(event = "gateway_unexpected_request", method = %method);
        }
    }
}

async fn send_frame(sink: &mut WsSink, frame: &WireFrame) -> Result<(), ()> {
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(err) => {
            warn!(event = "gateway_encode_error", error = %err);
            return Ok(());
        }
    };
    sink.send(Message::Text(text)).await.map_err(|err| {
        warn!(event = "gateway_write_error", error = %err);
    })
}

enum RetryOutcome {
    Retry,
    Shutdown,
    Exhausted,
}

/// Wait out one backoff delay. Outbound traffic arriving while disconnected
/// is dropped (frames) or rejected (calls); a shutdown cancels the retry.
async fn next_retry(
    backoff: &mut ReconnectBackoff,
    outbound_rx: &mut mpsc::Receiver<Outbound>,
) -> RetryOutcome {
    let Some(delay) = backoff.next_delay() else {
        return RetryOutcome::Exhausted;
    };
    debug!(event = "gateway_retry_scheduled", delay_ms = delay.as_millis() as u64, attempt = backoff.attempt());
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return RetryOutcome::Retry,
            maybe = outbound_rx.recv() => match maybe {
                Some(Outbound::Shutdown) | None => return RetryOutcome::Shutdown,
                Some(Outbound::Call { respond, .. }) => {
                    let _ = respond.send(Err(TransportError::NotConnected));
                }
                Some(Outbound::Frame(_)) => {
                    warn!(event = "send_dropped", link = "disconnected");
                }
            },
        }
    }
}

/// Terminal state: report unreachable and reject traffic until shutdown.
async fn give_up(
    link_tx: watch::Sender<LinkState>,
    notice_tx: mpsc::Sender<GatewayNotice>,
    mut outbound_rx: mpsc::Receiver<Outbound>,
) {
    warn!(event = "gateway_unreachable");
    set_link(&link_tx, &notice_tx, LinkState::Unreachable).await;
    while let Some(outbound) = outbound_rx.recv().await {
        match outbound {
            Outbound::Shutdown => return,
            Outbound::Call { respond, .. } => {
                let _ = respond.send(Err(TransportError::NotConnected));
            }
            Outbound::Frame(_) => warn!(event = "send_dropped", link = "unreachable"),
        }
    }
}

async fn set_link(
    link_tx: &watch::Sender<LinkState>,
    notice_tx: &mpsc::Sender<GatewayNotice>,
    state: LinkState,
) {
    let changed = {
        let current = *link_tx.borrow();
        current != state
    };
    if changed {
        let _ = link_tx.send(state);
        let _ = notice_tx.send(GatewayNotice::Link(state)).await;
    }
}

#[derive(Default)]
struct PendingCalls {
    calls: HashMap<String, oneshot::Sender<Result<Value, TransportError>>>,
}

impl PendingCalls {
    fn insert(&mut self, id: String, respond: oneshot::Sender<Result<Value, TransportError>>) {
        self.calls.insert(id, respond);
    }

    fn complete(&mut self, id: &str, result: Option<Value>, error: Option<WireError>) {
        let Some(respond) = self.calls.remove(id) else {
            warn!(event = "rpc_unmatched_response", id = %id);
            return;
        };
        let outcome = match error {
            Some(err) => Err(TransportError::RpcRejected {
                code: err.code,
                message: err.message,
            }),
            None => Ok(result.unwrap_or(Value::Null)),
        };
        let _ = respond.send(outcome);
    }

    fn fail_all(&mut self) {
        for (_, respond) in self.calls.drain() {
            let _ = respond.send(Err(TransportError::NotConnected));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn wait_for_link(
        rx: &mut watch::Receiver<LinkState>,
        want: LinkState,
    ) -> Result<(), tokio::time::error::Elapsed> {
        timeout(Duration::from_secs(5), async {
            loop {
                if *rx.borrow() == want {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
    }

    #[tokio::test]
    async fn mock_mode_always_reports_connected_and_discards_sends() {
        let (handle, _notices) = spawn(GatewayConfig::mock());
        assert!(handle.is_connected());

        handle.send_event("chat.message", json!({"content": "hi"})).await;
        let result = handle.call("sessions.list", Value::Null).await;
        assert_eq!(result, Ok(Value::Null));

        handle.disconnect().await;
    }

    #[tokio::test]
    async fn exhausted_reconnect_attempts_surface_unreachable() {
        let config = GatewayConfig {
            url: "ws://127.0.0.1:9".to_string(),
            reconnect_base: Duration::from_millis(1),
            reconnect_cap: Duration::from_millis(2),
            max_reconnect_attempts: 2,
            connect_timeout: Duration::from_millis(500),
            ..GatewayConfig::default()
        };
        let (handle, _notices) = spawn(config);
        let mut link = handle.watch_link();
        wait_for_link(&mut link, LinkState::Unreachable)
            .await
            .expect("link should become unreachable");

        let result = handle.call("sessions.list", Value::Null).await;
        assert_eq!(result, Err(TransportError::NotConnected));
        handle.disconnect().await;
    }

    #[tokio::test]
    async fn disconnect_cancels_a_scheduled_reconnect() {
        let config = GatewayConfig {
            url: "ws://127.0.0.1:9".to_string(),
            reconnect_base: Duration::from_secs(60),
            reconnect_cap: Duration::from_secs(60),
            max_reconnect_attempts: 0,
            connect_timeout: Duration::from_millis(500),
            ..GatewayConfig::default()
        };
        let (handle, _notices) = spawn(config);
        tokio::time::sleep(Duration::from_millis(50)).await;

        timeout(Duration::from_secs(2), handle.disconnect())
            .await
            .expect("disconnect should cancel the pending retry");
    }

    #[tokio::test]
    async fn handshake_answers_challenge_and_delivers_mapped_events() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut ws = tokio_tungstenite::accept_async(stream).await.expect("ws accept");

            let challenge = serde_json::to_string(&WireFrame::event(
                CHALLENGE_EVENT,
                json!({"nonce": "nonce-42"}),
            ))
            .unwrap();
            ws.send(Message::Text(challenge)).await.expect("send challenge");

            let auth = loop {
                match ws.next().await.expect("auth frame").expect("read auth") {
                    Message::Text(text) => break text,
                    _ => continue,
                }
            };
            let auth: WireFrame = serde_json::from_str(&auth).expect("parse auth");
            match auth {
                WireFrame::Event { event, payload } => {
                    assert_eq!(event, "connect.auth");
                    assert_eq!(payload["nonce"], "nonce-42");
                    assert_eq!(payload["token"], "secret");
                }
                other => panic!("expected auth event, got {other:?}"),
            }

            let thinking = serde_json::to_string(&WireFrame::event(
                "agent.thinking",
                json!({"agent_id": "agent-1"}),
            ))
            .unwrap();
            ws.send(Message::Text(thinking)).await.expect("send event");

            // Answer one RPC, then hold the socket open until the peer closes.
            loop {
                match ws.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(WireFrame::Req { id, method, .. }) = serde_json::from_str(&text) {
                            assert_eq!(method, "sessions.list");
                            let res = serde_json::to_string(&WireFrame::Res {
                                id,
                                result: Some(json!({"sessions": []})),
                                error: None,
                            })
                            .unwrap();
                            ws.send(Message::Text(res)).await.expect("send res");
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => continue,
                }
            }
        });

        let config = GatewayConfig {
            url: format!("ws://{addr}"),
            token: Some("secret".to_string()),
            ..GatewayConfig::default()
        };
        let (handle, mut notices) = spawn(config);
        let mut link = handle.watch_link();
        wait_for_link(&mut link, LinkState::Connected)
            .await
            .expect("connected");

        let event = timeout(Duration::from_secs(5), async {
            loop {
                match notices.recv().await.expect("notice") {
                    GatewayNotice::Event(event) => return event,
                    GatewayNotice::Link(_) => continue,
                }
            }
        })
        .await
        .expect("event delivered");
        assert_eq!(event.kind(), "agent_thinking");

        let result = handle
            .call("sessions.list", Value::Null)
            .await
            .expect("rpc result");
        assert_eq!(result["sessions"], json!([]));

        handle.disconnect().await;
        server.await.expect("server task");
    }
}
