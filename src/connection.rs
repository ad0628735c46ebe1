use bytes::BytesMut;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, info, warn};

use crate::codec::{StompCodec, StompItem};
use crate::frame::Frame;
use crate::hooks::Hooks;
use crate::subscription::Subscription;

/// Sub-protocols offered during the WebSocket upgrade, newest first.
pub const STOMP_SUBPROTOCOLS: &str = "v12.stomp, v11.stomp, v10.stomp";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, WsMessage>;
type WsSource = SplitStream<WsStream>;

/// Internal subscription entry stored for each destination.
pub(crate) struct SubscriptionEntry {
    pub(crate) id: String,
    pub(crate) sender: mpsc::Sender<Frame>,
}

/// Destination -> subscriptions listening on it.
pub(crate) type Subscriptions = HashMap<String, Vec<SubscriptionEntry>>;

/// Receipt id -> waiter to notify when the broker's RECEIPT arrives.
pub(crate) type PendingReceipts = HashMap<String, oneshot::Sender<()>>;

/// An `ERROR` frame sent by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    /// Value of the `message` header, or `"unknown error"` when absent.
    pub message: String,
    /// Body text, when the frame carried a non-empty UTF-8 body.
    pub body: Option<String>,
    /// `receipt-id` of the frame that triggered the error, if any.
    pub receipt_id: Option<String>,
    /// The frame as received.
    pub frame: Frame,
}

impl ServerError {
    pub fn from_frame(frame: Frame) -> Self {
        let message = frame
            .get_header("message")
            .unwrap_or("unknown error")
            .to_string();
        let body = if frame.body.is_empty() {
            None
        } else {
            std::str::from_utf8(&frame.body).ok().map(str::to_string)
        };
        let receipt_id = frame.get_header("receipt-id").map(str::to_string);
        Self {
            message,
            body,
            receipt_id,
            frame,
        }
    }
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "server error: {}", self.message)?;
        if let Some(body) = &self.body {
            write!(f, ": {}", body)?;
        }
        Ok(())
    }
}

impl std::error::Error for ServerError {}

/// Errors returned by `Connection` operations.
#[derive(Error, Debug)]
pub enum ConnError {
    /// I/O-level error, including undecodable wire data
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// WebSocket handshake or transport failure
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    /// Protocol-level error
    #[error("protocol error: {0}")]
    Protocol(String),
    /// A connection phase did not finish within `ConnectOptions::connect_timeout`
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    /// The broker answered CONNECT with an ERROR frame
    #[error("broker rejected connection: {0}")]
    ServerRejected(ServerError),
    /// Receipt timeout error
    #[error("receipt timeout: no RECEIPT received for '{0}' within timeout")]
    ReceiptTimeout(String),
}

/// Tunables for a single connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// `heart-beat` header value sent with CONNECT ("cx,cy" in milliseconds).
    pub heartbeat: String,
    /// Virtual host sent in the `host` header.
    pub host: String,
    /// Limit for the WebSocket upgrade and, separately, for CONNECTED.
    pub connect_timeout: Duration,
    /// Per-subscription queue length; messages beyond it are dropped.
    pub subscription_buffer: usize,
    /// Additional CONNECT headers.
    pub headers: Vec<(String, String)>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            heartbeat: "10000,10000".to_string(),
            host: "/".to_string(),
            connect_timeout: Duration::from_secs(10),
            subscription_buffer: 64,
            headers: Vec::new(),
        }
    }
}

impl ConnectOptions {
    pub fn with_heartbeat(mut self, heartbeat: impl Into<String>) -> Self {
        self.heartbeat = heartbeat.into();
        self
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Zero is treated as one; `mpsc` channels need capacity.
    pub fn with_subscription_buffer(mut self, capacity: usize) -> Self {
        self.subscription_buffer = capacity.max(1);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }
}

/// Parse the STOMP `heart-beat` header value (format: "cx,cy").
///
/// Returns `(cx, cy)` in milliseconds. Missing or invalid fields default
/// to `0`.
pub fn parse_heartbeat_header(header: &str) -> (u64, u64) {
    let mut parts = header.split(',');
    let mut next = || {
        parts
            .next()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(0)
    };
    let cx = next();
    let cy = next();
    (cx, cy)
}

/// Negotiate heartbeat intervals between client and server.
///
/// Returns `(outgoing, incoming)`. A direction is enabled only when both
/// sides ask for it (neither value is `0`), in which case the larger of the
/// two values wins.
pub fn negotiate_heartbeats(
    client_out: u64,
    client_in: u64,
    server_out: u64,
    server_in: u64,
) -> (Option<Duration>, Option<Duration>) {
    let pick = |ours: u64, theirs: u64| {
        if ours == 0 || theirs == 0 {
            None
        } else {
            Some(Duration::from_millis(ours.max(theirs)))
        }
    };
    (pick(client_out, server_in), pick(client_in, server_out))
}

/// Handle to a STOMP session carried over a WebSocket.
///
/// `connect` performs the WebSocket upgrade and the CONNECT/CONNECTED
/// exchange, then spawns a background task that owns the socket: it writes
/// queued frames, sends and checks heartbeats, and routes inbound frames to
/// subscriptions, receipt waiters and the `Hooks`. Handles are cheap to
/// clone; they all talk to the same task.
///
/// There is no automatic reconnect. Once the task stops, `is_active`
/// returns `false` and every operation fails.
#[derive(Clone)]
pub struct Connection {
    outbound_tx: mpsc::Sender<StompItem>,
    shutdown_tx: broadcast::Sender<()>,
    active: Arc<AtomicBool>,
    subscriptions: Arc<Mutex<Subscriptions>>,
    sub_id_counter: Arc<AtomicU64>,
    receipt_counter: Arc<AtomicU64>,
    pending_receipts: Arc<Mutex<PendingReceipts>>,
    subscription_buffer: usize,
}

impl Connection {
    /// Open a WebSocket to `url` and log in to the broker.
    ///
    /// `connect_headers` are added to the CONNECT frame (typically `login`
    /// and `passcode`). Resolves once the broker answered with CONNECTED;
    /// an ERROR answer is passed to `Hooks::on_error` and returned as
    /// `ConnError::ServerRejected`.
    pub async fn connect(
        url: &str,
        connect_headers: Vec<(String, String)>,
        options: ConnectOptions,
        hooks: Arc<dyn Hooks>,
    ) -> Result<Self, ConnError> {
        // CONNECT headers go out unescaped, so line breaks would forge headers
        for (k, v) in connect_headers.iter().chain(&options.headers) {
            check_connect_header(k, v)?;
        }
        check_connect_header("host", &options.host)?;
        check_connect_header("heart-beat", &options.heartbeat)?;

        let mut request = url.into_client_request()?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(STOMP_SUBPROTOCOLS),
        );

        debug!(url, "opening websocket");
        let (ws, _response) = tokio::time::timeout(options.connect_timeout, connect_async(request))
            .await
            .map_err(|_| ConnError::Timeout("websocket handshake"))??;
        let (mut sink, mut stream) = ws.split();

        let mut codec = StompCodec::new();
        let mut read_buf = BytesMut::new();

        let connect = Frame::new("CONNECT")
            .header("accept-version", "1.2")
            .header("host", &options.host)
            .headers(connect_headers)
            .headers(options.headers.iter().cloned())
            .header("heart-beat", &options.heartbeat);
        send_item(&mut sink, &mut codec, StompItem::Frame(connect)).await?;

        let handshake = tokio::time::timeout(
            options.connect_timeout,
            await_connected(&mut stream, &mut codec, &mut read_buf),
        )
        .await
        .map_err(|_| ConnError::Timeout("CONNECTED frame"))?;

        let connected = match handshake {
            Ok(frame) => frame,
            Err(ConnError::ServerRejected(err)) => {
                warn!(message = %err.message, "broker rejected CONNECT");
                hooks.on_error(&err);
                return Err(ConnError::ServerRejected(err));
            }
            Err(e) => return Err(e),
        };

        let (cx, cy) = parse_heartbeat_header(&options.heartbeat);
        let (sx, sy) = parse_heartbeat_header(connected.get_header("heart-beat").unwrap_or("0,0"));
        let (send_interval, recv_interval) = negotiate_heartbeats(cx, cy, sx, sy);
        info!(
            url,
            version = connected.get_header("version").unwrap_or("1.0"),
            ?send_interval,
            ?recv_interval,
            "connected to broker"
        );

        let (outbound_tx, outbound_rx) = mpsc::channel::<StompItem>(32);
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        let conn = Connection {
            outbound_tx,
            shutdown_tx,
            active: Arc::new(AtomicBool::new(true)),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            sub_id_counter: Arc::new(AtomicU64::new(0)),
            receipt_counter: Arc::new(AtomicU64::new(0)),
            pending_receipts: Arc::new(Mutex::new(HashMap::new())),
            subscription_buffer: options.subscription_buffer.max(1),
        };

        // frames that shared a WebSocket message with CONNECTED
        let buffered = codec.decode_all(&mut read_buf)?;
        hooks.on_connect(&connected);
        for item in buffered {
            if let StompItem::Frame(frame) = item {
                dispatch(frame, &conn.subscriptions, &conn.pending_receipts, hooks.as_ref()).await;
            }
        }

        let task = SessionTask {
            sink,
            stream,
            codec,
            read_buf,
            outbound_rx,
            shutdown_rx,
            active: conn.active.clone(),
            subscriptions: conn.subscriptions.clone(),
            pending_receipts: conn.pending_receipts.clone(),
            hooks,
            send_interval,
            recv_interval,
        };
        tokio::spawn(task.run());

        Ok(conn)
    }

    /// Whether the background task is still running.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Queue a frame for the background writer.
    pub async fn send_frame(&self, frame: Frame) -> Result<(), ConnError> {
        self.outbound_tx
            .send(StompItem::Frame(frame))
            .await
            .map_err(|_| ConnError::Protocol("send channel closed".into()))
    }

    /// Send a frame with a `receipt` header and wait for the broker's
    /// RECEIPT.
    ///
    /// Returns `ConnError::ReceiptTimeout` when no RECEIPT arrives within
    /// `timeout`, or a protocol error if the connection stops first.
    pub async fn send_frame_confirmed(
        &self,
        frame: Frame,
        timeout: Duration,
    ) -> Result<(), ConnError> {
        let receipt_id = format!(
            "rcpt-{}",
            self.receipt_counter.fetch_add(1, Ordering::SeqCst)
        );

        // Register before sending so a fast RECEIPT is not missed
        let (tx, rx) = oneshot::channel();
        self.pending_receipts
            .lock()
            .await
            .insert(receipt_id.clone(), tx);

        if let Err(e) = self.send_frame(frame.receipt(&receipt_id)).await {
            self.pending_receipts.lock().await.remove(&receipt_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ConnError::Protocol(
                "connection closed before RECEIPT".into(),
            )),
            Err(_) => {
                self.pending_receipts.lock().await.remove(&receipt_id);
                Err(ConnError::ReceiptTimeout(receipt_id))
            }
        }
    }

    /// Subscribe to `destination` exactly as given, in `auto` ack mode.
    ///
    /// `extra_headers` are appended to the SUBSCRIBE frame. MESSAGE frames
    /// for the subscription are delivered through the returned handle.
    pub async fn subscribe(
        &self,
        destination: &str,
        extra_headers: Vec<(String, String)>,
    ) -> Result<Subscription, ConnError> {
        let id = format!(
            "sub-{}",
            self.sub_id_counter.fetch_add(1, Ordering::SeqCst)
        );
        let (tx, rx) = mpsc::channel::<Frame>(self.subscription_buffer);
        self.subscriptions
            .lock()
            .await
            .entry(destination.to_string())
            .or_default()
            .push(SubscriptionEntry {
                id: id.clone(),
                sender: tx,
            });

        let f = Frame::new("SUBSCRIBE")
            .header("id", &id)
            .header("destination", destination)
            .header("ack", "auto")
            .headers(extra_headers);
        if let Err(e) = self.send_frame(f).await {
            self.remove_subscription(&id).await;
            return Err(e);
        }
        debug!(%id, destination, "subscribed");

        Ok(Subscription::new(
            id,
            destination.to_string(),
            rx,
            self.clone(),
        ))
    }

    /// Remove a subscription by its local id and send UNSUBSCRIBE.
    pub async fn unsubscribe(&self, subscription_id: &str) -> Result<(), ConnError> {
        if !self.remove_subscription(subscription_id).await {
            return Err(ConnError::Protocol("subscription id not found".into()));
        }
        debug!(id = subscription_id, "unsubscribing");
        self.send_frame(Frame::new("UNSUBSCRIBE").header("id", subscription_id))
            .await
    }

    async fn remove_subscription(&self, subscription_id: &str) -> bool {
        let mut map = self.subscriptions.lock().await;
        let mut found = false;
        for entries in map.values_mut() {
            let before = entries.len();
            entries.retain(|entry| entry.id != subscription_id);
            found |= entries.len() != before;
        }
        map.retain(|_, entries| !entries.is_empty());
        found
    }

    /// Ask the background task to send DISCONNECT and close the socket.
    pub async fn close(self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
impl Connection {
    /// A connection without a socket: frames queued by its methods come out
    /// of the returned receiver.
    pub(crate) fn detached() -> (Self, mpsc::Receiver<StompItem>) {
        let (outbound_tx, outbound_rx) = mpsc::channel::<StompItem>(32);
        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let conn = Connection {
            outbound_tx,
            shutdown_tx,
            active: Arc::new(AtomicBool::new(true)),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            sub_id_counter: Arc::new(AtomicU64::new(0)),
            receipt_counter: Arc::new(AtomicU64::new(0)),
            pending_receipts: Arc::new(Mutex::new(HashMap::new())),
            subscription_buffer: 8,
        };
        (conn, outbound_rx)
    }

    /// Route an inbound frame as if the broker had sent it.
    pub(crate) async fn inject(&self, frame: Frame) {
        dispatch(
            frame,
            &self.subscriptions,
            &self.pending_receipts,
            &crate::hooks::NoopHooks,
        )
        .await;
    }
}

/// Reject a CONNECT header that cannot be written verbatim.
fn check_connect_header(key: &str, value: &str) -> Result<(), ConnError> {
    if key.is_empty() || key.contains([':', '\n', '\r']) {
        return Err(ConnError::Protocol(format!(
            "invalid CONNECT header name {:?}",
            key
        )));
    }
    if value.contains(['\n', '\r']) {
        return Err(ConnError::Protocol(format!(
            "CONNECT header '{}' contains a line break",
            key
        )));
    }
    Ok(())
}

/// Encode `item` and write it as one WebSocket message: text when the
/// encoding is valid UTF-8, binary otherwise.
async fn send_item(
    sink: &mut WsSink,
    codec: &mut StompCodec,
    item: StompItem,
) -> Result<(), ConnError> {
    let mut buf = BytesMut::new();
    codec.encode(item, &mut buf)?;
    let msg = match String::from_utf8(buf.to_vec()) {
        Ok(text) => WsMessage::text(text),
        Err(e) => WsMessage::binary(e.into_bytes()),
    };
    sink.send(msg).await?;
    Ok(())
}

/// STOMP bytes carried by a WebSocket message; `None` for control messages.
fn payload(msg: &WsMessage) -> Option<&[u8]> {
    match msg {
        WsMessage::Text(text) => Some(text.as_bytes()),
        WsMessage::Binary(data) => Some(&data[..]),
        _ => None,
    }
}

/// Read until CONNECTED or ERROR. Frames after CONNECTED that arrived in
/// the same message stay in `read_buf`.
async fn await_connected(
    stream: &mut WsSource,
    codec: &mut StompCodec,
    read_buf: &mut BytesMut,
) -> Result<Frame, ConnError> {
    loop {
        while let Some(item) = codec.decode(read_buf)? {
            let StompItem::Frame(frame) = item else {
                continue;
            };
            match frame.command.as_str() {
                "CONNECTED" => return Ok(frame),
                "ERROR" => return Err(ConnError::ServerRejected(ServerError::from_frame(frame))),
                other => debug!(command = other, "ignoring frame before CONNECTED"),
            }
        }

        match stream.next().await {
            Some(Ok(WsMessage::Close(_))) | None => {
                return Err(ConnError::Protocol(
                    "connection closed before CONNECTED".into(),
                ));
            }
            Some(Ok(msg)) => {
                if let Some(bytes) = payload(&msg) {
                    read_buf.extend_from_slice(bytes);
                }
            }
            Some(Err(e)) => return Err(e.into()),
        }
    }
}

/// Route one inbound frame.
async fn dispatch(
    frame: Frame,
    subscriptions: &Mutex<Subscriptions>,
    pending_receipts: &Mutex<PendingReceipts>,
    hooks: &dyn Hooks,
) {
    match frame.command.as_str() {
        "MESSAGE" => deliver_message(subscriptions, frame).await,
        "RECEIPT" => {
            let Some(receipt_id) = frame.get_header("receipt-id") else {
                debug!("RECEIPT without receipt-id");
                return;
            };
            let waiter = pending_receipts.lock().await.remove(receipt_id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(());
                }
                None => debug!(receipt_id, "RECEIPT nobody is waiting for"),
            }
        }
        "ERROR" => {
            let err = ServerError::from_frame(frame);
            warn!(message = %err.message, "broker sent ERROR");
            hooks.on_error(&err);
        }
        other => debug!(command = other, "ignoring frame"),
    }
}

/// Hand a MESSAGE to its subscription (by `subscription` header, falling
/// back to `destination`). Full queues drop the message; closed queues are
/// pruned.
async fn deliver_message(subscriptions: &Mutex<Subscriptions>, frame: Frame) {
    let sub_id = frame.subscription().map(str::to_string);
    let destination = frame.destination().map(str::to_string);
    let mut delivered = false;

    let mut map = subscriptions.lock().await;
    for (dest, entries) in map.iter_mut() {
        entries.retain(|entry| {
            let matches = match &sub_id {
                Some(id) => &entry.id == id,
                None => destination.as_deref() == Some(dest.as_str()),
            };
            if !matches {
                return true;
            }
            delivered = true;
            match entry.sender.try_send(frame.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(subscription = %entry.id, "subscriber queue full, dropping message");
                    true
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }
    map.retain(|_, entries| !entries.is_empty());

    if !delivered {
        debug!(?sub_id, ?destination, "MESSAGE for unknown subscription");
    }
}

/// State owned by the background task of one connection.
struct SessionTask {
    sink: WsSink,
    stream: WsSource,
    codec: StompCodec,
    read_buf: BytesMut,
    outbound_rx: mpsc::Receiver<StompItem>,
    shutdown_rx: broadcast::Receiver<()>,
    active: Arc<AtomicBool>,
    subscriptions: Arc<Mutex<Subscriptions>>,
    pending_receipts: Arc<Mutex<PendingReceipts>>,
    hooks: Arc<dyn Hooks>,
    send_interval: Option<Duration>,
    recv_interval: Option<Duration>,
}

impl SessionTask {
    async fn run(self) {
        let SessionTask {
            mut sink,
            mut stream,
            mut codec,
            mut read_buf,
            mut outbound_rx,
            mut shutdown_rx,
            active,
            subscriptions,
            pending_receipts,
            hooks,
            send_interval,
            recv_interval,
        } = self;

        // Intervals only drive the checks; the idle day-long period keeps
        // disabled timers from firing.
        const IDLE: Duration = Duration::from_secs(86400);
        let mut hb_tick = tokio::time::interval(send_interval.unwrap_or(IDLE));
        let mut watchdog = tokio::time::interval(recv_interval.map(|d| d / 2).unwrap_or(IDLE));
        let mut last_sent = Instant::now();
        let mut last_received = Instant::now();

        'conn: loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    // frames queued before the shutdown are still owed to the broker
                    while let Ok(item) = outbound_rx.try_recv() {
                        if let Err(e) = send_item(&mut sink, &mut codec, item).await {
                            warn!(error = %e, "write failed while closing");
                            break;
                        }
                    }
                    let _ = send_item(&mut sink, &mut codec, StompItem::Frame(Frame::new("DISCONNECT"))).await;
                    let _ = sink.close().await;
                    break 'conn;
                }
                maybe = outbound_rx.recv() => {
                    let Some(item) = maybe else {
                        // every handle dropped
                        let _ = send_item(&mut sink, &mut codec, StompItem::Frame(Frame::new("DISCONNECT"))).await;
                        let _ = sink.close().await;
                        break 'conn;
                    };
                    if let Err(e) = send_item(&mut sink, &mut codec, item).await {
                        warn!(error = %e, "write failed");
                        break 'conn;
                    }
                    last_sent = Instant::now();
                }
                msg = stream.next() => {
                    match msg {
                        Some(Ok(WsMessage::Close(reason))) => {
                            debug!(?reason, "broker closed websocket");
                            break 'conn;
                        }
                        Some(Ok(msg)) => {
                            last_received = Instant::now();
                            let Some(bytes) = payload(&msg) else { continue 'conn };
                            read_buf.extend_from_slice(bytes);
                            let items = match codec.decode_all(&mut read_buf) {
                                Ok(items) => items,
                                Err(e) => {
                                    warn!(error = %e, "undecodable data from broker");
                                    break 'conn;
                                }
                            };
                            for item in items {
                                if let StompItem::Frame(frame) = item {
                                    dispatch(frame, &subscriptions, &pending_receipts, hooks.as_ref()).await;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "websocket read failed");
                            break 'conn;
                        }
                        None => break 'conn,
                    }
                }
                _ = hb_tick.tick(), if send_interval.is_some() => {
                    if let Some(interval) = send_interval {
                        if last_sent.elapsed() >= interval {
                            if send_item(&mut sink, &mut codec, StompItem::Heartbeat).await.is_err() {
                                break 'conn;
                            }
                            last_sent = Instant::now();
                        }
                    }
                }
                _ = watchdog.tick(), if recv_interval.is_some() => {
                    if let Some(interval) = recv_interval {
                        if last_received.elapsed() > interval * 2 {
                            warn!(?interval, "no data from broker, dropping connection");
                            let _ = sink.close().await;
                            break 'conn;
                        }
                    }
                }
            }
        }

        active.store(false, Ordering::SeqCst);
        // Dropping the senders ends every subscription stream and fails
        // outstanding receipt waits.
        subscriptions.lock().await.clear();
        pending_receipts.lock().await.clear();
        info!("connection closed");
        hooks.on_disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_headers_with_line_breaks_are_rejected() {
        assert!(check_connect_header("login", "guest").is_ok());
        assert!(check_connect_header("passcode", "a:b").is_ok());
        assert!(matches!(
            check_connect_header("passcode", "pw\nlogin:admin"),
            Err(ConnError::Protocol(_))
        ));
        assert!(check_connect_header("passcode", "pw\r").is_err());
        assert!(check_connect_header("x:y", "v").is_err());
        assert!(check_connect_header("", "v").is_err());
    }

    fn message_for(subscription: Option<&str>, destination: &str, body: &str) -> Frame {
        let mut f = Frame::new("MESSAGE")
            .header("destination", destination)
            .header("message-id", "m-1");
        if let Some(s) = subscription {
            f = f.header("subscription", s);
        }
        f.set_body(body.as_bytes().to_vec())
    }

    async fn next_frame(out_rx: &mut mpsc::Receiver<StompItem>) -> Frame {
        match out_rx.recv().await {
            Some(StompItem::Frame(f)) => f,
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn subscribe_sends_frame_and_allocates_ids() {
        let (conn, mut out_rx) = Connection::detached();

        let first = conn.subscribe("/topic/a", Vec::new()).await.unwrap();
        let second = conn
            .subscribe("/topic/b", vec![("selector".into(), "x = 1".into())])
            .await
            .unwrap();
        assert_eq!(first.id(), "sub-0");
        assert_eq!(second.id(), "sub-1");

        let f = next_frame(&mut out_rx).await;
        assert_eq!(f.command, "SUBSCRIBE");
        assert_eq!(f.get_header("id"), Some("sub-0"));
        assert_eq!(f.get_header("destination"), Some("/topic/a"));
        assert_eq!(f.get_header("ack"), Some("auto"));

        let f = next_frame(&mut out_rx).await;
        assert_eq!(f.get_header("selector"), Some("x = 1"));
    }

    #[tokio::test]
    async fn message_routed_by_subscription_header() {
        let (conn, _out_rx) = Connection::detached();
        let mut a = conn.subscribe("/topic/same", Vec::new()).await.unwrap();
        let mut b = conn.subscribe("/topic/same", Vec::new()).await.unwrap();

        conn.inject(message_for(Some(b.id()), "/topic/same", "for-b"))
            .await;

        let got = b.recv().await.unwrap();
        assert_eq!(got.body, b"for-b");
        assert!(a.try_recv().is_none());
    }

    #[tokio::test]
    async fn message_without_subscription_header_uses_destination() {
        let (conn, _out_rx) = Connection::detached();
        let mut a = conn.subscribe("/topic/one", Vec::new()).await.unwrap();
        let mut b = conn.subscribe("/topic/two", Vec::new()).await.unwrap();

        conn.inject(message_for(None, "/topic/two", "hello")).await;

        assert_eq!(b.recv().await.unwrap().body, b"hello");
        assert!(a.try_recv().is_none());
    }

    #[tokio::test]
    async fn dropped_subscription_is_pruned() {
        let (conn, _out_rx) = Connection::detached();
        let sub = conn.subscribe("/topic/gone", Vec::new()).await.unwrap();
        drop(sub);

        conn.inject(message_for(None, "/topic/gone", "x")).await;
        assert!(conn.subscriptions.lock().await.is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_removes_entry_and_sends_frame() {
        let (conn, mut out_rx) = Connection::detached();
        let sub = conn.subscribe("/topic/u", Vec::new()).await.unwrap();
        let _ = next_frame(&mut out_rx).await;

        sub.unsubscribe().await.unwrap();
        let f = next_frame(&mut out_rx).await;
        assert_eq!(f.command, "UNSUBSCRIBE");
        assert_eq!(f.get_header("id"), Some("sub-0"));
        assert!(conn.subscriptions.lock().await.is_empty());

        match conn.unsubscribe("sub-0").await {
            Err(ConnError::Protocol(msg)) => assert!(msg.contains("not found")),
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn receipt_resolves_confirmed_send() {
        let (conn, mut out_rx) = Connection::detached();
        let sender = conn.clone();
        let waiter = tokio::spawn(async move {
            sender
                .send_frame_confirmed(Frame::new("SEND"), Duration::from_secs(5))
                .await
        });

        let f = next_frame(&mut out_rx).await;
        let receipt = f.get_header("receipt").unwrap().to_string();
        assert_eq!(receipt, "rcpt-0");
        conn.inject(Frame::new("RECEIPT").header("receipt-id", receipt))
            .await;

        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn missing_receipt_times_out() {
        let (conn, _out_rx) = Connection::detached();
        let result = conn
            .send_frame_confirmed(Frame::new("SEND"), Duration::from_millis(20))
            .await;
        match result {
            Err(ConnError::ReceiptTimeout(id)) => assert_eq!(id, "rcpt-0"),
            other => panic!("expected receipt timeout, got {:?}", other),
        }
        assert!(conn.pending_receipts.lock().await.is_empty());
    }

    #[test]
    fn server_error_display_includes_body() {
        let err = ServerError::from_frame(
            Frame::new("ERROR")
                .header("message", "bad destination")
                .set_body(b"no such topic".to_vec()),
        );
        assert_eq!(err.to_string(), "server error: bad destination: no such topic");
    }
}
