//! Topic-level publish/subscribe on top of a STOMP `Connection`.
//!
//! A `Whisperer` namespaces every destination under [`TOPIC_PREFIX`],
//! publishes JSON bodies and hands parsed JSON back to subscribers. It
//! refuses to do anything until it has been activated.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::connection::{ConnError, ConnectOptions, Connection};
use crate::frame::Frame;
use crate::hooks::{Hooks, NoopHooks};
use crate::subscription::Subscription;

/// Namespace prepended to every destination handed to the broker.
pub const TOPIC_PREFIX: &str = "/topic/";

/// Map a logical destination name to the broker destination.
pub fn topic(destination: &str) -> String {
    format!("{}{}", TOPIC_PREFIX, destination)
}

/// Broker address and credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl ConnectionParams {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
        }
    }

    /// `ws://<host>:<port>/ws`
    pub fn broker_url(&self) -> String {
        format!("ws://{}:{}/ws", self.host, self.port)
    }

    /// `login` and `passcode` headers for the CONNECT frame.
    pub fn connect_headers(&self) -> Vec<(String, String)> {
        vec![
            ("login".to_string(), self.username.clone()),
            ("passcode".to_string(), self.password.clone()),
        ]
    }
}

/// A body to publish plus optional extra headers.
#[derive(Debug, Clone, PartialEq)]
pub struct Message<T = serde_json::Value> {
    pub body: T,
    pub headers: Option<Vec<(String, String)>>,
}

impl<T> Message<T> {
    pub fn new(body: T) -> Self {
        Self {
            body,
            headers: None,
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers
            .get_or_insert_with(Vec::new)
            .push((key.into(), value.into()));
        self
    }
}

/// Errors returned by `Whisperer` operations.
#[derive(Error, Debug)]
pub enum Error {
    /// `on`, `subscribe` or `emit` was called before `activate` succeeded,
    /// or after the connection stopped.
    #[error("client not initialized")]
    NotInitialized,
    #[error("failed to serialize message body: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Connection(#[from] ConnError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Decode a MESSAGE body for `on` callbacks.
///
/// Bodies that are not JSON are passed through as a JSON string.
pub fn decode_body(frame: &Frame) -> serde_json::Value {
    match serde_json::from_slice(&frame.body) {
        Ok(value) => value,
        Err(e) => {
            debug!(error = %e, "message body is not JSON, passing it as text");
            serde_json::Value::String(frame.body_text().into_owned())
        }
    }
}

/// A running `on` subscription.
///
/// Dropping the listener leaves the callback running until the connection
/// stops; call `unsubscribe` to end it earlier.
pub struct Listener {
    id: String,
    destination: String,
    conn: Connection,
    task: JoinHandle<()>,
}

impl Listener {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Broker destination, including the topic prefix.
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Send UNSUBSCRIBE and stop invoking the callback.
    ///
    /// Messages delivered before the call are still handed to the callback;
    /// this waits until it has seen all of them.
    pub async fn unsubscribe(self) -> Result<()> {
        // removing the subscription closes its channel, which ends the task
        // once the backlog is drained
        let result = self.conn.unsubscribe(&self.id).await;
        if let Err(e) = self.task.await {
            warn!(id = %self.id, error = %e, "listener callback failed");
        }
        result?;
        Ok(())
    }
}

/// Publish/subscribe helper bound to one broker.
///
/// ```ignore
/// let params = ConnectionParams::new("localhost", 15674, "guest", "guest");
/// let whisperer = Whisperer::connect(params, Arc::new(NoopHooks)).await?;
/// whisperer.on("prices", |body, _frame| println!("{}", body)).await?;
/// whisperer.emit("prices", &Message::new(json!({"eur": 1.08}))).await?;
/// ```
pub struct Whisperer {
    params: ConnectionParams,
    options: ConnectOptions,
    hooks: Arc<dyn Hooks>,
    connection: Option<Connection>,
}

impl Whisperer {
    /// Configure a client without touching the network. Call `activate`
    /// before `on` or `emit`.
    pub fn new(params: ConnectionParams) -> Self {
        Self {
            params,
            options: ConnectOptions::default(),
            hooks: Arc::new(NoopHooks),
            connection: None,
        }
    }

    pub fn with_options(mut self, options: ConnectOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn Hooks>) -> Self {
        self.hooks = hooks;
        self
    }

    /// Configure and activate in one step.
    pub async fn connect(params: ConnectionParams, hooks: Arc<dyn Hooks>) -> Result<Self> {
        let mut whisperer = Self::new(params).with_hooks(hooks);
        whisperer.activate().await?;
        Ok(whisperer)
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// Connect and log in. A no-op while already initialized.
    pub async fn activate(&mut self) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        let conn = Connection::connect(
            &self.params.broker_url(),
            self.params.connect_headers(),
            self.options.clone(),
            self.hooks.clone(),
        )
        .await?;
        self.connection = Some(conn);
        Ok(())
    }

    /// Disconnect from the broker. Running listeners stop.
    pub async fn deactivate(&mut self) {
        if let Some(conn) = self.connection.take() {
            conn.close().await;
        }
    }

    /// Whether `activate` succeeded and the connection is still up.
    pub fn is_initialized(&self) -> bool {
        self.connection.as_ref().is_some_and(Connection::is_active)
    }

    fn active_connection(&self) -> Result<&Connection> {
        self.connection
            .as_ref()
            .filter(|conn| conn.is_active())
            .ok_or(Error::NotInitialized)
    }

    /// Subscribe to `/topic/<destination>` and receive raw frames.
    pub async fn subscribe(&self, destination: &str) -> Result<Subscription> {
        let conn = self.active_connection()?;
        Ok(conn.subscribe(&topic(destination), Vec::new()).await?)
    }

    /// Invoke `on_message` with the JSON body and the frame of every message
    /// published to `/topic/<destination>`.
    pub async fn on<F>(&self, destination: &str, on_message: F) -> Result<Listener>
    where
        F: Fn(serde_json::Value, &Frame) + Send + Sync + 'static,
    {
        self.on_async(destination, move |body, frame| {
            on_message(body, &frame);
            std::future::ready(())
        })
        .await
    }

    /// Like `on`, but awaits the future the callback returns before handling
    /// the next message.
    pub async fn on_async<F, Fut>(&self, destination: &str, on_message: F) -> Result<Listener>
    where
        F: Fn(serde_json::Value, Frame) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let subscription = self.subscribe(destination).await?;
        let (id, destination, mut receiver, conn) = subscription.into_parts();
        let task = tokio::spawn(async move {
            while let Some(frame) = receiver.recv().await {
                let body = decode_body(&frame);
                on_message(body, frame).await;
            }
        });
        Ok(Listener {
            id,
            destination,
            conn,
            task,
        })
    }

    /// Publish `message` to `/topic/<destination>` with a JSON body.
    pub async fn emit<T: Serialize>(&self, destination: &str, message: &Message<T>) -> Result<()> {
        let conn = self.active_connection()?;
        conn.send_frame(build_send(destination, message)?).await?;
        Ok(())
    }

    /// Publish like `emit` and wait until the broker confirms it with a
    /// RECEIPT.
    pub async fn emit_confirmed<T: Serialize>(
        &self,
        destination: &str,
        message: &Message<T>,
        timeout: Duration,
    ) -> Result<()> {
        let conn = self.active_connection()?;
        conn.send_frame_confirmed(build_send(destination, message)?, timeout)
            .await?;
        Ok(())
    }
}

/// Build the SEND frame for `emit`. The body is serialized once; the
/// caller's headers are copied, except `destination`, which would escape the
/// topic namespace.
fn build_send<T: Serialize>(destination: &str, message: &Message<T>) -> Result<Frame> {
    let body = serde_json::to_string(&message.body)?;
    let mut frame = Frame::new("SEND").header("destination", topic(destination));
    for (k, v) in message.headers.iter().flatten() {
        if k == "destination" {
            warn!(value = %v, "ignoring destination header on emit");
            continue;
        }
        frame = frame.header(k.as_str(), v.as_str());
    }
    Ok(frame.set_body(body))
}

#[cfg(test)]
impl Whisperer {
    fn with_connection(params: ConnectionParams, conn: Connection) -> Self {
        let mut whisperer = Self::new(params);
        whisperer.connection = Some(conn);
        whisperer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::StompItem;
    use serde::ser::Serializer;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn params() -> ConnectionParams {
        ConnectionParams::new("broker.local", 15674, "guest", "secret")
    }

    async fn next_frame(out_rx: &mut mpsc::Receiver<StompItem>) -> Frame {
        match out_rx.recv().await {
            Some(StompItem::Frame(f)) => f,
            other => panic!("expected frame, got {:?}", other),
        }
    }

    /// Serializes as a number and counts how often it was asked to.
    struct Counted(Arc<AtomicUsize>);

    impl Serialize for Counted {
        fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
            self.0.fetch_add(1, Ordering::SeqCst);
            serializer.serialize_u32(7)
        }
    }

    #[test]
    fn params_build_url_and_login_headers() {
        let p = params();
        assert_eq!(p.broker_url(), "ws://broker.local:15674/ws");
        assert_eq!(
            p.connect_headers(),
            vec![
                ("login".to_string(), "guest".to_string()),
                ("passcode".to_string(), "secret".to_string()),
            ]
        );
    }

    #[test]
    fn params_deserialize_from_json() {
        let p: ConnectionParams = serde_json::from_value(json!({
            "host": "h", "port": 61614, "username": "u", "password": "p"
        }))
        .unwrap();
        assert_eq!(p, ConnectionParams::new("h", 61614, "u", "p"));
    }

    #[tokio::test]
    async fn operations_fail_before_activation() {
        let w = Whisperer::new(params());
        assert!(!w.is_initialized());

        assert!(matches!(
            w.on("anything", |_, _| {}).await,
            Err(Error::NotInitialized)
        ));
        assert!(matches!(w.subscribe("").await, Err(Error::NotInitialized)));
        assert!(matches!(
            w.emit("x", &Message::new(json!(null))).await,
            Err(Error::NotInitialized)
        ));
        assert!(matches!(
            w.emit_confirmed("x", &Message::new(1), Duration::from_secs(1))
                .await,
            Err(Error::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn emit_before_activation_does_not_serialize() {
        let w = Whisperer::new(params());
        let count = Arc::new(AtomicUsize::new(0));
        let result = w.emit("x", &Message::new(Counted(count.clone()))).await;
        assert!(matches!(result, Err(Error::NotInitialized)));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn emit_serializes_once_and_prefixes_destination() {
        let (conn, mut out_rx) = Connection::detached();
        let w = Whisperer::with_connection(params(), conn);
        let count = Arc::new(AtomicUsize::new(0));

        w.emit("orders", &Message::new(Counted(count.clone())))
            .await
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        let f = next_frame(&mut out_rx).await;
        assert_eq!(f.command, "SEND");
        assert_eq!(f.destination(), Some("/topic/orders"));
        assert_eq!(f.body, b"7");
    }

    #[tokio::test]
    async fn emit_copies_headers_without_touching_them() {
        let (conn, mut out_rx) = Connection::detached();
        let w = Whisperer::with_connection(params(), conn);
        let message = Message::new(json!({"qty": 3}))
            .with_header("priority", "9")
            .with_header("destination", "/queue/elsewhere");
        let before = message.clone();

        w.emit("orders", &message).await.unwrap();

        assert_eq!(message, before);
        let f = next_frame(&mut out_rx).await;
        assert_eq!(
            f.headers,
            vec![
                ("destination".to_string(), "/topic/orders".to_string()),
                ("priority".to_string(), "9".to_string()),
            ]
        );
        assert_eq!(f.body, br#"{"qty":3}"#);
    }

    #[tokio::test]
    async fn on_subscribes_under_topic_and_decodes_json() {
        let (conn, mut out_rx) = Connection::detached();
        let w = Whisperer::with_connection(params(), conn.clone());
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();

        let listener = w
            .on("prices", move |body, frame| {
                let _ = seen_tx.send((body, frame.message_id().map(str::to_string)));
            })
            .await
            .unwrap();
        assert_eq!(listener.destination(), "/topic/prices");

        let f = next_frame(&mut out_rx).await;
        assert_eq!(f.command, "SUBSCRIBE");
        assert_eq!(f.destination(), Some("/topic/prices"));

        conn.inject(
            Frame::new("MESSAGE")
                .header("subscription", listener.id())
                .header("destination", "/topic/prices")
                .header("message-id", "m-9")
                .set_body(br#"{"eur":1.08}"#.to_vec()),
        )
        .await;

        let (body, message_id) = seen_rx.recv().await.unwrap();
        assert_eq!(body, json!({"eur": 1.08}));
        assert_eq!(message_id.as_deref(), Some("m-9"));

        listener.unsubscribe().await.unwrap();
        let f = next_frame(&mut out_rx).await;
        assert_eq!(f.command, "UNSUBSCRIBE");
    }

    #[tokio::test]
    async fn unsubscribe_delivers_backlog_first() {
        let (conn, mut out_rx) = Connection::detached();
        let w = Whisperer::with_connection(params(), conn.clone());
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = seen.clone();
        let listener = w
            .on_async("ticks", move |_body, _frame| {
                let counter = counter.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .await
            .unwrap();
        let _ = next_frame(&mut out_rx).await;

        for i in 0..3 {
            conn.inject(
                Frame::new("MESSAGE")
                    .header("subscription", listener.id())
                    .header("destination", "/topic/ticks")
                    .set_body(format!("{}", i).into_bytes()),
            )
            .await;
        }

        listener.unsubscribe().await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
        assert_eq!(next_frame(&mut out_rx).await.command, "UNSUBSCRIBE");
    }

    #[test]
    fn non_json_body_is_passed_as_text() {
        let frame = Frame::new("MESSAGE").set_body(b"plain words".to_vec());
        assert_eq!(decode_body(&frame), json!("plain words"));
    }

    #[test]
    fn not_initialized_message() {
        assert_eq!(Error::NotInitialized.to_string(), "client not initialized");
    }
}
