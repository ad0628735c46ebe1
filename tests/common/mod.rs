//! A scripted STOMP-over-WebSocket broker for integration tests.
//!
//! Each test binds a listener, spawns a task that accepts one client and
//! plays its side of the conversation with `read_frame`/`send_frame`.

#![allow(dead_code)]

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{WebSocketStream, accept_hdr_async};
use tokio_util::codec::{Decoder, Encoder};
use whisperer::codec::{StompCodec, StompItem};
use whisperer::{Frame, Hooks, ServerError};

pub type BrokerSocket = WebSocketStream<TcpStream>;

pub async fn bind() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("local addr").port();
    (listener, port)
}

/// Accept one WebSocket client, answering the STOMP sub-protocol request.
/// Returns the socket and the request path.
pub async fn accept(listener: &TcpListener) -> (BrokerSocket, String) {
    let (stream, _) = listener.accept().await.expect("accept");
    let mut path = String::new();
    let ws = accept_hdr_async(stream, |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
        path = req.uri().path().to_string();
        resp.headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("v12.stomp"));
        Ok(resp)
    })
    .await
    .expect("websocket handshake");
    (ws, path)
}

/// Read the next frame, skipping heartbeats. Panics if the client goes away.
pub async fn read_frame(ws: &mut BrokerSocket) -> Frame {
    let mut codec = StompCodec::new();
    let mut buf = BytesMut::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => buf.extend_from_slice(text.as_bytes()),
            Ok(Some(Ok(Message::Binary(data)))) => buf.extend_from_slice(&data),
            Ok(Some(Ok(_))) => continue,
            other => panic!("expected a frame from the client, got {:?}", other),
        }
        while let Some(item) = codec.decode(&mut buf).expect("client sent bad data") {
            if let StompItem::Frame(frame) = item {
                return frame;
            }
        }
    }
}

pub async fn send_frame(ws: &mut BrokerSocket, frame: Frame) {
    send_frames(ws, vec![frame]).await;
}

/// Send several frames packed into a single WebSocket text message.
pub async fn send_frames(ws: &mut BrokerSocket, frames: Vec<Frame>) {
    let mut codec = StompCodec::new();
    let mut buf = BytesMut::new();
    for frame in frames {
        codec
            .encode(StompItem::Frame(frame), &mut buf)
            .expect("encode");
    }
    let text = String::from_utf8(buf.to_vec()).expect("test frames are text");
    ws.send(Message::text(text)).await.expect("send to client");
}

/// Next data message from the client as raw bytes, or `None` once the
/// client closed the socket.
pub async fn read_raw(ws: &mut BrokerSocket) -> Option<Vec<u8>> {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => return Some(text.as_bytes().to_vec()),
            Ok(Some(Ok(Message::Binary(data)))) => return Some(data.to_vec()),
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => return None,
            Ok(Some(Ok(_))) => continue,
            Err(_) => panic!("client sent nothing for 5s"),
        }
    }
}

pub fn connected() -> Frame {
    Frame::new("CONNECTED")
        .header("version", "1.2")
        .header("server", "mock/1.0")
}

pub fn connected_with_heartbeat(heartbeat: &str) -> Frame {
    connected().header("heart-beat", heartbeat)
}

/// Accept a client and complete the STOMP handshake. Returns the socket and
/// the CONNECT frame the client sent.
pub async fn accept_and_connect(listener: &TcpListener) -> (BrokerSocket, Frame) {
    let (mut ws, _) = accept(listener).await;
    let connect = read_frame(&mut ws).await;
    send_frame(&mut ws, connected()).await;
    (ws, connect)
}

/// Lifecycle events seen by `RecordingHooks`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connected(Option<String>),
    Error(String),
    Disconnected,
}

/// Hooks that forward every event to a channel.
pub struct RecordingHooks {
    tx: mpsc::UnboundedSender<Event>,
}

impl RecordingHooks {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Hooks for RecordingHooks {
    fn on_connect(&self, frame: &Frame) {
        let _ = self
            .tx
            .send(Event::Connected(frame.get_header("server").map(str::to_string)));
    }

    fn on_error(&self, error: &ServerError) {
        let _ = self.tx.send(Event::Error(error.message.clone()));
    }

    fn on_disconnect(&self) {
        let _ = self.tx.send(Event::Disconnected);
    }
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for hook")
        .expect("hook channel closed")
}
