use chrono::Local;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use whisperer::{ConnError, Error, Frame, Hooks, Message, ServerError, Whisperer};

use super::args::{Cli, Command};
use super::exit_codes;

/// Reports lifecycle events through the log.
struct LoggingHooks;

impl Hooks for LoggingHooks {
    fn on_connect(&self, frame: &Frame) {
        info!(
            server = frame.get_header("server").unwrap_or("unknown"),
            "connected"
        );
    }

    fn on_error(&self, err: &ServerError) {
        error!(%err, "broker error");
    }

    fn on_disconnect(&self) {
        info!("disconnected");
    }
}

/// Connect, run the requested command, disconnect.
pub async fn run(cli: &Cli) -> Result<(), (String, u8)> {
    let params = cli.params();
    let address = params.broker_url();
    let mut whisperer = Whisperer::new(params)
        .with_options(cli.options())
        .with_hooks(Arc::new(LoggingHooks));

    whisperer
        .activate()
        .await
        .map_err(|e| format_error(&e, &address))?;

    let result = match &cli.command {
        Command::Listen { topics } => listen(&whisperer, topics, &address).await,
        Command::Emit {
            topic,
            body,
            headers,
            confirm,
        } => emit(&whisperer, topic, body, headers, *confirm, &address).await,
    };

    whisperer.deactivate().await;
    result
}

async fn listen(whisperer: &Whisperer, topics: &[String], address: &str) -> Result<(), (String, u8)> {
    let mut listeners = Vec::with_capacity(topics.len());
    for name in topics {
        let label = name.clone();
        let listener = whisperer
            .on(name, move |body, frame| {
                println!(
                    "[{}] {} {}",
                    Local::now().format("%H:%M:%S%.3f"),
                    label,
                    body
                );
                if let Some(id) = frame.message_id() {
                    tracing::debug!(message_id = id, topic = %label, "message received");
                }
            })
            .await
            .map_err(|e| format_error(&e, address))?;
        info!(destination = listener.destination(), "listening");
        listeners.push(listener);
    }

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            _ = tokio::time::sleep(Duration::from_millis(500)) => {
                if !whisperer.is_initialized() {
                    return Err((
                        format!("Connection to {} lost", address),
                        exit_codes::NETWORK_ERROR,
                    ));
                }
            }
        }
    }

    for listener in listeners {
        let _ = listener.unsubscribe().await;
    }
    Ok(())
}

async fn emit(
    whisperer: &Whisperer,
    topic: &str,
    body: &str,
    headers: &[(String, String)],
    confirm: bool,
    address: &str,
) -> Result<(), (String, u8)> {
    let body: serde_json::Value = serde_json::from_str(body).map_err(|e| {
        (
            format!("Message body is not valid JSON: {}", e),
            exit_codes::USAGE_ERROR,
        )
    })?;
    let mut message = Message::new(body);
    for (k, v) in headers {
        message = message.with_header(k.as_str(), v.as_str());
    }

    let sent = if confirm {
        whisperer
            .emit_confirmed(topic, &message, Duration::from_secs(10))
            .await
    } else {
        whisperer.emit(topic, &message).await
    };
    sent.map_err(|e| format_error(&e, address))?;

    println!("Sent to {}", whisperer::topic(topic));
    Ok(())
}

/// Turn an error into a user-facing message and exit code.
fn format_error(err: &Error, address: &str) -> (String, u8) {
    match err {
        Error::NotInitialized => (
            format!("Not connected to {}", address),
            exit_codes::NETWORK_ERROR,
        ),
        Error::Serialize(e) => (
            format!("Could not encode message: {}", e),
            exit_codes::USAGE_ERROR,
        ),
        Error::Connection(conn_err) => format_connection_error(conn_err, address),
    }
}

fn format_connection_error(err: &ConnError, address: &str) -> (String, u8) {
    match err {
        ConnError::Io(io_err) => {
            let message = match io_err.kind() {
                std::io::ErrorKind::ConnectionRefused => {
                    format!("Connection refused: {}", address)
                }
                _ => format!("Connection failed: {}", io_err),
            };
            (message, exit_codes::NETWORK_ERROR)
        }
        ConnError::WebSocket(ws_err) => (
            format!("WebSocket connection to {} failed: {}", address, ws_err),
            exit_codes::NETWORK_ERROR,
        ),
        ConnError::Timeout(phase) => (
            format!("Timed out waiting for {} from {}", phase, address),
            exit_codes::NETWORK_ERROR,
        ),
        ConnError::ServerRejected(server_err) => {
            let mut message = format!("Authentication failed: {}", server_err.message);
            if let Some(body) = &server_err.body {
                message.push_str(&format!(" ({})", body));
            }
            (message, exit_codes::AUTH_ERROR)
        }
        ConnError::Protocol(msg) => (
            format!("Protocol error: {}", msg),
            exit_codes::PROTOCOL_ERROR,
        ),
        ConnError::ReceiptTimeout(id) => (
            format!("Receipt timeout: {}", id),
            exit_codes::PROTOCOL_ERROR,
        ),
    }
}
