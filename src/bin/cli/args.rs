use clap::{Parser, Subcommand};
use whisperer::{ConnectOptions, ConnectionParams};

#[derive(Parser)]
#[command(name = "whisper")]
#[command(version)]
#[command(about = "Publish to and listen on STOMP topics over WebSocket")]
pub struct Cli {
    /// Broker host name
    #[arg(long, env = "WHISPERER_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// Broker WebSocket port
    #[arg(long, env = "WHISPERER_PORT", default_value_t = 15674)]
    pub port: u16,

    /// Login username
    #[arg(short, long, env = "WHISPERER_USERNAME", default_value = "guest")]
    pub username: String,

    /// Passcode
    #[arg(short, long, env = "WHISPERER_PASSWORD", default_value = "guest", hide_env_values = true)]
    pub password: String,

    /// Heartbeat settings (client-send,client-receive in ms)
    #[arg(long, env = "WHISPERER_HEARTBEAT", default_value = "10000,10000")]
    pub heartbeat: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Print every message published to the given topics until Ctrl-C
    Listen {
        /// Topic names, without the /topic/ prefix
        #[arg(required = true)]
        topics: Vec<String>,
    },
    /// Publish one JSON message
    Emit {
        /// Topic name, without the /topic/ prefix
        topic: String,
        /// Message body as JSON
        body: String,
        /// Extra header as key:value (can be specified multiple times)
        #[arg(long = "header", value_parser = parse_header)]
        headers: Vec<(String, String)>,
        /// Wait for the broker to confirm the message
        #[arg(long)]
        confirm: bool,
    },
}

impl Cli {
    pub fn params(&self) -> ConnectionParams {
        ConnectionParams::new(
            self.host.clone(),
            self.port,
            self.username.clone(),
            self.password.clone(),
        )
    }

    pub fn options(&self) -> ConnectOptions {
        ConnectOptions::default().with_heartbeat(self.heartbeat.clone())
    }
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    match raw.split_once(':') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected key:value, got '{}'", raw)),
    }
}
