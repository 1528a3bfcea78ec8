// socket.rs
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};

use crate::commands::SlashCommand;
use crate::{spawn_command, spawn_event, AppState};

#[derive(Debug, Clone, Deserialize)]
pub struct SocketEnvelope {
    #[serde(default)]
    pub envelope_id: Option<String>,
    #[serde(rename = "type")]
    pub envelope_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub retry_attempt: u32,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum EnvelopeAction {
    Hello,
    Disconnect,
    Event,
    Command,
    /// Redelivery of something already acknowledged once.
    Redelivery,
    Unsupported,
}

impl SocketEnvelope {
    pub fn action(&self) -> EnvelopeAction {
        match self.envelope_type.as_str() {
            "hello" => EnvelopeAction::Hello,
            "disconnect" => EnvelopeAction::Disconnect,
            "events_api" | "slash_commands" if self.retry_attempt > 0 => {
                EnvelopeAction::Redelivery
            }
            "events_api" => EnvelopeAction::Event,
            "slash_commands" => EnvelopeAction::Command,
            _ => EnvelopeAction::Unsupported,
        }
    }
}

enum SessionEnd {
    Shutdown,
    Reconnect,
}

/// Holds a Socket Mode connection open until Ctrl-C, reconnecting whenever
/// Slack drops or refreshes it.
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let app_token = state
        .config
        .slack_app_token
        .clone()
        .context("SLACK_APP_TOKEN not set")?;
    let reconnect_delay = Duration::from_millis(state.config.reconnect_delay_ms);

    loop {
        match state.slack.open_socket_connection(&app_token).await {
            Ok(url) => match run_session(&state, &url).await {
                Ok(SessionEnd::Shutdown) => {
                    info!("shutdown requested");
                    return Ok(());
                }
                Ok(SessionEnd::Reconnect) => info!("socket session ended, reconnecting"),
                Err(e) => error!("Socket session error: {:#}", e),
            },
            Err(e) => error!("Failed to open socket connection: {:#}", e),
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                return Ok(());
            }
            _ = tokio::time::sleep(reconnect_delay) => {}
        }
    }
}

async fn run_session(state: &Arc<AppState>, url: &str) -> Result<SessionEnd> {
    let (stream, _response) = connect_async(url)
        .await
        .context("failed to connect socket mode websocket")?;
    let (mut sink, mut source) = stream.split();
    info!("Socket mode connected");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(SessionEnd::Shutdown),
            message = source.next() => {
                let Some(message) = message else {
                    return Ok(SessionEnd::Reconnect);
                };
                let message = message.context("failed reading socket mode message")?;
                if !handle_frame(state, &mut sink, message).await? {
                    return Ok(SessionEnd::Reconnect);
                }
            }
        }
    }
}

/// A frame that does not decode is logged and skipped; the session stays up.
async fn handle_frame<S>(state: &Arc<AppState>, sink: &mut S, message: WsMessage) -> Result<bool>
where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    match parse_socket_envelope(message) {
        Ok(Some(envelope)) => handle_envelope(state, sink, envelope).await,
        Ok(None) => Ok(true),
        Err(e) => {
            warn!("Malformed socket mode frame: {:#}", e);
            Ok(true)
        }
    }
}

/// Acks first, then hands the payload to its own task. Returns false when
/// Slack asked us to reconnect.
async fn handle_envelope<S>(
    state: &Arc<AppState>,
    sink: &mut S,
    envelope: SocketEnvelope,
) -> Result<bool>
where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let action = envelope.action();
    if let Some(envelope_id) = envelope.envelope_id.as_deref() {
        if action != EnvelopeAction::Hello && action != EnvelopeAction::Disconnect {
            ack_envelope(sink, envelope_id).await?;
        }
    }

    match action {
        EnvelopeAction::Hello => debug!("socket mode hello received"),
        EnvelopeAction::Disconnect => {
            info!(
                reason = envelope.reason.as_deref().unwrap_or("unknown"),
                "slack requested disconnect"
            );
            return Ok(false);
        }
        EnvelopeAction::Event => spawn_event(Arc::clone(state), envelope.payload),
        EnvelopeAction::Command => {
            match serde_json::from_value::<SlashCommand>(envelope.payload) {
                Ok(command) => spawn_command(Arc::clone(state), command),
                Err(e) => warn!("Malformed slash command payload: {}", e),
            }
        }
        EnvelopeAction::Redelivery => info!(
            retry_attempt = envelope.retry_attempt,
            "Skipping redelivered {} envelope", envelope.envelope_type
        ),
        EnvelopeAction::Unsupported => {
            debug!(envelope_type = %envelope.envelope_type, "ignoring envelope")
        }
    }

    Ok(true)
}

async fn ack_envelope<S>(sink: &mut S, envelope_id: &str) -> Result<()>
where
    S: Sink<WsMessage> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let ack = json!({ "envelope_id": envelope_id }).to_string();
    sink.send(WsMessage::Text(ack.into()))
        .await
        .context("failed to send socket mode ack")
}

pub fn parse_socket_envelope(message: WsMessage) -> Result<Option<SocketEnvelope>> {
    let text = match message {
        WsMessage::Text(text) => text.as_str().to_string(),
        WsMessage::Binary(bytes) => {
            String::from_utf8(bytes.to_vec()).context("invalid utf-8 socket mode payload")?
        }
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Close(_) | WsMessage::Frame(_) => {
            return Ok(None)
        }
    };

    let envelope = serde_json::from_str::<SocketEnvelope>(&text)
        .context("failed to parse socket mode envelope")?;
    Ok(Some(envelope))
}
