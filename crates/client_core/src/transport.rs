use std::{collections::VecDeque, time::Duration};

use anyhow::{anyhow, Context, Result};
use futures::{SinkExt, StreamExt};
use shared::{
    domain::Identity,
    protocol::{ClientCommand, RelayEvent},
};
use tokio::{net::TcpStream, sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

type RelayStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound half of the event channel. Sends never block and never fail;
/// commands issued while disconnected are held until the next session.
pub trait RelaySink: Send + Sync {
    fn send(&self, command: ClientCommand);
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Event(RelayEvent),
}

#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            next: INITIAL_BACKOFF,
        }
    }
}

impl Backoff {
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(MAX_BACKOFF);
        delay
    }

    pub fn reset(&mut self) {
        self.next = INITIAL_BACKOFF;
    }
}

/// Maps the portal base URL onto the relay endpoint (`http` -> `ws`,
/// `https` -> `wss`, path `/ws`).
pub fn relay_ws_url(server_url: &str) -> Result<Url> {
    let mut url = Url::parse(server_url).with_context(|| format!("invalid server url: {server_url}"))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(anyhow!("unsupported server url scheme: {other}")),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("cannot use scheme {scheme} for {server_url}"))?;
    url.set_path("/ws");
    url.set_query(None);
    Ok(url)
}

enum SessionEnd {
    Dropped,
    Shutdown,
}

/// Background connection to the relay with automatic reconnect.
///
/// Every session opens with `authenticate`, then drains queued commands.
/// The task is aborted when the handle is dropped.
pub struct TransportHandle {
    outbound: mpsc::UnboundedSender<ClientCommand>,
    task: JoinHandle<()>,
}

impl TransportHandle {
    pub fn spawn(
        server_url: &str,
        identity: Identity,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let url = relay_ws_url(server_url)?;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_transport(url, identity, outbound_rx, events_tx));
        Ok((Self { outbound, task }, events_rx))
    }
}

impl RelaySink for TransportHandle {
    fn send(&self, command: ClientCommand) {
        if self.outbound.send(command).is_err() {
            debug!("transport: dropping command after shutdown");
        }
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_transport(
    url: Url,
    identity: Identity,
    mut outbound: mpsc::UnboundedReceiver<ClientCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut backoff = Backoff::default();
    let mut pending = VecDeque::new();
    loop {
        match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                backoff.reset();
                info!(url = %url, user_id = identity.user_id.0, "transport: connected");
                if events.send(TransportEvent::Connected).is_err() {
                    return;
                }
                let end = drive_session(stream, &identity, &mut pending, &mut outbound, &events).await;
                if matches!(end, SessionEnd::Shutdown) {
                    return;
                }
                warn!(url = %url, "transport: disconnected");
                if events.send(TransportEvent::Disconnected).is_err() {
                    return;
                }
            }
            Err(err) => warn!(url = %url, %err, "transport: connect failed"),
        }

        let delay = backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "transport: reconnecting");
        tokio::time::sleep(delay).await;
    }
}

async fn drive_session(
    stream: RelayStream,
    identity: &Identity,
    pending: &mut VecDeque<ClientCommand>,
    outbound: &mut mpsc::UnboundedReceiver<ClientCommand>,
    events: &mpsc::UnboundedSender<TransportEvent>,
) -> SessionEnd {
    let (mut writer, mut reader) = stream.split();

    let hello = ClientCommand::Authenticate {
        user_id: identity.user_id,
        name: identity.display_name.clone(),
        role: identity.role.clone(),
    };
    if let Err(err) = send_command(&mut writer, &hello).await {
        warn!(%err, "transport: authenticate failed");
        return SessionEnd::Dropped;
    }
    while let Some(command) = pending.pop_front() {
        if let Err(err) = send_command(&mut writer, &command).await {
            warn!(%err, "transport: flush failed");
            pending.push_front(command);
            return SessionEnd::Dropped;
        }
    }

    loop {
        tokio::select! {
            command = outbound.recv() => {
                let Some(command) = command else {
                    let _ = writer.close().await;
                    return SessionEnd::Shutdown;
                };
                if let Err(err) = send_command(&mut writer, &command).await {
                    warn!(%err, "transport: send failed");
                    pending.push_back(command);
                    return SessionEnd::Dropped;
                }
            }
            frame = reader.next() => match frame {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<RelayEvent>(&text) {
                    Ok(event) => {
                        if events.send(TransportEvent::Event(event)).is_err() {
                            return SessionEnd::Shutdown;
                        }
                    }
                    Err(err) => warn!(%err, "transport: invalid relay event"),
                },
                Some(Ok(Message::Close(_))) | None => return SessionEnd::Dropped,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(%err, "transport: receive failed");
                    return SessionEnd::Dropped;
                }
            }
        }
    }
}

async fn send_command<S>(writer: &mut S, command: &ClientCommand) -> Result<()>
where
    S: futures::Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let text = serde_json::to_string(command).context("failed to encode command")?;
    writer
        .send(Message::Text(text))
        .await
        .context("failed to write frame")
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
