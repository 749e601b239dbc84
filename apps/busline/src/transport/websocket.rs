use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode as WsCloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, warn};
use url::Url;

use super::{Backoff, TransportError, TransportEvent};
use crate::dispatch::Dispatcher;
use crate::protocol::{ClientFrame, CloseCode};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub url: Url,
    pub channels: Vec<String>,
    pub backoff: Backoff,
}

impl ChannelConfig {
    pub fn new(url: &str) -> Result<Self, TransportError> {
        let url = Url::parse(url)?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => return Err(TransportError::UnsupportedScheme(other.to_string())),
        }
        Ok(Self {
            url,
            channels: Vec::new(),
            backoff: Backoff::default(),
        })
    }

    pub fn with_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels.extend(channels.into_iter().map(Into::into));
        self
    }

    pub fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.backoff = Backoff::new(min, max);
        self
    }
}

#[derive(Debug)]
enum Command {
    Subscribe(Vec<String>),
    UpdatePresence(u64),
    Close,
}

enum SessionEnd {
    Closed(CloseCode),
    Shutdown,
}

/// Websocket connection to the bus server that re-subscribes on every
/// (re)connect and retries with backoff until closed or the session expires.
pub struct WebSocketChannel {
    config: ChannelConfig,
    dispatcher: Dispatcher,
}

impl WebSocketChannel {
    /// `dispatcher` supplies the replay point sent with each subscribe.
    pub fn new(config: ChannelConfig, dispatcher: Dispatcher) -> Self {
        Self { config, dispatcher }
    }

    pub fn spawn(self, events: mpsc::Sender<TransportEvent>) -> ChannelHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(events, commands_rx));
        ChannelHandle {
            commands: commands_tx,
            task,
        }
    }

    async fn run(
        mut self,
        events: mpsc::Sender<TransportEvent>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let mut backoff = self.config.backoff.clone();
        let mut connected_before = false;
        let mut attempt: u32 = 0;

        loop {
            match connect_async(self.config.url.as_str()).await {
                Ok((socket, _)) => {
                    info!(target = "busline::transport", url = %self.config.url, "connected");
                    backoff.reset();
                    attempt = 0;
                    let event = if connected_before {
                        TransportEvent::Reconnect
                    } else {
                        TransportEvent::Connect
                    };
                    connected_before = true;
                    if events.send(event).await.is_err() {
                        return;
                    }

                    match self.session(socket, &events, &mut commands).await {
                        SessionEnd::Shutdown => {
                            let _ = events
                                .send(TransportEvent::Disconnect {
                                    code: CloseCode::CLEAN,
                                })
                                .await;
                            return;
                        }
                        SessionEnd::Closed(code) => {
                            info!(target = "busline::transport", %code, "disconnected");
                            if events.send(TransportEvent::Disconnect { code }).await.is_err() {
                                return;
                            }
                            if code.is_terminal() {
                                warn!(
                                    target = "busline::transport",
                                    "session expired; not reconnecting"
                                );
                                return;
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        target = "busline::transport",
                        url = %self.config.url,
                        error = %err,
                        "connection attempt failed"
                    );
                }
            }

            attempt = attempt.saturating_add(1);
            if events
                .send(TransportEvent::Reconnecting { attempt })
                .await
                .is_err()
            {
                return;
            }
            let delay = backoff.next_delay();
            debug!(
                target = "busline::transport",
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying"
            );
            if !self.wait(delay, &mut commands).await {
                return;
            }
        }
    }

    /// Sleep out a retry delay while still taking commands. Returns false
    /// when the channel was closed meanwhile.
    async fn wait(
        &mut self,
        delay: Duration,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = &mut sleep => return true,
                command = commands.recv() => match command {
                    None | Some(Command::Close) => return false,
                    Some(Command::Subscribe(channels)) => {
                        self.add_channels(channels);
                    }
                    // Presence is re-reported by the caller once connected.
                    Some(Command::UpdatePresence(_)) => {}
                },
            }
        }
    }

    fn add_channels(&mut self, channels: Vec<String>) -> bool {
        let before = self.config.channels.len();
        for channel in channels {
            if !self.config.channels.contains(&channel) {
                self.config.channels.push(channel);
            }
        }
        self.config.channels.len() != before
    }

    fn subscribe_frame(&self) -> Message {
        Message::Text(
            ClientFrame::Subscribe {
                channels: self.config.channels.clone(),
                last: self.dispatcher.last_notification_id(),
            }
            .to_text(),
        )
    }

    async fn session(
        &mut self,
        socket: Socket,
        events: &mpsc::Sender<TransportEvent>,
        commands: &mut mpsc::UnboundedReceiver<Command>,
    ) -> SessionEnd {
        let (mut sink, mut source) = socket.split();
        if let Err(err) = sink.send(self.subscribe_frame()).await {
            warn!(target = "busline::transport", error = %err, "failed to send subscribe frame");
            return SessionEnd::Closed(CloseCode::ABNORMAL_CLOSURE);
        }

        loop {
            tokio::select! {
                incoming = source.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if events.send(TransportEvent::Frame(text)).await.is_err() {
                            return SessionEnd::Shutdown;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            if events.send(TransportEvent::Frame(text)).await.is_err() {
                                return SessionEnd::Shutdown;
                            }
                        }
                        Err(err) => {
                            warn!(
                                target = "busline::transport",
                                error = %err,
                                "dropping non-utf8 binary frame"
                            );
                        }
                    },
                    Some(Ok(Message::Close(frame))) => {
                        let code = frame
                            .map(|frame| CloseCode(u16::from(frame.code)))
                            .unwrap_or(CloseCode::ABNORMAL_CLOSURE);
                        return SessionEnd::Closed(code);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(target = "busline::transport", error = %err, "websocket read failed");
                        return SessionEnd::Closed(CloseCode::ABNORMAL_CLOSURE);
                    }
                    None => return SessionEnd::Closed(CloseCode::ABNORMAL_CLOSURE),
                },
                command = commands.recv() => {
                    let outgoing = match command {
                        None | Some(Command::Close) => {
                            let _ = sink
                                .send(Message::Close(Some(CloseFrame {
                                    code: WsCloseCode::Normal,
                                    reason: "client closed".into(),
                                })))
                                .await;
                            return SessionEnd::Shutdown;
                        }
                        Some(Command::Subscribe(channels)) => {
                            if !self.add_channels(channels) {
                                continue;
                            }
                            self.subscribe_frame()
                        }
                        Some(Command::UpdatePresence(inactivity_period)) => Message::Text(
                            ClientFrame::UpdatePresence { inactivity_period }.to_text(),
                        ),
                    };
                    if let Err(err) = sink.send(outgoing).await {
                        warn!(
                            target = "busline::transport",
                            error = %err,
                            "websocket write failed"
                        );
                        return SessionEnd::Closed(CloseCode::ABNORMAL_CLOSURE);
                    }
                }
            }
        }
    }
}

/// Control surface for a spawned [`WebSocketChannel`].
#[derive(Debug)]
pub struct ChannelHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

impl ChannelHandle {
    /// Join more channels; the subscription is resent if anything changed.
    pub fn subscribe<I, S>(&self, channels: I) -> Result<(), TransportError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let channels = channels.into_iter().map(Into::into).collect();
        self.commands
            .send(Command::Subscribe(channels))
            .map_err(|_| TransportError::Closed)
    }

    pub fn update_presence(&self, inactivity_period: Duration) -> Result<(), TransportError> {
        let millis = u64::try_from(inactivity_period.as_millis()).unwrap_or(u64::MAX);
        self.commands
            .send(Command::UpdatePresence(millis))
            .map_err(|_| TransportError::Closed)
    }

    /// Close the socket cleanly and wait for the channel task to end.
    pub async fn close(self) {
        let _ = self.commands.send(Command::Close);
        let _ = self.task.await;
    }
}
