//! Live connection lifecycle for one conversation.
//!
//! [`ConnectionManager`] owns the duplex link and its state machine:
//!
//! ```text
//! Disconnected --connect--> Connecting --ok--> Connected --lost--> Reconnecting --ok--> Connected
//!                                |                                      |
//!                                +--fail--> Reconnecting                +--exhausted--> Failed
//! any state --disconnect--> Disconnected
//! ```
//!
//! The manager itself never blocks. Connect attempts and the receive loop
//! run as background tasks that post [`ConnectionEvent`]s onto the owning
//! actor's queue; the actor feeds them back through
//! [`ConnectionManager::handle`]. Every event carries the generation it was
//! produced under, and events from an older generation are discarded.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use courtchat_proto::codec::{self, CodecError};
use courtchat_proto::message::{ConversationId, Message};

use crate::config::ConnectionConfig;
use crate::transport::{Connector, Frame, LinkGuard, LiveLink, TransportError};

/// Shortest keep-alive period the receive loop will use.
const MIN_KEEPALIVE: Duration = Duration::from_millis(100);

/// Connection state of one conversation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No link and no attempt in progress.
    #[default]
    Disconnected,
    /// First attempt after an explicit `connect`.
    Connecting,
    /// Link is up.
    Connected,
    /// The link failed; an automatic attempt is pending or running.
    Reconnecting {
        /// 1-based number of the current attempt.
        attempt: u32,
        /// Attempts allowed before giving up.
        max_attempts: u32,
    },
    /// Reconnection was exhausted. Only an explicit `connect` leaves this state.
    Failed {
        /// Last failure observed.
        reason: String,
    },
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting {
                attempt,
                max_attempts,
            } => write!(f, "reconnecting ({attempt}/{max_attempts})"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// Errors returned by [`ConnectionManager::send`].
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// The link is not in the `Connected` state.
    #[error("not connected")]
    NotConnected,

    /// The message could not be encoded.
    #[error("encode failed: {0}")]
    Codec(#[from] CodecError),
}

/// Result of a background connection task, posted to the owning actor.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// A connect attempt finished.
    AttemptFinished {
        /// Generation the attempt was started under.
        generation: u64,
        /// The opened link or the failure.
        result: Result<LiveLink, TransportError>,
    },
    /// A decoded chat message arrived on the link.
    Received {
        /// Generation of the link that produced it.
        generation: u64,
        /// The message.
        message: Message,
    },
    /// The link died (read error, close, or keep-alive timeout).
    Lost {
        /// Generation of the dead link.
        generation: u64,
        /// Human-readable cause.
        reason: String,
    },
}

/// What the owner should do after [`ConnectionManager::handle`].
#[derive(Debug, PartialEq, Eq)]
pub enum ConnectionUpdate {
    /// The event belonged to a superseded generation and was dropped.
    Stale,
    /// The state changed; read it with [`ConnectionManager::state`].
    StateChanged {
        /// `true` when this is a `Connected` transition that follows an
        /// earlier successful connection.
        reconnected: bool,
    },
    /// A live message to merge.
    Live(Message),
}

/// How [`ConnectionManager::connect`] proceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectStart {
    /// Already connected to this conversation; nothing to do.
    AlreadyConnected,
    /// A new attempt was started.
    Started {
        /// An earlier attempt was still running and has been superseded.
        superseded: bool,
    },
}

/// The link currently in use.
struct ActiveLink {
    outgoing: mpsc::UnboundedSender<Frame>,
    receive_task: JoinHandle<()>,
    _guard: LinkGuard,
}

impl Drop for ActiveLink {
    fn drop(&mut self) {
        self.receive_task.abort();
    }
}

/// Owns the live link of one conversation.
///
/// `E` is the owner's queue item type; background tasks post
/// `E::from(ConnectionEvent)` through a weak sender so they never keep the
/// owner alive.
pub struct ConnectionManager<C, E> {
    connector: Arc<C>,
    config: ConnectionConfig,
    events: mpsc::WeakSender<E>,
    conversation: Option<ConversationId>,
    state: ConnectionState,
    generation: u64,
    /// Reconnect attempts used since the last successful connection.
    attempts: u32,
    has_connected: bool,
    attempt_task: Option<JoinHandle<()>>,
    link: Option<ActiveLink>,
}

impl<C, E> ConnectionManager<C, E>
where
    C: Connector,
    E: From<ConnectionEvent> + Send + 'static,
{
    /// Create a disconnected manager.
    pub fn new(
        connector: Arc<C>,
        config: ConnectionConfig,
        events: mpsc::WeakSender<E>,
    ) -> Self {
        Self {
            connector,
            config,
            events,
            conversation: None,
            state: ConnectionState::Disconnected,
            generation: 0,
            attempts: 0,
            has_connected: false,
            attempt_task: None,
            link: None,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Current generation; bumped by every attempt and by `disconnect`.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Start connecting to `conversation`.
    ///
    /// A no-op when already connected to the same conversation. Any attempt
    /// in flight is superseded and its eventual result discarded.
    pub fn connect(&mut self, conversation: ConversationId) -> ConnectStart {
        if self.state == ConnectionState::Connected && self.conversation == Some(conversation) {
            return ConnectStart::AlreadyConnected;
        }
        let superseded = self.attempt_task.is_some();
        if superseded {
            tracing::debug!(
                conversation = %conversation,
                generation = self.generation,
                "superseding in-flight connect attempt"
            );
        }
        self.conversation = Some(conversation);
        self.attempts = 0;
        self.state = ConnectionState::Connecting;
        tracing::info!(conversation = %conversation, "connecting");
        self.start_attempt(Duration::ZERO);
        ConnectStart::Started { superseded }
    }

    /// Queue `message` on the link.
    ///
    /// Returns once the frame is handed to the transport; delivery is
    /// confirmed only by the server echo.
    ///
    /// # Errors
    ///
    /// [`ConnectionError::NotConnected`] unless the state is `Connected`;
    /// [`ConnectionError::Codec`] if the message cannot be encoded.
    pub fn send(&self, message: &Message) -> Result<(), ConnectionError> {
        let link = match (&self.state, &self.link) {
            (ConnectionState::Connected, Some(link)) => link,
            _ => return Err(ConnectionError::NotConnected),
        };
        let text = codec::encode_outbound(message)?;
        link.outgoing.send(Frame::Text(text)).map_err(|_| {
            tracing::warn!(generation = self.generation, "send on closed link");
            ConnectionError::NotConnected
        })
    }

    /// Apply a background event.
    pub fn handle(&mut self, event: ConnectionEvent) -> ConnectionUpdate {
        match event {
            ConnectionEvent::AttemptFinished { generation, result } => {
                if generation != self.generation {
                    tracing::debug!(
                        generation,
                        current = self.generation,
                        "discarding stale connect result"
                    );
                    return ConnectionUpdate::Stale;
                }
                self.attempt_task = None;
                match result {
                    Ok(link) => {
                        self.install(link);
                        let reconnected = self.has_connected;
                        self.has_connected = true;
                        self.attempts = 0;
                        self.state = ConnectionState::Connected;
                        tracing::info!(
                            conversation = ?self.conversation,
                            generation,
                            reconnected,
                            "connected"
                        );
                        ConnectionUpdate::StateChanged { reconnected }
                    }
                    Err(e) => {
                        self.fail(e.to_string());
                        ConnectionUpdate::StateChanged { reconnected: false }
                    }
                }
            }
            ConnectionEvent::Received {
                generation,
                message,
            } => {
                if generation != self.generation || self.link.is_none() {
                    return ConnectionUpdate::Stale;
                }
                ConnectionUpdate::Live(message)
            }
            ConnectionEvent::Lost { generation, reason } => {
                if generation != self.generation || self.link.is_none() {
                    tracing::debug!(generation, "ignoring loss of superseded link");
                    return ConnectionUpdate::Stale;
                }
                self.link = None;
                self.fail(reason);
                ConnectionUpdate::StateChanged { reconnected: false }
            }
        }
    }

    /// Close the link, cancel any attempt and go to `Disconnected`.
    ///
    /// Safe to call from any state, any number of times.
    pub fn disconnect(&mut self) {
        self.generation += 1;
        if let Some(task) = self.attempt_task.take() {
            task.abort();
        }
        if let Some(link) = self.link.take() {
            let _ = link.outgoing.send(Frame::Close);
        }
        self.attempts = 0;
        if self.state != ConnectionState::Disconnected {
            tracing::info!(conversation = ?self.conversation, "disconnected");
            self.state = ConnectionState::Disconnected;
        }
    }

    /// Route a failure to `Reconnecting` or, once attempts run out, `Failed`.
    fn fail(&mut self, reason: String) {
        if self.attempts < self.config.max_reconnect_attempts {
            self.attempts += 1;
            tracing::warn!(
                conversation = ?self.conversation,
                attempt = self.attempts,
                max_attempts = self.config.max_reconnect_attempts,
                reason = %reason,
                "connection failed, reconnecting"
            );
            self.state = ConnectionState::Reconnecting {
                attempt: self.attempts,
                max_attempts: self.config.max_reconnect_attempts,
            };
            self.start_attempt(self.config.reconnect_delay);
        } else {
            tracing::warn!(
                conversation = ?self.conversation,
                reason = %reason,
                "connection failed, giving up"
            );
            self.link = None;
            self.state = ConnectionState::Failed { reason };
        }
    }

    /// Bump the generation and spawn a connect attempt after `delay`.
    fn start_attempt(&mut self, delay: Duration) {
        self.generation += 1;
        if let Some(task) = self.attempt_task.take() {
            task.abort();
        }
        if let Some(link) = self.link.take() {
            let _ = link.outgoing.send(Frame::Close);
        }

        let Some(conversation) = self.conversation else {
            return;
        };
        let generation = self.generation;
        let connector = Arc::clone(&self.connector);
        let events = self.events.clone();
        let timeout = self.config.connect_timeout;

        self.attempt_task = Some(tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let result = tokio::time::timeout(timeout, connector.connect(conversation))
                .await
                .unwrap_or(Err(TransportError::Timeout));
            post(&events, ConnectionEvent::AttemptFinished { generation, result }).await;
        }));
    }

    /// Take ownership of an opened link and start its receive loop.
    fn install(&mut self, link: LiveLink) {
        let LiveLink {
            outgoing,
            incoming,
            guard,
        } = link;
        let Some(conversation) = self.conversation else {
            return;
        };
        let receive_task = tokio::spawn(receive_loop(
            ReceiveContext {
                generation: self.generation,
                conversation,
                outgoing: outgoing.clone(),
                keepalive_interval: self.config.keepalive_interval,
                pong_timeout: self.config.pong_timeout,
            },
            incoming,
            self.events.clone(),
        ));
        self.link = Some(ActiveLink {
            outgoing,
            receive_task,
            _guard: guard,
        });
    }
}

impl<C, E> Drop for ConnectionManager<C, E> {
    fn drop(&mut self) {
        if let Some(task) = self.attempt_task.take() {
            task.abort();
        }
        if let Some(link) = self.link.take() {
            let _ = link.outgoing.send(Frame::Close);
        }
    }
}

/// Post an event to the owner. Returns `false` once the owner is gone.
async fn post<E: From<ConnectionEvent>>(
    events: &mpsc::WeakSender<E>,
    event: ConnectionEvent,
) -> bool {
    match events.upgrade() {
        Some(tx) => tx.send(E::from(event)).await.is_ok(),
        None => false,
    }
}

/// Fixed inputs of one receive loop.
struct ReceiveContext {
    generation: u64,
    conversation: ConversationId,
    outgoing: mpsc::UnboundedSender<Frame>,
    keepalive_interval: Duration,
    pong_timeout: Duration,
}

/// Reads the link until it dies, then reports the loss once.
///
/// Sends a ping every keep-alive interval. Any inbound frame counts as a
/// response; if nothing arrives within the pong timeout the link is
/// declared dead. Malformed frames are logged and skipped.
async fn receive_loop<E: From<ConnectionEvent>>(
    ctx: ReceiveContext,
    mut incoming: mpsc::Receiver<Result<Frame, TransportError>>,
    events: mpsc::WeakSender<E>,
) {
    let ReceiveContext {
        generation,
        conversation,
        outgoing,
        keepalive_interval,
        pong_timeout,
    } = ctx;
    if keepalive_interval < MIN_KEEPALIVE {
        tracing::warn!(
            conversation = %conversation,
            requested_ms = keepalive_interval.as_millis(),
            "keep-alive interval too short, using minimum"
        );
    }
    let period = keepalive_interval.max(MIN_KEEPALIVE);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut pong_deadline: Option<Instant> = None;

    let reason = loop {
        tokio::select! {
            frame = incoming.recv() => {
                pong_deadline = None;
                match frame {
                    None => break "transport closed".to_string(),
                    Some(Err(e)) => break e.to_string(),
                    Some(Ok(Frame::Close)) => break "closed by server".to_string(),
                    Some(Ok(Frame::Ping | Frame::Pong)) => {}
                    Some(Ok(Frame::Binary(data))) => {
                        tracing::warn!(
                            conversation = %conversation,
                            len = data.len(),
                            "unexpected binary frame, skipping"
                        );
                    }
                    Some(Ok(Frame::Text(text))) => match codec::decode(&text) {
                        Ok(message) if message.conversation_id != conversation => {
                            tracing::warn!(
                                conversation = %conversation,
                                other = %message.conversation_id,
                                "frame for another conversation, skipping"
                            );
                        }
                        Ok(message) => {
                            let event = ConnectionEvent::Received { generation, message };
                            if !post(&events, event).await {
                                return;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(
                                conversation = %conversation,
                                err = %e,
                                "malformed frame, skipping"
                            );
                        }
                    },
                }
            }
            _ = ticker.tick() => {
                if outgoing.send(Frame::Ping).is_err() {
                    break "keep-alive ping could not be sent".to_string();
                }
                if pong_deadline.is_none() {
                    pong_deadline = Some(Instant::now() + pong_timeout);
                }
            }
            () = expire(pong_deadline) => {
                break format!("no keep-alive response within {}ms", pong_timeout.as_millis());
            }
        }
    };

    tracing::debug!(conversation = %conversation, generation, reason = %reason, "receive loop ended");
    post(&events, ConnectionEvent::Lost { generation, reason }).await;
}

/// Completes at `deadline`, or never when there is none.
async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
