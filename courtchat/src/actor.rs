//! Per-conversation actor.
//!
//! [`ConversationActor`] is the only place a conversation's message list,
//! pagination cursor and connection state are mutated. Commands from
//! [`ConversationHandle`]s, connection events, finished page fetches and
//! send timeouts all arrive on one queue and are applied in order. Network
//! work runs in spawned tasks that post their results back onto that queue
//! through a weak sender, so the actor stops once every handle is dropped.
//!
//! After each message the actor publishes a [`ConversationSnapshot`] on a
//! `watch` channel if anything visible changed.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use courtchat_proto::history::HistoryPage;
use courtchat_proto::message::{ConversationId, Message, MessageId, SenderId, Timestamp};

use crate::config::{ChatConfig, ConnectionConfig};
use crate::connection::{
    ConnectStart, ConnectionError, ConnectionEvent, ConnectionManager, ConnectionState,
    ConnectionUpdate,
};
use crate::error::ChatError;
use crate::history::{FetchKind, HistoryError, HistoryPager, HistorySource, OlderStart, PageRequest};
use crate::stream::{
    Delivery, LocalId, MergeResult, MessageStream, OptimisticResult, StreamEntry,
};
use crate::transport::Connector;

/// Reason recorded on a send whose echo never arrived.
const NO_CONFIRMATION: &str = "no confirmation from server";

/// Reason recorded on a send attempted without a connection.
const NOT_CONNECTED: &str = "not connected";

/// Who is sending from this client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Authenticated user id.
    pub user_id: SenderId,
    /// Display name carried on each message.
    pub user_name: String,
}

impl Identity {
    /// Build an identity.
    pub fn new(user_id: SenderId, user_name: impl Into<String>) -> Self {
        Self {
            user_id,
            user_name: user_name.into(),
        }
    }
}

/// The oldest loaded entry at the moment a backfill was requested.
///
/// The presentation layer keeps this entry on screen after the older page
/// is inserted above it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrollAnchor {
    /// Entry that was oldest before the fetch.
    pub local_id: LocalId,
    /// Its server id, when it has one.
    pub message_id: Option<MessageId>,
}

/// Result of `load_older` or `refresh`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageOutcome {
    /// Oldest entry before the fetch, if the list was not empty.
    pub anchor: Option<ScrollAnchor>,
    /// Entries the page added.
    pub added: usize,
    /// Whether older pages remain.
    pub has_more: bool,
}

/// Everything the presentation layer renders for one conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSnapshot {
    /// The conversation.
    pub conversation: ConversationId,
    /// Entries in display order.
    pub entries: Vec<StreamEntry>,
    /// Connection state.
    pub state: ConnectionState,
    /// Whether older history remains.
    pub has_more: bool,
    /// List revision; changes whenever `entries` does.
    pub revision: u64,
}

impl ConversationSnapshot {
    fn empty(conversation: ConversationId) -> Self {
        Self {
            conversation,
            entries: Vec::new(),
            state: ConnectionState::Disconnected,
            has_more: true,
            revision: 0,
        }
    }

    /// Entries whose send failed, oldest first.
    pub fn failed(&self) -> impl Iterator<Item = &StreamEntry> {
        self.entries
            .iter()
            .filter(|e| matches!(e.delivery, Delivery::Failed { .. }))
    }
}

type Reply<T> = oneshot::Sender<Result<T, ChatError>>;

#[derive(Debug)]
enum Command {
    Connect(Reply<()>),
    Send { content: String, reply: Reply<LocalId> },
    Resend { local_id: LocalId, reply: Reply<()> },
    LoadOlder(Reply<PageOutcome>),
    Refresh(Reply<PageOutcome>),
    Close(oneshot::Sender<()>),
}

#[derive(Debug)]
enum ActorMsg {
    Command(Command),
    Connection(ConnectionEvent),
    PageLoaded {
        request: PageRequest,
        result: Result<HistoryPage, HistoryError>,
    },
    OptimisticExpired(LocalId),
}

impl From<ConnectionEvent> for ActorMsg {
    fn from(event: ConnectionEvent) -> Self {
        Self::Connection(event)
    }
}

/// The in-flight cursor-advancing fetch and everyone waiting on it.
struct PendingPage {
    request: PageRequest,
    anchor: Option<ScrollAnchor>,
    waiters: Vec<Reply<PageOutcome>>,
}

/// Cloneable front end of a running [`ConversationActor`].
#[derive(Debug, Clone)]
pub struct ConversationHandle {
    conversation: ConversationId,
    tx: mpsc::Sender<ActorMsg>,
    snapshots: watch::Receiver<Arc<ConversationSnapshot>>,
}

impl ConversationHandle {
    /// The conversation this handle drives.
    #[must_use]
    pub const fn conversation(&self) -> ConversationId {
        self.conversation
    }

    /// (Re)connect the live channel.
    ///
    /// Resolves once connected.
    ///
    /// # Errors
    ///
    /// [`ChatError::ConnectionFailed`] when reconnection is exhausted,
    /// [`ChatError::Superseded`] if another `connect` replaced this one,
    /// [`ChatError::SessionClosed`] if the conversation was closed.
    pub async fn connect(&self) -> Result<(), ChatError> {
        self.request(Command::Connect).await
    }

    /// Send a message. The entry appears in the list immediately.
    ///
    /// # Errors
    ///
    /// [`ChatError::Validation`] for blank or oversized content (nothing is
    /// added), [`ChatError::NotConnected`] when offline (the entry is kept
    /// and marked failed).
    pub async fn send(&self, content: impl Into<String>) -> Result<LocalId, ChatError> {
        let content = content.into();
        self.request(|reply| Command::Send { content, reply }).await
    }

    /// Send a failed entry again.
    ///
    /// # Errors
    ///
    /// [`ChatError::UnknownEntry`] if `local_id` is not a failed send;
    /// [`ChatError::NotConnected`] when offline.
    pub async fn resend(&self, local_id: LocalId) -> Result<(), ChatError> {
        self.request(|reply| Command::Resend { local_id, reply })
            .await
    }

    /// Load the next older history page.
    ///
    /// Concurrent calls share one fetch.
    ///
    /// # Errors
    ///
    /// [`ChatError::FetchFailed`] if the page could not be fetched (retry is
    /// safe), [`ChatError::Superseded`] if a refresh intervened.
    pub async fn load_older(&self) -> Result<PageOutcome, ChatError> {
        self.request(Command::LoadOlder).await
    }

    /// Discard the loaded history and reload the newest page.
    ///
    /// Unconfirmed sends are kept.
    ///
    /// # Errors
    ///
    /// As for [`load_older`](Self::load_older).
    pub async fn refresh(&self) -> Result<PageOutcome, ChatError> {
        self.request(Command::Refresh).await
    }

    /// Disconnect and stop the actor. Idempotent.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(ActorMsg::Command(Command::Close(tx))).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Whether the actor has stopped.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// A receiver that sees every published snapshot.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<ConversationSnapshot>> {
        self.snapshots.clone()
    }

    /// The latest published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Arc<ConversationSnapshot> {
        Arc::clone(&*self.snapshots.borrow())
    }

    /// Wait until a published snapshot satisfies `predicate`.
    ///
    /// # Errors
    ///
    /// [`ChatError::SessionClosed`] if the actor stops first.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&ConversationSnapshot) -> bool,
    ) -> Result<Arc<ConversationSnapshot>, ChatError> {
        let mut rx = self.snapshots.clone();
        let snapshot = Arc::clone(
            &*rx.wait_for(|s| predicate(s))
                .await
                .map_err(|_| ChatError::SessionClosed)?,
        );
        Ok(snapshot)
    }

    async fn request<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, ChatError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ActorMsg::Command(make(tx)))
            .await
            .map_err(|_| ChatError::SessionClosed)?;
        rx.await.map_err(|_| ChatError::SessionClosed)?
    }
}

/// Owns one conversation's state. Created with [`ConversationActor::spawn`].
pub struct ConversationActor<C, H> {
    conversation: ConversationId,
    identity: Identity,
    config: ChatConfig,
    history: Arc<H>,
    connection: ConnectionManager<C, ActorMsg>,
    stream: MessageStream,
    pager: HistoryPager,
    pending_page: Option<PendingPage>,
    connect_waiters: Vec<Reply<()>>,
    timers: HashMap<LocalId, JoinHandle<()>>,
    events: mpsc::WeakSender<ActorMsg>,
    snapshots: watch::Sender<Arc<ConversationSnapshot>>,
}

impl<C, H> ConversationActor<C, H>
where
    C: Connector,
    H: HistorySource,
{
    /// Open a conversation: start connecting, request the newest history
    /// page and return a handle to the running actor.
    pub fn spawn(
        conversation: ConversationId,
        identity: Identity,
        connector: Arc<C>,
        history: Arc<H>,
        config: ChatConfig,
        connection: ConnectionConfig,
    ) -> ConversationHandle {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let events = tx.downgrade();
        let (snap_tx, snap_rx) = watch::channel(Arc::new(ConversationSnapshot::empty(conversation)));

        let mut actor = Self {
            conversation,
            identity,
            history,
            connection: ConnectionManager::new(connector, connection, events.clone()),
            stream: MessageStream::new(config.reconcile_window),
            pager: HistoryPager::new(config.page_size),
            config,
            pending_page: None,
            connect_waiters: Vec::new(),
            timers: HashMap::new(),
            events,
            snapshots: snap_tx,
        };
        tracing::info!(conversation = %conversation, "opening conversation");
        actor.connection.connect(conversation);
        actor.load_older(None);
        actor.publish();
        tokio::spawn(actor.run(rx));

        ConversationHandle {
            conversation,
            tx,
            snapshots: snap_rx,
        }
    }

    async fn run(mut self, mut rx: mpsc::Receiver<ActorMsg>) {
        while let Some(msg) = rx.recv().await {
            let keep_running = self.handle(msg);
            self.publish();
            if !keep_running {
                break;
            }
        }
        self.shutdown();
        tracing::debug!(conversation = %self.conversation, "conversation actor stopped");
    }

    fn handle(&mut self, msg: ActorMsg) -> bool {
        match msg {
            ActorMsg::Command(command) => return self.handle_command(command),
            ActorMsg::Connection(event) => self.on_connection(event),
            ActorMsg::PageLoaded { request, result } => self.on_page(request, result),
            ActorMsg::OptimisticExpired(local_id) => {
                self.timers.remove(&local_id);
                if self.stream.mark_failed(local_id, NO_CONFIRMATION) {
                    tracing::warn!(
                        conversation = %self.conversation,
                        local_id = %local_id,
                        "send not confirmed in time"
                    );
                }
            }
        }
        true
    }

    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Connect(reply) => match self.connection.connect(self.conversation) {
                ConnectStart::AlreadyConnected => self.respond(reply, Ok(())),
                ConnectStart::Started { superseded } => {
                    if superseded {
                        for waiter in std::mem::take(&mut self.connect_waiters) {
                            self.respond(waiter, Err(ChatError::Superseded));
                        }
                    }
                    self.connect_waiters.push(reply);
                }
            },
            Command::Send { content, reply } => {
                let result = self.send(&content);
                self.respond(reply, result);
            }
            Command::Resend { local_id, reply } => {
                let result = self.resend(local_id);
                self.respond(reply, result);
            }
            Command::LoadOlder(reply) => self.load_older(Some(reply)),
            Command::Refresh(reply) => self.refresh(reply),
            Command::Close(reply) => {
                self.shutdown();
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    fn send(&mut self, content: &str) -> Result<LocalId, ChatError> {
        let message = Message::outgoing(
            self.conversation,
            self.identity.user_id,
            self.identity.user_name.clone(),
            content.trim(),
            Timestamp::now(),
        );
        message.validate()?;
        let local_id = match self.stream.append_optimistic(message.clone()) {
            OptimisticResult::Inserted(local_id) => local_id,
            OptimisticResult::Coalesced(local_id) => {
                // A failed entry is sent again; otherwise it is already on its way.
                return match self.stream.mark_sending(local_id) {
                    Some(pending) => self.transmit(local_id, &pending).map(|()| local_id),
                    None => Ok(local_id),
                };
            }
        };
        self.transmit(local_id, &message).map(|()| local_id)
    }

    fn resend(&mut self, local_id: LocalId) -> Result<(), ChatError> {
        let message = self
            .stream
            .mark_sending(local_id)
            .ok_or(ChatError::UnknownEntry(local_id))?;
        tracing::debug!(conversation = %self.conversation, local_id = %local_id, "resending");
        self.transmit(local_id, &message)
    }

    /// Hand an optimistic entry to the connection, or mark it failed.
    fn transmit(&mut self, local_id: LocalId, message: &Message) -> Result<(), ChatError> {
        match self.connection.send(message) {
            Ok(()) => {
                self.arm_timer(local_id);
                Ok(())
            }
            Err(ConnectionError::NotConnected) => {
                tracing::warn!(conversation = %self.conversation, "send while not connected");
                self.stream.mark_failed(local_id, NOT_CONNECTED);
                Err(ChatError::NotConnected)
            }
            Err(ConnectionError::Codec(e)) => {
                tracing::warn!(conversation = %self.conversation, err = %e, "send encode failed");
                self.stream.mark_failed(local_id, e.to_string());
                Err(ChatError::Encode(e.to_string()))
            }
        }
    }

    fn arm_timer(&mut self, local_id: LocalId) {
        let events = self.events.clone();
        let timeout = self.config.optimistic_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(tx) = events.upgrade() {
                let _ = tx.send(ActorMsg::OptimisticExpired(local_id)).await;
            }
        });
        if let Some(previous) = self.timers.insert(local_id, timer) {
            previous.abort();
        }
    }

    fn disarm_timer(&mut self, local_id: LocalId) {
        if let Some(timer) = self.timers.remove(&local_id) {
            timer.abort();
        }
    }

    fn anchor(&self) -> Option<ScrollAnchor> {
        self.stream.oldest().map(|e| ScrollAnchor {
            local_id: e.local_id,
            message_id: e.message.id,
        })
    }

    fn load_older(&mut self, reply: Option<Reply<PageOutcome>>) {
        match self.pager.begin_older() {
            OlderStart::Exhausted => {
                if let Some(reply) = reply {
                    let outcome = PageOutcome {
                        anchor: self.anchor(),
                        added: 0,
                        has_more: false,
                    };
                    self.respond(reply, Ok(outcome));
                }
            }
            OlderStart::InFlight(_) => match self.pending_page.as_mut() {
                Some(pending) => pending.waiters.extend(reply),
                None => {
                    if let Some(reply) = reply {
                        self.respond(reply, Err(ChatError::Superseded));
                    }
                }
            },
            OlderStart::Issue(request) => {
                self.pending_page = Some(PendingPage {
                    request,
                    anchor: self.anchor(),
                    waiters: reply.into_iter().collect(),
                });
                self.fetch(request);
            }
        }
    }

    fn refresh(&mut self, reply: Reply<PageOutcome>) {
        if let Some(pending) = self.pending_page.take() {
            for waiter in pending.waiters {
                self.respond(waiter, Err(ChatError::Superseded));
            }
        }
        self.pager.refresh();
        let unconfirmed = self.stream.clear();
        self.stream.restore(unconfirmed);
        tracing::info!(conversation = %self.conversation, epoch = self.pager.epoch(), "refreshing history");
        self.load_older(Some(reply));
    }

    fn fetch(&self, request: PageRequest) {
        let history = Arc::clone(&self.history);
        let events = self.events.clone();
        let conversation = self.conversation;
        let size = self.pager.page_size();
        tokio::spawn(async move {
            let result = history.fetch_page(conversation, request.index, size).await;
            if let Some(tx) = events.upgrade() {
                let _ = tx.send(ActorMsg::PageLoaded { request, result }).await;
            }
        });
    }

    fn on_page(&mut self, request: PageRequest, result: Result<HistoryPage, HistoryError>) {
        if !self.pager.complete(request, result.as_ref().ok()) {
            return;
        }
        match request.kind {
            FetchKind::CatchUp => match result {
                Ok(page) => {
                    let added = self.merge_page(page);
                    tracing::info!(conversation = %self.conversation, added, "caught up after reconnect");
                }
                Err(e) => {
                    tracing::warn!(conversation = %self.conversation, err = %e, "catch-up fetch failed");
                }
            },
            FetchKind::Older => {
                let Some(pending) = self.pending_page.take() else {
                    return;
                };
                if pending.request != request {
                    self.pending_page = Some(pending);
                    return;
                }
                let outcome = match result {
                    Ok(page) => Ok(PageOutcome {
                        added: self.merge_page(page),
                        anchor: pending.anchor,
                        has_more: self.pager.has_more(),
                    }),
                    Err(e) => {
                        tracing::warn!(
                            conversation = %self.conversation,
                            page = request.index,
                            err = %e,
                            "history fetch failed"
                        );
                        Err(ChatError::FetchFailed(e.to_string()))
                    }
                };
                for waiter in pending.waiters {
                    self.respond(waiter, outcome.clone());
                }
            }
        }
    }

    /// Merge a page into the stream and return how many entries it added.
    fn merge_page(&mut self, mut page: HistoryPage) -> usize {
        page.normalise();
        let summary = self.stream.prepend(page.items);
        for local_id in summary.reconciled {
            self.disarm_timer(local_id);
        }
        summary.added
    }

    fn on_connection(&mut self, event: ConnectionEvent) {
        match self.connection.handle(event) {
            ConnectionUpdate::Stale => {}
            ConnectionUpdate::Live(message) => {
                if let MergeResult::Reconciled(local_id) = self.stream.append_live(message) {
                    self.disarm_timer(local_id);
                }
            }
            ConnectionUpdate::StateChanged { reconnected } => match self.connection.state().clone() {
                ConnectionState::Connected => {
                    for waiter in std::mem::take(&mut self.connect_waiters) {
                        self.respond(waiter, Ok(()));
                    }
                    if reconnected && self.config.catch_up_on_reconnect {
                        let request = self.pager.begin_catch_up();
                        self.fetch(request);
                    }
                }
                ConnectionState::Failed { reason } => {
                    for waiter in std::mem::take(&mut self.connect_waiters) {
                        self.respond(
                            waiter,
                            Err(ChatError::ConnectionFailed {
                                reason: reason.clone(),
                            }),
                        );
                    }
                }
                _ => {}
            },
        }
    }

    /// Publish pending changes, then answer a caller.
    ///
    /// A caller that reads the snapshot after its reply sees the effect.
    fn respond<T>(&self, reply: Reply<T>, result: Result<T, ChatError>) {
        self.publish();
        let _ = reply.send(result);
    }

    /// Release every resource. Safe to call more than once.
    fn shutdown(&mut self) {
        self.connection.disconnect();
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(ChatError::SessionClosed));
        }
        if let Some(pending) = self.pending_page.take() {
            for waiter in pending.waiters {
                let _ = waiter.send(Err(ChatError::SessionClosed));
            }
        }
        for (_, timer) in self.timers.drain() {
            timer.abort();
        }
        self.publish();
    }

    /// Publish a snapshot if the list, state or `has_more` changed.
    fn publish(&self) {
        let state = self.connection.state();
        let has_more = self.pager.has_more();
        let revision = self.stream.revision();
        let unchanged = {
            let current = self.snapshots.borrow();
            current.revision == revision && &current.state == state && current.has_more == has_more
        };
        if unchanged {
            return;
        }
        self.snapshots.send_replace(Arc::new(ConversationSnapshot {
            conversation: self.conversation,
            entries: self.stream.entries().to_vec(),
            state: state.clone(),
            has_more,
            revision,
        }));
    }
}
