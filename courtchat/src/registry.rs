//! Open conversations, keyed by id.
//!
//! At most one actor runs per conversation. Opening a conversation that is
//! already open closes the old session first, so its connection and timers
//! are released before the new one starts.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use courtchat_proto::message::{ConversationId, SenderId};

use crate::actor::{ConversationActor, ConversationHandle, Identity};
use crate::config::{ChatConfig, ClientConfig, ConfigError, ConnectionConfig};
use crate::history::{HistoryError, HistorySource, HttpHistorySource};
use crate::transport::websocket::WebSocketConnector;
use crate::transport::{Connector, TransportError};

/// Why a registry could not be built from configuration.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    /// A required setting has no value.
    #[error("missing setting: {0}")]
    MissingSetting(&'static str),

    /// The live endpoint is unusable.
    #[error("invalid live endpoint: {0}")]
    Live(#[from] TransportError),

    /// The history endpoint is unusable.
    #[error("invalid history endpoint: {0}")]
    History(#[from] HistoryError),

    /// A setting is out of range.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Spawns and tracks one [`ConversationActor`] per open conversation.
pub struct ConversationRegistry<C, H> {
    connector: Arc<C>,
    history: Arc<H>,
    identity: Identity,
    chat: ChatConfig,
    connection: ConnectionConfig,
    sessions: Mutex<HashMap<ConversationId, ConversationHandle>>,
}

impl<C, H> ConversationRegistry<C, H>
where
    C: Connector,
    H: HistorySource,
{
    /// Create an empty registry.
    pub fn new(
        connector: Arc<C>,
        history: Arc<H>,
        identity: Identity,
        chat: ChatConfig,
        connection: ConnectionConfig,
    ) -> Self {
        Self {
            connector,
            history,
            identity,
            chat,
            connection,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// The identity every session sends as.
    #[must_use]
    pub const fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Open `conversation`, replacing any session already open for it.
    pub async fn open(&self, conversation: ConversationId) -> ConversationHandle {
        let mut sessions = self.sessions.lock().await;
        if let Some(previous) = sessions.remove(&conversation) {
            tracing::info!(conversation = %conversation, "replacing open session");
            previous.close().await;
        }
        let handle = ConversationActor::spawn(
            conversation,
            self.identity.clone(),
            Arc::clone(&self.connector),
            Arc::clone(&self.history),
            self.chat.clone(),
            self.connection.clone(),
        );
        sessions.insert(conversation, handle.clone());
        handle
    }

    /// The running session for `conversation`, if any.
    pub async fn get(&self, conversation: ConversationId) -> Option<ConversationHandle> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(&conversation)
            .filter(|h| !h.is_closed())
            .cloned()
    }

    /// Ids of the conversations currently open.
    pub async fn open_conversations(&self) -> Vec<ConversationId> {
        let sessions = self.sessions.lock().await;
        let mut ids: Vec<_> = sessions
            .iter()
            .filter(|(_, h)| !h.is_closed())
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Close the session for `conversation`. Returns `false` if none was open.
    pub async fn close(&self, conversation: ConversationId) -> bool {
        let removed = self.sessions.lock().await.remove(&conversation);
        match removed {
            Some(handle) => {
                handle.close().await;
                true
            }
            None => false,
        }
    }

    /// Close every open session.
    pub async fn close_all(&self) {
        let drained: Vec<_> = self.sessions.lock().await.drain().collect();
        for (conversation, handle) in drained {
            tracing::debug!(conversation = %conversation, "closing session");
            handle.close().await;
        }
    }
}

impl ConversationRegistry<WebSocketConnector, HttpHistorySource> {
    /// Build a registry that talks to the endpoints in `config`.
    ///
    /// # Errors
    ///
    /// [`SetupError::MissingSetting`] without a history URL, live URL or
    /// user id; [`SetupError::Live`] or [`SetupError::History`] for an
    /// unusable URL; [`SetupError::Config`] for an out-of-range setting.
    pub fn from_config(config: &ClientConfig) -> Result<Self, SetupError> {
        config.validate()?;
        let history_url = config
            .history_url
            .as_deref()
            .ok_or(SetupError::MissingSetting("history_url"))?;
        let live_url = config
            .live_url
            .as_deref()
            .ok_or(SetupError::MissingSetting("live_url"))?;
        let user_id = config.user_id.ok_or(SetupError::MissingSetting("user_id"))?;
        let user_name = config
            .user_name
            .clone()
            .unwrap_or_else(|| format!("user {user_id}"));

        Ok(Self::new(
            Arc::new(WebSocketConnector::new(live_url)?),
            Arc::new(HttpHistorySource::new(history_url)?),
            Identity::new(SenderId::new(user_id), user_name),
            config.chat.clone(),
            config.connection.clone(),
        ))
    }
}
