//! Loopback live channel for testing.
//!
//! [`LoopbackConnector::new`] returns the connector and a
//! [`LoopbackServer`]. Every successful `connect` hands the server side a
//! [`LoopbackPeer`], which plays the backend for that one link: it can push
//! messages, read what the client sent, inject errors or drop the link.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use courtchat_proto::codec;
use courtchat_proto::message::{ConversationId, Message};

use super::{Connector, Frame, LinkGuard, LiveLink, TransportError};

/// Capacity of the server-to-client channel for one link.
const LINK_CAPACITY: usize = 64;

#[derive(Debug, Default)]
struct Script {
    /// Outcomes consumed by the next `connect` calls, front first.
    failures: VecDeque<TransportError>,
    /// Artificial latency before a `connect` completes.
    delay: Option<Duration>,
    /// Number of `connect` calls seen so far.
    attempts: usize,
}

/// In-process [`Connector`] backed by `tokio::sync::mpsc` channels.
#[derive(Debug, Clone)]
pub struct LoopbackConnector {
    script: Arc<Mutex<Script>>,
    accepted: mpsc::UnboundedSender<LoopbackPeer>,
}

/// Receives the server side of every link the connector opens.
#[derive(Debug)]
pub struct LoopbackServer {
    accepted: mpsc::UnboundedReceiver<LoopbackPeer>,
}

/// Server side of one loopback link.
#[derive(Debug)]
pub struct LoopbackPeer {
    conversation: ConversationId,
    to_client: mpsc::Sender<Result<Frame, TransportError>>,
    from_client: mpsc::UnboundedReceiver<Frame>,
}

impl LoopbackConnector {
    /// Create a connector and the server endpoint that accepts its links.
    #[must_use]
    pub fn new() -> (Self, LoopbackServer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            script: Arc::new(Mutex::new(Script::default())),
            accepted: tx,
        };
        (connector, LoopbackServer { accepted: rx })
    }

    /// Make the next `connect` call fail with `err`. Calls queue up.
    pub fn fail_next(&self, err: TransportError) {
        self.script.lock().failures.push_back(err);
    }

    /// Delay every subsequent `connect` by `delay` (`None` to disable).
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.script.lock().delay = delay;
    }

    /// Number of `connect` calls made so far, successful or not.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.script.lock().attempts
    }
}

impl Connector for LoopbackConnector {
    async fn connect(&self, conversation: ConversationId) -> Result<LiveLink, TransportError> {
        let (delay, failure) = {
            let mut script = self.script.lock();
            script.attempts += 1;
            (script.delay, script.failures.pop_front())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = failure {
            return Err(err);
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::channel(LINK_CAPACITY);
        let peer = LoopbackPeer {
            conversation,
            to_client: in_tx,
            from_client: out_rx,
        };
        self.accepted
            .send(peer)
            .map_err(|_| TransportError::Unreachable("loopback".into()))?;

        Ok(LiveLink {
            outgoing: out_tx,
            incoming: in_rx,
            guard: LinkGuard::default(),
        })
    }
}

impl LoopbackServer {
    /// Wait for the next link the connector opens.
    pub async fn accept(&mut self) -> Option<LoopbackPeer> {
        self.accepted.recv().await
    }
}

impl LoopbackPeer {
    /// The conversation this link was opened for.
    #[must_use]
    pub const fn conversation(&self) -> ConversationId {
        self.conversation
    }

    /// Push a message to the client as a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the client side is gone.
    pub async fn push(&self, message: &Message) -> Result<(), TransportError> {
        let text = codec::encode(message).map_err(|e| TransportError::Protocol(e.to_string()))?;
        self.push_frame(Frame::Text(text)).await
    }

    /// Push an arbitrary frame to the client.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::ConnectionClosed`] if the client side is gone.
    pub async fn push_frame(&self, frame: Frame) -> Result<(), TransportError> {
        self.to_client
            .send(Ok(frame))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Deliver a transport error to the client, ending the link.
    pub async fn fail(self, err: TransportError) {
        let _ = self.to_client.send(Err(err)).await;
    }

    /// Next frame the client sent, including pings and close.
    pub async fn recv(&mut self) -> Option<Frame> {
        self.from_client.recv().await
    }

    /// Next chat message the client sent, skipping control frames.
    ///
    /// Returns `None` once the client closes the link.
    pub async fn recv_message(&mut self) -> Option<Message> {
        loop {
            match self.from_client.recv().await? {
                Frame::Text(text) => return codec::decode(&text).ok(),
                Frame::Close => return None,
                Frame::Binary(_) | Frame::Ping | Frame::Pong => {}
            }
        }
    }

    /// Answer pings with pongs until the client goes away.
    ///
    /// Chat messages received meanwhile are forwarded to `messages`.
    pub fn serve_keepalive(mut self, messages: mpsc::UnboundedSender<Message>) {
        tokio::spawn(async move {
            while let Some(frame) = self.from_client.recv().await {
                match frame {
                    Frame::Ping => {
                        if self.to_client.send(Ok(Frame::Pong)).await.is_err() {
                            break;
                        }
                    }
                    Frame::Text(text) => {
                        if let Ok(message) = codec::decode(&text) {
                            let _ = messages.send(message);
                        }
                    }
                    Frame::Close => break,
                    Frame::Binary(_) | Frame::Pong => {}
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courtchat_proto::message::{SenderId, Timestamp};

    fn sample() -> Message {
        Message::outgoing(
            ConversationId::new(5),
            SenderId::new(1),
            "ana",
            "rematch?",
            Timestamp::now(),
        )
    }

    #[tokio::test]
    async fn link_carries_frames_both_ways() {
        let (connector, mut server) = LoopbackConnector::new();
        let mut link = connector.connect(ConversationId::new(5)).await.unwrap();
        let mut peer = server.accept().await.unwrap();
        assert_eq!(peer.conversation(), ConversationId::new(5));

        link.outgoing
            .send(Frame::Text(codec::encode_outbound(&sample()).unwrap()))
            .unwrap();
        let received = peer.recv_message().await.unwrap();
        assert_eq!(received.content, "rematch?");

        peer.push(&sample()).await.unwrap();
        assert!(matches!(
            link.incoming.recv().await,
            Some(Ok(Frame::Text(_)))
        ));
    }

    #[tokio::test]
    async fn scripted_failure_is_consumed_once() {
        let (connector, _server) = LoopbackConnector::new();
        connector.fail_next(TransportError::Timeout);

        let first = connector.connect(ConversationId::new(1)).await;
        assert!(matches!(first, Err(TransportError::Timeout)));
        assert!(connector.connect(ConversationId::new(1)).await.is_ok());
        assert_eq!(connector.attempts(), 2);
    }

    #[tokio::test]
    async fn dropping_peer_closes_incoming() {
        let (connector, mut server) = LoopbackConnector::new();
        let mut link = connector.connect(ConversationId::new(1)).await.unwrap();
        drop(server.accept().await.unwrap());
        assert!(link.incoming.recv().await.is_none());
    }

    #[tokio::test]
    async fn keepalive_server_answers_pings() {
        let (connector, mut server) = LoopbackConnector::new();
        let mut link = connector.connect(ConversationId::new(1)).await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        server.accept().await.unwrap().serve_keepalive(tx);

        link.outgoing.send(Frame::Ping).unwrap();
        assert!(matches!(link.incoming.recv().await, Some(Ok(Frame::Pong))));
    }
}
