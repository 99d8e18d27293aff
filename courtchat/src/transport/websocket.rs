//! WebSocket live channel.
//!
//! Connects to `{live_url}?locationId={conversation}` and splits the socket
//! into two pumps: a reader that forwards frames into the link's inbound
//! channel and a writer that drains the outbound channel into the socket.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use courtchat_proto::message::ConversationId;

use super::{Connector, Frame, LinkGuard, LiveLink, TransportError};

/// Write half of a client WebSocket.
type WsSink = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    WsMessage,
>;

/// Read half of a client WebSocket.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Capacity of the inbound frame channel for one link.
const INBOUND_CAPACITY: usize = 256;

/// Query parameter the backend uses to select the conversation room.
const CONVERSATION_PARAM: &str = "locationId";

/// Opens WebSocket links against a fixed live endpoint.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    live_url: Url,
}

impl WebSocketConnector {
    /// Create a connector for the given `ws://` or `wss://` endpoint.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Protocol`] if the URL cannot be parsed or
    /// does not use a WebSocket scheme.
    pub fn new(live_url: &str) -> Result<Self, TransportError> {
        let live_url = Url::parse(live_url)
            .map_err(|e| TransportError::Protocol(format!("invalid live url {live_url}: {e}")))?;
        if !matches!(live_url.scheme(), "ws" | "wss") {
            return Err(TransportError::Protocol(format!(
                "live url must use ws:// or wss://, got {}",
                live_url.scheme()
            )));
        }
        Ok(Self { live_url })
    }

    /// The endpoint URL for one conversation.
    #[must_use]
    pub fn conversation_url(&self, conversation: ConversationId) -> Url {
        let mut url = self.live_url.clone();
        url.query_pairs_mut()
            .append_pair(CONVERSATION_PARAM, &conversation.to_string());
        url
    }
}

impl Connector for WebSocketConnector {
    async fn connect(&self, conversation: ConversationId) -> Result<LiveLink, TransportError> {
        let url = self.conversation_url(conversation);
        let (ws_stream, _response) = connect_async(url.as_str()).await.map_err(|e| {
            tracing::warn!(url = %url, err = %e, "live channel connect failed");
            map_ws_connect_error(&url, e)
        })?;
        tracing::debug!(url = %url, conversation = %conversation, "live channel open");

        let (sink, reader) = ws_stream.split();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::channel(INBOUND_CAPACITY);

        let reader_task = tokio::spawn(reader_pump(reader, in_tx));
        tokio::spawn(writer_pump(sink, out_rx));

        Ok(LiveLink {
            outgoing: out_tx,
            incoming: in_rx,
            guard: LinkGuard::new(vec![reader_task]),
        })
    }
}

/// Forwards socket frames into the inbound channel until the socket ends.
///
/// A read error is forwarded once as the final item.
async fn reader_pump(mut reader: WsReader, tx: mpsc::Sender<Result<Frame, TransportError>>) {
    while let Some(item) = reader.next().await {
        let frame = match item {
            Ok(WsMessage::Text(text)) => Frame::Text(text.as_str().to_owned()),
            Ok(WsMessage::Binary(data)) => Frame::Binary(data.to_vec()),
            Ok(WsMessage::Ping(_)) => Frame::Ping,
            Ok(WsMessage::Pong(_)) => Frame::Pong,
            Ok(WsMessage::Close(_)) => {
                let _ = tx.send(Ok(Frame::Close)).await;
                break;
            }
            Ok(WsMessage::Frame(_)) => continue,
            Err(e) => {
                tracing::debug!(err = %e, "live channel read error");
                let _ = tx
                    .send(Err(TransportError::Protocol(e.to_string())))
                    .await;
                break;
            }
        };
        if tx.send(Ok(frame)).await.is_err() {
            break;
        }
    }
    tracing::debug!("live channel reader exiting");
}

/// Drains the outbound channel into the socket.
///
/// Ends after a [`Frame::Close`], on a write error, or when every sender
/// has been dropped.
async fn writer_pump(mut sink: WsSink, mut rx: mpsc::UnboundedReceiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        let msg = match frame {
            Frame::Text(text) => WsMessage::Text(text.into()),
            Frame::Binary(data) => WsMessage::Binary(data.into()),
            Frame::Ping => WsMessage::Ping(Vec::new().into()),
            Frame::Pong => WsMessage::Pong(Vec::new().into()),
            Frame::Close => break,
        };
        if let Err(e) = sink.send(msg).await {
            tracing::warn!(err = %e, "live channel write failed");
            return;
        }
    }
    let _ = sink.close().await;
}

/// Map a `tokio_tungstenite` connect error to a [`TransportError`].
fn map_ws_connect_error(url: &Url, err: tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => match io_err.kind() {
            std::io::ErrorKind::ConnectionRefused | std::io::ErrorKind::AddrNotAvailable => {
                TransportError::Unreachable(url.to_string())
            }
            _ => TransportError::Io(io_err),
        },
        WsError::Http(response) => TransportError::Protocol(format!(
            "live endpoint answered with status {}",
            response.status()
        )),
        other => TransportError::Protocol(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

    /// Accepts one socket, records the request path, and echoes text frames
    /// until the client closes.
    async fn start_echo_server() -> (String, tokio::sync::oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (path_tx, path_rx) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                let _ = path_tx.send(req.uri().to_string());
                Ok(resp)
            };
            let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
                .await
                .unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    WsMessage::Text(_) => ws.send(msg).await.unwrap(),
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
        });

        (format!("ws://{addr}/ws/chat"), path_rx)
    }

    #[test]
    fn rejects_non_websocket_scheme() {
        let err = WebSocketConnector::new("http://localhost/ws").unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }

    #[test]
    fn conversation_url_carries_location_id() {
        let connector = WebSocketConnector::new("ws://localhost:9095/ws/chat").unwrap();
        let url = connector.conversation_url(ConversationId::new(12));
        assert_eq!(url.as_str(), "ws://localhost:9095/ws/chat?locationId=12");
    }

    #[tokio::test]
    async fn connect_selects_conversation_and_echoes_text() {
        let (url, path_rx) = start_echo_server().await;
        let connector = WebSocketConnector::new(&url).unwrap();
        let mut link = connector.connect(ConversationId::new(4)).await.unwrap();

        assert_eq!(path_rx.await.unwrap(), "/ws/chat?locationId=4");

        link.outgoing.send(Frame::Text("hello".into())).unwrap();
        let echoed = link.incoming.recv().await.unwrap().unwrap();
        assert_eq!(echoed, Frame::Text("hello".into()));
    }

    #[tokio::test]
    async fn connect_to_closed_port_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let connector = WebSocketConnector::new(&format!("ws://{addr}/ws/chat")).unwrap();
        let result = connector.connect(ConversationId::new(1)).await;
        assert!(matches!(result, Err(TransportError::Unreachable(_))));
    }

    #[tokio::test]
    async fn close_frame_ends_the_link() {
        let (url, _path_rx) = start_echo_server().await;
        let connector = WebSocketConnector::new(&url).unwrap();
        let mut link = connector.connect(ConversationId::new(4)).await.unwrap();

        link.outgoing.send(Frame::Close).unwrap();
        // The echo server stops on Close; the reader then sees the socket end.
        let next = tokio::time::timeout(std::time::Duration::from_secs(2), async {
            loop {
                match link.incoming.recv().await {
                    Some(Ok(Frame::Close)) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        })
        .await;
        assert!(next.is_ok(), "link did not end after close");
    }
}
