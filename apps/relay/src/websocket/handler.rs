//! WebSocket upgrade handler and per-connection driver
//!
//! Each socket is split into a writer task, which owns the sink and drains
//! the connection's outbound channel, and a reader that first waits for
//! admission and then feeds frames to a [`MessageRouter`]. Whatever ends
//! the connection, the registry is told to forget it afterwards.

use std::borrow::Cow;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, Extension,
    },
    response::Response,
};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;

use crate::error::{RelayError, RelayResult};

use super::admission::{admit, Admitted};
use super::connection::{ConnectionHandle, ConnectionId, Outbound};
use super::registry::SessionRegistry;
use super::router::MessageRouter;

/// How long a writer gets to flush a close frame after the reader is done
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state handed to every connection
#[derive(Debug, Clone)]
pub struct RelayContext {
    pub registry: Arc<SessionRegistry>,
    /// Time allowed between upgrade and the connect message
    pub admission_timeout: Duration,
}

/// WebSocket upgrade handler for `GET /ws`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Extension(context): Extension<RelayContext>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let peer = connect_info
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    tracing::debug!(peer = %peer, "WebSocket upgrade requested");

    ws.on_upgrade(move |socket| handle_socket(socket, context))
}

async fn handle_socket(socket: WebSocket, context: RelayContext) {
    let (sink, stream) = socket.split();
    drive_connection(sink, stream, context).await;
}

/// Run one connection from admission to cleanup
///
/// Generic over the transport halves so it can be driven without a real
/// socket.
pub async fn drive_connection<Si, St>(sink: Si, mut stream: St, context: RelayContext)
where
    Si: Sink<Message> + Unpin + Send + 'static,
    Si::Error: Display,
    St: Stream<Item = Result<Message, axum::Error>> + Unpin + Send + 'static,
{
    let (connection, rx) = ConnectionHandle::channel();
    let connection_id = connection.id();
    let mut send_task = tokio::spawn(write_frames(sink, rx, connection_id));

    let admitted = match await_admission(&mut stream, &context, &connection).await {
        Ok(Some(admitted)) => admitted,
        Ok(None) => {
            tracing::debug!(%connection_id, "Connection ended before admission");
            finish(connection, send_task, &context.registry).await;
            return;
        }
        Err(e) => {
            e.log();
            let _ = connection.close(e.close_code(), e.close_reason());
            finish(connection, send_task, &context.registry).await;
            return;
        }
    };

    let role = admitted.role;
    let key = admitted.key.clone();
    let router = MessageRouter::new(
        Arc::clone(&context.registry),
        Arc::clone(&connection),
        admitted,
    );
    let mut recv_task = tokio::spawn(read_frames(stream, router));

    // Wait for either task to complete, then stop the other
    let fault = tokio::select! {
        _ = &mut send_task => {
            tracing::debug!(%connection_id, "Send task completed");
            recv_task.abort();
            None
        }
        result = &mut recv_task => {
            tracing::debug!(%connection_id, "Receive task completed");
            match result {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e),
                Err(join_error) if join_error.is_panic() => {
                    Some(RelayError::Internal("connection task panicked".to_string()))
                }
                Err(join_error) => Some(RelayError::Internal(join_error.to_string())),
            }
        }
    };

    if let Some(e) = fault {
        e.log();
        let _ = connection.close(e.close_code(), e.close_reason());
    }

    if send_task.is_finished() {
        context.registry.detach_connection(connection_id);
    } else {
        finish(connection, send_task, &context.registry).await;
    }

    tracing::info!(key = %key, role = %role, %connection_id, "WebSocket connection closed");
}

/// Forget the connection and give the writer a chance to flush
async fn finish(
    connection: Arc<ConnectionHandle>,
    send_task: tokio::task::JoinHandle<()>,
    registry: &SessionRegistry,
) {
    let connection_id = connection.id();
    registry.detach_connection(connection_id);
    drop(connection);

    // Other holders may still keep the channel open briefly
    if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, send_task)
        .await
        .is_err()
    {
        tracing::debug!(%connection_id, "Writer did not drain in time");
    }
}

/// Wait for the first text frame and admit the connection on it
///
/// `Ok(None)` means the peer went away without saying anything.
async fn await_admission<St>(
    stream: &mut St,
    context: &RelayContext,
    connection: &Arc<ConnectionHandle>,
) -> RelayResult<Option<Admitted>>
where
    St: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let first = tokio::time::timeout(context.admission_timeout, next_text(stream))
        .await
        .map_err(|_| RelayError::AdmissionTimeout(context.admission_timeout.as_secs()))??;

    match first {
        Some(text) => admit(&context.registry, connection, &text).map(Some),
        None => Ok(None),
    }
}

async fn next_text<St>(stream: &mut St) -> RelayResult<Option<String>>
where
    St: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => return Ok(Some(text)),
            Ok(Message::Binary(_)) => {
                return Err(RelayError::ProtocolViolation(
                    "binary frame before admission".to_string(),
                ))
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) => return Ok(None),
            Err(e) => {
                tracing::debug!(error = %e, "WebSocket error before admission");
                return Ok(None);
            }
        }
    }
    Ok(None)
}

/// Feed frames to the router until the peer leaves or a fatal error occurs
async fn read_frames<St>(mut stream: St, router: MessageRouter) -> RelayResult<()>
where
    St: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => match router.handle_text(&text) {
                Ok(()) => {}
                Err(e) if !e.is_fatal() => {
                    e.log();
                    router.reply_error(&e);
                }
                Err(e) => return Err(e),
            },
            Ok(Message::Binary(_)) => {
                tracing::debug!(key = %router.key(), "Received unsupported binary message");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                tracing::trace!(key = %router.key(), "Received ping/pong");
            }
            Ok(Message::Close(_)) => {
                tracing::debug!(key = %router.key(), "WebSocket close received");
                break;
            }
            Err(e) => {
                tracing::debug!(error = %e, key = %router.key(), "WebSocket error");
                break;
            }
        }
    }
    Ok(())
}

/// Drain the outbound channel into the sink
async fn write_frames<Si>(
    mut sink: Si,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    connection_id: ConnectionId,
) where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    while let Some(frame) = rx.recv().await {
        match frame {
            Outbound::Text(text) => {
                if let Err(e) = sink.send(Message::Text(text.to_string())).await {
                    tracing::debug!(%connection_id, error = %e, "WebSocket send failed");
                    return;
                }
            }
            Outbound::Close { code, reason } => {
                let frame = CloseFrame {
                    code,
                    reason: Cow::Borrowed(reason),
                };
                if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                    tracing::debug!(%connection_id, error = %e, "Failed to send close frame");
                }
                break;
            }
        }
    }
    let _ = sink.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::websocket::messages::{decode, RemoteMessage};
    use assert_matches::assert_matches;
    use futures_util::sink;
    use std::pin::Pin;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    type TestSink = Pin<Box<dyn Sink<Message, Error = mpsc::error::SendError<Message>> + Send>>;

    struct Peer {
        incoming: mpsc::UnboundedSender<Result<Message, axum::Error>>,
        outgoing: mpsc::UnboundedReceiver<Message>,
    }

    impl Peer {
        fn send(&self, text: &str) {
            self.incoming.send(Ok(Message::Text(text.to_string()))).unwrap();
        }

        async fn recv(&mut self) -> Option<Message> {
            self.outgoing.recv().await
        }

        async fn recv_message(&mut self) -> RemoteMessage {
            match self.recv().await {
                Some(Message::Text(text)) => decode(&text).unwrap(),
                other => panic!("expected text frame, got {:?}", other),
            }
        }

        async fn recv_close_code(&mut self) -> u16 {
            match self.recv().await {
                Some(Message::Close(Some(frame))) => frame.code,
                other => panic!("expected close frame, got {:?}", other),
            }
        }
    }

    fn context(timeout: Duration) -> RelayContext {
        RelayContext {
            registry: Arc::new(SessionRegistry::new(
                Arc::new(ManualClock::default()),
                chrono::Duration::days(365),
            )),
            admission_timeout: timeout,
        }
    }

    fn spawn_peer(context: &RelayContext) -> (Peer, tokio::task::JoinHandle<()>) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel::<Message>();

        let sink: TestSink = Box::pin(sink::unfold(out_tx, |tx, msg: Message| async move {
            tx.send(msg)?;
            Ok::<_, mpsc::error::SendError<Message>>(tx)
        }));
        let stream = UnboundedReceiverStream::new(in_rx);

        let task = tokio::spawn(drive_connection(sink, stream, context.clone()));
        (
            Peer {
                incoming: in_tx,
                outgoing: out_rx,
            },
            task,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_connection_is_closed_after_timeout() {
        let context = context(Duration::from_secs(30));
        let (mut peer, task) = spawn_peer(&context);

        assert_eq!(peer.recv_close_code().await, 1003);
        task.await.unwrap();
        assert_eq!(context.registry.session_count(), 0);
    }

    #[test_log::test(tokio::test)]
    async fn test_wrong_first_message_is_protocol_error() {
        let context = context(Duration::from_secs(30));
        let (mut peer, task) = spawn_peer(&context);

        peer.send(r#"{"type":"seek-command","position":1}"#);
        assert_eq!(peer.recv_close_code().await, 1002);
        task.await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_unknown_observer_key_is_cannot_accept() {
        let context = context(Duration::from_secs(30));
        let (mut peer, task) = spawn_peer(&context);

        peer.send(r#"{"type":"observer-connect","key":"ZZZZZZ"}"#);
        assert_eq!(peer.recv_close_code().await, 1003);
        task.await.unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn test_primary_disconnect_detaches_but_keeps_session() {
        let context = context(Duration::from_secs(30));
        let (mut peer, task) = spawn_peer(&context);

        peer.send(r#"{"type":"primary-connect"}"#);
        let key = match peer.recv_message().await {
            RemoteMessage::PrimaryConnectResponse(r) => r.key,
            other => panic!("unexpected {:?}", other),
        };

        peer.incoming.send(Ok(Message::Close(None))).unwrap();
        task.await.unwrap();

        let key = crate::websocket::registry::PairingKey::parse(&key).unwrap();
        assert!(context.registry.contains_key(&key));
        assert!(!context.registry.has_live_primary(&key));
    }

    #[test_log::test(tokio::test)]
    async fn test_bad_frame_after_admission_gets_error_reply() {
        let context = context(Duration::from_secs(30));
        let (mut peer, _task) = spawn_peer(&context);

        peer.send(r#"{"type":"primary-connect"}"#);
        peer.recv_message().await;

        peer.send("definitely not json");
        assert_matches!(
            peer.recv_message().await,
            RemoteMessage::ErrorMessage(e) if e.code == "INVALID_MESSAGE"
        );

        peer.send(r#"{"type":"volume-command","volume":0.3}"#);
        assert_matches!(
            peer.recv_message().await,
            RemoteMessage::ErrorMessage(e) if e.code == "INVALID_COMMAND"
        );
    }
}
