//! Agent transport
//!
//! The registry works on any pair of a frame stream and a frame sink. This
//! module adapts an axum WebSocket to that shape and sorts transport errors
//! into benign resets and fatal failures.

use axum::extract::ws::{Message, WebSocket};
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tracing::trace;

use convoy_common::error::is_reset_kind;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Peer went away; handled as an ordinary disconnect
    #[error("connection reset")]
    Reset,

    /// Anything else; reported to the supervisor
    #[error("transport failure: {0}")]
    Fatal(String),
}

impl From<axum::Error> for TransportError {
    fn from(error: axum::Error) -> Self {
        let inner = error.into_inner();
        let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&*inner);
        while let Some(e) = source {
            if let Some(io) = e.downcast_ref::<std::io::Error>() {
                if is_reset_kind(io.kind()) {
                    return TransportError::Reset;
                }
            }
            source = e.source();
        }

        let message = inner.to_string();
        if message.contains("without closing handshake")
            || message.contains("Connection closed")
            || message.contains("closed connection")
        {
            TransportError::Reset
        } else {
            TransportError::Fatal(message)
        }
    }
}

/// Split a WebSocket into an outbound text-frame sink and an inbound
/// text-frame stream. The stream ends at the peer's close frame.
pub fn split_websocket(
    socket: WebSocket,
) -> (
    impl Sink<String, Error = TransportError> + Unpin + Send,
    impl Stream<Item = Result<String, TransportError>> + Unpin + Send,
) {
    let (ws_write, ws_read) = socket.split();

    let sink = ws_write
        .sink_map_err(TransportError::from)
        .with(|text: String| future::ready(Ok::<_, TransportError>(Message::Text(text))));

    let stream = ws_read
        .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Binary(data)) => {
                    trace!("Binary frame: {} bytes", data.len());
                    Some(Ok(String::from_utf8_lossy(&data).into_owned()))
                }
                // Ping/pong is answered by axum
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::from(e))),
            })
        });

    (sink, stream)
}
