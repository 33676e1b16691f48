//! WebSocket driver for [`SubscriptionProtocol`].
//!
//! One writer task drains the protocol's outbound queue into the socket, one
//! reader task feeds inbound text frames back into the protocol. When the
//! socket closes, every outstanding packet is rejected with
//! [`ProtocolError::ConnectionClosed`]. Reconnecting is the caller's call:
//! [`WsConnection::close`] hands the outbound queue back so it can be passed
//! to the next [`WsConnection::connect`], after which
//! [`SubscriptionProtocol::resend_outstanding`] replays anything in flight.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, info, trace, warn};

use super::error::ProtocolError;
use super::protocol::SubscriptionProtocol;

/// Client socket as returned by [`WsConnection::dial`].
pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A live socket session.
#[derive(Debug)]
pub struct WsConnection {
    closed: Arc<watch::Sender<bool>>,
    writer: JoinHandle<mpsc::Receiver<String>>,
    reader: JoinHandle<()>,
}

impl WsConnection {
    /// Open `url` and start pumping frames between it and `protocol`.
    pub async fn connect(
        url: &str,
        protocol: SubscriptionProtocol,
        outbound: mpsc::Receiver<String>,
    ) -> Result<Self, ProtocolError> {
        let socket = Self::dial(url).await?;
        Ok(Self::attach(socket, protocol, outbound))
    }

    /// Open `url` without attaching anything to it.
    pub async fn dial(url: &str) -> Result<WsStream, ProtocolError> {
        let (socket, _) = connect_async(url)
            .await
            .map_err(|e| ProtocolError::Connect(e.to_string()))?;
        info!(%url, "socket connected");
        Ok(socket)
    }

    /// Start pumping frames between an open socket and `protocol`.
    pub fn attach(
        socket: WsStream,
        protocol: SubscriptionProtocol,
        mut outbound: mpsc::Receiver<String>,
    ) -> Self {
        let (mut sink, mut stream) = socket.split();
        let (closed, mut closed_rx) = watch::channel(false);
        let closed = Arc::new(closed);

        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = closed_rx.changed() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                    frame = outbound.recv() => {
                        let Some(frame) = frame else {
                            break;
                        };
                        trace!(len = frame.len(), "frame out");
                        if let Err(e) = sink.send(Message::Text(frame.into())).await {
                            warn!(error = %e, "socket write failed");
                            break;
                        }
                    }
                }
            }
            debug!("socket writer stopped");
            outbound
        });

        let reader_closed = Arc::clone(&closed);
        let reader = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => match protocol.handle_frame(&text) {
                        Ok(dispatch) => trace!(?dispatch, "frame in"),
                        Err(e) => warn!(error = %e, "bad inbound frame"),
                    },
                    Ok(Message::Close(frame)) => {
                        info!(?frame, "socket closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "socket read failed");
                        break;
                    }
                }
            }
            protocol.fail_outstanding(ProtocolError::ConnectionClosed);
            reader_closed.send_replace(true);
        });

        Self {
            closed,
            writer,
            reader,
        }
    }

    /// Whether the socket has stopped.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Wait until the socket stops.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Close the socket and return the outbound queue for the next session.
    ///
    /// Outstanding packets are left alone so they can be resent.
    pub async fn close(self) -> Result<mpsc::Receiver<String>, ProtocolError> {
        self.closed.send_replace(true);
        self.reader.abort();
        self.writer
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }
}
