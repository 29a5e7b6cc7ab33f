//! Producer side of the relay link.

use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{ConnectionStatus, LinkEnd, LinkSlot, StatusEvent, StatusTracker};
use crate::error::ConnectError;
use crate::protocol::Frame;
use crate::screen::capture::FrameSink;

pub(crate) type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Live connection state, present only while connected
struct Link {
    outbound: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
}

/// Outbound frame link to the relay.
///
/// `send` never blocks and never queues: the writer task takes one frame
/// at a time and anything offered while it is busy is dropped.
pub struct ProducerSession {
    status: Arc<StatusTracker>,
    link: Arc<LinkSlot<Link>>,
}

impl ProducerSession {
    pub fn new() -> Self {
        Self {
            status: Arc::new(StatusTracker::new()),
            link: Arc::new(LinkSlot::new()),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.current()
    }

    pub fn subscribe_status(&self) -> mpsc::UnboundedReceiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Open the link and wait for the upgrade handshake to finish.
    pub async fn connect(&self, url: &str) -> Result<(), ConnectError> {
        if self.status.apply(StatusEvent::Connect).is_none() {
            return Err(ConnectError::AlreadyConnected);
        }
        info!("connecting to relay: {}", url);

        let ws = match connect_async(url).await {
            Ok((ws, _)) => ws,
            Err(e) => {
                self.status.apply(StatusEvent::Failure);
                return Err(map_handshake_error(url, e));
            }
        };

        let (outbound, rx) = mpsc::channel::<Vec<u8>>(1);
        let cancel = CancellationToken::new();
        let id = self.link.install(Link {
            outbound,
            cancel: cancel.clone(),
        });

        if self.status.apply(StatusEvent::HandshakeOk).is_none() {
            // close() won the race while the handshake was in flight
            cancel.cancel();
            self.link.take_if(id);
            return Err(ConnectError::Handshake("closed during handshake".into()));
        }
        info!("producer link established");

        let status = self.status.clone();
        let slot = self.link.clone();
        tokio::spawn(async move {
            let end = run_link(ws, rx, cancel).await;
            if let LinkEnd::Failed(reason) = &end {
                warn!("producer link failed: {}", reason);
            }
            slot.finish(id, &status, end);
        });
        Ok(())
    }

    /// Offer a frame. `false` means it was dropped.
    pub fn send(&self, frame: &Frame) -> bool {
        if self.status.current() != ConnectionStatus::Connected {
            return false;
        }
        self.link.with(|link| match link {
            Some(link) => link.outbound.try_send(frame.data().to_vec()).is_ok(),
            None => false,
        })
    }

    pub fn is_open(&self) -> bool {
        self.status.current() == ConnectionStatus::Connected && self.link.with(|link| link.is_some())
    }

    /// Idempotent
    pub fn close(&self) {
        if let Some(link) = self.link.take() {
            link.cancel.cancel();
        }
        self.status.apply(StatusEvent::Closed);
    }
}

impl Default for ProducerSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProducerSession {
    fn drop(&mut self) {
        if let Some(link) = self.link.take() {
            link.cancel.cancel();
        }
    }
}

impl FrameSink for ProducerSession {
    fn is_open(&self) -> bool {
        ProducerSession::is_open(self)
    }

    fn send(&self, frame: &Frame) -> bool {
        ProducerSession::send(self, frame)
    }

    fn status(&self) -> ConnectionStatus {
        ProducerSession::status(self)
    }

    fn subscribe_status(&self) -> mpsc::UnboundedReceiver<ConnectionStatus> {
        ProducerSession::subscribe_status(self)
    }

    fn close(&self) {
        ProducerSession::close(self)
    }
}

pub(crate) fn map_handshake_error(url: &str, e: tungstenite::Error) -> ConnectError {
    match e {
        tungstenite::Error::Url(e) => ConnectError::InvalidAddress(format!("{}: {}", url, e)),
        other => ConnectError::Handshake(other.to_string()),
    }
}

async fn run_link(
    ws: WsStream,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) -> LinkEnd {
    let (mut ws_sender, mut ws_receiver) = ws.split();

    let write = async {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = ws_sender.send(WsMessage::Close(None)).await;
                    return LinkEnd::Closed;
                }
                data = outbound.recv() => match data {
                    Some(data) => {
                        if let Err(e) = ws_sender.send(WsMessage::Binary(data)).await {
                            return LinkEnd::Failed(e.to_string());
                        }
                    }
                    None => {
                        let _ = ws_sender.send(WsMessage::Close(None)).await;
                        return LinkEnd::Closed;
                    }
                },
            }
        }
    };

    // The relay never sends the producer data; only watch for close or failure
    let read = async {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(WsMessage::Close(_)) => return LinkEnd::Closed,
                Ok(_) => {}
                Err(e) => return LinkEnd::Failed(e.to_string()),
            }
        }
        LinkEnd::Closed
    };

    tokio::select! {
        end = write => end,
        end = read => end,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_rejected_when_not_connected() {
        let session = ProducerSession::new();
        assert!(!session.send(&Frame::new(vec![1u8, 2, 3], 1, 1)));
        assert!(!session.is_open());
        assert_eq!(session.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn test_close_is_idempotent() {
        let session = ProducerSession::new();
        let mut rx = session.subscribe_status();
        session.close();
        session.close();
        assert_eq!(session.status(), ConnectionStatus::Disconnected);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_refused_reports_error() {
        // Bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let session = ProducerSession::new();
        let mut rx = session.subscribe_status();
        let err = session
            .connect(&format!("ws://127.0.0.1:{}/transmitter", port))
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::Handshake(_)));
        assert_eq!(rx.recv().await, Some(ConnectionStatus::Connecting));
        assert_eq!(rx.recv().await, Some(ConnectionStatus::Error));
        assert_eq!(session.status(), ConnectionStatus::Error);
    }

    #[tokio::test]
    async fn test_invalid_address() {
        let session = ProducerSession::new();
        let err = session.connect("not a url").await.unwrap_err();
        assert!(matches!(
            err,
            ConnectError::InvalidAddress(_) | ConnectError::Handshake(_)
        ));
        assert_eq!(session.status(), ConnectionStatus::Error);
    }
}
