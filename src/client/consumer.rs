//! Consumer side of the relay link.

use bytes::Bytes;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::producer::{map_handshake_error, WsStream};
use super::{ConnectionStatus, LinkEnd, LinkSlot, StatusEvent, StatusTracker};
use crate::error::ConnectError;

/// Frames waiting for the display. Past this the reader stops pulling from
/// the socket and the relay starts dropping frames for this consumer.
const FRAME_BUFFER: usize = 4;

/// Ordered stream of raw frame payloads, exactly as the relay forwarded them
#[derive(Debug)]
pub struct FrameReceiver {
    rx: mpsc::Receiver<Bytes>,
}

impl FrameReceiver {
    /// Frames from any source, e.g. a local pipeline
    pub fn from_channel(rx: mpsc::Receiver<Bytes>) -> Self {
        Self { rx }
    }

    /// `None` once the connection is gone
    pub async fn next(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub fn try_next(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }
}

pub struct ConsumerSession {
    status: Arc<StatusTracker>,
    link: Arc<LinkSlot<CancellationToken>>,
}

impl ConsumerSession {
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

    pub async fn connect(&self, url: &str) -> Result<FrameReceiver, ConnectError> {
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

        let cancel = CancellationToken::new();
        let id = self.link.install(cancel.clone());
        if self.status.apply(StatusEvent::HandshakeOk).is_none() {
            self.link.take_if(id);
            return Err(ConnectError::Handshake("closed during handshake".into()));
        }
        info!("viewer link established");

        let (tx, rx) = mpsc::channel(FRAME_BUFFER);
        let status = self.status.clone();
        let slot = self.link.clone();
        tokio::spawn(async move {
            let end = read_frames(ws, tx, cancel).await;
            if let LinkEnd::Failed(reason) = &end {
                warn!("viewer link failed: {}", reason);
            }
            slot.finish(id, &status, end);
        });

        Ok(FrameReceiver::from_channel(rx))
    }

    /// Idempotent
    pub fn close(&self) {
        if let Some(cancel) = self.link.take() {
            cancel.cancel();
        }
        self.status.apply(StatusEvent::Closed);
    }
}

impl Default for ConsumerSession {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConsumerSession {
    fn drop(&mut self) {
        if let Some(cancel) = self.link.take() {
            cancel.cancel();
        }
    }
}

async fn read_frames(
    mut ws: WsStream,
    frames: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) -> LinkEnd {
    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws.close(None).await;
                return LinkEnd::Closed;
            }
            msg = ws.next() => msg,
        };

        match msg {
            Some(Ok(WsMessage::Binary(data))) => {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = ws.close(None).await;
                        return LinkEnd::Closed;
                    }
                    sent = frames.send(Bytes::from(data)) => {
                        if sent.is_err() {
                            // Nobody is displaying frames anymore
                            let _ = ws.close(None).await;
                            return LinkEnd::Closed;
                        }
                    }
                }
            }
            Some(Ok(WsMessage::Close(_))) | None => return LinkEnd::Closed,
            Some(Ok(_)) => {}
            Some(Err(e)) => return LinkEnd::Failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let session = ConsumerSession::new();
        assert!(session
            .connect(&format!("ws://127.0.0.1:{}/viewer", port))
            .await
            .is_err());
        assert_eq!(session.status(), ConnectionStatus::Error);

        // Reconnecting is an explicit call, and legal from `error`
        assert!(session
            .connect(&format!("ws://127.0.0.1:{}/viewer", port))
            .await
            .is_err());
        session.close();
        assert_eq!(session.status(), ConnectionStatus::Disconnected);
    }
}
