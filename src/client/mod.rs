//! Transport sessions to the relay.
//!
//! Both session kinds share one status machine. Transitions are driven by
//! [`StatusEvent`]s and published to subscribers exactly once each, in order.
//! Nothing reconnects on its own: leaving `error` or `disconnected` takes an
//! explicit `connect` call.

pub mod consumer;
pub mod producer;

pub use consumer::{ConsumerSession, FrameReceiver};
pub use producer::ProducerSession;

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// What happened to the underlying connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    /// The caller asked to connect (or reconnect)
    Connect,
    HandshakeOk,
    /// Any transport-level failure
    Failure,
    /// Explicit or peer-initiated close
    Closed,
}

impl ConnectionStatus {
    /// The status after `event`, or `None` if the event is not a legal transition from here.
    pub fn apply(self, event: StatusEvent) -> Option<ConnectionStatus> {
        use ConnectionStatus::*;
        match (self, event) {
            (Disconnected | Error, StatusEvent::Connect) => Some(Connecting),
            (Connecting, StatusEvent::HandshakeOk) => Some(Connected),
            (Connecting | Connected, StatusEvent::Failure) => Some(Error),
            (Connecting | Connected | Error, StatusEvent::Closed) => Some(Disconnected),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Current status plus the subscribers that hear about every change.
#[derive(Debug)]
pub struct StatusTracker {
    inner: Mutex<TrackerInner>,
}

#[derive(Debug)]
struct TrackerInner {
    current: ConnectionStatus,
    subscribers: Vec<mpsc::UnboundedSender<ConnectionStatus>>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TrackerInner {
                current: ConnectionStatus::Disconnected,
                subscribers: Vec::new(),
            }),
        }
    }

    pub fn current(&self) -> ConnectionStatus {
        self.lock().current
    }

    /// Receives every transition after this call, in order
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConnectionStatus> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }

    /// Apply `event`; returns the new status if it was a legal transition.
    ///
    /// Notification happens under the lock so concurrent transitions reach
    /// subscribers in the order they were applied.
    pub fn apply(&self, event: StatusEvent) -> Option<ConnectionStatus> {
        let mut inner = self.lock();
        let next = inner.current.apply(event)?;
        debug!(from = %inner.current, to = %next, ?event, "status transition");
        inner.current = next;
        inner.subscribers.retain(|tx| tx.send(next).is_ok());
        Some(next)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// How a connection ended
pub(crate) enum LinkEnd {
    Closed,
    Failed(String),
}

/// The live connection a session owns, tagged with the id it was installed
/// under. A link task that outlives its session's interest (closed, then
/// replaced by a reconnect) finds a different id here and stays silent.
pub(crate) struct LinkSlot<T> {
    current: Mutex<Option<(u64, T)>>,
    next_id: AtomicU64,
}

impl<T> LinkSlot<T> {
    pub(crate) fn new() -> Self {
        Self {
            current: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Returns the id the link task must present to `finish`
    pub(crate) fn install(&self, link: T) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        *self.lock() = Some((id, link));
        id
    }

    pub(crate) fn take(&self) -> Option<T> {
        self.lock().take().map(|(_, link)| link)
    }

    /// Remove link `id` only if it is still the installed one
    pub(crate) fn take_if(&self, id: u64) -> Option<T> {
        let mut slot = self.lock();
        match slot.as_ref() {
            Some((current, _)) if *current == id => slot.take().map(|(_, link)| link),
            _ => None,
        }
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        f(self.lock().as_ref().map(|(_, link)| link))
    }

    /// Report how link `id` ended. Ignored once the session has closed or
    /// moved on to a newer link; `true` if the event was applied.
    pub(crate) fn finish(&self, id: u64, status: &StatusTracker, end: LinkEnd) -> bool {
        let mut slot = self.lock();
        match slot.as_ref() {
            Some((current, _)) if *current == id => {}
            _ => {
                debug!(link = id, "stale link ended");
                return false;
            }
        }
        *slot = None;
        // Applied under the slot lock so a concurrent connect cannot interleave
        let event = match end {
            LinkEnd::Closed => StatusEvent::Closed,
            LinkEnd::Failed(_) => StatusEvent::Failure,
        };
        status.apply(event);
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<(u64, T)>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionStatus::*;

    const ALL: [ConnectionStatus; 4] = [Disconnected, Connecting, Connected, Error];
    const EVENTS: [StatusEvent; 4] = [
        StatusEvent::Connect,
        StatusEvent::HandshakeOk,
        StatusEvent::Failure,
        StatusEvent::Closed,
    ];

    #[test]
    fn test_transition_table() {
        let mut legal = Vec::new();
        for from in ALL {
            for event in EVENTS {
                if let Some(to) = from.apply(event) {
                    legal.push((from, event, to));
                }
            }
        }
        assert_eq!(
            legal,
            vec![
                (Disconnected, StatusEvent::Connect, Connecting),
                (Connecting, StatusEvent::HandshakeOk, Connected),
                (Connecting, StatusEvent::Failure, Error),
                (Connecting, StatusEvent::Closed, Disconnected),
                (Connected, StatusEvent::Failure, Error),
                (Connected, StatusEvent::Closed, Disconnected),
                (Error, StatusEvent::Connect, Connecting),
                (Error, StatusEvent::Closed, Disconnected),
            ]
        );
    }

    #[test]
    fn test_error_needs_explicit_connect() {
        // Nothing but an explicit connect (or a close) leaves `error`
        assert_eq!(Error.apply(StatusEvent::HandshakeOk), None);
        assert_eq!(Error.apply(StatusEvent::Failure), None);
        assert_eq!(Connected.apply(StatusEvent::Connect), None);
        assert_eq!(Disconnected.apply(StatusEvent::HandshakeOk), None);
    }

    #[test]
    fn test_tracker_notifies_each_transition_once() {
        let tracker = StatusTracker::new();
        let mut rx = tracker.subscribe();

        assert_eq!(tracker.apply(StatusEvent::Connect), Some(Connecting));
        assert_eq!(tracker.apply(StatusEvent::HandshakeOk), Some(Connected));
        assert_eq!(tracker.apply(StatusEvent::HandshakeOk), None);
        assert_eq!(tracker.apply(StatusEvent::Failure), Some(Error));
        assert_eq!(tracker.apply(StatusEvent::Closed), Some(Disconnected));
        assert_eq!(tracker.apply(StatusEvent::Closed), None);

        let mut seen = Vec::new();
        while let Ok(status) = rx.try_recv() {
            seen.push(status);
        }
        assert_eq!(seen, vec![Connecting, Connected, Error, Disconnected]);
        assert_eq!(tracker.current(), Disconnected);
    }

    #[test]
    fn test_tracker_drops_closed_subscribers() {
        let tracker = StatusTracker::new();
        drop(tracker.subscribe());
        let mut live = tracker.subscribe();
        tracker.apply(StatusEvent::Connect);
        assert_eq!(live.try_recv().unwrap(), Connecting);
        assert_eq!(tracker.lock().subscribers.len(), 1);
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Connected).unwrap(), "\"connected\"");
        assert_eq!(Error.to_string(), "error");
    }

    #[test]
    fn test_stale_link_end_is_ignored() {
        let tracker = StatusTracker::new();
        let slot = LinkSlot::new();

        tracker.apply(StatusEvent::Connect);
        let old = slot.install("first");
        tracker.apply(StatusEvent::HandshakeOk);

        // close, then reconnect before the first link task has wound down
        assert_eq!(slot.take(), Some("first"));
        tracker.apply(StatusEvent::Closed);
        tracker.apply(StatusEvent::Connect);
        let new = slot.install("second");
        tracker.apply(StatusEvent::HandshakeOk);

        assert!(!slot.finish(old, &tracker, LinkEnd::Closed));
        assert!(!slot.finish(old, &tracker, LinkEnd::Failed("reset".into())));
        assert_eq!(tracker.current(), Connected);
        assert_eq!(slot.with(|link| link.copied()), Some("second"));

        assert!(slot.finish(new, &tracker, LinkEnd::Failed("reset".into())));
        assert_eq!(tracker.current(), Error);
        assert!(slot.with(|link| link.is_none()));
    }

    #[test]
    fn test_take_if_leaves_newer_link() {
        let slot = LinkSlot::new();
        let old = slot.install(1u8);
        let new = slot.install(2u8);
        assert_eq!(slot.take_if(old), None);
        assert_eq!(slot.take_if(new), Some(2));
        assert_eq!(slot.take(), None);
    }
}
