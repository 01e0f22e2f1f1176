//! Per-session forced-logout notifications.
//!
//! Each session id gets its own `tokio::sync::broadcast` channel, created
//! lazily on first subscribe. Publishing is fire-and-forget: if nobody is
//! listening the event is dropped, and a client that subscribes later is
//! expected to discover the revocation on its next request.
//!
//! `ForceLogout` is terminal for a channel, so publishing it also drops the
//! sender. Receivers drain the event and then observe `Closed`.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::broadcast;

/// Buffered events per channel. Only one terminal event is ever sent.
const CHANNEL_CAPACITY: usize = 16;

/// Event delivered to subscribers of a session channel.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyEvent {
    /// The session was revoked; the client must drop its credentials.
    ForceLogout { session_id: String },
}

impl NotifyEvent {
    pub fn force_logout(session_id: &str) -> Self {
        Self::ForceLogout {
            session_id: session_id.to_string(),
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, Self::ForceLogout { .. })
    }
}

#[derive(Debug, Default)]
pub struct Notifier {
    channels: Mutex<HashMap<String, broadcast::Sender<NotifyEvent>>>,
    published: AtomicUsize,
}

impl Notifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events for one session id.
    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<NotifyEvent> {
        let mut channels = self.channels.lock();
        let tx = channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        tracing::debug!(session_id, "Session channel subscribed");
        tx.subscribe()
    }

    /// Publish an event. Returns the number of receivers it reached.
    pub fn publish(&self, session_id: &str, event: NotifyEvent) -> usize {
        self.published.fetch_add(1, Ordering::SeqCst);

        let tx = {
            let mut channels = self.channels.lock();
            if event.is_terminal() {
                channels.remove(session_id)
            } else {
                channels.get(session_id).cloned()
            }
        };

        let reached = tx.map_or(0, |tx| tx.send(event).unwrap_or(0));
        tracing::debug!(session_id, reached, "Session event published");
        reached
    }

    /// Drop channels whose subscribers have all gone away.
    pub fn prune(&self) -> usize {
        let mut channels = self.channels.lock();
        let before = channels.len();
        channels.retain(|_, tx| tx.receiver_count() > 0);
        before - channels.len()
    }

    /// Total number of `publish` calls since creation.
    pub fn published_count(&self) -> usize {
        self.published.load(Ordering::SeqCst)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn subscriber_receives_force_logout_then_closed() {
        let notifier = Notifier::new();
        let mut rx = notifier.subscribe("s1");

        let reached = notifier.publish("s1", NotifyEvent::force_logout("s1"));
        assert_eq!(reached, 1);
        assert_eq!(rx.try_recv().unwrap(), NotifyEvent::force_logout("s1"));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Closed)));
        assert_eq!(notifier.channel_count(), 0);
    }

    #[test]
    fn publish_without_subscribers_is_dropped() {
        let notifier = Notifier::new();
        assert_eq!(notifier.publish("nobody", NotifyEvent::force_logout("nobody")), 0);
        assert_eq!(notifier.published_count(), 1);
    }

    #[test]
    fn channels_are_isolated_per_session() {
        let notifier = Notifier::new();
        let mut a = notifier.subscribe("a");
        let mut b = notifier.subscribe("b");

        notifier.publish("a", NotifyEvent::force_logout("a"));
        assert!(a.try_recv().is_ok());
        assert!(matches!(b.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn prune_drops_abandoned_channels() {
        let notifier = Notifier::new();
        let rx = notifier.subscribe("gone");
        let _keep = notifier.subscribe("kept");
        drop(rx);

        assert_eq!(notifier.prune(), 1);
        assert_eq!(notifier.channel_count(), 1);
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let json = serde_json::to_value(NotifyEvent::force_logout("s9")).unwrap();
        assert_eq!(json["type"], "force_logout");
        assert_eq!(json["session_id"], "s9");
    }
}
