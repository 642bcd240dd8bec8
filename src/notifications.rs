//! In-process notification bus plus its Postgres LISTEN backing.
//!
//! The bus is a process-wide table of broadcast channels keyed by
//! notification channel name, each entry carrying a reference count.
//! Subscribing registers the entry (creating it on first use), dropping the
//! subscription decrements, and the entry disappears when the last
//! subscriber leaves, so an idle gateway holds no channels.
//!
//! A single daemon task owns one database connection in LISTEN mode on the
//! store's fixed channel set and republishes every received payload into
//! the bus. The daemon reconnects on any failure with decorrelated
//! exponential backoff.

use dashmap::DashMap;
use rand::Rng;
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::store::{CHANNEL_INCOMING, CHANNEL_OUTGOING};

const CHANNEL_CAPACITY: usize = 64;
const BACKOFF_BASE: Duration = Duration::from_millis(250);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

struct ChannelEntry {
    sender: broadcast::Sender<String>,
    refcount: usize,
}

/// Process-wide pub/sub table. Cheap to clone; all clones share state.
#[derive(Clone, Default)]
pub struct NotificationBus {
    channels: Arc<DashMap<String, ChannelEntry>>,
}

/// A live registration on one channel. Dropping it releases the refcount
/// and removes the channel once nobody listens anymore.
pub struct Subscription {
    bus: NotificationBus,
    key: String,
    pub receiver: broadcast::Receiver<String>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers on `key`. The registration is active from the moment this
    /// returns, so callers can subscribe *before* their initial database
    /// read and never lose a wake-up.
    pub fn subscribe(&self, key: &str) -> Subscription {
        let receiver = {
            let mut entry = self
                .channels
                .entry(key.to_string())
                .or_insert_with(|| ChannelEntry {
                    sender: broadcast::channel(CHANNEL_CAPACITY).0,
                    refcount: 0,
                });
            entry.refcount += 1;
            entry.sender.subscribe()
        };
        Subscription {
            bus: self.clone(),
            key: key.to_string(),
            receiver,
        }
    }

    /// Runs `body` with a fresh receiver; the registration is released on
    /// scope exit regardless of how the body finishes.
    pub async fn listen<T, F, Fut>(&self, key: &str, body: F) -> T
    where
        F: FnOnce(broadcast::Receiver<String>) -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let subscription = self.subscribe(key);
        let receiver = subscription.receiver.resubscribe();
        let result = body(receiver).await;
        drop(subscription);
        result
    }

    /// Delivers `payload` to current subscribers of `key`. A key without
    /// subscribers is not an error; the notification is simply dropped.
    pub fn publish(&self, key: &str, payload: String) {
        if let Some(entry) = self.channels.get(key) {
            // Send fails only when no receiver is alive, which the
            // refcount makes transient by construction.
            let _ = entry.sender.send(payload);
        }
    }

    fn release(&self, key: &str) {
        self.channels.remove_if_mut(key, |_, entry| {
            entry.refcount = entry.refcount.saturating_sub(1);
            entry.refcount == 0
        });
    }

    #[cfg(test)]
    fn contains(&self, key: &str) -> bool {
        self.channels.contains_key(key)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.release(&self.key);
    }
}

/// Runs the LISTEN daemon until cancelled. Every connection failure is
/// logged and followed by a decorrelated backoff before reconnecting.
pub async fn run_listener(bus: NotificationBus, pool: PgPool, cancel: CancellationToken) {
    let mut previous_delay = BACKOFF_BASE;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        match listen_once(&bus, &pool, &cancel).await {
            Ok(()) => return,
            Err(err) => {
                tracing::warn!(%err, "notification listener lost its connection");
            }
        }
        let delay = decorrelated_backoff(previous_delay);
        previous_delay = delay;
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn listen_once(
    bus: &NotificationBus,
    pool: &PgPool,
    cancel: &CancellationToken,
) -> Result<(), sqlx::Error> {
    let mut listener = PgListener::connect_with(pool).await?;
    listener
        .listen_all([CHANNEL_INCOMING, CHANNEL_OUTGOING])
        .await?;
    tracing::info!("notification listener connected");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            notification = listener.recv() => {
                let notification = notification?;
                bus.publish(notification.channel(), notification.payload().to_string());
            }
        }
    }
}

/// `delay = rand(base, min(cap, 3 × previous))`.
fn decorrelated_backoff(previous: Duration) -> Duration {
    let base = BACKOFF_BASE.as_millis() as u64;
    let upper = (previous.as_millis() as u64 * 3)
        .min(BACKOFF_CAP.as_millis() as u64)
        .max(base + 1);
    Duration::from_millis(rand::thread_rng().gen_range(base..upper))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscriber_in_order() {
        let bus = NotificationBus::new();
        let mut subscription = bus.subscribe("nexus_incoming_tx");
        bus.publish("nexus_incoming_tx", "1".to_string());
        bus.publish("nexus_incoming_tx", "2".to_string());
        assert_eq!(subscription.receiver.recv().await.unwrap(), "1");
        assert_eq!(subscription.receiver.recv().await.unwrap(), "2");
    }

    #[tokio::test]
    async fn balanced_scopes_leave_no_entry() {
        let bus = NotificationBus::new();
        for _ in 0..3 {
            bus.listen("acct", |_receiver| async {}).await;
        }
        assert!(!bus.contains("acct"));

        let first = bus.subscribe("acct");
        let second = bus.subscribe("acct");
        assert!(bus.contains("acct"));
        drop(first);
        assert!(bus.contains("acct"));
        drop(second);
        assert!(!bus.contains("acct"));
    }

    #[tokio::test]
    async fn cross_key_isolation() {
        let bus = NotificationBus::new();
        let mut incoming = bus.subscribe("incoming");
        let _outgoing = bus.subscribe("outgoing");
        bus.publish("outgoing", "x".to_string());
        bus.publish("incoming", "y".to_string());
        assert_eq!(incoming.receiver.recv().await.unwrap(), "y");
    }

    #[tokio::test]
    async fn subscription_registered_before_read_sees_publish() {
        let bus = NotificationBus::new();
        let result = bus
            .listen("acct", |mut receiver| {
                let bus = bus.clone();
                async move {
                    // Publish happens after registration but before the
                    // receive: nothing is lost.
                    bus.publish("acct", "wake".to_string());
                    receiver.recv().await.unwrap()
                }
            })
            .await;
        assert_eq!(result, "wake");
    }

    #[test]
    fn backoff_stays_within_envelope() {
        let mut previous = BACKOFF_BASE;
        for _ in 0..50 {
            let next = decorrelated_backoff(previous);
            assert!(next >= BACKOFF_BASE);
            assert!(next <= BACKOFF_CAP);
            previous = next;
        }
    }
}
