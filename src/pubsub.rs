//! In-process publish/subscribe fan-out.
//!
//! Each channel and each pattern with at least one subscriber owns a
//! [`tokio::sync::broadcast`] sender. Publishing sends on the channel's sender
//! and on every matching pattern's sender and never waits on a slow consumer:
//! a subscriber that falls more than the configured capacity behind on one
//! channel (rounded up to a power of two) loses that channel's oldest
//! messages, counted in [`Subscription::dropped`]. Delivery is at-most-once and
//! messages published while nobody listens are lost.
//!
//! Subscriptions match either exact channel names or glob patterns
//! (`*`, `?`, `[a-z]`, `[^0-9]`, `\` escapes). A subscription that matches a
//! message both by name and by one or more patterns receives one copy per
//! match, each tagged with the matching pattern. Order is kept per channel
//! and per pattern, not across them.

use crate::config::{CacheConfig, MAX_PUBSUB_CAPACITY};
use crate::error::{Error, Result};
use crate::serialization::{decode_message, encode_message};
use dashmap::DashMap;
use futures::stream::{self, Stream};
use futures::{FutureExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamMap;

/// A delivered message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub channel: String,
    /// Pattern that matched, for pattern subscriptions.
    pub pattern: Option<String>,
    pub payload: Vec<u8>,
}

impl Message {
    /// Decode the JSON payload.
    ///
    /// # Errors
    /// Returns `Error::EncodingError` if the payload is not a `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        decode_message(&self.payload)
    }

    /// Payload as UTF-8 text, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// What a subscription listens on.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Topic {
    Channel(String),
    Pattern(String),
}

struct Hub {
    channels: DashMap<String, broadcast::Sender<Message>>,
    patterns: DashMap<String, broadcast::Sender<Message>>,
    next_id: AtomicU64,
    capacity: usize,
    closed: AtomicBool,
}

impl Hub {
    fn registry<'a>(
        &'a self,
        topic: &'a Topic,
    ) -> (&'a DashMap<String, broadcast::Sender<Message>>, &'a str) {
        match topic {
            Topic::Channel(name) => (&self.channels, name),
            Topic::Pattern(name) => (&self.patterns, name),
        }
    }

    /// New receiver on `topic`, creating its sender on first use. The entry
    /// guard is held while subscribing so [`release`](Self::release) cannot
    /// drop the sender in between.
    fn attach(&self, topic: &Topic) -> Result<broadcast::Receiver<Message>> {
        let (registry, name) = self.registry(topic);
        let receiver = registry
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        if self.closed.load(Ordering::Acquire) {
            registry.clear();
            return Err(Error::ValidationError("pub/sub hub is closed".to_string()));
        }
        Ok(receiver)
    }

    /// Forget the sender of `topic` once nobody listens on it. The receiver
    /// count is read under the entry guard.
    fn release(&self, topic: &Topic) {
        let (registry, name) = self.registry(topic);
        registry.remove_if(name, |_, sender| sender.receiver_count() == 0);
    }
}

/// Publish/subscribe hub. Cloning is cheap; clones share subscribers.
///
/// # Example
///
/// ```
/// use ride_cache::pubsub::PubSub;
///
/// # #[tokio::main]
/// # async fn main() -> ride_cache::Result<()> {
/// let hub = PubSub::with_capacity(16);
/// let mut sub = hub.subscribe(&["ride:r-1:status"])?;
///
/// let receivers = hub.publish("ride:r-1:status", &"driver_arrived")?;
/// assert_eq!(receivers, 1);
///
/// let message = sub.recv().await.expect("subscription open");
/// assert_eq!(message.decode::<String>()?, "driver_arrived");
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PubSub {
    hub: Arc<Hub>,
}

impl PubSub {
    pub fn new(config: &CacheConfig) -> Self {
        Self::with_capacity(config.pubsub_capacity)
    }

    /// Hub whose subscribers buffer up to `capacity` messages per channel.
    pub fn with_capacity(capacity: usize) -> Self {
        PubSub {
            hub: Arc::new(Hub {
                channels: DashMap::new(),
                patterns: DashMap::new(),
                next_id: AtomicU64::new(1),
                capacity: capacity.clamp(1, MAX_PUBSUB_CAPACITY),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Encode `message` as JSON and deliver it. Returns the number of
    /// deliveries made.
    ///
    /// # Errors
    /// Returns `Error::EncodingError` if the message cannot be encoded.
    pub fn publish<T: Serialize + ?Sized>(&self, channel: &str, message: &T) -> Result<usize> {
        let payload = encode_message(message)?;
        Ok(self.publish_raw(channel, payload))
    }

    /// Deliver pre-encoded bytes. Returns the number of deliveries made.
    pub fn publish_raw(&self, channel: &str, payload: Vec<u8>) -> usize {
        let mut delivered = 0;
        if let Some(sender) = self.hub.channels.get(channel) {
            let message = Message {
                channel: channel.to_string(),
                pattern: None,
                payload: payload.clone(),
            };
            delivered += sender.send(message).unwrap_or_default();
        }
        for entry in self.hub.patterns.iter() {
            if glob_match(entry.key(), channel) {
                let message = Message {
                    channel: channel.to_string(),
                    pattern: Some(entry.key().clone()),
                    payload: payload.clone(),
                };
                delivered += entry.value().send(message).unwrap_or_default();
            }
        }
        debug!("✓ PUBLISH {} -> {} receivers", channel, delivered);
        delivered
    }

    /// Subscribe to exact channel names.
    ///
    /// # Errors
    /// Returns `Error::ValidationError` if `channels` is empty or the hub is closed.
    pub fn subscribe(&self, channels: &[&str]) -> Result<Subscription> {
        if channels.is_empty() {
            return Err(Error::ValidationError(
                "subscribe requires at least one channel".to_string(),
            ));
        }
        let mut subscription = self.register();
        subscription.subscribe(channels)?;
        Ok(subscription)
    }

    /// Subscribe to glob patterns.
    ///
    /// # Errors
    /// Returns `Error::ValidationError` if `patterns` is empty or the hub is closed.
    pub fn psubscribe(&self, patterns: &[&str]) -> Result<Subscription> {
        if patterns.is_empty() {
            return Err(Error::ValidationError(
                "psubscribe requires at least one pattern".to_string(),
            ));
        }
        let mut subscription = self.register();
        subscription.psubscribe(patterns)?;
        Ok(subscription)
    }

    fn register(&self) -> Subscription {
        Subscription {
            id: self.hub.next_id.fetch_add(1, Ordering::Relaxed),
            hub: self.hub.clone(),
            streams: StreamMap::new(),
            dropped: 0,
            closed: false,
        }
    }

    /// Number of deliveries a publish on `channel` would make right now.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        let direct = self
            .hub
            .channels
            .get(channel)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0);
        let by_pattern: usize = self
            .hub
            .patterns
            .iter()
            .filter(|entry| glob_match(entry.key(), channel))
            .map(|entry| entry.value().receiver_count())
            .sum();
        direct + by_pattern
    }

    /// Close every subscription and refuse new ones. Messages already
    /// published stay readable.
    pub fn close_all(&self) {
        self.hub.closed.store(true, Ordering::Release);
        let topics = self.hub.channels.len() + self.hub.patterns.len();
        // dropping the senders ends every receiver once it has drained
        self.hub.channels.clear();
        self.hub.patterns.clear();
        info!("✓ PubSub closed {} channels and patterns", topics);
    }
}

/// A live subscription. Dropping it unsubscribes from everything.
pub struct Subscription {
    id: u64,
    hub: Arc<Hub>,
    streams: StreamMap<Topic, BroadcastStream<Message>>,
    dropped: u64,
    closed: bool,
}

impl Subscription {
    /// Add exact channels to this subscription.
    ///
    /// # Errors
    /// Returns `Error::ValidationError` if the subscription is closed.
    pub fn subscribe(&mut self, channels: &[&str]) -> Result<()> {
        let topics: Vec<Topic> = channels.iter().map(|c| Topic::Channel(c.to_string())).collect();
        self.listen(topics)
    }

    /// Add glob patterns to this subscription.
    ///
    /// # Errors
    /// Returns `Error::ValidationError` if the subscription is closed.
    pub fn psubscribe(&mut self, patterns: &[&str]) -> Result<()> {
        let topics: Vec<Topic> = patterns.iter().map(|p| Topic::Pattern(p.to_string())).collect();
        self.listen(topics)
    }

    fn listen(&mut self, topics: Vec<Topic>) -> Result<()> {
        self.ensure_open()?;
        for topic in topics {
            if self.streams.contains_key(&topic) {
                continue;
            }
            let receiver = self.hub.attach(&topic)?;
            debug!("✓ SUBSCRIBE #{} {:?}", self.id, topic);
            self.streams.insert(topic, BroadcastStream::new(receiver));
        }
        Ok(())
    }

    /// Stop receiving from `channels` (all channels if empty). The subscription
    /// closes once it has no channels and no patterns left.
    pub fn unsubscribe(&mut self, channels: &[&str]) {
        self.forget(|topic| match topic {
            Topic::Channel(name) => channels.is_empty() || channels.contains(&name.as_str()),
            Topic::Pattern(_) => false,
        });
    }

    /// Pattern counterpart of [`unsubscribe`](Self::unsubscribe).
    pub fn punsubscribe(&mut self, patterns: &[&str]) {
        self.forget(|topic| match topic {
            Topic::Pattern(name) => patterns.is_empty() || patterns.contains(&name.as_str()),
            Topic::Channel(_) => false,
        });
    }

    fn forget(&mut self, selected: impl Fn(&Topic) -> bool) {
        let topics: Vec<Topic> = self.streams.keys().filter(|t| selected(t)).cloned().collect();
        for topic in &topics {
            // the receiver must be gone before the hub checks for listeners
            drop(self.streams.remove(topic));
            self.hub.release(topic);
        }
        if self.streams.is_empty() {
            debug!("✓ UNSUBSCRIBE #{} (no channels left)", self.id);
            self.closed = true;
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ValidationError(format!(
                "subscription #{} is closed",
                self.id
            )));
        }
        Ok(())
    }

    fn lagged(&mut self, topic: &Topic, missed: u64) {
        self.dropped += missed;
        warn!(
            "⚠ Subscription #{} fell behind on {:?}, dropped {} messages",
            self.id, topic, missed
        );
    }

    /// Next message, waiting if none is buffered. `None` once the
    /// subscription is closed and drained.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match self.streams.next().await? {
                (_, Ok(message)) => return Some(message),
                (topic, Err(BroadcastStreamRecvError::Lagged(missed))) => {
                    self.lagged(&topic, missed)
                }
            }
        }
    }

    /// Next message if one is already buffered.
    pub fn try_recv(&mut self) -> Option<Message> {
        loop {
            match self.streams.next().now_or_never()?? {
                (_, Ok(message)) => return Some(message),
                (topic, Err(BroadcastStreamRecvError::Lagged(missed))) => {
                    self.lagged(&topic, missed)
                }
            }
        }
    }

    /// Consume the subscription as a stream that ends when it closes.
    pub fn into_stream(self) -> impl Stream<Item = Message> {
        stream::unfold(self, |mut subscription| async move {
            let message = subscription.recv().await?;
            Some((message, subscription))
        })
    }

    /// Messages lost because this subscriber fell too far behind.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Subscribed channels, sorted.
    pub fn channels(&self) -> Vec<String> {
        self.names(|topic| match topic {
            Topic::Channel(name) => Some(name),
            Topic::Pattern(_) => None,
        })
    }

    /// Subscribed patterns, sorted.
    pub fn patterns(&self) -> Vec<String> {
        self.names(|topic| match topic {
            Topic::Pattern(name) => Some(name),
            Topic::Channel(_) => None,
        })
    }

    fn names(&self, pick: impl Fn(&Topic) -> Option<&String>) -> Vec<String> {
        let mut names: Vec<String> = self.streams.keys().filter_map(pick).cloned().collect();
        names.sort();
        names
    }

    pub fn is_closed(&self) -> bool {
        self.closed || self.hub.closed.load(Ordering::Acquire)
    }

    /// Stop receiving. Messages not yet read are discarded.
    pub fn close(&mut self) {
        self.forget(|_| true);
        self.closed = true;
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.forget(|_| true);
    }
}

/// Redis-style glob match of `text` against `pattern`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    // position of the last `*` and the text index it is currently absorbing up to
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
            continue;
        }
        if let Some(next) = (pi < p.len()).then(|| match_one(&p, pi, t[ti])).flatten() {
            pi = next;
            ti += 1;
            continue;
        }
        match star {
            Some((sp, st)) => {
                pi = sp + 1;
                ti = st + 1;
                star = Some((sp, st + 1));
            }
            None => return false,
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

/// Match the single-character token at `p[pi]` against `c`, returning the
/// index of the next token on success.
fn match_one(p: &[char], pi: usize, c: char) -> Option<usize> {
    match p[pi] {
        '?' => Some(pi + 1),
        '\\' if pi + 1 < p.len() => (p[pi + 1] == c).then_some(pi + 2),
        '[' => match class_end(p, pi) {
            Some(end) => class_matches(&p[pi + 1..end], c).then_some(end + 1),
            None => (c == '[').then_some(pi + 1),
        },
        literal => (literal == c).then_some(pi + 1),
    }
}

/// Index of the `]` closing the class opened at `p[open]`.
fn class_end(p: &[char], open: usize) -> Option<usize> {
    let mut i = open + 1;
    if p.get(i) == Some(&'^') {
        i += 1;
    }
    while i < p.len() {
        match p[i] {
            '\\' => i += 2,
            ']' => return Some(i),
            _ => i += 1,
        }
    }
    None
}

fn class_matches(class: &[char], c: char) -> bool {
    let (negate, items) = match class.first() {
        Some('^') => (true, &class[1..]),
        _ => (false, class),
    };
    let mut matched = false;
    let mut i = 0;
    while i < items.len() {
        if items[i] == '\\' && i + 1 < items.len() {
            matched |= items[i + 1] == c;
            i += 2;
        } else if i + 2 < items.len() && items[i + 1] == '-' {
            let (lo, hi) = if items[i] <= items[i + 2] {
                (items[i], items[i + 2])
            } else {
                (items[i + 2], items[i])
            };
            matched |= (lo..=hi).contains(&c);
            i += 3;
        } else {
            matched |= items[i] == c;
            i += 1;
        }
    }
    matched != negate
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("ride:*", "ride:r-1:status"));
        assert!(glob_match("ride:?", "ride:1"));
        assert!(!glob_match("ride:?", "ride:12"));
        assert!(glob_match("*", ""));
        assert!(glob_match("d[0-9]", "d7"));
        assert!(!glob_match("d[^0-9]", "d7"));
        assert!(glob_match("a\\*b", "a*b"));
        assert!(!glob_match("a\\*b", "axb"));
        assert!(glob_match("*:status", "ride:r-1:status"));
        assert!(!glob_match("chat:*", "ride:r-1"));
        assert!(glob_match("[", "["));
    }

    #[tokio::test]
    async fn test_two_subscribers_receive_publish() {
        let hub = PubSub::with_capacity(8);
        let mut a = hub.subscribe(&["chat:c-1"]).unwrap();
        let mut b = hub.subscribe(&["chat:c-1"]).unwrap();

        assert_eq!(hub.publish("chat:c-1", &"hi").unwrap(), 2);
        assert_eq!(a.recv().await.unwrap().decode::<String>().unwrap(), "hi");
        assert_eq!(b.recv().await.unwrap().decode::<String>().unwrap(), "hi");
    }

    #[tokio::test]
    async fn test_unsubscribed_handle_receives_nothing() {
        let hub = PubSub::with_capacity(8);
        let mut sub = hub.subscribe(&["a", "b"]).unwrap();

        sub.unsubscribe(&["a"]);
        assert!(!sub.is_closed());
        assert_eq!(sub.channels(), vec!["b"]);
        assert_eq!(hub.publish("a", &1).unwrap(), 0);

        sub.unsubscribe(&["b"]);
        assert!(sub.is_closed());
        assert_eq!(hub.publish("b", &2).unwrap(), 0);
        assert_eq!(sub.recv().await, None);
        assert!(sub.subscribe(&["c"]).is_err());
    }

    #[tokio::test]
    async fn test_order_preserved_per_channel() {
        let hub = PubSub::with_capacity(16);
        let mut sub = hub.subscribe(&["ride:r-1"]).unwrap();
        for i in 0..10 {
            hub.publish("ride:r-1", &i).unwrap();
        }
        for i in 0..10 {
            assert_eq!(sub.try_recv().unwrap().decode::<i32>().unwrap(), i);
        }
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_slow_subscriber_loses_oldest() {
        let hub = PubSub::with_capacity(4);
        let mut sub = hub.subscribe(&["c"]).unwrap();
        for i in 0..6 {
            hub.publish("c", &i).unwrap();
        }

        let received: Vec<i32> = std::iter::from_fn(|| sub.try_recv())
            .map(|m| m.decode().unwrap())
            .collect();
        assert_eq!(received, vec![2, 3, 4, 5]);
        assert_eq!(sub.dropped(), 2);
    }

    #[tokio::test]
    async fn test_pattern_subscription_tags_pattern() {
        let hub = PubSub::with_capacity(8);
        let mut sub = hub.psubscribe(&["ride:*"]).unwrap();
        sub.subscribe(&["ride:r-9"]).unwrap();

        assert_eq!(hub.publish("ride:r-9", &"x").unwrap(), 2);
        let mut tags: Vec<Option<String>> = std::iter::from_fn(|| sub.try_recv())
            .map(|m| {
                assert_eq!(m.channel, "ride:r-9");
                m.pattern
            })
            .collect();
        tags.sort();
        assert_eq!(tags, vec![None, Some("ride:*".to_string())]);
        assert_eq!(hub.subscriber_count("ride:r-1"), 1);
        assert_eq!(sub.patterns(), vec!["ride:*"]);
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish() {
        let hub = PubSub::with_capacity(8);
        let mut sub = hub.subscribe(&["late"]).unwrap();

        let publisher = hub.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("late", &"ping").unwrap();
        });

        let message = tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .expect("woken by publish")
            .unwrap();
        assert_eq!(message.payload_str(), Some("\"ping\""));
    }

    #[tokio::test]
    async fn test_close_all_ends_streams() {
        let hub = PubSub::with_capacity(8);
        let sub = hub.subscribe(&["s"]).unwrap();
        hub.publish("s", &1).unwrap();

        let closer = hub.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.close_all();
        });

        let collected: Vec<Message> = sub.into_stream().collect().await;
        assert_eq!(collected.len(), 1);
        assert_eq!(hub.subscriber_count("s"), 0);
        assert!(hub.subscribe(&["s"]).is_err());
    }

    #[tokio::test]
    async fn test_drop_unregisters() {
        let hub = PubSub::with_capacity(8);
        {
            let _sub = hub.subscribe(&["x"]).unwrap();
            assert_eq!(hub.subscriber_count("x"), 1);
        }
        assert_eq!(hub.subscriber_count("x"), 0);
        assert!(hub.hub.channels.is_empty());
    }

    #[tokio::test]
    async fn test_leaving_channel_keeps_other_listeners() {
        let hub = PubSub::with_capacity(8);
        let mut leaving = hub.subscribe(&["ride:r-1"]).unwrap();
        let mut staying = hub.subscribe(&["ride:r-1"]).unwrap();

        leaving.unsubscribe(&[]);
        assert!(leaving.is_closed());
        assert_eq!(hub.publish("ride:r-1", &"still here").unwrap(), 1);
        assert_eq!(
            staying.recv().await.unwrap().decode::<String>().unwrap(),
            "still here"
        );

        // rejoining after the sender was released gets a fresh one
        staying.unsubscribe(&[]);
        let mut rejoined = hub.subscribe(&["ride:r-1"]).unwrap();
        assert_eq!(hub.publish("ride:r-1", &"again").unwrap(), 1);
        assert!(rejoined.try_recv().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_join_and_leave_never_strands_subscriber() {
        let hub = PubSub::with_capacity(8);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let hub = hub.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..200 {
                    let mut sub = hub.subscribe(&["zone:4"]).unwrap();
                    sub.unsubscribe(&["zone:4"]);
                }
            }));
        }
        let mut keeper = hub.subscribe(&["zone:4"]).unwrap();
        for handle in handles {
            handle.await.unwrap();
        }

        assert!(hub.publish("zone:4", &"ping").unwrap() >= 1);
        assert!(keeper.try_recv().is_some());
    }

    #[test]
    fn test_empty_subscribe_rejected() {
        let hub = PubSub::with_capacity(8);
        assert!(hub.subscribe(&[]).is_err());
        assert!(hub.psubscribe(&[]).is_err());
    }
}
