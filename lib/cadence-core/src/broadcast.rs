//! Local publish/subscribe.
//!
//! Each channel is a chain of promises, one per message: publishing settles the current tail of the chain with the
//! message and a fresh tail, so every subscriber walks the same chain at its own pace and sees every message published
//! after it subscribed, in publish order. Messages nobody can reach anymore are freed as subscribers move past them.
use std::{cell::RefCell, fmt, rc::Rc};

use foldhash::quality::RandomState;
use tracing::{debug, trace};

use crate::{error::TaskError, promise::Promise};

type FastHashMap<K, V> = hashbrown::HashMap<K, V, RandomState>;

#[derive(Clone)]
struct Link<T> {
    message: T,
    next: Promise<Link<T>>,
}

/// A set of named broadcast channels, local to one scheduler thread.
///
/// Cloning a broker yields another handle to the same channels.
pub struct Broker<T> {
    channels: Rc<RefCell<FastHashMap<String, Promise<Link<T>>>>>,
}

impl<T> Broker<T>
where
    T: Clone + 'static,
{
    /// Creates a broker with no channels.
    pub fn new() -> Self {
        Self {
            channels: Rc::new(RefCell::new(FastHashMap::default())),
        }
    }

    fn tail(&self, channel: &str) -> Promise<Link<T>> {
        let mut channels = self.channels.borrow_mut();
        match channels.get(channel) {
            Some(tail) => tail.clone(),
            None => {
                let tail = Promise::new();
                channels.insert(channel.to_string(), tail.clone());
                tail
            }
        }
    }

    /// Subscribes to a channel, creating it if it does not exist.
    ///
    /// The subscription receives every message published to the channel from now on.
    pub fn subscribe(&self, channel: &str) -> Subscription<T> {
        trace!(channel, "New subscription.");
        Subscription {
            channel: channel.to_string(),
            next: self.tail(channel),
        }
    }

    /// Publishes a message to every current subscriber of a channel.
    ///
    /// Publishing to a channel without subscribers drops the message.
    pub fn publish(&self, channel: &str, message: T) {
        let next = Promise::new();
        let tail = {
            let mut channels = self.channels.borrow_mut();
            match channels.get_mut(channel) {
                Some(tail) => std::mem::replace(tail, next.clone()),
                None => {
                    trace!(channel, "No subscribers. Dropping message.");
                    return;
                }
            }
        };

        // The tail is only ever settled here or when closing, and both replace it first.
        let _ = tail.resolve(Link { message, next });
        trace!(channel, "Published message.");
    }

    /// Closes a channel.
    ///
    /// Subscribers still receive the messages published before the close, after which they get
    /// [`TaskError::ChannelClosed`]. Subscribing to the channel again starts a new, open channel.
    pub fn close(&self, channel: &str) {
        let tail = self.channels.borrow_mut().remove(channel);
        if let Some(tail) = tail {
            debug!(channel, "Closing channel.");
            let _ = tail.reject(TaskError::ChannelClosed {
                channel: channel.to_string(),
            });
        }
    }

    /// Returns the number of open channels.
    pub fn channel_count(&self) -> usize {
        self.channels.borrow().len()
    }
}

impl<T> Clone for Broker<T> {
    fn clone(&self) -> Self {
        Self {
            channels: Rc::clone(&self.channels),
        }
    }
}

impl<T> Default for Broker<T>
where
    T: Clone + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Broker<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let channels = self.channels.borrow();
        f.debug_struct("Broker")
            .field("channels", &channels.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// A subscription to a broadcast channel.
pub struct Subscription<T> {
    channel: String,
    next: Promise<Link<T>>,
}

impl<T> Subscription<T>
where
    T: Clone + 'static,
{
    /// Returns the name of the channel.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Waits for the next message.
    ///
    /// # Errors
    ///
    /// Once the channel is closed and every message published before that has been received, returns
    /// [`TaskError::ChannelClosed`]. Like any suspension, fails with the injected error if the waiting task is
    /// cancelled.
    pub async fn next(&mut self) -> Result<T, TaskError> {
        let link = self.next.wait().await?;
        self.next = link.next;
        Ok(link.message)
    }

    /// Returns the next message if it has already been published, without waiting.
    pub fn try_next(&mut self) -> Option<Result<T, TaskError>> {
        let link = match self.next.try_result()? {
            Ok(link) => link,
            Err(e) => return Some(Err(e)),
        };
        self.next = link.next;
        Some(Ok(link.message))
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("channel", &self.channel).finish()
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::{scheduler::Scheduler, task::yield_now};

    #[test]
    fn subscribers_receive_messages_in_publish_order() {
        let scheduler = Scheduler::default();
        let broker = Broker::new();

        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let mut subscription = broker.subscribe("events");
                scheduler.spawn(async move {
                    let mut received = Vec::new();
                    for _ in 0..3 {
                        received.push(subscription.next().await?);
                    }
                    Ok(received)
                })
            })
            .collect();

        let producer_broker = broker.clone();
        scheduler.spawn(async move {
            for i in 1..=3u32 {
                producer_broker.publish("events", i);
                yield_now().await?;
            }
            Ok(())
        });

        let report = scheduler.run();
        assert_eq!(report.failed, 0);
        for consumer in consumers {
            assert_eq!(consumer.future().try_result().unwrap().unwrap(), vec![1, 2, 3]);
        }
    }

    #[test]
    fn late_subscribers_only_see_later_messages() {
        let broker = Broker::new();
        let mut early = broker.subscribe("jobs");
        broker.publish("jobs", "first");
        let mut late = broker.subscribe("jobs");
        broker.publish("jobs", "second");

        assert_eq!(early.try_next().unwrap().unwrap(), "first");
        assert_eq!(early.try_next().unwrap().unwrap(), "second");
        assert!(early.try_next().is_none());
        assert_eq!(late.try_next().unwrap().unwrap(), "second");
    }

    #[test]
    fn publishing_without_subscribers_does_not_open_channels() {
        let broker = Broker::new();
        for channel in ["a", "b", "c"] {
            broker.publish(channel, 1u8);
        }
        assert_eq!(broker.channel_count(), 0);

        let mut subscription = broker.subscribe("a");
        broker.publish("a", 2);
        assert_eq!(broker.channel_count(), 1);
        assert_eq!(subscription.try_next().unwrap().unwrap(), 2);
        assert!(subscription.try_next().is_none());
    }

    #[test]
    fn close_ends_subscriptions_after_buffered_messages() {
        let broker = Broker::new();
        let mut subscription = broker.subscribe("jobs");
        broker.publish("jobs", 1);
        broker.close("jobs");
        assert_eq!(broker.channel_count(), 0);

        assert_eq!(subscription.try_next().unwrap().unwrap(), 1);
        let err = subscription.try_next().unwrap().unwrap_err();
        assert!(matches!(err, TaskError::ChannelClosed { ref channel } if channel == "jobs"));
        // Closed stays closed.
        assert!(subscription.try_next().unwrap().is_err());
    }

    #[test]
    fn waiting_subscriber_is_woken_by_close() {
        let scheduler = Scheduler::default();
        let broker = Broker::<u8>::new();
        let mut subscription = broker.subscribe("jobs");

        let consumer = scheduler.spawn(async move { subscription.next().await });
        scheduler.run_until_stalled();
        assert!(!consumer.is_finished());

        broker.close("jobs");
        let err = scheduler.run_until(&consumer).unwrap_err();
        assert_eq!(err.to_string(), "Channel 'jobs' was closed.");
    }
}
