//! Pub/sub multiplexer.
//!
//! Many subscribers share the driver's single subscription connection. The
//! multiplexer keeps a `channel -> handlers` map: the first handler on a
//! channel triggers the driver subscribe, removing the last one triggers the
//! driver unsubscribe. Incoming raw messages are decoded once and delivered
//! to every handler in registration order; one failing handler never blocks
//! the others.

use crate::driver::{DriverRef, RawMessage, StoreDriver};
use crate::serializer::SerializerRef;
use futures::future::BoxFuture;
use igniter_core::IgniterResult;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

/// Token identifying one subscription; closures are not comparable, so
/// removal goes through the token handed out at subscribe time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A decoded delivery handed to channel handlers.
#[derive(Debug, Clone)]
pub struct ChannelMessage {
    /// Concrete channel the message was published to.
    pub channel: String,
    /// Decoded payload.
    pub payload: Value,
}

/// Handler invoked for each message on a subscribed channel.
pub type ChannelHandler =
    Arc<dyn Fn(ChannelMessage) -> BoxFuture<'static, IgniterResult<()>> + Send + Sync>;

/// Multiplexes channel subscribers onto the driver's subscription connection.
pub struct PubSubMultiplexer {
    driver: DriverRef,
    serializer: SerializerRef,
    channels: RwLock<HashMap<String, Vec<(u64, ChannelHandler)>>>,
    next_id: AtomicU64,
}

impl PubSubMultiplexer {
    /// Creates the multiplexer and starts its dispatch task.
    pub fn new(driver: DriverRef, serializer: SerializerRef) -> Arc<Self> {
        let mux = Arc::new(Self {
            driver: driver.clone(),
            serializer,
            channels: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        });

        let weak: Weak<Self> = Arc::downgrade(&mux);
        let mut messages = driver.messages();
        tokio::spawn(async move {
            loop {
                match messages.recv().await {
                    Ok(raw) => {
                        let Some(mux) = weak.upgrade() else { break };
                        mux.dispatch(raw).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Pub/sub dispatch lagged, messages were dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Pub/sub dispatch task stopped");
        });

        mux
    }

    /// Registers a handler; subscribes at the driver when it is the first
    /// one on the channel.
    pub async fn subscribe(
        &self,
        channel: &str,
        handler: ChannelHandler,
    ) -> IgniterResult<SubscriptionId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let first = {
            let mut channels = self.channels.write();
            let handlers = channels.entry(channel.to_string()).or_default();
            handlers.push((id, handler));
            handlers.len() == 1
        };

        if first {
            self.driver.subscribe(channel).await?;
            debug!(channel = %channel, "First subscriber, channel opened");
        }

        Ok(SubscriptionId(id))
    }

    /// Removes one handler (by token) or all handlers on a channel;
    /// unsubscribes at the driver when the last one goes away.
    pub async fn unsubscribe(
        &self,
        channel: &str,
        id: Option<SubscriptionId>,
    ) -> IgniterResult<()> {
        let emptied = {
            let mut channels = self.channels.write();
            let Some(handlers) = channels.get_mut(channel) else {
                return Ok(());
            };
            match id {
                Some(SubscriptionId(id)) => handlers.retain(|(h, _)| *h != id),
                None => handlers.clear(),
            }
            if handlers.is_empty() {
                channels.remove(channel);
                true
            } else {
                false
            }
        };

        if emptied {
            self.driver.unsubscribe(channel).await?;
            debug!(channel = %channel, "Last subscriber removed, channel closed");
        }

        Ok(())
    }

    /// Number of handlers currently registered on a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels.read().get(channel).map(Vec::len).unwrap_or(0)
    }

    async fn dispatch(&self, raw: RawMessage) {
        let payload = match self.serializer.decode(&raw.payload) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(channel = %raw.channel, error = %e, "Dropping undecodable message");
                return;
            }
        };

        // Snapshot under the lock so handlers removed mid-dispatch are
        // tolerated and slow handlers never hold the map.
        let handlers: Vec<ChannelHandler> = {
            let channels = self.channels.read();
            match channels.get(raw.routing_key()) {
                Some(handlers) => handlers.iter().map(|(_, h)| h.clone()).collect(),
                None => return,
            }
        };

        for handler in handlers {
            let message = ChannelMessage {
                channel: raw.channel.clone(),
                payload: payload.clone(),
            };
            if let Err(e) = handler(message).await {
                warn!(channel = %raw.channel, error = %e, "Subscriber handler failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_driver::MemoryDriver;
    use crate::serializer::default_serializer;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn counting_handler(counter: Arc<AtomicUsize>) -> ChannelHandler {
        Arc::new(move |_msg| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_fan_out_in_registration_order() {
        let driver: DriverRef = Arc::new(MemoryDriver::new());
        let mux = PubSubMultiplexer::new(driver.clone(), default_serializer());

        let order: Arc<parking_lot::Mutex<Vec<u8>>> = Arc::new(parking_lot::Mutex::new(vec![]));
        for tag in [1u8, 2, 3] {
            let order = order.clone();
            let handler: ChannelHandler = Arc::new(move |_msg| {
                let order = order.clone();
                Box::pin(async move {
                    order.lock().push(tag);
                    Ok(())
                })
            });
            mux.subscribe("ch", handler).await.unwrap();
        }

        driver.publish("ch", "{\"x\":1}").await.unwrap();
        settle().await;

        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_others() {
        let driver: DriverRef = Arc::new(MemoryDriver::new());
        let mux = PubSubMultiplexer::new(driver.clone(), default_serializer());

        let failing: ChannelHandler = Arc::new(|_msg| {
            Box::pin(async { Err(igniter_core::IgniterError::internal("boom")) })
        });
        mux.subscribe("ch", failing).await.unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        mux.subscribe("ch", counting_handler(counter.clone())).await.unwrap();

        driver.publish("ch", "{}").await.unwrap();
        settle().await;

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_by_token() {
        let driver: DriverRef = Arc::new(MemoryDriver::new());
        let mux = PubSubMultiplexer::new(driver.clone(), default_serializer());

        let counter = Arc::new(AtomicUsize::new(0));
        let id = mux.subscribe("ch", counting_handler(counter.clone())).await.unwrap();
        mux.subscribe("ch", counting_handler(counter.clone())).await.unwrap();
        assert_eq!(mux.subscriber_count("ch"), 2);

        mux.unsubscribe("ch", Some(id)).await.unwrap();
        assert_eq!(mux.subscriber_count("ch"), 1);

        driver.publish("ch", "{}").await.unwrap();
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_last_unsubscribe_closes_channel() {
        let driver = Arc::new(MemoryDriver::new());
        let mux = PubSubMultiplexer::new(driver.clone(), default_serializer());

        let counter = Arc::new(AtomicUsize::new(0));
        mux.subscribe("ch", counting_handler(counter.clone())).await.unwrap();
        mux.unsubscribe("ch", None).await.unwrap();
        assert_eq!(mux.subscriber_count("ch"), 0);

        driver.publish("ch", "{}").await.unwrap();
        settle().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_delivers_decoded_payload() {
        let driver: DriverRef = Arc::new(MemoryDriver::new());
        let mux = PubSubMultiplexer::new(driver.clone(), default_serializer());

        let seen: Arc<parking_lot::Mutex<Option<Value>>> = Arc::new(parking_lot::Mutex::new(None));
        let seen2 = seen.clone();
        let handler: ChannelHandler = Arc::new(move |msg| {
            let seen = seen2.clone();
            Box::pin(async move {
                *seen.lock() = Some(msg.payload);
                Ok(())
            })
        });
        mux.subscribe("ch", handler).await.unwrap();

        driver.publish("ch", "{\"userId\":\"456\"}").await.unwrap();
        settle().await;

        assert_eq!(*seen.lock(), Some(json!({"userId": "456"})));
    }
}
