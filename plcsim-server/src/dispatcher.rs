//! Data-change subscription dispatch.
//!
//! A dispatcher is one subscription session against the address space. Each
//! (node, attribute) pair can be subscribed at most once per session and gets
//! its own delivery task, so notifications for one pair reach the handler in
//! the order the values changed. Different pairs are not ordered against each
//! other.
//!
//! If the address space closes a subscription's channel on its own, the
//! delivery task logs it and drops the pair from the session.

use crate::error::ServerError;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use plcsim_space::{AddressSpace, DataChange, NodeId, SubscriptionHandle};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Receives data-change notifications.
pub trait DataChangeHandler: Send + Sync + 'static {
    fn handle(&self, change: &DataChange);
}

impl<F> DataChangeHandler for F
where
    F: Fn(&DataChange) + Send + Sync + 'static,
{
    fn handle(&self, change: &DataChange) {
        self(change)
    }
}

type SubscriptionKey = (NodeId, String);

struct ActiveSubscription {
    handle: SubscriptionHandle,
    task: JoinHandle<()>,
}

/// A subscription session.
pub struct SubscriptionDispatcher {
    session_id: String,
    space: Arc<dyn AddressSpace>,
    subscriptions: Arc<DashMap<SubscriptionKey, ActiveSubscription>>,
}

impl SubscriptionDispatcher {
    pub fn new(space: Arc<dyn AddressSpace>) -> Self {
        let session_id = format!("session-{}", uuid::Uuid::new_v4());
        tracing::debug!("Opened subscription session {}", session_id);
        Self {
            session_id,
            space,
            subscriptions: Arc::new(DashMap::new()),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Subscribes `handler` to changes of `attribute` on `node`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe(
        &self,
        node: &NodeId,
        attribute: &str,
        handler: Arc<dyn DataChangeHandler>,
    ) -> Result<SubscriptionHandle, ServerError> {
        let key = (*node, attribute.to_string());
        match self.subscriptions.entry(key.clone()) {
            Entry::Occupied(_) => Err(ServerError::AlreadySubscribed {
                node: *node,
                attribute: attribute.to_string(),
            }),
            Entry::Vacant(slot) => {
                let (handle, receiver) = self.space.subscribe_data_change(node, attribute)?;
                let task = self.spawn_delivery(key, handle, receiver, handler);
                slot.insert(ActiveSubscription { handle, task });

                tracing::debug!(
                    "[{}] Subscribed {} to {} on {}",
                    self.session_id,
                    handle,
                    attribute,
                    node
                );
                Ok(handle)
            }
        }
    }

    /// Releases the subscription of one pair.
    pub fn unsubscribe(&self, node: &NodeId, attribute: &str) -> Result<(), ServerError> {
        let (_, active) = self
            .subscriptions
            .remove(&(*node, attribute.to_string()))
            .ok_or_else(|| ServerError::SubscriptionNotFound {
                node: *node,
                attribute: attribute.to_string(),
            })?;
        self.release(active);
        Ok(())
    }

    pub fn is_subscribed(&self, node: &NodeId, attribute: &str) -> bool {
        self.subscriptions
            .contains_key(&(*node, attribute.to_string()))
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Releases every subscription of the session. Returns how many were released.
    pub fn disconnect(&self) -> usize {
        let keys: Vec<_> = self.subscriptions.iter().map(|e| e.key().clone()).collect();
        let mut released = 0;
        for key in keys {
            if let Some((_, active)) = self.subscriptions.remove(&key) {
                self.release(active);
                released += 1;
            }
        }
        if released > 0 {
            tracing::debug!(
                "[{}] Released {} subscriptions",
                self.session_id,
                released
            );
        }
        released
    }

    fn release(&self, active: ActiveSubscription) {
        active.task.abort();
        self.space.unsubscribe(active.handle);
    }

    fn spawn_delivery(
        &self,
        key: SubscriptionKey,
        handle: SubscriptionHandle,
        mut receiver: broadcast::Receiver<DataChange>,
        handler: Arc<dyn DataChangeHandler>,
    ) -> JoinHandle<()> {
        let subscriptions = Arc::clone(&self.subscriptions);
        let session_id = self.session_id.clone();

        tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(change) => handler.handle(&change),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Subscription {} lagged {} notifications", handle, n);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        // Released by this session unless the entry is still ours.
                        let dropped = subscriptions
                            .remove_if(&key, |_, active| active.handle == handle)
                            .is_some();
                        if dropped {
                            tracing::warn!(
                                "[{}] Subscription {} to {} on {} closed by the address space",
                                session_id,
                                handle,
                                key.1,
                                key.0
                            );
                        }
                        break;
                    }
                }
            }
        })
    }
}

impl Drop for SubscriptionDispatcher {
    fn drop(&mut self) {
        self.disconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use plcsim_space::{MemorySpace, Variant};

    fn space_with_node() -> (Arc<MemorySpace>, NodeId) {
        let space = Arc::new(MemorySpace::default());
        let id = space
            .add_object(&NodeId::OBJECTS_FOLDER, NodeId::new(1, 1), "valve01", None)
            .unwrap();
        space.add_attribute(&id, "ValveStatus", Variant::Int(0)).unwrap();
        space.add_attribute(&id, "Other", Variant::Int(0)).unwrap();
        (space, id)
    }

    fn recorder() -> (Arc<Mutex<Vec<Variant>>>, Arc<dyn DataChangeHandler>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler: Arc<dyn DataChangeHandler> =
            Arc::new(move |change: &DataChange| sink.lock().push(change.value.clone()));
        (seen, handler)
    }

    #[tokio::test]
    async fn test_double_subscribe_rejected() {
        let (space, id) = space_with_node();
        let dispatcher = SubscriptionDispatcher::new(space.clone());
        let (_, handler) = recorder();

        dispatcher.subscribe(&id, "ValveStatus", handler.clone()).unwrap();
        let err = dispatcher
            .subscribe(&id, "ValveStatus", handler.clone())
            .unwrap_err();
        assert!(matches!(err, ServerError::AlreadySubscribed { .. }));
        assert_eq!(err.error_code(), "ALREADY_SUBSCRIBED");

        // A different attribute on the same node is a different pair.
        dispatcher.subscribe(&id, "Other", handler).unwrap();
        assert_eq!(dispatcher.subscription_count(), 2);
        assert_eq!(space.subscription_count(), 2);
    }

    #[tokio::test]
    async fn test_delivery_order_per_pair() {
        let (space, id) = space_with_node();
        let dispatcher = SubscriptionDispatcher::new(space.clone());
        let (seen, handler) = recorder();
        dispatcher.subscribe(&id, "ValveStatus", handler).unwrap();

        for v in [3, 1, 2, 0] {
            space.set_attribute(&id, "ValveStatus", Variant::Int(v)).unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert_eq!(
            *seen.lock(),
            vec![Variant::Int(3), Variant::Int(1), Variant::Int(2), Variant::Int(0)]
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_and_disconnect() {
        let (space, id) = space_with_node();
        let dispatcher = SubscriptionDispatcher::new(space.clone());
        let (seen, handler) = recorder();

        dispatcher.subscribe(&id, "ValveStatus", handler.clone()).unwrap();
        dispatcher.subscribe(&id, "Other", handler).unwrap();

        dispatcher.unsubscribe(&id, "Other").unwrap();
        assert!(!dispatcher.is_subscribed(&id, "Other"));
        assert!(matches!(
            dispatcher.unsubscribe(&id, "Other"),
            Err(ServerError::SubscriptionNotFound { .. })
        ));

        assert_eq!(dispatcher.disconnect(), 1);
        assert_eq!(space.subscription_count(), 0);

        space.set_attribute(&id, "ValveStatus", Variant::Int(1)).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_drop_releases_subscriptions() {
        let (space, id) = space_with_node();
        {
            let dispatcher = SubscriptionDispatcher::new(space.clone());
            let (_, handler) = recorder();
            dispatcher.subscribe(&id, "ValveStatus", handler).unwrap();
            assert_eq!(space.subscription_count(), 1);
        }
        assert_eq!(space.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_closed_channel_drops_subscription() {
        let (space, id) = space_with_node();
        let dispatcher = SubscriptionDispatcher::new(space.clone());
        let (seen, handler) = recorder();

        let handle = dispatcher
            .subscribe(&id, "ValveStatus", handler.clone())
            .unwrap();
        assert!(space.unsubscribe(handle));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        assert!(!dispatcher.is_subscribed(&id, "ValveStatus"));
        assert_eq!(dispatcher.subscription_count(), 0);

        // The pair can be subscribed again and delivers.
        dispatcher.subscribe(&id, "ValveStatus", handler).unwrap();
        space.set_attribute(&id, "ValveStatus", Variant::Int(1)).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(*seen.lock(), vec![Variant::Int(1)]);
    }

    #[tokio::test]
    async fn test_subscribe_unknown_attribute() {
        let (space, id) = space_with_node();
        let dispatcher = SubscriptionDispatcher::new(space);
        let (_, handler) = recorder();

        let err = dispatcher.subscribe(&id, "Missing", handler).unwrap_err();
        assert!(matches!(err, ServerError::Space(_)));
        assert_eq!(dispatcher.subscription_count(), 0);
    }
}
