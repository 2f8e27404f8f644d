//! Keyed storage of closable entities with liveness-driven removal.

use std::hash::Hash;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::task::JoinHandle;

use crate::closable::Closable;

struct Slot<T> {
    entity: Arc<T>,
    /// One-shot observer on the entity's terminal signal; aborted (detached)
    /// when the slot is displaced, deleted, or cleared.
    listener: JoinHandle<()>,
}

/// A map whose entries remove themselves when the entity they hold
/// terminates.
///
/// An entry exists exactly as long as its entity has not signaled
/// termination (removal happens upon observing the signal, so it is
/// eventually consistent with the entity's internal state). Overwriting a
/// key detaches the displaced entity's observer, and every removal is
/// guarded by entity identity, so a stale observer can never delete a newer
/// insertion.
pub struct LivenessCollection<K, T>
where
    K: Eq + Hash,
{
    inner: Arc<DashMap<K, Slot<T>>>,
}

impl<K, T> LivenessCollection<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Closable + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }

    /// Bind `key` to `entity`, displacing and detaching any previous binding.
    pub fn set(&self, key: K, entity: Arc<T>) {
        let listener = spawn_listener(Arc::downgrade(&self.inner), key.clone(), entity.clone());
        if let Some(displaced) = self
            .inner
            .insert(key.clone(), Slot { entity: entity.clone(), listener })
        {
            displaced.listener.abort();
        }
        // The observer may have run against an already-terminated entity
        // before the insert landed, in which case its removal found nothing.
        // The terminal signal is latched, so that lost removal is visible
        // here and gets performed by the inserting thread instead.
        if entity.is_closed() {
            self.inner
                .remove_if(&key, |_, slot| Arc::ptr_eq(&slot.entity, &entity));
        }
    }

    /// The entity currently bound to `key`, if any.
    pub fn get(&self, key: &K) -> Option<Arc<T>> {
        self.inner.get(key).map(|slot| slot.entity.clone())
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Unbind `key`, detaching its observer. Reports whether a binding
    /// existed.
    pub fn delete(&self, key: &K) -> bool {
        match self.inner.remove(key) {
            Some((_, slot)) => {
                slot.listener.abort();
                true
            }
            None => false,
        }
    }

    /// Detach every observer, then drop all bindings, so no late terminal
    /// signal fires against the cleared collection.
    pub fn clear(&self) {
        self.inner.retain(|_, slot| {
            slot.listener.abort();
            false
        });
    }
}

/// Observer task: waits for the entity's terminal signal, then removes the
/// key only while it still holds this exact entity (`Arc::ptr_eq`), which
/// makes removal by a stale observer structurally impossible even if the
/// abort raced its wakeup.
fn spawn_listener<K, T>(map: Weak<DashMap<K, Slot<T>>>, key: K, entity: Arc<T>) -> JoinHandle<()>
where
    K: Eq + Hash + Send + Sync + 'static,
    T: Closable + Send + Sync + 'static,
{
    tokio::spawn(async move {
        entity.closed().await;
        if let Some(map) = map.upgrade() {
            map.remove_if(&key, |_, slot| Arc::ptr_eq(&slot.entity, &entity));
        }
    })
}

impl<K, T> Default for LivenessCollection<K, T>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    T: Closable + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> Drop for LivenessCollection<K, T>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        for slot in self.inner.iter() {
            slot.listener.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::closable::CloseSignal;
    use async_trait::async_trait;
    use std::time::Duration;

    struct FakeEntity {
        close: CloseSignal,
    }

    impl FakeEntity {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                close: CloseSignal::new(),
            })
        }
    }

    #[async_trait]
    impl Closable for FakeEntity {
        fn is_closed(&self) -> bool {
            self.close.is_fired()
        }

        async fn closed(&self) {
            self.close.fired().await;
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_removed_when_entity_terminates() {
        let collection: LivenessCollection<String, FakeEntity> = LivenessCollection::new();
        let entity = FakeEntity::new();
        collection.set("k".to_string(), entity.clone());
        assert!(collection.contains_key(&"k".to_string()));

        entity.close.fire();
        settle().await;
        assert!(!collection.contains_key(&"k".to_string()));
        assert!(collection.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overwrite_detaches_previous_listener() {
        let collection: LivenessCollection<String, FakeEntity> = LivenessCollection::new();
        let first = FakeEntity::new();
        let second = FakeEntity::new();
        collection.set("k".to_string(), first.clone());
        collection.set("k".to_string(), second.clone());

        first.close.fire();
        settle().await;
        assert!(collection.contains_key(&"k".to_string()));

        second.close.fire();
        settle().await;
        assert!(!collection.contains_key(&"k".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_reports_and_detaches() {
        let collection: LivenessCollection<String, FakeEntity> = LivenessCollection::new();
        let entity = FakeEntity::new();
        collection.set("k".to_string(), entity.clone());
        assert!(collection.delete(&"k".to_string()));
        assert!(!collection.delete(&"k".to_string()));

        // A terminal signal after deletion has nothing left to remove.
        entity.close.fire();
        settle().await;
        assert!(collection.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_detaches_every_listener() {
        let collection: LivenessCollection<String, FakeEntity> = LivenessCollection::new();
        let first = FakeEntity::new();
        let second = FakeEntity::new();
        collection.set("a".to_string(), first.clone());
        collection.set("b".to_string(), second.clone());
        collection.clear();
        assert!(collection.is_empty());

        first.close.fire();
        second.close.fire();
        settle().await;
        assert!(collection.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_returns_current_binding() {
        let collection: LivenessCollection<String, FakeEntity> = LivenessCollection::new();
        let first = FakeEntity::new();
        let second = FakeEntity::new();
        collection.set("k".to_string(), first.clone());
        collection.set("k".to_string(), second.clone());
        let stored = collection.get(&"k".to_string()).unwrap();
        assert!(Arc::ptr_eq(&stored, &second));
        assert_eq!(collection.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_channel_is_removed_from_collection() {
        use crate::channel::{Channel, ChannelOptions};
        use crate::connection::{Connection, ConnectionOptions};
        use axum::http::HeaderMap;

        let channels: LivenessCollection<String, Channel> = LivenessCollection::new();
        let channel = Channel::new(ChannelOptions {
            empty_timeout: Duration::from_millis(50),
            ..Default::default()
        });
        channels.set("topic".to_string(), channel.clone());

        let (connection, _body) =
            Connection::new(&HeaderMap::new(), ConnectionOptions::default()).unwrap();
        channel.add(&connection);
        channel.remove(&connection);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!channels.contains_key(&"topic".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_terminated_entity_is_removed_promptly() {
        let collection: LivenessCollection<String, FakeEntity> = LivenessCollection::new();
        let entity = FakeEntity::new();
        entity.close.fire();
        collection.set("k".to_string(), entity);
        settle().await;
        assert!(collection.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_terminated_entity_never_survives_insert() {
        // The observer task races the insert on a multi-threaded runtime; a
        // removal that loses that race must still happen.
        let collection: LivenessCollection<String, FakeEntity> = LivenessCollection::new();
        for round in 0..100 {
            let key = format!("k{round}");
            let entity = FakeEntity::new();
            entity.close.fire();
            collection.set(key.clone(), entity);
            tokio::task::yield_now().await;
            assert!(
                !collection.contains_key(&key),
                "terminated entity still present after round {round}"
            );
        }
        assert!(collection.is_empty());
    }
}
